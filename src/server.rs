//! RPC server: acceptors, service bindings, and the dispatcher.
//!
//! A server owns any number of sibling server transports, a read-mostly
//! binding map, and the built-in services (publish/subscribe, proxy
//! endpoints). Each accepted connection runs as one `NetworkSession`
//! task; dispatch happens on that task unless a handler suspends, and a
//! handler that outlives the client's declared ping-back interval has
//! keep-alives emitted on its behalf.

use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, RemoteException, RpcError, RpcResult};
use crate::filter::auth::{AuthFilter, AuthMechanism, AuthRole, QualityOfProtection};
use crate::filter::compression::ZlibCompressionFilter;
use crate::filter::tls::TlsFilter;
use crate::filter::{Filter, FilterChain, FilterId};
use crate::pool::ObjectPool;
use crate::proxy::{ProxyDispatch, ProxyEndpointService};
use crate::pubsub::{PublishingService, SubscriberHandle};
use crate::session::{spawn_session, SharedCallSession};
use crate::transport::http::HttpServerTransport;
use crate::transport::local::LocalServerTransport;
use crate::transport::tcp::TcpServerTransport;
use crate::transport::udp::UdpServerSocket;
use crate::transport::{Accepted, DynStream, FramedStream, ServerTransport, StreamKind};
use crate::wire::{
    self, MethodRequest, MethodResponse, OobRequest, OobResponse, WireCursor,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Dense method-id dispatch ceiling.
pub const MAX_METHOD_COUNT: u32 = 200;

/// Oldest runtime version this build speaks. Peers below the floor get a
/// `VersionMismatch` and no legacy fallback.
pub const MIN_RUNTIME_VERSION: u32 = 12;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub endpoints: Vec<Endpoint>,
    pub max_incoming: u32,
    pub max_outgoing: u32,
    pub max_runtime_version: u32,
    pub max_archive_version: u32,
    /// TLS material for https listeners and negotiated TLS filters.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Shared secret for negotiated auth filters.
    pub auth_secret: Option<Vec<u8>>,
    pub auth_qop: QualityOfProtection,
    /// Whether this server acts as a proxy rendezvous.
    pub enable_proxy_endpoints: bool,
    /// Interval subscribers are told to expect publisher pings at; 0
    /// disables.
    pub pub_ping_interval_ms: u32,
    /// Concurrent per-subscriber sends during publish; 0 is unlimited.
    pub simultaneous_publish_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_incoming: crate::defaults::MAX_MESSAGE_LENGTH,
            max_outgoing: crate::defaults::MAX_MESSAGE_LENGTH,
            max_runtime_version: crate::defaults::RUNTIME_VERSION,
            max_archive_version: crate::defaults::ARCHIVE_VERSION,
            tls: None,
            auth_secret: None,
            auth_qop: QualityOfProtection::Integrity,
            enable_proxy_endpoints: false,
            pub_ping_interval_ms: 0,
            simultaneous_publish_limit: 0,
        }
    }
}

/// A dispatch target: deserializes parameters, runs the handler, and
/// serializes the result.
#[async_trait]
pub trait ServerMethod: Send + Sync {
    async fn invoke(
        &self,
        session: SharedCallSession,
        method_id: u32,
        params: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteException>;
}

/// Adapter turning an async closure into a `ServerMethod`.
pub struct ServiceFn<F>(pub F);

#[async_trait]
impl<F, Fut> ServerMethod for ServiceFn<F>
where
    F: Fn(SharedCallSession, u32, Vec<u8>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<u8>, RemoteException>> + Send,
{
    async fn invoke(
        &self,
        session: SharedCallSession,
        method_id: u32,
        params: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteException> {
        (self.0)(session, method_id, params).await
    }
}

type AccessControl = Box<dyn Fn(u32) -> bool + Send + Sync>;

/// One service binding: a dispatcher plus an optional per-method access
/// check.
pub struct ServerBinding {
    pub name: String,
    method: Arc<dyn ServerMethod>,
    access_control: Option<AccessControl>,
}

/// What the session loop does after a dispatch.
pub(crate) struct DispatchAction {
    pub reply: Option<Vec<u8>>,
    pub close_after: bool,
    pub takeover: Option<Takeover>,
}

impl DispatchAction {
    fn reply(frame: Vec<u8>, close_after: bool) -> Self {
        Self {
            reply: Some(frame),
            close_after,
            takeover: None,
        }
    }

    fn oneway(close_after: bool) -> Self {
        Self {
            reply: None,
            close_after,
            takeover: None,
        }
    }
}

/// Role changes a dispatch can impose on its session.
pub(crate) enum Takeover {
    /// Swap in a freshly negotiated transport filter chain.
    InstallFilters { chain: FilterChain },
    /// The connection becomes a publish stream for a subscriber.
    Subscriber(SubscriberHandle),
    /// Relay bytes verbatim between this session and `other`.
    ProxyRelay { other: DynStream },
    /// Hand this session's stream to a waiting proxy request.
    ProxyProvide {
        slot: tokio::sync::oneshot::Sender<DynStream>,
    },
}

/// Shared server state reachable from sessions.
pub struct ServerCore {
    pub config: ServerConfig,
    bindings: RwLock<HashMap<String, Arc<ServerBinding>>>,
    pub pool: Arc<ObjectPool>,
    pub publishing: Arc<PublishingService>,
    pub proxy: Arc<ProxyEndpointService>,
    stop_tx: watch::Sender<bool>,
    bound_addrs: Mutex<HashMap<usize, String>>,
    callback_tx: Mutex<Option<mpsc::UnboundedSender<DynStream>>>,
}

impl ServerCore {
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Server half of a negotiated filter chain.
    fn build_filter_chain(&self, raw_ids: &[u32]) -> RpcResult<FilterChain> {
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(raw_ids.len());
        for raw in raw_ids {
            let id = FilterId::from_wire(*raw)
                .ok_or_else(|| RpcError::with_args(ErrorCode::UnknownFilter, *raw as i32, 0))?;
            match id {
                FilterId::Zlib => filters.push(Box::new(ZlibCompressionFilter::default())),
                FilterId::Tls | FilterId::Schannel => {
                    let config = self.config.tls.clone().ok_or_else(|| {
                        RpcError::with_what(
                            ErrorCode::UnknownFilter,
                            "no server tls configuration",
                        )
                    })?;
                    filters.push(Box::new(TlsFilter::server(config)?));
                }
                FilterId::Ntlm | FilterId::Kerberos | FilterId::Negotiate => {
                    let secret = self.config.auth_secret.clone().ok_or_else(|| {
                        RpcError::with_what(ErrorCode::UnknownFilter, "no server auth secret")
                    })?;
                    let mechanism = match id {
                        FilterId::Ntlm => AuthMechanism::Ntlm,
                        FilterId::Kerberos => AuthMechanism::Kerberos,
                        _ => AuthMechanism::Negotiate,
                    };
                    filters.push(Box::new(AuthFilter::new(
                        mechanism,
                        AuthRole::Server,
                        self.config.auth_qop,
                        secret,
                    )));
                }
            }
        }
        Ok(FilterChain::new(filters))
    }

    /// Dispatch one request frame from a stream session.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        call: &SharedCallSession,
        body: Vec<u8>,
        framed: &mut FramedStream,
        kind: StreamKind,
    ) -> RpcResult<DispatchAction> {
        let mut cursor = WireCursor::new(&body);
        let descriptor = cursor.varint()?;
        if descriptor != wire::DESCRIPTOR_REQUEST {
            return Err(RpcError::with_what(
                ErrorCode::BadDescriptor,
                format!("unexpected descriptor {descriptor}"),
            ));
        }
        let req = MethodRequest::decode(&mut cursor)?;
        let params = cursor.remaining().to_vec();
        debug!(service = %req.service, method = req.method_id, oneway = req.oneway,
               "dispatching request");

        // Version gate before anything else touches the request.
        if req.runtime_version > self.config.max_runtime_version
            || req.runtime_version < MIN_RUNTIME_VERSION
            || req.archive_version > self.config.max_archive_version
        {
            let resp = MethodResponse::error(
                ErrorCode::VersionMismatch,
                self.config.max_runtime_version as i32,
                self.config.max_archive_version as i32,
            );
            return Ok(DispatchAction::reply(resp.encode(&[]), req.close_after));
        }

        {
            let mut c = call.lock();
            c.oob_in = req.oob_request.clone();
            c.current_request = Some(req.clone());
        }

        if !req.oob_request.is_empty() {
            let oob = OobRequest::decode(&req.oob_request)?;
            return self.handle_oob(call, &req, oob).await;
        }

        self.dispatch_method(call, req, params, Some((framed, kind)))
            .await
    }

    /// Dispatch one datagram (no filters, no takeovers, no ping-backs).
    pub(crate) async fn dispatch_datagram(
        self: &Arc<Self>,
        call: &SharedCallSession,
        body: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let mut cursor = WireCursor::new(&body);
        match cursor.try_varint() {
            Some(wire::DESCRIPTOR_REQUEST) => {}
            _ => return None,
        }
        let req = match MethodRequest::decode(&mut cursor) {
            Ok(req) => req,
            Err(_) => return None,
        };
        let params = cursor.remaining().to_vec();
        if req.runtime_version > self.config.max_runtime_version
            || req.runtime_version < MIN_RUNTIME_VERSION
        {
            let resp = MethodResponse::error(
                ErrorCode::VersionMismatch,
                self.config.max_runtime_version as i32,
                self.config.max_archive_version as i32,
            );
            return Some(resp.encode(&[]));
        }
        match self.dispatch_method(call, req, params, None).await {
            Ok(action) => action.reply,
            Err(_) => None,
        }
    }

    async fn dispatch_method(
        self: &Arc<Self>,
        call: &SharedCallSession,
        req: MethodRequest,
        params: Vec<u8>,
        mut stream_io: Option<(&mut FramedStream, StreamKind)>,
    ) -> RpcResult<DispatchAction> {
        // Built-in rendezvous service, when enabled.
        if self.config.enable_proxy_endpoints && req.service == crate::defaults::PROXY_SERVICE {
            return self.dispatch_proxy(call, &req, &params).await;
        }

        let binding = self.bindings.read().get(&req.service).cloned();
        let Some(binding) = binding else {
            if req.oneway {
                return Ok(DispatchAction::oneway(req.close_after));
            }
            let resp = MethodResponse::error(ErrorCode::NoServerBinding, 0, 0);
            return Ok(DispatchAction::reply(resp.encode(&[]), req.close_after));
        };
        if req.method_id >= MAX_METHOD_COUNT {
            let resp = MethodResponse::error(ErrorCode::NoMethod, req.method_id as i32, 0);
            return Ok(DispatchAction::reply(resp.encode(&[]), req.close_after));
        }
        if let Some(check) = &binding.access_control {
            if !check(req.method_id) {
                if req.oneway {
                    return Ok(DispatchAction::oneway(req.close_after));
                }
                let resp = MethodResponse::error(ErrorCode::AccessDenied, req.method_id as i32, 0);
                return Ok(DispatchAction::reply(resp.encode(&[]), req.close_after));
            }
        }

        let fut = binding
            .method
            .invoke(Arc::clone(call), req.method_id, params);
        tokio::pin!(fut);

        // Emit ping-backs while the handler runs past the client's
        // declared interval. Only stream sessions can interleave frames.
        let pingback = match (&stream_io, req.oneway, req.pingback_interval_ms) {
            (Some((_, StreamKind::Raw)), false, ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        };
        let result = match pingback {
            Some(interval) => loop {
                tokio::select! {
                    r = &mut fut => break r,
                    _ = tokio::time::sleep(interval) => {
                        let ping = MethodResponse::error(
                            ErrorCode::PingBack,
                            req.pingback_interval_ms as i32,
                            0,
                        );
                        if let Some((framed, _)) = stream_io.as_mut() {
                            framed.send_frame(&ping.encode(&[])).await?;
                            debug!(interval_ms = req.pingback_interval_ms, "ping-back sent");
                        }
                    }
                }
            },
            None => fut.await,
        };

        if req.oneway {
            return Ok(DispatchAction::oneway(req.close_after));
        }
        let oob_out = std::mem::take(&mut call.lock().oob_out);
        let frame = match result {
            Ok(payload) => MethodResponse::Reply {
                is_exception: false,
                oob_response: oob_out,
                response_user_data: Vec::new(),
            }
            .encode(&payload),
            Err(exception) => MethodResponse::Reply {
                is_exception: true,
                oob_response: oob_out,
                response_user_data: Vec::new(),
            }
            .encode(&wire::encode_remote_exception(&exception)),
        };
        if frame.len() as u64 > u64::from(self.config.max_outgoing) {
            let resp = MethodResponse::error(
                ErrorCode::ServerMessageLength,
                frame.len() as i32,
                self.config.max_outgoing as i32,
            );
            return Ok(DispatchAction::reply(resp.encode(&[]), req.close_after));
        }
        Ok(DispatchAction::reply(frame, req.close_after))
    }

    async fn dispatch_proxy(
        self: &Arc<Self>,
        call: &SharedCallSession,
        req: &MethodRequest,
        params: &[u8],
    ) -> RpcResult<DispatchAction> {
        match self.proxy.dispatch(call, req.method_id, params).await {
            Ok(ProxyDispatch::Reply(payload)) => {
                let frame = MethodResponse::ok().encode(&payload);
                Ok(DispatchAction::reply(frame, req.close_after))
            }
            Ok(ProxyDispatch::Provide(slot)) => Ok(DispatchAction {
                reply: None,
                close_after: true,
                takeover: Some(Takeover::ProxyProvide { slot }),
            }),
            Err(e) if e.code.is_connection_fatal() => Err(e),
            Err(e) => {
                if req.oneway {
                    return Ok(DispatchAction::oneway(req.close_after));
                }
                let resp = MethodResponse::error(e.code, e.arg0, e.arg1);
                Ok(DispatchAction::reply(resp.encode(&[]), req.close_after))
            }
        }
    }

    async fn handle_oob(
        self: &Arc<Self>,
        call: &SharedCallSession,
        req: &MethodRequest,
        oob: OobRequest,
    ) -> RpcResult<DispatchAction> {
        let reply_with = |response: OobResponse| {
            MethodResponse::Reply {
                is_exception: false,
                oob_response: response.encode(),
                response_user_data: Vec::new(),
            }
            .encode(&[])
        };

        match oob {
            OobRequest::RequestTransportFilters { filter_ids, .. } => {
                match self.build_filter_chain(&filter_ids) {
                    Ok(chain) => Ok(DispatchAction {
                        reply: Some(reply_with(OobResponse::ok())),
                        close_after: false,
                        takeover: Some(Takeover::InstallFilters { chain }),
                    }),
                    Err(e) => {
                        warn!(?filter_ids, code = ?e.code, "filter negotiation refused");
                        Ok(DispatchAction::reply(
                            reply_with(OobResponse::refused(e.code)),
                            req.close_after,
                        ))
                    }
                }
            }
            OobRequest::RequestSubscription {
                topic,
                sub_ping_interval_ms,
                ..
            } => {
                let remote_addr = call.lock().remote_addr.clone();
                match self
                    .publishing
                    .accept_subscriber(&topic, remote_addr, sub_ping_interval_ms)
                {
                    Some((handle, response)) => {
                        info!(%topic, guid = %response.connection_guid, "subscriber attached");
                        Ok(DispatchAction {
                            reply: Some(reply_with(response)),
                            close_after: false,
                            takeover: Some(Takeover::Subscriber(handle)),
                        })
                    }
                    None => {
                        debug!(%topic, "subscription refused: no publisher");
                        Ok(DispatchAction::reply(
                            reply_with(OobResponse::refused(ErrorCode::SubscriptionRefused)),
                            req.close_after,
                        ))
                    }
                }
            }
            OobRequest::RequestProxyConnection { endpoint_name, .. } => {
                if !self.config.enable_proxy_endpoints {
                    let resp = MethodResponse::error(ErrorCode::ProxyEndpointDown, 0, 0);
                    return Ok(DispatchAction::reply(resp.encode(&[]), true));
                }
                match self.proxy.request_connection(&endpoint_name).await {
                    Ok(other) => Ok(DispatchAction {
                        reply: Some(reply_with(OobResponse::ok())),
                        close_after: true,
                        takeover: Some(Takeover::ProxyRelay { other }),
                    }),
                    Err(e) => {
                        let resp = MethodResponse::error(e.code, 0, 0);
                        Ok(DispatchAction::reply(resp.encode(&[]), true))
                    }
                }
            }
            OobRequest::CreateCallbackConnection { .. } => {
                let tx = self.callback_tx.lock().clone();
                match tx {
                    Some(tx) => Ok(DispatchAction {
                        reply: Some(reply_with(OobResponse::ok())),
                        close_after: true,
                        takeover: Some(Takeover::ProxyProvide {
                            slot: callback_slot(tx),
                        }),
                    }),
                    None => Ok(DispatchAction::reply(
                        reply_with(OobResponse::refused(ErrorCode::NoServerBinding)),
                        req.close_after,
                    )),
                }
            }
        }
    }
}

/// Adapt the callback-connection channel to the oneshot slot the takeover
/// machinery uses.
fn callback_slot(
    tx: mpsc::UnboundedSender<DynStream>,
) -> tokio::sync::oneshot::Sender<DynStream> {
    let (slot_tx, slot_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Ok(stream) = slot_rx.await {
            let _ = tx.send(stream);
        }
    });
    slot_tx
}

/// The server handle. Cheap to clone; all clones drive the same server.
#[derive(Clone)]
pub struct RpcServer {
    core: Arc<ServerCore>,
}

impl RpcServer {
    pub fn new(config: ServerConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let publishing = PublishingService::new(
            config.simultaneous_publish_limit,
            config.pub_ping_interval_ms,
        );
        Self {
            core: Arc::new(ServerCore {
                publishing,
                proxy: ProxyEndpointService::new(),
                bindings: RwLock::new(HashMap::new()),
                pool: Arc::new(ObjectPool::default()),
                stop_tx,
                bound_addrs: Mutex::new(HashMap::new()),
                callback_tx: Mutex::new(None),
                config,
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    pub fn publishing_service(&self) -> Arc<PublishingService> {
        Arc::clone(&self.core.publishing)
    }

    pub fn proxy_service(&self) -> Arc<ProxyEndpointService> {
        Arc::clone(&self.core.proxy)
    }

    /// Bind a service by name.
    pub fn bind(&self, name: impl Into<String>, method: impl ServerMethod + 'static) {
        self.bind_arc(name, Arc::new(method), None);
    }

    /// Bind a service with a per-method access-control callback.
    pub fn bind_with_access(
        &self,
        name: impl Into<String>,
        method: impl ServerMethod + 'static,
        access: impl Fn(u32) -> bool + Send + Sync + 'static,
    ) {
        self.bind_arc(name, Arc::new(method), Some(Box::new(access)));
    }

    fn bind_arc(
        &self,
        name: impl Into<String>,
        method: Arc<dyn ServerMethod>,
        access_control: Option<AccessControl>,
    ) {
        let name = name.into();
        let binding = Arc::new(ServerBinding {
            name: name.clone(),
            method,
            access_control,
        });
        self.core.bindings.write().insert(name.clone(), binding);
        debug!(%name, "service bound");
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.core.bindings.write().remove(name).is_some()
    }

    /// Receive connections opened by clients via the
    /// `CreateCallbackConnection` OOB. May be taken once.
    pub fn callback_connections(&self) -> mpsc::UnboundedReceiver<DynStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.core.callback_tx.lock() = Some(tx);
        rx
    }

    /// Bind all configured endpoints and start accepting.
    pub async fn start(&self) -> RpcResult<()> {
        let endpoints = self.core.config.endpoints.clone();
        for (index, endpoint) in endpoints.into_iter().enumerate() {
            self.start_endpoint(index, endpoint).await?;
        }
        info!("server started");
        Ok(())
    }

    async fn start_endpoint(&self, index: usize, endpoint: Endpoint) -> RpcResult<()> {
        match &endpoint {
            Endpoint::Tcp { host, port } => {
                let mut transport = TcpServerTransport::new(host.clone(), *port);
                transport.bind().await?;
                self.record_addr(index, transport.local_addr());
                self.spawn_accept_loop(Box::new(transport), endpoint);
            }
            Endpoint::Local { .. } | Endpoint::NamedPipe { .. } => {
                let path = endpoint
                    .socket_path()
                    .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
                let mut transport = LocalServerTransport::new(path);
                transport.bind().await?;
                self.record_addr(index, transport.local_addr());
                self.spawn_accept_loop(Box::new(transport), endpoint);
            }
            Endpoint::Http { host, port, .. } => {
                let mut transport = HttpServerTransport::new(host.clone(), *port, None);
                transport.bind().await?;
                self.record_addr(index, transport.local_addr());
                self.spawn_accept_loop(Box::new(transport), endpoint);
            }
            Endpoint::Https { host, port, .. } => {
                let tls = self.core.config.tls.clone().ok_or_else(|| {
                    RpcError::with_what(
                        ErrorCode::SslCertVerification,
                        "https listener requires server tls configuration",
                    )
                })?;
                let mut transport = HttpServerTransport::new(host.clone(), *port, Some(tls));
                transport.bind().await?;
                self.record_addr(index, transport.local_addr());
                self.spawn_accept_loop(Box::new(transport), endpoint);
            }
            Endpoint::Udp { .. } => {
                let socket =
                    UdpServerSocket::bind(&endpoint, self.core.config.max_incoming).await?;
                self.record_addr(index, socket.local_addr().map(|a| a.to_string()));
                self.spawn_datagram_loop(socket, endpoint);
            }
            Endpoint::Proxy { name, via } => {
                let stop = self.core.stop_signal();
                let server = self.clone();
                let name = name.clone();
                let via = (**via).clone();
                tokio::spawn(async move {
                    crate::proxy::run_proxy_endpoint_agent(
                        server,
                        via,
                        name,
                        String::new(),
                        stop,
                    )
                    .await;
                });
            }
        }
        Ok(())
    }

    fn record_addr(&self, index: usize, addr: Option<String>) {
        if let Some(addr) = addr {
            self.core.bound_addrs.lock().insert(index, addr);
        }
    }

    /// The actual bound address of the n-th configured endpoint. This is
    /// how tests discover ephemeral ports.
    pub fn bound_addr(&self, index: usize) -> Option<String> {
        self.core.bound_addrs.lock().get(&index).cloned()
    }

    fn spawn_accept_loop(&self, mut transport: Box<dyn ServerTransport>, endpoint: Endpoint) {
        let core = Arc::clone(&self.core);
        let mut stop = core.stop_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = transport.accept() => match accepted {
                        Ok(accepted) => {
                            debug!(peer = %accepted.peer, %endpoint, "accepted connection");
                            spawn_session(Arc::clone(&core), accepted);
                        }
                        Err(e) => {
                            error!(%endpoint, "accept failed: {e}");
                            break;
                        }
                    },
                    _ = stop.changed() => break,
                }
            }
            debug!(%endpoint, "acceptor stopped");
        });
    }

    fn spawn_datagram_loop(&self, socket: UdpServerSocket, endpoint: Endpoint) {
        let core = Arc::clone(&self.core);
        let mut stop = core.stop_signal();
        tokio::spawn(async move {
            // One pooled scratch buffer serves the whole loop and goes
            // back to the pool when the acceptor exits.
            let mut scratch = core.pool.get::<Vec<u8>>();
            loop {
                tokio::select! {
                    received = socket.recv_with(&mut scratch) => match received {
                        Ok((body, peer)) => {
                            let call = crate::session::CallSession::new(peer.to_string());
                            if let Some(reply) = core.dispatch_datagram(&call, body).await {
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    warn!(%peer, "datagram reply failed: {e}");
                                }
                            }
                        }
                        Err(e) => {
                            error!(%endpoint, "datagram receive failed: {e}");
                            break;
                        }
                    },
                    _ = stop.changed() => break,
                }
            }
        });
    }

    /// Serve an externally established stream as if it had been accepted
    /// (proxied dial-backs, tests).
    pub fn serve_stream(&self, stream: DynStream, peer: String) {
        spawn_session(
            Arc::clone(&self.core),
            Accepted {
                stream,
                peer,
                kind: StreamKind::Raw,
                initial_chain: FilterChain::default(),
            },
        );
    }

    /// Stop the server: acceptors exit, every session is torn down, and
    /// each session's on-destroy callbacks fire.
    pub fn stop(&self) {
        let _ = self.core.stop_tx.send(true);
        info!("server stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_method() -> impl ServerMethod {
        ServiceFn(|_session, _method, params: Vec<u8>| async move { Ok(params) })
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let server = RpcServer::new(ServerConfig::default());
        server.bind("Echo", echo_method());
        assert!(server.unbind("Echo"));
        assert!(!server.unbind("Echo"));
    }

    #[tokio::test]
    async fn test_dispatch_datagram_unknown_service() {
        let server = RpcServer::new(ServerConfig::default());
        let call = crate::session::CallSession::new("peer".into());
        let req = MethodRequest::new("Nope", 1);
        let reply = server
            .core()
            .dispatch_datagram(&call, req.encode(b""))
            .await
            .expect("two-way call gets an error reply");
        let (resp, _) = MethodResponse::decode(&reply).unwrap();
        assert_eq!(
            resp,
            MethodResponse::error(ErrorCode::NoServerBinding, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_dispatch_datagram_version_gate() {
        let server = RpcServer::new(ServerConfig::default());
        server.bind("Echo", echo_method());
        let call = crate::session::CallSession::new("peer".into());
        let mut req = MethodRequest::new("Echo", 1);
        req.runtime_version = MIN_RUNTIME_VERSION - 1;
        let reply = server
            .core()
            .dispatch_datagram(&call, req.encode(b""))
            .await
            .unwrap();
        let (resp, _) = MethodResponse::decode(&reply).unwrap();
        match resp {
            MethodResponse::Error { code, arg0, .. } => {
                assert_eq!(code, ErrorCode::VersionMismatch);
                assert_eq!(arg0, crate::defaults::RUNTIME_VERSION as i32);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_access_control_denies_method() {
        let server = RpcServer::new(ServerConfig::default());
        server.bind_with_access("Guarded", echo_method(), |method_id| method_id != 7);
        let call = crate::session::CallSession::new("peer".into());

        let ok = MethodRequest::new("Guarded", 1);
        let reply = server
            .core()
            .dispatch_datagram(&call, ok.encode(b"x"))
            .await
            .unwrap();
        let (resp, _) = MethodResponse::decode(&reply).unwrap();
        assert!(matches!(resp, MethodResponse::Reply { .. }));

        let denied = MethodRequest::new("Guarded", 7);
        let reply = server
            .core()
            .dispatch_datagram(&call, denied.encode(b"x"))
            .await
            .unwrap();
        let (resp, _) = MethodResponse::decode(&reply).unwrap();
        assert_eq!(resp, MethodResponse::error(ErrorCode::AccessDenied, 7, 0));
    }
}
