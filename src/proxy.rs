//! Proxy endpoints: rendezvous for servers behind NAT.
//!
//! A NAT-ed server registers on a public rendezvous server with
//! `SetupProxyEndpoint` and long-polls `GetConnectionRequests` on the same
//! connection. A public client dials the rendezvous with a
//! `RequestProxyConnection` OOB; the rendezvous mints a per-request GUID,
//! wakes the long-poll, and waits up to ten seconds for the NAT-ed server
//! to dial back with `MakeConnectionAvailable`. Once paired, the
//! rendezvous relays bytes verbatim between the two sockets until either
//! side shuts down.

use crate::client::{client_transport_for, ClientOptions, ClientStub};
use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::session::SharedCallSession;
use crate::transport::{DynStream, StreamClientTransport, StreamConnector};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SETUP_METHOD_ID: u32 = 1;
pub const GET_REQUESTS_METHOD_ID: u32 = 2;
pub const MAKE_AVAILABLE_METHOD_ID: u32 = 3;
pub const ENUMERATE_METHOD_ID: u32 = 4;
pub const TEARDOWN_METHOD_ID: u32 = 5;

/// How long a public client waits for the NAT-ed server to provide a
/// connection for its request GUID.
pub const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Long-poll window for `GetConnectionRequests`.
pub const LONG_POLL_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
pub struct SetupParams {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRequestsParams {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MakeAvailableParams {
    pub name: String,
    pub guid: String,
}

struct ProxyEndpointEntry {
    password: String,
    online: Arc<AtomicBool>,
    pending: Arc<Mutex<VecDeque<String>>>,
    wake: Arc<Notify>,
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<DynStream>>>>,
}

/// Outcome of a proxy-service method dispatch that the session loop must
/// act on.
pub(crate) enum ProxyDispatch {
    Reply(Vec<u8>),
    /// Oneway `MakeConnectionAvailable`: the session's stream goes into
    /// this slot and the connection changes hands.
    Provide(oneshot::Sender<DynStream>),
}

/// Rendezvous-side registry of proxy endpoints.
#[derive(Default)]
pub struct ProxyEndpointService {
    entries: Mutex<HashMap<String, Arc<ProxyEndpointEntry>>>,
}

impl ProxyEndpointService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registered endpoints whose control connection is still alive.
    /// Dead entries are pruned as a side effect.
    pub fn enumerate_endpoints(&self) -> Vec<String> {
        let mut entries = self.entries.lock();
        entries.retain(|name, entry| {
            let alive = entry.online.load(Ordering::SeqCst);
            if !alive {
                debug!(%name, "pruning offline proxy endpoint");
            }
            alive
        });
        entries.keys().cloned().collect()
    }

    fn setup(
        &self,
        call: &SharedCallSession,
        params: SetupParams,
    ) -> RpcResult<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&params.name) {
            if existing.online.load(Ordering::SeqCst) && existing.password != params.password {
                return Err(RpcError::with_what(
                    ErrorCode::ProxyAuthFailed,
                    format!("endpoint {} already registered", params.name),
                ));
            }
        }
        let entry = Arc::new(ProxyEndpointEntry {
            password: params.password,
            online: Arc::new(AtomicBool::new(true)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            wake: Arc::new(Notify::new()),
            waiting: Arc::new(Mutex::new(HashMap::new())),
        });
        // The endpoint goes offline the moment its control session dies.
        let online = Arc::clone(&entry.online);
        let wake = Arc::clone(&entry.wake);
        call.lock().on_destroy(move || {
            online.store(false, Ordering::SeqCst);
            wake.notify_waiters();
        });
        info!(name = %call.lock().remote_addr, "proxy endpoint registered");
        entries.insert(params.name, entry);
        Ok(())
    }

    async fn get_requests(&self, name: &str) -> RpcResult<Vec<String>> {
        let entry = self
            .entries
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::new(ErrorCode::ProxyEndpointDown))?;
        let deadline = tokio::time::Instant::now() + LONG_POLL_WINDOW;
        loop {
            {
                let mut pending = entry.pending.lock();
                if !pending.is_empty() {
                    return Ok(pending.drain(..).collect());
                }
            }
            if !entry.online.load(Ordering::SeqCst) {
                return Err(RpcError::new(ErrorCode::ProxyEndpointDown));
            }
            tokio::select! {
                _ = entry.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    /// Queue a connection request for `name` and wait for the dial-back.
    pub(crate) async fn request_connection(&self, name: &str) -> RpcResult<DynStream> {
        let entry = self
            .entries
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::new(ErrorCode::ProxyEndpointDown))?;
        if !entry.online.load(Ordering::SeqCst) {
            return Err(RpcError::new(ErrorCode::ProxyEndpointDown));
        }

        let guid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        entry.waiting.lock().insert(guid.clone(), tx);
        entry.pending.lock().push_back(guid.clone());
        entry.wake.notify_waiters();
        debug!(%name, %guid, "queued proxy connection request");

        match tokio::time::timeout(CONNECT_WAIT, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            _ => {
                entry.waiting.lock().remove(&guid);
                entry.pending.lock().retain(|g| g != &guid);
                Err(RpcError::new(ErrorCode::NoProxyConnection))
            }
        }
    }

    /// Graceful deregistration by the NAT-ed server.
    fn teardown(&self, name: &str, password: &str) -> RpcResult<()> {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            if entry.password != password {
                return Err(RpcError::new(ErrorCode::ProxyAuthFailed));
            }
            entry.online.store(false, Ordering::SeqCst);
            entry.wake.notify_waiters();
            info!(%name, "proxy endpoint deregistered");
        }
        Ok(())
    }

    fn claim_slot(&self, name: &str, guid: &str) -> Option<oneshot::Sender<DynStream>> {
        let entry = self.entries.lock().get(name).cloned()?;
        let slot = entry.waiting.lock().remove(guid);
        slot
    }

    /// Dispatch one method of the rendezvous service.
    pub(crate) async fn dispatch(
        &self,
        call: &SharedCallSession,
        method_id: u32,
        params: &[u8],
    ) -> RpcResult<ProxyDispatch> {
        match method_id {
            SETUP_METHOD_ID => {
                let params: SetupParams = bincode::deserialize(params)?;
                self.setup(call, params)?;
                Ok(ProxyDispatch::Reply(bincode::serialize(&())?))
            }
            GET_REQUESTS_METHOD_ID => {
                let params: GetRequestsParams = bincode::deserialize(params)?;
                let guids = self.get_requests(&params.name).await?;
                Ok(ProxyDispatch::Reply(bincode::serialize(&guids)?))
            }
            MAKE_AVAILABLE_METHOD_ID => {
                let params: MakeAvailableParams = bincode::deserialize(params)?;
                match self.claim_slot(&params.name, &params.guid) {
                    Some(slot) => Ok(ProxyDispatch::Provide(slot)),
                    None => {
                        warn!(name = %params.name, guid = %params.guid,
                              "dial-back for unknown request guid");
                        Err(RpcError::new(ErrorCode::NoProxyConnection))
                    }
                }
            }
            ENUMERATE_METHOD_ID => {
                let endpoints = self.enumerate_endpoints();
                Ok(ProxyDispatch::Reply(bincode::serialize(&endpoints)?))
            }
            TEARDOWN_METHOD_ID => {
                let params: SetupParams = bincode::deserialize(params)?;
                self.teardown(&params.name, &params.password)?;
                Ok(ProxyDispatch::Reply(bincode::serialize(&())?))
            }
            _ => Err(RpcError::new(ErrorCode::NoMethod)),
        }
    }
}

/// NAT-ed server agent: registers under `name` at the rendezvous, long
/// polls for connection requests, and dials back to serve each one.
///
/// Runs until the provided stop signal fires; connection losses to the
/// rendezvous are retried with a short backoff.
pub async fn run_proxy_endpoint_agent(
    server: crate::server::RpcServer,
    rendezvous: Endpoint,
    name: String,
    password: String,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut opts = ClientOptions::default();
    // The long poll must outlive the default call timeout.
    opts.call_timeout = LONG_POLL_WINDOW + Duration::from_secs(5);

    loop {
        if *stop.borrow() {
            return;
        }
        let attempt = serve_rendezvous(&server, &rendezvous, &name, &password, &opts, &mut stop).await;
        match attempt {
            Ok(()) => return,
            Err(e) => {
                warn!(%rendezvous, code = ?e.code, "proxy endpoint agent retrying: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = stop.changed() => return,
                }
            }
        }
    }
}

async fn serve_rendezvous(
    server: &crate::server::RpcServer,
    rendezvous: &Endpoint,
    name: &str,
    password: &str,
    opts: &ClientOptions,
    stop: &mut tokio::sync::watch::Receiver<bool>,
) -> RpcResult<()> {
    let mut stub = ClientStub::with_options(rendezvous.clone(), opts.clone())?;
    stub.connect().await?;
    let () = stub
        .call(
            crate::defaults::PROXY_SERVICE,
            SETUP_METHOD_ID,
            &SetupParams {
                name: name.to_owned(),
                password: password.to_owned(),
            },
        )
        .await
        .map_err(|e| match e {
            crate::error::CallError::Rpc(e) => e,
            crate::error::CallError::Remote(e) => {
                RpcError::with_what(ErrorCode::ProxyAuthFailed, e.message)
            }
        })?;
    info!(%rendezvous, name, "proxy endpoint online");

    loop {
        if *stop.borrow() {
            deregister(rendezvous, name, password).await;
            return Ok(());
        }
        let get_requests_params = GetRequestsParams {
            name: name.to_owned(),
        };
        let poll = stub.call(
            crate::defaults::PROXY_SERVICE,
            GET_REQUESTS_METHOD_ID,
            &get_requests_params,
        );
        let guids: Vec<String> = tokio::select! {
            r = poll => r.map_err(|e| match e {
                crate::error::CallError::Rpc(e) => e,
                crate::error::CallError::Remote(e) => {
                    RpcError::with_what(ErrorCode::ProxyEndpointDown, e.message)
                }
            })?,
            _ = stop.changed() => {
                deregister(rendezvous, name, password).await;
                return Ok(());
            }
        };

        for guid in guids {
            let server = server.clone();
            let rendezvous = rendezvous.clone();
            let name = name.to_owned();
            tokio::spawn(async move {
                if let Err(e) = provide_connection(server, rendezvous, name, guid).await {
                    warn!(code = ?e.code, "dial-back failed: {e}");
                }
            });
        }
    }
}

/// Tell the rendezvous this endpoint is going away, on a short-lived
/// connection of its own (the control connection is parked in a long
/// poll).
async fn deregister(rendezvous: &Endpoint, name: &str, password: &str) {
    let Ok(mut stub) = ClientStub::new(rendezvous.clone()) else {
        return;
    };
    let _ = stub
        .call::<SetupParams, ()>(
            crate::defaults::PROXY_SERVICE,
            TEARDOWN_METHOD_ID,
            &SetupParams {
                name: name.to_owned(),
                password: password.to_owned(),
            },
        )
        .await;
}

/// Dial the rendezvous, mark the connection as serving `guid`, then treat
/// the (relayed) connection as an ordinary accepted session.
async fn provide_connection(
    server: crate::server::RpcServer,
    rendezvous: Endpoint,
    name: String,
    guid: String,
) -> RpcResult<()> {
    let mut stub = ClientStub::new(rendezvous.clone())?;
    stub.connect().await?;
    stub.call_oneway(
        crate::defaults::PROXY_SERVICE,
        MAKE_AVAILABLE_METHOD_ID,
        &MakeAvailableParams {
            name,
            guid: guid.clone(),
        },
    )
    .await?;
    let framed = stub
        .take_framed()
        .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
    let (stream, _, _) = framed.into_parts();
    debug!(%guid, "serving proxied connection");
    server.serve_stream(stream, format!("proxy:{rendezvous}"));
    Ok(())
}

struct ProxyConnector {
    name: String,
    via: Endpoint,
    opts: ClientOptions,
}

#[async_trait::async_trait]
impl StreamConnector for ProxyConnector {
    async fn connect(&self, _timeout: Duration) -> RpcResult<DynStream> {
        let mut stub = ClientStub::with_options(self.via.clone(), self.opts.clone())?;
        stub.connect().await?;
        let response = stub
            .send_oob(crate::wire::OobRequest::RequestProxyConnection {
                runtime_version: stub.runtime_version(),
                endpoint_name: self.name.clone(),
            })
            .await?;
        if response.error_code != 0 {
            return Err(RpcError::new(ErrorCode::from_wire(response.error_code)));
        }
        let framed = stub
            .take_framed()
            .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
        let (stream, _, _) = framed.into_parts();
        debug!(name = %self.name, via = %self.via, "proxied connection established");
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("proxy://{}@{}", self.name, self.via)
    }
}

/// Client transport reaching a NAT-ed server through its rendezvous.
pub(crate) fn proxied_client_transport(
    name: String,
    via: Endpoint,
    opts: &ClientOptions,
) -> RpcResult<StreamClientTransport> {
    // The dial to the rendezvous itself must be a plain connected stream.
    if client_transport_for(&via, opts).is_err() {
        return Err(RpcError::new(ErrorCode::SocketError));
    }
    Ok(StreamClientTransport::new(Box::new(ProxyConnector {
        name,
        via,
        opts: opts.clone(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CallSession;

    #[tokio::test]
    async fn test_request_for_unknown_endpoint_is_down() {
        let service = ProxyEndpointService::new();
        let err = match service.request_connection("ghost").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code, ErrorCode::ProxyEndpointDown);
    }

    #[tokio::test]
    async fn test_setup_then_session_death_marks_offline() {
        let service = ProxyEndpointService::new();
        let call = CallSession::new("nat-server".into());
        service
            .setup(
                &call,
                SetupParams {
                    name: "alpha".into(),
                    password: "pw".into(),
                },
            )
            .unwrap();
        assert_eq!(service.enumerate_endpoints(), vec!["alpha".to_string()]);

        // Control session dies; endpoint must go offline and prune.
        call.lock().run_destroy_callbacks();
        assert!(service.enumerate_endpoints().is_empty());
        let err = match service.request_connection("alpha").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code, ErrorCode::ProxyEndpointDown);
    }

    #[tokio::test]
    async fn test_long_poll_returns_queued_guid() {
        let service = ProxyEndpointService::new();
        let call = CallSession::new("nat-server".into());
        service
            .setup(
                &call,
                SetupParams {
                    name: "alpha".into(),
                    password: "pw".into(),
                },
            )
            .unwrap();

        let service2 = Arc::clone(&service);
        let requester = tokio::spawn(async move {
            // Expected to time out: nothing dials back in this test.
            service2.request_connection("alpha").await.err()
        });

        // The queued GUID must surface through the long poll promptly.
        let guids =
            tokio::time::timeout(Duration::from_secs(2), service.get_requests("alpha"))
                .await
                .expect("long poll should wake")
                .unwrap();
        assert_eq!(guids.len(), 1);

        let err = requester.await.unwrap().unwrap();
        assert_eq!(err.code, ErrorCode::NoProxyConnection);
    }

    #[tokio::test]
    async fn test_reregistration_with_wrong_password_refused() {
        let service = ProxyEndpointService::new();
        let call = CallSession::new("a".into());
        service
            .setup(
                &call,
                SetupParams {
                    name: "alpha".into(),
                    password: "pw".into(),
                },
            )
            .unwrap();
        let call2 = CallSession::new("b".into());
        let err = service
            .setup(
                &call2,
                SetupParams {
                    name: "alpha".into(),
                    password: "other".into(),
                },
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProxyAuthFailed);
    }
}
