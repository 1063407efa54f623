//! Client stub.
//!
//! A `ClientStub` owns one client transport and issues method invocations
//! over it: two-way calls with ping-back-aware waiting, oneway calls,
//! OOB control exchanges (transport-filter negotiation, subscriptions,
//! proxy connections), automatic version negotiation with a single retry,
//! and synchronous cancellation.

use crate::endpoint::Endpoint;
use crate::error::{CallError, ErrorCode, RemoteException, RpcError, RpcResult};
use crate::filter::auth::{AuthFilter, AuthMechanism, AuthRole, QualityOfProtection};
use crate::filter::compression::ZlibCompressionFilter;
use crate::filter::tls::TlsFilter;
use crate::filter::{Filter, FilterChain, FilterId};
use crate::transport::http::HttpClientTransport;
use crate::transport::local::local_client_transport;
use crate::transport::tcp::tcp_client_transport;
use crate::transport::udp::UdpClientTransport;
use crate::transport::{CancelHandle, ClientTransport, FramedStream, TransferCounters};
use crate::wire::{self, MethodRequest, MethodResponse, OobRequest, OobResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tunables for a client stub.
#[derive(Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub runtime_version: u32,
    pub archive_version: u32,
    /// Retry once at the server's versions on `VersionMismatch`.
    pub auto_versioning: bool,
    /// Ping-back interval the client declares to the server; 0 disables.
    pub pingback_interval_ms: u32,
    pub max_incoming: u32,
    pub max_outgoing: u32,
    /// Sliding window length for file-transfer throttling, seconds.
    pub transfer_window_s: u32,
    /// Client-side bandwidth cap for file transfers, bytes/sec; 0 is
    /// unlimited.
    pub transfer_bps: u32,
    /// TLS material for https endpoints and negotiated TLS filters.
    pub tls: Option<(Arc<rustls::ClientConfig>, String)>,
    /// Shared secret for negotiated auth filters.
    pub auth_secret: Option<Vec<u8>>,
    pub auth_qop: QualityOfProtection,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            call_timeout: crate::defaults::CALL_TIMEOUT,
            runtime_version: crate::defaults::RUNTIME_VERSION,
            archive_version: crate::defaults::ARCHIVE_VERSION,
            auto_versioning: true,
            pingback_interval_ms: 0,
            max_incoming: crate::defaults::MAX_MESSAGE_LENGTH,
            max_outgoing: crate::defaults::MAX_MESSAGE_LENGTH,
            transfer_window_s: crate::defaults::TRANSFER_WINDOW_S,
            transfer_bps: 0,
            tls: None,
            auth_secret: None,
            auth_qop: QualityOfProtection::Integrity,
        }
    }
}

/// Build the client transport matching an endpoint description.
pub fn client_transport_for(
    endpoint: &Endpoint,
    opts: &ClientOptions,
) -> RpcResult<Box<dyn ClientTransport>> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok(Box::new(tcp_client_transport(host.clone(), *port))),
        Endpoint::Local { .. } | Endpoint::NamedPipe { .. } => {
            let path = endpoint
                .socket_path()
                .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
            Ok(Box::new(local_client_transport(path)))
        }
        Endpoint::Udp { .. } => Ok(Box::new(UdpClientTransport::new(endpoint.clone()))),
        Endpoint::Http {
            host,
            port,
            url_path,
        } => Ok(Box::new(HttpClientTransport::new(
            host.clone(),
            *port,
            url_path.clone(),
        ))),
        Endpoint::Https {
            host,
            port,
            url_path,
        } => {
            let (config, server_name) = opts.tls.clone().ok_or_else(|| {
                RpcError::with_what(
                    ErrorCode::SslCertVerification,
                    "https endpoint requires client tls configuration",
                )
            })?;
            Ok(Box::new(
                HttpClientTransport::new(host.clone(), *port, url_path.clone())
                    .with_tls(config, &server_name),
            ))
        }
        Endpoint::Proxy { name, via } => Ok(Box::new(
            crate::proxy::proxied_client_transport(name.clone(), (**via).clone(), opts)?,
        )),
    }
}

pub struct ClientStub {
    endpoint: Endpoint,
    transport: Box<dyn ClientTransport>,
    opts: ClientOptions,
    /// Effective versions after any auto-negotiation.
    runtime_version: u32,
    archive_version: u32,
    /// Number of version-mismatch retries performed.
    tries: u32,
    /// Ping-backs observed during the last call.
    last_pingback: Option<Instant>,
}

impl ClientStub {
    pub fn new(endpoint: Endpoint) -> RpcResult<Self> {
        Self::with_options(endpoint, ClientOptions::default())
    }

    pub fn with_options(endpoint: Endpoint, opts: ClientOptions) -> RpcResult<Self> {
        let mut transport = client_transport_for(&endpoint, &opts)?;
        transport.set_max_incoming(opts.max_incoming);
        transport.set_max_outgoing(opts.max_outgoing);
        Ok(Self {
            endpoint,
            transport,
            runtime_version: opts.runtime_version,
            archive_version: opts.archive_version,
            opts,
            tries: 0,
            last_pingback: None,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Version-mismatch retries performed so far.
    pub fn get_tries(&self) -> u32 {
        self.tries
    }

    /// When the last ping-back arrived during the current or previous
    /// call, if any.
    pub fn last_pingback(&self) -> Option<Instant> {
        self.last_pingback
    }

    pub fn runtime_version(&self) -> u32 {
        self.runtime_version
    }

    pub fn counters(&self) -> Arc<TransferCounters> {
        self.transport.counters()
    }

    pub fn last_request_size(&self) -> u64 {
        self.transport.counters().last_request_size()
    }

    pub fn last_response_size(&self) -> u64 {
        self.transport.counters().last_response_size()
    }

    /// Abort the in-flight operation. Safe to call from another task; a
    /// no-op if nothing is in flight.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.transport.cancel_handle()
    }

    pub async fn connect(&mut self) -> RpcResult<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect(self.opts.connect_timeout).await
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    /// Issue a call and return the decoded response header plus payload.
    ///
    /// Handles ping-backs (re-arming the receive without surfacing them)
    /// and the single auto-versioning retry.
    pub async fn call_raw(
        &mut self,
        service: &str,
        method_id: u32,
        params: &[u8],
        oneway: bool,
    ) -> RpcResult<Option<(MethodResponse, Vec<u8>)>> {
        self.call_raw_with_oob(service, method_id, params, oneway, Vec::new())
            .await
    }

    pub async fn call_raw_with_oob(
        &mut self,
        service: &str,
        method_id: u32,
        params: &[u8],
        oneway: bool,
        oob_request: Vec<u8>,
    ) -> RpcResult<Option<(MethodResponse, Vec<u8>)>> {
        if oneway && matches!(self.endpoint, Endpoint::Http { .. } | Endpoint::Https { .. }) {
            // Response streams are server-initiated over HTTP; a call that
            // never elicits a response cannot be carried.
            return Err(RpcError::new(ErrorCode::OnewayHttp));
        }
        self.connect().await?;

        loop {
            let mut req = MethodRequest::new(service, method_id);
            req.oneway = oneway;
            req.runtime_version = self.runtime_version;
            req.archive_version = self.archive_version;
            req.pingback_interval_ms = self.opts.pingback_interval_ms;
            req.oob_request = oob_request.clone();
            let body = req.encode(params);
            self.transport.send(&body, self.opts.call_timeout).await?;

            if oneway {
                return Ok(None);
            }

            loop {
                let frame = self.transport.receive(self.opts.call_timeout).await?;
                let (resp, offset) = MethodResponse::decode(&frame)?;
                match resp {
                    MethodResponse::Error {
                        code: ErrorCode::PingBack,
                        arg0,
                        ..
                    } => {
                        // Keep-alive while the handler runs; re-arm.
                        debug!(interval_ms = arg0, "ping-back received");
                        self.last_pingback = Some(Instant::now());
                        continue;
                    }
                    MethodResponse::Error {
                        code: ErrorCode::VersionMismatch,
                        arg0,
                        arg1,
                    } => {
                        if self.opts.auto_versioning && self.tries == 0 {
                            self.tries += 1;
                            self.runtime_version =
                                self.runtime_version.min(arg0.max(0) as u32);
                            self.archive_version =
                                self.archive_version.min(arg1.max(0) as u32);
                            debug!(
                                runtime = self.runtime_version,
                                archive = self.archive_version,
                                "auto-versioning retry"
                            );
                            break;
                        }
                        return Err(RpcError::with_args(
                            ErrorCode::VersionMismatch,
                            arg0,
                            arg1,
                        ));
                    }
                    MethodResponse::Error { code, arg0, arg1 } => {
                        return Err(RpcError::with_args(code, arg0, arg1));
                    }
                    reply @ MethodResponse::Reply { .. } => {
                        return Ok(Some((reply, frame[offset..].to_vec())));
                    }
                }
            }
        }
    }

    /// Two-way call with bincode-serialized parameters and result.
    pub async fn call<P, R>(&mut self, service: &str, method_id: u32, params: &P) -> Result<R, CallError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = bincode::serialize(params).map_err(RpcError::from)?;
        let (resp, payload) = self
            .call_raw(service, method_id, &params, false)
            .await?
            .expect("two-way call always yields a response");
        match resp {
            MethodResponse::Reply {
                is_exception: true, ..
            } => Err(CallError::Remote(wire::decode_remote_exception(&payload)?)),
            MethodResponse::Reply { .. } => {
                Ok(bincode::deserialize(&payload).map_err(RpcError::from)?)
            }
            MethodResponse::Error { .. } => unreachable!("errors surface as RpcError"),
        }
    }

    /// Oneway call: returns as soon as the request is on the wire.
    pub async fn call_oneway<P>(&mut self, service: &str, method_id: u32, params: &P) -> RpcResult<()>
    where
        P: Serialize,
    {
        let params = bincode::serialize(params)?;
        self.call_raw(service, method_id, &params, true).await?;
        Ok(())
    }

    /// Send an OOB control message on a carrier call and decode the reply.
    pub async fn send_oob(&mut self, oob: OobRequest) -> RpcResult<OobResponse> {
        let (resp, _) = self
            .call_raw_with_oob(
                crate::defaults::CONTROL_SERVICE,
                0,
                &[],
                false,
                oob.encode(),
            )
            .await?
            .expect("two-way call always yields a response");
        match resp {
            MethodResponse::Reply { oob_response, .. } => OobResponse::decode(&oob_response),
            MethodResponse::Error { .. } => unreachable!("errors surface as RpcError"),
        }
    }

    /// Negotiate transport filters with the server, then install the same
    /// chain locally. Both sides reset filter state; the next message is
    /// carried through the new chain.
    pub async fn request_transport_filters(&mut self, ids: &[FilterId]) -> RpcResult<()> {
        let raw_ids: Vec<u32> = ids.iter().map(|id| *id as u32).collect();
        let resp = self
            .send_oob(OobRequest::RequestTransportFilters {
                runtime_version: self.runtime_version,
                filter_ids: raw_ids,
            })
            .await?;
        if resp.error_code != 0 {
            return Err(RpcError::with_args(
                ErrorCode::from_wire(resp.error_code),
                0,
                0,
            ));
        }
        let chain = self.build_filter_chain(ids)?;
        self.transport
            .install_filters(chain, self.opts.connect_timeout)
            .await
    }

    /// Client half of a negotiated filter chain.
    fn build_filter_chain(&self, ids: &[FilterId]) -> RpcResult<FilterChain> {
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(ids.len());
        for id in ids {
            match id {
                FilterId::Zlib => filters.push(Box::new(ZlibCompressionFilter::default())),
                FilterId::Tls | FilterId::Schannel => {
                    let (config, server_name) = self.opts.tls.clone().ok_or_else(|| {
                        RpcError::with_what(
                            ErrorCode::UnknownFilter,
                            "tls filter requested without client tls configuration",
                        )
                    })?;
                    filters.push(Box::new(TlsFilter::client(config, &server_name)?));
                }
                FilterId::Ntlm | FilterId::Kerberos | FilterId::Negotiate => {
                    let secret = self.opts.auth_secret.clone().ok_or_else(|| {
                        RpcError::with_what(
                            ErrorCode::UnknownFilter,
                            "auth filter requested without a shared secret",
                        )
                    })?;
                    let mechanism = match id {
                        FilterId::Ntlm => AuthMechanism::Ntlm,
                        FilterId::Kerberos => AuthMechanism::Kerberos,
                        _ => AuthMechanism::Negotiate,
                    };
                    filters.push(Box::new(AuthFilter::new(
                        mechanism,
                        AuthRole::Client,
                        self.opts.auth_qop,
                        secret,
                    )));
                }
            }
        }
        Ok(FilterChain::new(filters))
    }

    /// Surrender the framed connection (subscriptions take the stream
    /// over once the OOB handshake is done).
    pub(crate) fn take_framed(&mut self) -> Option<FramedStream> {
        self.transport.take_framed()
    }
}
