//! Transport abstraction.
//!
//! Two polymorphic roles: a *client transport* owns one logical connection
//! and a *server transport* owns a listener that accepts into network
//! sessions. Stream transports (TCP, local sockets, proxied connections)
//! share the framed-stream plumbing here; datagram and HTTP transports
//! supply their own framing in their modules.
//!
//! All byte limits and counters live at this layer: each client transport
//! carries a max-incoming / max-outgoing message length and tracks the last
//! and total bytes in each direction.

pub mod http;
pub mod local;
pub mod tcp;
pub mod udp;

use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::filter::FilterChain;
use crate::wire;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

/// Object-safe alias for the byte streams transports hand around.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type DynStream = Box<dyn AsyncStream>;

/// Transports never honor a connect deadline shorter than this.
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

/// Byte accounting shared between a transport and its owning stub.
#[derive(Debug, Default)]
pub struct TransferCounters {
    last_request_size: AtomicU64,
    last_response_size: AtomicU64,
    total_sent: AtomicU64,
    total_received: AtomicU64,
}

impl TransferCounters {
    pub fn record_send(&self, n: u64) {
        self.last_request_size.store(n, Ordering::Relaxed);
        self.total_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_receive(&self, n: u64) {
        self.last_response_size.store(n, Ordering::Relaxed);
        self.total_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn last_request_size(&self) -> u64 {
        self.last_request_size.load(Ordering::Relaxed)
    }

    pub fn last_response_size(&self) -> u64 {
        self.last_response_size.load(Ordering::Relaxed)
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }
}

/// Cooperative cancellation shared between a stub and its transport.
///
/// `cancel` is synchronous and non-blocking: it flips the flag and wakes
/// any waiter, which fails with `ClientCancel`. Cancelling an operation
/// that already completed is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Run `fut` under this handle and the given deadline.
    pub async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = RpcResult<T>>,
        deadline: Duration,
        timeout_code: ErrorCode,
    ) -> RpcResult<T> {
        if self.is_cancelled() {
            return Err(RpcError::new(ErrorCode::ClientCancel));
        }
        tokio::select! {
            _ = self.notify.notified() => Err(RpcError::new(ErrorCode::ClientCancel)),
            r = tokio::time::timeout(deadline, fut) => match r {
                Ok(inner) => inner,
                Err(_) => Err(RpcError::new(timeout_code)),
            },
        }
    }
}

/// A byte stream plus its filter chain, speaking length-prefixed frames on
/// the plaintext side of the chain.
pub struct FramedStream {
    stream: DynStream,
    chain: FilterChain,
    /// Plaintext accumulated past the chain but not yet consumed as frames.
    plain: Vec<u8>,
}

impl FramedStream {
    pub fn new(stream: DynStream) -> Self {
        Self {
            stream,
            chain: FilterChain::default(),
            plain: Vec::new(),
        }
    }

    pub fn with_chain(stream: DynStream, chain: FilterChain) -> Self {
        Self {
            stream,
            chain,
            plain: Vec::new(),
        }
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Replace the filter chain. Any undelivered plaintext is retained;
    /// bytes already in flight through the old chain are discarded, which
    /// is why filter swaps only happen on a quiet connection.
    pub fn set_chain(&mut self, mut chain: FilterChain) {
        chain.reset_state();
        self.chain = chain;
    }

    pub fn into_stream(self) -> DynStream {
        self.stream
    }

    /// Decompose into the raw stream, its chain, and any plaintext already
    /// read past the chain. Used when a session changes roles.
    pub fn into_parts(self) -> (DynStream, FilterChain, Vec<u8>) {
        (self.stream, self.chain, self.plain)
    }

    /// Undelivered plaintext read past the chain but not yet framed.
    pub(crate) fn plain_buffer(&self) -> &[u8] {
        &self.plain
    }

    pub(crate) fn consume_plain(&mut self, n: usize) {
        self.plain.drain(..n);
    }

    /// Read wire bytes and run them through the chain into the plaintext
    /// buffer.
    pub(crate) async fn fill_plain(&mut self) -> RpcResult<()> {
        let mut raw = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut raw).await?;
        if n == 0 {
            return Err(RpcError::new(ErrorCode::PeerDisconnect));
        }
        let app = self.chain.read(&raw[..n])?;
        self.plain.extend_from_slice(&app);
        Ok(())
    }

    /// Transform outbound bytes through the chain without framing them.
    /// The HTTP session path frames its own bodies.
    pub(crate) fn chain_write(&mut self, bytes: &[u8]) -> RpcResult<Vec<u8>> {
        self.chain.write(bytes)
    }

    pub(crate) async fn write_raw(&mut self, wire_bytes: &[u8]) -> RpcResult<()> {
        self.stream.write_all(wire_bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Drive the filter handshake to completion, shuttling bytes in both
    /// directions. A no-op for chains without handshaking filters.
    pub async fn run_handshake(&mut self) -> RpcResult<()> {
        loop {
            let out = self.chain.pending_wire()?;
            if !out.is_empty() {
                self.stream.write_all(&out).await?;
                self.stream.flush().await?;
            }
            if self.chain.handshake_done() {
                return Ok(());
            }
            let mut raw = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut raw).await?;
            if n == 0 {
                return Err(RpcError::new(ErrorCode::PeerDisconnect));
            }
            let app = self.chain.read(&raw[..n])?;
            // Nothing application-level may arrive before the handshake
            // completes; hold anything that slips through for the reader.
            self.plain.extend_from_slice(&app);
        }
    }

    /// Send one frame body; framing and filtering applied here.
    pub async fn send_frame(&mut self, body: &[u8]) -> RpcResult<()> {
        let wire_bytes = self.chain.write(&wire::frame(body))?;
        self.stream.write_all(&wire_bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one frame body, reading more wire bytes as needed.
    pub async fn recv_frame(&mut self, max_len: u32, inbound_to_server: bool) -> RpcResult<Vec<u8>> {
        loop {
            if self.plain.len() >= wire::FRAME_HEADER_LEN {
                let len = u32::from_le_bytes([
                    self.plain[0],
                    self.plain[1],
                    self.plain[2],
                    self.plain[3],
                ]);
                wire::validate_frame_len(len, max_len, inbound_to_server)?;
                let total = wire::FRAME_HEADER_LEN + len as usize;
                if self.plain.len() >= total {
                    let body = self.plain[wire::FRAME_HEADER_LEN..total].to_vec();
                    self.plain.drain(..total);
                    return Ok(body);
                }
            }
            let mut raw = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut raw).await?;
            if n == 0 {
                return Err(RpcError::new(ErrorCode::PeerDisconnect));
            }
            let app = self.chain.read(&raw[..n])?;
            self.plain.extend_from_slice(&app);
        }
    }

    /// Whether a complete frame is already buffered (no socket read
    /// needed to serve the next `recv_frame`).
    pub fn frame_buffered(&self) -> bool {
        if self.plain.len() < wire::FRAME_HEADER_LEN {
            return false;
        }
        let len = u32::from_le_bytes([self.plain[0], self.plain[1], self.plain[2], self.plain[3]]);
        self.plain.len() >= wire::FRAME_HEADER_LEN + len as usize
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Dialing half of a stream transport; TCP, local sockets and proxied
/// connections plug in here.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, timeout: Duration) -> RpcResult<DynStream>;

    /// Filters the connector itself requires (e.g. TLS for an `https`
    /// target), installed ahead of any user-requested filters.
    fn implicit_filters(&self) -> RpcResult<FilterChain> {
        Ok(FilterChain::default())
    }

    fn describe(&self) -> String;
}

/// Client transport over any `StreamConnector`.
pub struct StreamClientTransport {
    connector: Box<dyn StreamConnector>,
    framed: Option<FramedStream>,
    counters: Arc<TransferCounters>,
    cancel: CancelHandle,
    max_incoming: u32,
    max_outgoing: u32,
}

impl StreamClientTransport {
    pub fn new(connector: Box<dyn StreamConnector>) -> Self {
        Self {
            connector,
            framed: None,
            counters: Arc::new(TransferCounters::default()),
            cancel: CancelHandle::default(),
            max_incoming: crate::defaults::MAX_MESSAGE_LENGTH,
            max_outgoing: crate::defaults::MAX_MESSAGE_LENGTH,
        }
    }
}

/// Operations every client transport provides, regardless of wire kind.
#[async_trait]
pub trait ClientTransport: Send {
    async fn connect(&mut self, timeout: Duration) -> RpcResult<()>;

    /// Send one frame body. The transport applies its own outer framing.
    async fn send(&mut self, body: &[u8], timeout: Duration) -> RpcResult<()>;

    /// Receive one frame body.
    async fn receive(&mut self, timeout: Duration) -> RpcResult<Vec<u8>>;

    async fn disconnect(&mut self);

    /// Install a transport filter chain and run its handshake.
    async fn install_filters(&mut self, chain: FilterChain, timeout: Duration) -> RpcResult<()>;

    fn is_connected(&self) -> bool;
    fn counters(&self) -> Arc<TransferCounters>;
    fn cancel_handle(&self) -> CancelHandle;

    fn max_incoming(&self) -> u32;
    fn set_max_incoming(&mut self, limit: u32);
    fn max_outgoing(&self) -> u32;
    fn set_max_outgoing(&mut self, limit: u32);

    /// Surrender the underlying stream, if this transport has one. Used
    /// when a connection changes roles (proxy dial-back, callbacks).
    fn take_stream(&mut self) -> Option<DynStream> {
        None
    }

    /// Surrender the framed stream including its filter chain, if this
    /// transport has one. Subscriptions use this to keep filtered
    /// connections intact across the role change.
    fn take_framed(&mut self) -> Option<FramedStream> {
        None
    }
}

#[async_trait]
impl ClientTransport for StreamClientTransport {
    async fn connect(&mut self, timeout: Duration) -> RpcResult<()> {
        let deadline = timeout.max(MIN_CONNECT_TIMEOUT);
        let stream = self
            .cancel
            .run(
                self.connector.connect(deadline),
                deadline,
                ErrorCode::ClientConnectTimeout,
            )
            .await?;
        let chain = self.connector.implicit_filters()?;
        let mut framed = FramedStream::with_chain(stream, chain);
        if !framed.chain().handshake_done() {
            self.cancel
                .run(
                    framed.run_handshake(),
                    deadline,
                    ErrorCode::ClientConnectTimeout,
                )
                .await?;
        }
        debug!(target = %self.connector.describe(), "client transport connected");
        self.framed = Some(framed);
        Ok(())
    }

    async fn send(&mut self, body: &[u8], timeout: Duration) -> RpcResult<()> {
        if body.len() as u64 > u64::from(self.max_outgoing) {
            return Err(RpcError::with_args(
                ErrorCode::ClientMessageLength,
                body.len() as i32,
                self.max_outgoing as i32,
            ));
        }
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        self.cancel
            .run(
                framed.send_frame(body),
                timeout,
                ErrorCode::ClientWriteTimeout,
            )
            .await?;
        self.counters.record_send(body.len() as u64);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> RpcResult<Vec<u8>> {
        let max_incoming = self.max_incoming;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        let body = self
            .cancel
            .run(
                framed.recv_frame(max_incoming, false),
                timeout,
                ErrorCode::ClientReadTimeout,
            )
            .await?;
        self.counters.record_receive(body.len() as u64);
        Ok(body)
    }

    async fn disconnect(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            framed.shutdown().await;
        }
    }

    async fn install_filters(&mut self, chain: FilterChain, timeout: Duration) -> RpcResult<()> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        framed.set_chain(chain);
        if !framed.chain().handshake_done() {
            self.cancel
                .run(
                    framed.run_handshake(),
                    timeout,
                    ErrorCode::ClientConnectTimeout,
                )
                .await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    fn counters(&self) -> Arc<TransferCounters> {
        Arc::clone(&self.counters)
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn max_incoming(&self) -> u32 {
        self.max_incoming
    }

    fn set_max_incoming(&mut self, limit: u32) {
        self.max_incoming = limit;
    }

    fn max_outgoing(&self) -> u32 {
        self.max_outgoing
    }

    fn set_max_outgoing(&mut self, limit: u32) {
        self.max_outgoing = limit;
    }

    fn take_stream(&mut self) -> Option<DynStream> {
        self.framed.take().map(FramedStream::into_stream)
    }

    fn take_framed(&mut self) -> Option<FramedStream> {
        self.framed.take()
    }
}

/// How an accepted connection frames its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Raw length-prefixed frames.
    Raw,
    /// Frames embedded in HTTP request/response bodies.
    Http,
}

/// One connection handed out by a server transport.
pub struct Accepted {
    pub stream: DynStream,
    pub peer: String,
    pub kind: StreamKind,
    /// Filters the endpoint mandates (e.g. TLS for https listeners).
    pub initial_chain: FilterChain,
}

/// Listening half of a stream transport.
#[async_trait]
pub trait ServerTransport: Send {
    async fn bind(&mut self) -> RpcResult<()>;

    /// Accept the next connection. Cancellation-safe.
    async fn accept(&mut self) -> RpcResult<Accepted>;

    /// The bound address, once `bind` has succeeded. For ephemeral-port
    /// listeners this is how tests discover the real port.
    fn local_addr(&self) -> Option<String>;
}

/// DNS resolution without blocking the reactor.
pub async fn resolve(host: &str, port: u16) -> RpcResult<std::net::SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        RpcError::with_what(ErrorCode::SocketError, format!("resolve {host}: {e}"))
    })?;
    addrs
        .next()
        .ok_or_else(|| RpcError::with_what(ErrorCode::SocketError, format!("no address for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let c = TransferCounters::default();
        c.record_send(10);
        c.record_send(20);
        c.record_receive(5);
        assert_eq!(c.last_request_size(), 20);
        assert_eq!(c.total_sent(), 30);
        assert_eq!(c.last_response_size(), 5);
        assert_eq!(c.total_received(), 5);
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let cancel = CancelHandle::default();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move {
            waiter
                .run(
                    async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(())
                    },
                    Duration::from_secs(60),
                    ErrorCode::ClientReadTimeout,
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::ClientCancel);
    }

    #[tokio::test]
    async fn test_framed_stream_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = FramedStream::new(Box::new(a));
        let mut right = FramedStream::new(Box::new(b));

        left.send_frame(b"ping").await.unwrap();
        let got = right.recv_frame(1024, true).await.unwrap();
        assert_eq!(got, b"ping");

        right.send_frame(b"pong").await.unwrap();
        let got = left.recv_frame(1024, false).await.unwrap();
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn test_framed_stream_rejects_oversized_frame() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = FramedStream::new(Box::new(a));
        let mut right = FramedStream::new(Box::new(b));
        left.send_frame(&vec![0u8; 2048]).await.unwrap();
        let err = right.recv_frame(1024, true).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ClientMessageLength);
    }
}
