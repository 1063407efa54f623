//! HTTP and HTTPS transports.
//!
//! RPC frames ride inside HTTP/1.1 message bodies: POST requests on the
//! client side, responses (fixed-length, or chunked when the server streams
//! published messages) on the server side. The embedded payload starts with
//! the same 4-byte length prefix as the stream transports. HTTPS is the
//! same framing with a TLS filter at the bottom of the chain; when an HTTP
//! proxy is configured it becomes the connect target and a CONNECT request
//! opens the tunnel before the TLS handshake.

use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::filter::tls::TlsFilter;
use crate::filter::FilterChain;
use crate::transport::tcp::TcpConnector;
use crate::transport::{
    Accepted, CancelHandle, ClientTransport, DynStream, ServerTransport, StreamConnector,
    StreamKind, TransferCounters,
};
use crate::wire;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// A parsed HTTP/1.1 message head.
#[derive(Debug, Clone)]
pub struct HttpHead {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    pub fn chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn keep_alive(&self) -> bool {
        !self
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    /// Status code of a response head.
    pub fn status(&self) -> Option<(u16, String)> {
        let mut parts = self.start_line.splitn(3, ' ');
        let _version = parts.next()?;
        let code = parts.next()?.parse().ok()?;
        let text = parts.next().unwrap_or("").to_owned();
        Some((code, text))
    }
}

/// Parse a message head if a complete one is buffered; returns the head
/// and the offset of the body.
pub fn try_parse_head(buf: &[u8]) -> RpcResult<Option<(HttpHead, usize)>> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > 64 * 1024 {
            return Err(RpcError::with_what(
                ErrorCode::HttpResponse,
                "http head too large",
            ));
        }
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| RpcError::with_what(ErrorCode::HttpResponse, "non-ascii http head"))?;
    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| RpcError::with_what(ErrorCode::HttpResponse, "empty http head"))?
        .to_owned();
    let mut headers = Vec::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_owned(), v.trim().to_owned()));
        }
    }
    Ok(Some((
        HttpHead {
            start_line,
            headers,
        },
        end + 4,
    )))
}

/// Build a POST request carrying one frame.
pub fn build_request(host: &str, url_path: &str, frame: &[u8]) -> Vec<u8> {
    let head = format!(
        "POST {url_path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\r\n",
        frame.len()
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(frame);
    out
}

/// Build a 200 response carrying one frame.
pub fn build_response(frame: &[u8], keep_alive: bool) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\r\n",
        frame.len(),
        if keep_alive { "keep-alive" } else { "close" }
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(frame);
    out
}

/// Head of a chunked streaming response; each subsequent frame goes out as
/// one chunk via `encode_chunk`.
pub fn build_chunked_response_head() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\n"
        .to_vec()
}

pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn build_error_response(status: u16, text: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {text}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\r\n"
    )
    .into_bytes()
}

#[derive(Clone, Copy)]
enum ReadState {
    Head,
    FixedBody { remaining: usize, keep_alive: bool },
    ChunkedBody,
}

/// Client transport embedding frames in HTTP POST exchanges over a
/// persistent connection.
pub struct HttpClientTransport {
    host: String,
    port: u16,
    url_path: String,
    tls: Option<(Arc<rustls::ClientConfig>, String)>,
    http_proxy: Option<(String, u16)>,
    stream: Option<DynStream>,
    chain: FilterChain,
    plain: Vec<u8>,
    body: Vec<u8>,
    frames: VecDeque<Vec<u8>>,
    read_state: ReadState,
    counters: Arc<TransferCounters>,
    cancel: CancelHandle,
    max_incoming: u32,
    max_outgoing: u32,
}

impl HttpClientTransport {
    pub fn new(host: impl Into<String>, port: u16, url_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            url_path: url_path.into(),
            tls: None,
            http_proxy: None,
            stream: None,
            chain: FilterChain::default(),
            plain: Vec::new(),
            body: Vec::new(),
            frames: VecDeque::new(),
            read_state: ReadState::Head,
            counters: Arc::new(TransferCounters::default()),
            cancel: CancelHandle::default(),
            max_incoming: crate::defaults::MAX_MESSAGE_LENGTH,
            max_outgoing: crate::defaults::MAX_MESSAGE_LENGTH,
        }
    }

    /// Enable TLS (an `https` endpoint).
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>, server_name: &str) -> Self {
        self.tls = Some((config, server_name.to_owned()));
        self
    }

    /// Route the connection through an HTTP proxy.
    pub fn with_http_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.http_proxy = Some((host.into(), port));
        self
    }

    async fn read_more(&mut self) -> RpcResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        let mut raw = [0u8; READ_CHUNK];
        let n = stream.read(&mut raw).await?;
        if n == 0 {
            return Err(RpcError::new(ErrorCode::PeerDisconnect));
        }
        let app = self.chain.read(&raw[..n])?;
        self.plain.extend_from_slice(&app);
        Ok(())
    }

    /// Pull frames out of `self.body` into the frame queue.
    fn drain_body_frames(&mut self, max_len: u32) -> RpcResult<()> {
        loop {
            if self.body.len() < wire::FRAME_HEADER_LEN {
                return Ok(());
            }
            let len =
                u32::from_le_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
            wire::validate_frame_len(len, max_len, false)?;
            let total = wire::FRAME_HEADER_LEN + len as usize;
            if self.body.len() < total {
                return Ok(());
            }
            let frame = self.body[wire::FRAME_HEADER_LEN..total].to_vec();
            self.body.drain(..total);
            self.frames.push_back(frame);
        }
    }

    /// Advance the HTTP response state machine until a frame is available.
    async fn next_frame(&mut self) -> RpcResult<Vec<u8>> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            match self.read_state {
                ReadState::Head => {
                    let Some((head, body_offset)) = try_parse_head(&self.plain)? else {
                        self.read_more().await?;
                        continue;
                    };
                    let (status, text) = head.status().ok_or_else(|| {
                        RpcError::with_what(ErrorCode::HttpResponse, "bad status line")
                    })?;
                    if status != 200 {
                        return Err(RpcError::with_what(
                            ErrorCode::HttpResponse,
                            format!("{status} {text}"),
                        ));
                    }
                    self.plain.drain(..body_offset);
                    if head.chunked() {
                        self.read_state = ReadState::ChunkedBody;
                    } else {
                        let remaining = head.content_length().ok_or_else(|| {
                            RpcError::with_what(
                                ErrorCode::HttpResponse,
                                "response without length",
                            )
                        })?;
                        self.read_state = ReadState::FixedBody {
                            remaining,
                            keep_alive: head.keep_alive(),
                        };
                    }
                }
                ReadState::FixedBody {
                    remaining,
                    keep_alive,
                } => {
                    if remaining == 0 {
                        self.read_state = ReadState::Head;
                        if !keep_alive {
                            self.stream = None;
                        }
                        self.drain_body_frames(self.max_incoming)?;
                        continue;
                    }
                    if self.plain.is_empty() {
                        self.read_more().await?;
                    }
                    let take = remaining.min(self.plain.len());
                    self.body.extend(self.plain.drain(..take));
                    self.read_state = ReadState::FixedBody {
                        remaining: remaining - take,
                        keep_alive,
                    };
                    self.drain_body_frames(self.max_incoming)?;
                }
                ReadState::ChunkedBody => {
                    // Chunk size line, data, trailing CRLF.
                    let Some(line_end) = self.plain.windows(2).position(|w| w == b"\r\n") else {
                        self.read_more().await?;
                        continue;
                    };
                    let size = usize::from_str_radix(
                        std::str::from_utf8(&self.plain[..line_end])
                            .unwrap_or("")
                            .trim(),
                        16,
                    )
                    .map_err(|_| {
                        RpcError::with_what(ErrorCode::HttpResponse, "bad chunk size")
                    })?;
                    let chunk_total = line_end + 2 + size + 2;
                    if self.plain.len() < chunk_total {
                        self.read_more().await?;
                        continue;
                    }
                    if size == 0 {
                        self.plain.drain(..chunk_total);
                        self.read_state = ReadState::Head;
                        continue;
                    }
                    self.body
                        .extend_from_slice(&self.plain[line_end + 2..line_end + 2 + size]);
                    self.plain.drain(..chunk_total);
                    self.drain_body_frames(self.max_incoming)?;
                }
            }
        }
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    async fn connect(&mut self, timeout: Duration) -> RpcResult<()> {
        let (connect_host, connect_port) = self
            .http_proxy
            .clone()
            .unwrap_or_else(|| (self.host.clone(), self.port));
        let connector = TcpConnector::new(connect_host, connect_port);
        let mut stream = self
            .cancel
            .run(
                connector.connect(timeout),
                timeout.max(super::MIN_CONNECT_TIMEOUT),
                ErrorCode::ClientConnectTimeout,
            )
            .await?;

        // CONNECT tunnel through the proxy before any TLS bytes flow.
        if self.http_proxy.is_some() && self.tls.is_some() {
            let connect_req = format!(
                "CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\n\r\n",
                self.host, self.port
            );
            stream.write_all(connect_req.as_bytes()).await?;
            let mut buf = Vec::new();
            loop {
                let mut raw = [0u8; READ_CHUNK];
                let n = stream.read(&mut raw).await?;
                if n == 0 {
                    return Err(RpcError::new(ErrorCode::PeerDisconnect));
                }
                buf.extend_from_slice(&raw[..n]);
                if let Some((head, body_offset)) = try_parse_head(&buf)? {
                    let (status, text) = head.status().ok_or_else(|| {
                        RpcError::with_what(ErrorCode::HttpResponse, "bad proxy reply")
                    })?;
                    if status != 200 {
                        return Err(RpcError::with_what(
                            ErrorCode::HttpResponse,
                            format!("proxy: {status} {text}"),
                        ));
                    }
                    debug!("http proxy tunnel established");
                    buf.drain(..body_offset);
                    break;
                }
            }
        }

        let mut chain = FilterChain::default();
        if let Some((config, server_name)) = &self.tls {
            chain = FilterChain::new(vec![Box::new(TlsFilter::client(
                Arc::clone(config),
                server_name,
            )?)]);
        }
        self.stream = Some(stream);
        self.chain = chain;
        self.plain.clear();
        self.body.clear();
        self.frames.clear();
        self.read_state = ReadState::Head;

        if !self.chain.handshake_done() {
            // Shuttle handshake records by hand; the chain owns no socket.
            loop {
                let out = self.chain.pending_wire()?;
                if !out.is_empty() {
                    let stream = self.stream.as_mut().expect("stream set above");
                    stream.write_all(&out).await?;
                    stream.flush().await?;
                }
                if self.chain.handshake_done() {
                    break;
                }
                self.read_more().await?;
            }
        }
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
        let request = build_request(&self.host, &self.url_path, &wire::frame(body));
        let wire_bytes = self.chain.write(&request)?;
        let cancel = self.cancel.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        cancel
            .run(
                async {
                    stream.write_all(&wire_bytes).await?;
                    stream.flush().await?;
                    Ok(())
                },
                timeout,
                ErrorCode::ClientWriteTimeout,
            )
            .await?;
        self.counters.record_send(body.len() as u64);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> RpcResult<Vec<u8>> {
        let cancel = self.cancel.clone();
        let frame = cancel
            .run(self.next_frame(), timeout, ErrorCode::ClientReadTimeout)
            .await?;
        self.counters.record_receive(frame.len() as u64);
        Ok(frame)
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn install_filters(&mut self, chain: FilterChain, _timeout: Duration) -> RpcResult<()> {
        if chain.is_empty() {
            return Ok(());
        }
        Err(RpcError::with_what(
            ErrorCode::UnknownFilter,
            "transport filters on http endpoints are limited to the implicit tls filter",
        ))
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
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
}

/// Listener for http/https endpoints; accepted connections speak HTTP
/// framing, with TLS below it when a server config is supplied.
pub struct HttpServerTransport {
    host: String,
    port: u16,
    tls: Option<Arc<rustls::ServerConfig>>,
    listener: Option<TcpListener>,
}

impl HttpServerTransport {
    pub fn new(host: impl Into<String>, port: u16, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            listener: None,
        }
    }
}

#[async_trait]
impl ServerTransport for HttpServerTransport {
    async fn bind(&mut self) -> RpcResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            RpcError::with_what(ErrorCode::SocketError, format!("bind {addr}: {e}"))
        })?;
        debug!(local = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
               tls = self.tls.is_some(), "http server listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> RpcResult<Accepted> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
        let (stream, peer) = listener.accept().await?;
        let initial_chain = match &self.tls {
            Some(config) => {
                FilterChain::new(vec![Box::new(TlsFilter::server(Arc::clone(config))?)])
            }
            None => FilterChain::default(),
        };
        Ok(Accepted {
            stream: Box::new(stream),
            peer: peer.to_string(),
            kind: StreamKind::Http,
            initial_chain,
        })
    }

    fn local_addr(&self) -> Option<String> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_parsing() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: keep-alive\r\n\r\nbody";
        let (head, offset) = try_parse_head(raw).unwrap().unwrap();
        assert_eq!(head.status().unwrap().0, 200);
        assert_eq!(head.content_length(), Some(10));
        assert!(head.keep_alive());
        assert_eq!(&raw[offset..], b"body");
    }

    #[test]
    fn test_incomplete_head_returns_none() {
        assert!(try_parse_head(b"HTTP/1.1 200 OK\r\nContent-").unwrap().is_none());
    }

    #[test]
    fn test_request_build_round_trip() {
        let frame = wire::frame(b"payload");
        let request = build_request("example.com", "/rpc", &frame);
        let (head, offset) = try_parse_head(&request).unwrap().unwrap();
        assert!(head.start_line.starts_with("POST /rpc"));
        assert_eq!(head.content_length(), Some(frame.len()));
        assert_eq!(&request[offset..], &frame[..]);
    }

    #[test]
    fn test_chunk_encoding() {
        let chunk = encode_chunk(b"abc");
        assert_eq!(chunk, b"3\r\nabc\r\n");
    }

    #[tokio::test]
    async fn test_http_round_trip_over_socket() {
        let mut server = HttpServerTransport::new("127.0.0.1", 0, None);
        server.bind().await.unwrap();
        let port: u16 = server
            .local_addr()
            .unwrap()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let server_task = tokio::spawn(async move {
            let mut accepted = server.accept().await.unwrap();
            // Minimal HTTP exchange: read one request, echo the frame back.
            let mut buf = Vec::new();
            let mut raw = [0u8; 8192];
            let (head, offset) = loop {
                let n = accepted.stream.read(&mut raw).await.unwrap();
                buf.extend_from_slice(&raw[..n]);
                if let Some(parsed) = try_parse_head(&buf).unwrap() {
                    break parsed;
                }
            };
            let want = offset + head.content_length().unwrap();
            while buf.len() < want {
                let n = accepted.stream.read(&mut raw).await.unwrap();
                buf.extend_from_slice(&raw[..n]);
            }
            let frame = &buf[offset..want];
            let response = build_response(frame, true);
            accepted.stream.write_all(&response).await.unwrap();
        });

        let mut client = HttpClientTransport::new("127.0.0.1", port, "/rpc");
        client.connect(Duration::from_secs(5)).await.unwrap();
        client
            .send(b"over http", Duration::from_secs(5))
            .await
            .unwrap();
        let reply = client.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, b"over http");
        server_task.await.unwrap();
    }
}
