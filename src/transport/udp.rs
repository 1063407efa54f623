//! UDP transport.
//!
//! Each datagram carries exactly one `[u32 length][body]` frame; the length
//! prefix is retained for uniformity with the stream transports and must
//! match the datagram size minus the header. Messages that would exceed a
//! single datagram are rejected before any send. Transport filters do not
//! apply to datagram endpoints.

use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::transport::{resolve, CancelHandle, ClientTransport, TransferCounters};
use crate::wire;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Largest frame body a single datagram can carry: the IPv4 UDP payload
/// ceiling minus our 4-byte frame header.
pub const MAX_DATAGRAM_BODY: usize = 65_507 - wire::FRAME_HEADER_LEN;

fn apply_endpoint_options(socket: &UdpSocket, endpoint: &Endpoint) -> RpcResult<()> {
    if let Endpoint::Udp { ttl, broadcast, .. } = endpoint {
        if let Some(ttl) = ttl {
            socket.set_multicast_ttl_v4(*ttl)?;
            socket.set_ttl(*ttl)?;
        }
        if *broadcast {
            socket.set_broadcast(true)?;
        }
    }
    Ok(())
}

pub struct UdpClientTransport {
    endpoint: Endpoint,
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
    counters: Arc<TransferCounters>,
    cancel: CancelHandle,
    max_incoming: u32,
    max_outgoing: u32,
}

impl UdpClientTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            socket: None,
            target: None,
            counters: Arc::new(TransferCounters::default()),
            cancel: CancelHandle::default(),
            max_incoming: crate::defaults::MAX_MESSAGE_LENGTH,
            max_outgoing: MAX_DATAGRAM_BODY as u32,
        }
    }
}

#[async_trait]
impl ClientTransport for UdpClientTransport {
    async fn connect(&mut self, timeout: Duration) -> RpcResult<()> {
        let (host, port) = self
            .endpoint
            .host_port()
            .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
        let connect = async {
            let target = resolve(&host, port).await?;
            let bind_addr: SocketAddr = if target.is_ipv4() {
                "0.0.0.0:0".parse().expect("literal addr")
            } else {
                "[::]:0".parse().expect("literal addr")
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            apply_endpoint_options(&socket, &self.endpoint)?;
            socket.connect(target).await?;
            debug!(%target, "udp client bound");
            Ok((socket, target))
        };
        let (socket, target) = self
            .cancel
            .run(connect, timeout, ErrorCode::ClientConnectTimeout)
            .await?;
        self.socket = Some(socket);
        self.target = Some(target);
        Ok(())
    }

    async fn send(&mut self, body: &[u8], timeout: Duration) -> RpcResult<()> {
        if body.len() > MAX_DATAGRAM_BODY || body.len() as u64 > u64::from(self.max_outgoing) {
            return Err(RpcError::with_args(
                ErrorCode::DatagramTooLarge,
                body.len() as i32,
                MAX_DATAGRAM_BODY as i32,
            ));
        }
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        let datagram = wire::frame(body);
        self.cancel
            .run(
                async {
                    socket.send(&datagram).await?;
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
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| RpcError::new(ErrorCode::PeerDisconnect))?;
        let max_incoming = self.max_incoming;
        let body = self
            .cancel
            .run(
                async {
                    let mut buf = vec![0u8; 65_536];
                    let n = socket.recv(&mut buf).await?;
                    decode_datagram(&buf[..n], max_incoming, false)
                },
                timeout,
                ErrorCode::ClientReadTimeout,
            )
            .await?;
        self.counters.record_receive(body.len() as u64);
        Ok(body)
    }

    async fn disconnect(&mut self) {
        self.socket = None;
        self.target = None;
    }

    async fn install_filters(
        &mut self,
        chain: crate::filter::FilterChain,
        _timeout: Duration,
    ) -> RpcResult<()> {
        if chain.is_empty() {
            return Ok(());
        }
        Err(RpcError::with_what(
            ErrorCode::UnknownFilter,
            "transport filters are not supported on datagram endpoints",
        ))
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
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
        self.max_outgoing = limit.min(MAX_DATAGRAM_BODY as u32);
    }
}

/// Validate and strip the frame header of one received datagram.
///
/// The embedded length must match the datagram size exactly.
pub fn decode_datagram(datagram: &[u8], max_len: u32, inbound_to_server: bool) -> RpcResult<Vec<u8>> {
    if datagram.len() < wire::FRAME_HEADER_LEN {
        return Err(RpcError::new(if inbound_to_server {
            ErrorCode::ClientMessageLength
        } else {
            ErrorCode::ServerMessageLength
        }));
    }
    let len = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    wire::validate_frame_len(len, max_len, inbound_to_server)?;
    if len as usize != datagram.len() - wire::FRAME_HEADER_LEN {
        return Err(RpcError::with_args(
            if inbound_to_server {
                ErrorCode::ClientMessageLength
            } else {
                ErrorCode::ServerMessageLength
            },
            len as i32,
            (datagram.len() - wire::FRAME_HEADER_LEN) as i32,
        ));
    }
    Ok(datagram[wire::FRAME_HEADER_LEN..].to_vec())
}

/// Server-side UDP socket: one bound socket serving framed datagrams, with
/// optional multicast membership.
pub struct UdpServerSocket {
    socket: UdpSocket,
    max_incoming: u32,
}

impl UdpServerSocket {
    pub async fn bind(endpoint: &Endpoint, max_incoming: u32) -> RpcResult<Self> {
        let (host, port) = endpoint
            .host_port()
            .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
        let socket = UdpSocket::bind((host.as_str(), port)).await.map_err(|e| {
            RpcError::with_what(ErrorCode::SocketError, format!("bind {host}:{port}: {e}"))
        })?;
        apply_endpoint_options(&socket, endpoint)?;
        if let Endpoint::Udp {
            multicast: Some(group),
            ..
        } = endpoint
        {
            socket.join_multicast_v4(*group, Ipv4Addr::UNSPECIFIED)?;
            debug!(%group, "joined multicast group");
        }
        debug!(local = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
               "udp server bound");
        Ok(Self {
            socket,
            max_incoming,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Receive one framed datagram into the caller's scratch buffer
    /// (typically pooled). Malformed datagrams are dropped and the wait
    /// continues; a datagram is not a session, so there is nothing to
    /// fail.
    pub async fn recv_with(&self, scratch: &mut Vec<u8>) -> RpcResult<(Vec<u8>, SocketAddr)> {
        scratch.resize(65_536, 0);
        loop {
            let (n, peer) = self.socket.recv_from(scratch).await?;
            match decode_datagram(&scratch[..n], self.max_incoming, true) {
                Ok(body) => return Ok((body, peer)),
                Err(e) => {
                    debug!(%peer, code = ?e.code, "dropping malformed datagram");
                }
            }
        }
    }

    pub async fn recv(&self) -> RpcResult<(Vec<u8>, SocketAddr)> {
        let mut scratch = Vec::new();
        self.recv_with(&mut scratch).await
    }

    pub async fn send_to(&self, body: &[u8], peer: SocketAddr) -> RpcResult<()> {
        if body.len() > MAX_DATAGRAM_BODY {
            return Err(RpcError::new(ErrorCode::DatagramTooLarge));
        }
        self.socket.send_to(&wire::frame(body), peer).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_round_trip() {
        let server = UdpServerSocket::bind(&Endpoint::udp("127.0.0.1", 0), 65_536)
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();

        let server_task = tokio::spawn(async move {
            let (body, peer) = server.recv().await.unwrap();
            server.send_to(&body, peer).await.unwrap();
        });

        let mut client = UdpClientTransport::new(Endpoint::udp("127.0.0.1", port));
        client.connect(Duration::from_secs(5)).await.unwrap();
        client
            .send(b"datagram", Duration::from_secs(5))
            .await
            .unwrap();
        let reply = client.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, b"datagram");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_send() {
        let mut client = UdpClientTransport::new(Endpoint::udp("127.0.0.1", 1));
        client.connect(Duration::from_secs(5)).await.unwrap();
        let big = vec![0u8; MAX_DATAGRAM_BODY + 1];
        let err = client.send(&big, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DatagramTooLarge);
    }

    #[test]
    fn test_decode_datagram_length_must_match() {
        let mut datagram = wire::frame(b"abc");
        datagram.push(0xff);
        assert!(decode_datagram(&datagram, 1024, true).is_err());
        let good = wire::frame(b"abc");
        assert_eq!(decode_datagram(&good, 1024, true).unwrap(), b"abc");
    }
}
