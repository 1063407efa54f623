//! TCP transport.

use super::{
    resolve, Accepted, DynStream, ServerTransport, StreamClientTransport, StreamConnector,
    StreamKind,
};
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::filter::FilterChain;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Socket options applied to every TCP connection: disable Nagle and give
/// both directions a fixed kernel buffer.
fn tune(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_recv_buffer_size(buffer_size)?;
    sock.set_send_buffer_size(buffer_size)?;
    Ok(())
}

pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            buffer_size: crate::defaults::SOCKET_BUFFER_SIZE,
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self, _timeout: Duration) -> RpcResult<DynStream> {
        let addr = resolve(&self.host, self.port).await?;
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            RpcError::with_what(ErrorCode::SocketError, format!("connect {addr}: {e}"))
        })?;
        tune(&stream, self.buffer_size)?;
        debug!(%addr, "tcp client connected");
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Client transport dialing a plain TCP endpoint.
pub fn tcp_client_transport(host: impl Into<String>, port: u16) -> StreamClientTransport {
    StreamClientTransport::new(Box::new(TcpConnector::new(host, port)))
}

pub struct TcpServerTransport {
    host: String,
    port: u16,
    buffer_size: usize,
    listener: Option<TcpListener>,
}

impl TcpServerTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            buffer_size: crate::defaults::SOCKET_BUFFER_SIZE,
            listener: None,
        }
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn bind(&mut self) -> RpcResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            RpcError::with_what(ErrorCode::SocketError, format!("bind {addr}: {e}"))
        })?;
        debug!(local = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
               "tcp server listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> RpcResult<Accepted> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
        let (stream, peer) = listener.accept().await?;
        tune(&stream, self.buffer_size)?;
        Ok(Accepted {
            stream: Box::new(stream),
            peer: peer.to_string(),
            kind: StreamKind::Raw,
            initial_chain: FilterChain::default(),
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
    use crate::transport::{ClientTransport, FramedStream};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_client_server_frame_round_trip() {
        let mut server = TcpServerTransport::new("127.0.0.1", 0);
        server.bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

        let server_task = tokio::spawn(async move {
            let accepted = server.accept().await.unwrap();
            let mut framed = FramedStream::new(accepted.stream);
            let got = framed.recv_frame(1024 * 1024, true).await.unwrap();
            framed.send_frame(&got).await.unwrap();
        });

        let mut client = tcp_client_transport("127.0.0.1", port);
        client.connect(Duration::from_secs(5)).await.unwrap();
        client
            .send(b"echo me", Duration::from_secs(5))
            .await
            .unwrap();
        let reply = client.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, b"echo me");
        assert_eq!(client.counters().last_request_size(), 7);
        assert_eq!(client.counters().last_response_size(), 7);

        client.disconnect().await;
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_socket_error() {
        // Port 1 on localhost is essentially never listening.
        let mut client = tcp_client_transport("127.0.0.1", 1);
        let err = client.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(
            err.code,
            ErrorCode::SocketError | ErrorCode::ClientConnectTimeout
        ));
    }
}
