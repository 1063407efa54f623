//! Local transport: unix domain sockets.
//!
//! Named-pipe endpoints resolve to a filesystem socket path and land here
//! as well on unix targets.

use super::{
    Accepted, DynStream, ServerTransport, StreamClientTransport, StreamConnector, StreamKind,
};
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::filter::FilterChain;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

pub struct LocalConnector {
    pub path: PathBuf,
}

#[async_trait]
impl StreamConnector for LocalConnector {
    async fn connect(&self, _timeout: Duration) -> RpcResult<DynStream> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            RpcError::with_what(
                ErrorCode::SocketError,
                format!("connect {}: {e}", self.path.display()),
            )
        })?;
        debug!(path = %self.path.display(), "local client connected");
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("local://{}", self.path.display())
    }
}

pub fn local_client_transport(path: impl Into<PathBuf>) -> StreamClientTransport {
    StreamClientTransport::new(Box::new(LocalConnector { path: path.into() }))
}

pub struct LocalServerTransport {
    path: PathBuf,
    listener: Option<UnixListener>,
}

impl LocalServerTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            listener: None,
        }
    }
}

#[async_trait]
impl ServerTransport for LocalServerTransport {
    async fn bind(&mut self) -> RpcResult<()> {
        // A previous run may have left the socket file behind.
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path).map_err(|e| {
            RpcError::with_what(
                ErrorCode::SocketError,
                format!("bind {}: {e}", self.path.display()),
            )
        })?;
        debug!(path = %self.path.display(), "local server listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> RpcResult<Accepted> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| RpcError::new(ErrorCode::SocketError))?;
        let (stream, _) = listener.accept().await?;
        Ok(Accepted {
            stream: Box::new(stream),
            peer: format!("local://{}", self.path.display()),
            kind: StreamKind::Raw,
            initial_chain: FilterChain::default(),
        })
    }

    fn local_addr(&self) -> Option<String> {
        self.listener
            .as_ref()
            .map(|_| format!("local://{}", self.path.display()))
    }
}

impl Drop for LocalServerTransport {
    fn drop(&mut self) {
        if self.listener.is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ClientTransport, FramedStream};

    #[tokio::test]
    async fn test_local_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");

        let mut server = LocalServerTransport::new(&path);
        server.bind().await.unwrap();

        let server_task = tokio::spawn(async move {
            let accepted = server.accept().await.unwrap();
            let mut framed = FramedStream::new(accepted.stream);
            let got = framed.recv_frame(1024, true).await.unwrap();
            framed.send_frame(&got).await.unwrap();
            server
        });

        let mut client = local_client_transport(&path);
        client.connect(Duration::from_secs(5)).await.unwrap();
        client.send(b"local", Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.receive(Duration::from_secs(5)).await.unwrap(), b"local");

        client.disconnect().await;
        let server = server_task.await.unwrap();
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        let mut server = LocalServerTransport::new(&path);
        server.bind().await.unwrap();
    }
}
