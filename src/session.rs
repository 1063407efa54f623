//! Network sessions.
//!
//! A `NetworkSession` is created per accepted connection and drives the
//! read → dispatch → write lifecycle on one task, so per-session I/O is
//! strictly ordered: at most one read and one write are ever in flight.
//! The dispatch-level view of the connection is the `CallSession`, which
//! user handlers see; it carries typed session objects, ping bookkeeping,
//! OOB buffers and the ordered on-destroy callbacks.

use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::pubsub::SubscriberHandle;
use crate::server::{DispatchAction, ServerCore, Takeover};
use crate::transport::http::{
    build_chunked_response_head, build_error_response, build_response, encode_chunk,
    try_parse_head,
};
use crate::transport::{Accepted, FramedStream, StreamKind};
use crate::wire;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Read/dispatch/write lifecycle states of a network session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Accepting,
    ReadingFrameLength,
    ReadingFrameBody,
    WritingResponse,
}

/// The dispatch-level view of a connection, shared between the session
/// task and user handlers.
pub struct CallSession {
    /// Request currently being dispatched.
    pub current_request: Option<wire::MethodRequest>,
    pub remote_addr: String,
    /// DER certificates presented by the peer, when the transport chain
    /// includes TLS.
    pub peer_certificates: Vec<Vec<u8>>,
    /// Last time any traffic arrived from the peer.
    pub last_activity: Instant,
    /// OOB payload attached to the in-flight request.
    pub oob_in: Vec<u8>,
    /// OOB payload to attach to the next response.
    pub oob_out: Vec<u8>,
    pub connected: bool,
    objects: HashMap<TypeId, Box<dyn Any + Send>>,
    on_destroy: Vec<Box<dyn FnOnce() + Send>>,
    destroyed: bool,
}

pub type SharedCallSession = Arc<Mutex<CallSession>>;

impl CallSession {
    pub fn new(remote_addr: String) -> SharedCallSession {
        Arc::new(Mutex::new(Self {
            current_request: None,
            remote_addr,
            peer_certificates: Vec::new(),
            last_activity: Instant::now(),
            oob_in: Vec::new(),
            oob_out: Vec::new(),
            connected: true,
            objects: HashMap::new(),
            on_destroy: Vec::new(),
            destroyed: false,
        }))
    }

    /// Attach a user object to the session, keyed by its type. Replaces
    /// any previous object of the same type.
    pub fn set_object<T: Any + Send>(&mut self, value: T) {
        self.objects.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn object<T: Any + Send>(&self) -> Option<&T> {
        self.objects
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref())
    }

    pub fn object_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.objects
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut())
    }

    pub fn take_object<T: Any + Send>(&mut self) -> Option<T> {
        self.objects
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast().ok())
            .map(|b| *b)
    }

    /// Register a callback to run when the session is destroyed.
    /// Callbacks fire exactly once, in registration order.
    pub fn on_destroy(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_destroy.push(Box::new(f));
    }

    pub(crate) fn run_destroy_callbacks(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.connected = false;
        for f in self.on_destroy.drain(..) {
            f();
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.run_destroy_callbacks();
    }
}

/// Why the serve loop stopped without an error.
enum ServeOutcome {
    Closed,
    Takeover(Takeover),
}

/// Server-side session: one accepted connection plus its chains and
/// buffers.
pub struct NetworkSession {
    state: SessionState,
    framed: FramedStream,
    kind: StreamKind,
    close_after_write: bool,
    call: SharedCallSession,
    core: Arc<ServerCore>,
    /// HTTP keep-alive derived from the last request head.
    http_keep_alive: bool,
}

impl NetworkSession {
    pub fn new(core: Arc<ServerCore>, accepted: Accepted) -> Self {
        let call = CallSession::new(accepted.peer.clone());
        Self {
            state: SessionState::Accepting,
            framed: FramedStream::with_chain(accepted.stream, accepted.initial_chain),
            kind: accepted.kind,
            close_after_write: false,
            call,
            core,
            http_keep_alive: true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the peer disconnects, a fatal error occurs
    /// or the server stops.
    pub async fn run(mut self) {
        let mut stop = self.core.stop_signal();
        let outcome = tokio::select! {
            r = self.serve() => r,
            _ = stop.changed() => Err(RpcError::new(ErrorCode::ServerStopped)),
        };
        let call = Arc::clone(&self.call);
        match outcome {
            Ok(ServeOutcome::Takeover(takeover)) => {
                self.execute_takeover(takeover).await;
            }
            Ok(ServeOutcome::Closed) => {
                debug!(peer = %call.lock().remote_addr, "session closed");
            }
            Err(e) if e.code == ErrorCode::PeerDisconnect => {
                debug!(peer = %call.lock().remote_addr, "peer disconnected");
            }
            Err(e) => {
                warn!(peer = %call.lock().remote_addr, code = ?e.code,
                      "session terminated: {e}");
            }
        }
        call.lock().run_destroy_callbacks();
    }

    async fn serve(&mut self) -> RpcResult<ServeOutcome> {
        // Any endpoint-mandated filters (TLS on https listeners) finish
        // their handshake before the first frame.
        if !self.framed.chain().handshake_done() {
            self.framed.run_handshake().await?;
            self.call.lock().peer_certificates = self.framed.chain().peer_certificates();
            debug!(peer = %self.call.lock().remote_addr,
                   filters = ?self.framed.chain().ids(),
                   "transport handshake complete");
        }

        loop {
            self.state = SessionState::ReadingFrameLength;
            let body = match self.kind {
                StreamKind::Raw => {
                    let max = self.core.config.max_incoming;
                    self.state = SessionState::ReadingFrameBody;
                    self.framed.recv_frame(max, true).await?
                }
                StreamKind::Http => self.recv_http_frame().await?,
            };
            self.call.lock().last_activity = Instant::now();

            let action = self
                .core
                .dispatch(&self.call, body, &mut self.framed, self.kind)
                .await?;

            if let Some(frame) = &action.reply {
                self.state = SessionState::WritingResponse;
                match self.kind {
                    StreamKind::Raw => self.framed.send_frame(frame).await?,
                    StreamKind::Http => self.send_http_frame(frame).await?,
                }
            } else if self.kind == StreamKind::Http && action.takeover.is_none() {
                // A oneway call must not elicit any response, but HTTP
                // framing still owes the peer a status line.
                self.send_http_empty().await?;
            }
            self.close_after_write = action.close_after;
            self.state = SessionState::Ready;

            match action.takeover {
                Some(Takeover::InstallFilters { chain }) => {
                    self.framed.set_chain(chain);
                    self.framed.run_handshake().await?;
                    debug!(filters = ?self.framed.chain().ids(),
                           "transport filters installed");
                }
                Some(other) => return Ok(ServeOutcome::Takeover(other)),
                None => {}
            }
            if self.close_after_write {
                return Ok(ServeOutcome::Closed);
            }
        }
    }

    /// Hand the connection over to its new role. Consumes the session.
    async fn execute_takeover(self, takeover: Takeover) {
        match takeover {
            Takeover::Subscriber(handle) => {
                serve_subscriber(self.framed, self.kind, self.call, handle).await;
            }
            Takeover::ProxyRelay { mut other } => {
                let (mut stream, _, _) = self.framed.into_parts();
                debug!("relaying proxied connection");
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut other).await;
            }
            Takeover::ProxyProvide { slot } => {
                let (stream, _, _) = self.framed.into_parts();
                let _ = slot.send(stream);
            }
            Takeover::InstallFilters { .. } => {
                // Handled inside the serve loop; unreachable here.
            }
        }
    }

    async fn recv_http_frame(&mut self) -> RpcResult<Vec<u8>> {
        loop {
            if let Some((head, body_offset)) = try_parse_head(self.framed.plain_buffer())? {
                let Some(content_length) = head.content_length() else {
                    let reply = build_error_response(411, "Length Required");
                    let wire_bytes = self.framed.chain_write(&reply)?;
                    self.framed.write_raw(&wire_bytes).await?;
                    return Err(RpcError::new(ErrorCode::HttpResponse));
                };
                wire::validate_frame_len(
                    content_length as u32,
                    self.core.config.max_incoming + wire::FRAME_HEADER_LEN as u32,
                    true,
                )?;
                let total = body_offset + content_length;
                if self.framed.plain_buffer().len() >= total {
                    self.http_keep_alive = head.keep_alive();
                    let body = self.framed.plain_buffer()[body_offset..total].to_vec();
                    self.framed.consume_plain(total);
                    // The embedded payload is one length-prefixed frame.
                    if body.len() < wire::FRAME_HEADER_LEN {
                        return Err(RpcError::new(ErrorCode::ClientMessageLength));
                    }
                    let len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    wire::validate_frame_len(len, self.core.config.max_incoming, true)?;
                    if len as usize != body.len() - wire::FRAME_HEADER_LEN {
                        return Err(RpcError::new(ErrorCode::ClientMessageLength));
                    }
                    return Ok(body[wire::FRAME_HEADER_LEN..].to_vec());
                }
            }
            self.framed.fill_plain().await?;
        }
    }

    async fn send_http_frame(&mut self, frame_body: &[u8]) -> RpcResult<()> {
        let response = build_response(&wire::frame(frame_body), self.http_keep_alive);
        let wire_bytes = self.framed.chain_write(&response)?;
        self.framed.write_raw(&wire_bytes).await?;
        if !self.http_keep_alive {
            self.close_after_write = true;
        }
        Ok(())
    }

    async fn send_http_empty(&mut self) -> RpcResult<()> {
        let response = build_response(&[], self.http_keep_alive);
        let wire_bytes = self.framed.chain_write(&response)?;
        self.framed.write_raw(&wire_bytes).await?;
        Ok(())
    }
}

/// Publish mode. The connection splits: a reader task watches for
/// subscriber pings (any inbound frame counts) and for disconnect, while
/// this task forwards published frames. HTTP subscribers get a chunked
/// streaming response and cannot ping; they are dropped on send failure.
async fn serve_subscriber(
    framed: FramedStream,
    kind: StreamKind,
    call: SharedCallSession,
    mut handle: SubscriberHandle,
) {
    debug!(topic = %handle.topic, guid = %handle.guid, "session entering publish mode");
    let (stream, chain, _leftover) = framed.into_parts();
    let chain = Arc::new(Mutex::new(chain));
    let (mut rd, mut wr) = tokio::io::split(stream);

    // Reader half: every decoded inbound frame refreshes the ping stamp.
    let (gone_tx, mut gone_rx) = tokio::sync::oneshot::channel::<()>();
    let reader_chain = Arc::clone(&chain);
    let reader_ping = Arc::clone(&handle.last_ping);
    let reader_call = Arc::clone(&call);
    let reader = tokio::spawn(async move {
        let mut plain: Vec<u8> = Vec::new();
        let mut raw = [0u8; 4096];
        loop {
            let n = match rd.read(&mut raw).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let app = match reader_chain.lock().read(&raw[..n]) {
                Ok(app) => app,
                Err(_) => break,
            };
            plain.extend_from_slice(&app);
            while plain.len() >= wire::FRAME_HEADER_LEN {
                let len = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
                if plain.len() < wire::FRAME_HEADER_LEN + len {
                    break;
                }
                plain.drain(..wire::FRAME_HEADER_LEN + len);
                *reader_ping.lock() = Instant::now();
                reader_call.lock().last_activity = Instant::now();
            }
        }
        let _ = gone_tx.send(());
    });

    // HTTP subscribers stream inside one chunked response.
    if kind == StreamKind::Http {
        let head = build_chunked_response_head();
        let wire_bytes = chain.lock().write(&head);
        match wire_bytes {
            Ok(b) => {
                if wr.write_all(&b).await.is_err() {
                    handle.unregister();
                    reader.abort();
                    return;
                }
            }
            Err(_) => {
                handle.unregister();
                reader.abort();
                return;
            }
        }
    }

    loop {
        tokio::select! {
            published = handle.rx.recv() => {
                let Some(frame) = published else {
                    // Publisher shut down.
                    break;
                };
                let encoded = match kind {
                    StreamKind::Raw => chain.lock().write(&wire::frame(&frame)),
                    StreamKind::Http => {
                        chain.lock().write(&encode_chunk(&wire::frame(&frame)))
                    }
                };
                let ok = match encoded {
                    Ok(bytes) => wr.write_all(&bytes).await.is_ok() && wr.flush().await.is_ok(),
                    Err(_) => false,
                };
                if !ok {
                    break;
                }
            }
            _ = &mut gone_rx => {
                debug!(topic = %handle.topic, "subscriber disconnected");
                break;
            }
        }
    }
    handle.unregister();
    reader.abort();
}

/// Spawn a session task for an accepted connection.
pub(crate) fn spawn_session(core: Arc<ServerCore>, accepted: Accepted) {
    tokio::spawn(async move {
        NetworkSession::new(core, accepted).run().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_objects_are_typed() {
        let call = CallSession::new("test".into());
        let mut guard = call.lock();
        guard.set_object(42u32);
        guard.set_object(String::from("name"));
        assert_eq!(guard.object::<u32>(), Some(&42));
        assert_eq!(guard.object::<String>().map(String::as_str), Some("name"));
        assert_eq!(guard.take_object::<u32>(), Some(42));
        assert!(guard.object::<u32>().is_none());
    }

    #[test]
    fn test_on_destroy_callbacks_fire_once_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let call = CallSession::new("test".into());
            let mut guard = call.lock();
            for i in 0..3 {
                let order = Arc::clone(&order);
                guard.on_destroy(move || order.lock().push(i));
            }
            guard.run_destroy_callbacks();
            // A second invocation must be a no-op.
            guard.run_destroy_callbacks();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_fires_pending_callbacks() {
        let fired = Arc::new(Mutex::new(false));
        {
            let call = CallSession::new("test".into());
            let fired = Arc::clone(&fired);
            call.lock().on_destroy(move || *fired.lock() = true);
        }
        assert!(*fired.lock());
    }
}
