//! Publish/subscribe.
//!
//! Topics are strings. On the server side a `Publisher` owns a multicast
//! client transport: one entry per active subscriber connection, each fed
//! from a channel drained by the subscriber's session task. Publishing
//! encodes the payload once and fans the shared buffer out to a bounded
//! number of subscribers at a time. Subscribers whose oneway pings go
//! stale are reaped by `drop_idle_transports`.
//!
//! On the subscriber side, `create_subscription` converts an ordinary
//! client connection into a receive stream via the `RequestSubscription`
//! OOB exchange.

use crate::client::{ClientOptions, ClientStub};
use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::wire::{self, MethodRequest, OobRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Method id published messages are delivered under (a oneway call on the
/// subscriber's connection).
pub const PUBLISH_METHOD_ID: u32 = 1;
/// Method id of subscriber keep-alive pings.
pub const SUBSCRIBER_PING_METHOD_ID: u32 = 2;

/// Queue depth per subscriber connection.
const SUBSCRIBER_QUEUE: usize = 64;

/// Grace added to twice the ping interval before a subscriber is
/// considered dead.
const PING_GRACE: Duration = Duration::from_secs(5);

struct SubscriberEntry {
    guid: String,
    remote_addr: String,
    sender: mpsc::Sender<Arc<Vec<u8>>>,
    last_ping: Arc<Mutex<Instant>>,
    /// Subscriber-to-publisher ping interval it declared; 0 when the
    /// subscriber cannot ping (HTTP).
    ping_interval_ms: u32,
}

/// Server-side publisher for one topic.
pub struct Publisher {
    topic: String,
    subscribers: Mutex<HashMap<String, SubscriberEntry>>,
    /// Upper bound on concurrent per-subscriber sends; 0 is unlimited.
    publish_limit: usize,
    /// Interval this publisher tells subscribers to expect pings at.
    pub_ping_interval_ms: u32,
}

impl Publisher {
    fn new(topic: String, publish_limit: usize, pub_ping_interval_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            topic,
            subscribers: Mutex::new(HashMap::new()),
            publish_limit,
            pub_ping_interval_ms,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publish one payload to every subscriber. The message is framed
    /// once; sends run with at most `publish_limit` in flight. Subscribers
    /// whose queue is gone are removed.
    pub async fn publish(&self, payload: &[u8]) -> RpcResult<usize> {
        let mut request = MethodRequest::new(self.topic.clone(), PUBLISH_METHOD_ID);
        request.oneway = true;
        let encoded = Arc::new(request.encode(payload));

        let targets: Vec<(String, mpsc::Sender<Arc<Vec<u8>>>)> = {
            let subs = self.subscribers.lock();
            subs.values()
                .map(|s| (s.guid.clone(), s.sender.clone()))
                .collect()
        };

        let limit = if self.publish_limit == 0 {
            targets.len().max(1)
        } else {
            self.publish_limit
        };
        let mut failed: Vec<String> = Vec::new();
        let mut join = tokio::task::JoinSet::new();
        let mut pending = targets.into_iter();
        let mut delivered = 0usize;
        loop {
            while join.len() < limit {
                let Some((guid, sender)) = pending.next() else {
                    break;
                };
                let frame = Arc::clone(&encoded);
                join.spawn(async move {
                    let ok = sender.send(frame).await.is_ok();
                    (guid, ok)
                });
            }
            match join.join_next().await {
                Some(Ok((_, true))) => delivered += 1,
                Some(Ok((guid, false))) => failed.push(guid),
                Some(Err(_)) => {}
                None => break,
            }
        }
        if !failed.is_empty() {
            let mut subs = self.subscribers.lock();
            for guid in failed {
                if subs.remove(&guid).is_some() {
                    debug!(topic = %self.topic, %guid, "removed unreachable subscriber");
                }
            }
        }
        Ok(delivered)
    }

    /// Reap subscribers whose last ping is older than `2×interval +
    /// grace`. Subscribers that declared no ping interval are never
    /// reaped here; they are dropped on send failure instead.
    pub fn drop_idle_transports(&self) {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|_, entry| {
            if entry.ping_interval_ms == 0 {
                return true;
            }
            let deadline =
                Duration::from_millis(u64::from(entry.ping_interval_ms) * 2) + PING_GRACE;
            let alive = entry.last_ping.lock().elapsed() <= deadline;
            if !alive {
                info!(topic = %self.topic, addr = %entry.remote_addr,
                      interval_ms = entry.ping_interval_ms, "dropping idle subscriber");
            }
            alive
        });
        let dropped = before - subs.len();
        if dropped > 0 {
            debug!(topic = %self.topic, dropped, remaining = subs.len(), "reaped subscribers");
        }
    }

    fn register(
        self: &Arc<Self>,
        remote_addr: String,
        ping_interval_ms: u32,
    ) -> SubscriberHandle {
        let guid = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let last_ping = Arc::new(Mutex::new(Instant::now()));
        let entry = SubscriberEntry {
            guid: guid.clone(),
            remote_addr,
            sender: tx,
            last_ping: Arc::clone(&last_ping),
            ping_interval_ms,
        };
        self.subscribers.lock().insert(guid.clone(), entry);
        SubscriberHandle {
            topic: self.topic.clone(),
            guid,
            rx,
            last_ping,
            publisher: Arc::downgrade(self),
        }
    }
}

/// Hand-off from the publishing service to the session that now serves a
/// subscriber connection.
pub struct SubscriberHandle {
    pub topic: String,
    pub guid: String,
    pub rx: mpsc::Receiver<Arc<Vec<u8>>>,
    pub last_ping: Arc<Mutex<Instant>>,
    publisher: Weak<Publisher>,
}

impl SubscriberHandle {
    /// Remove this subscriber from its publisher. Idempotent.
    pub fn unregister(&self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.subscribers.lock().remove(&self.guid);
        }
    }
}

/// Server-side registry of publishers, one per topic.
pub struct PublishingService {
    topics: Mutex<HashMap<String, Arc<Publisher>>>,
    publish_limit: usize,
    pub_ping_interval_ms: u32,
}

impl PublishingService {
    pub fn new(publish_limit: usize, pub_ping_interval_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            publish_limit,
            pub_ping_interval_ms,
        })
    }

    /// Create (or fetch) the publisher for a topic.
    pub fn publisher(&self, topic: &str) -> Arc<Publisher> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| {
                Publisher::new(
                    topic.to_owned(),
                    self.publish_limit,
                    self.pub_ping_interval_ms,
                )
            })
            .clone()
    }

    /// Topics with a live publisher.
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    /// Close a topic: its subscribers' queues drop, and their sessions
    /// close out.
    pub fn close_topic(&self, topic: &str) {
        if let Some(publisher) = self.topics.lock().remove(topic) {
            publisher.subscribers.lock().clear();
        }
    }

    /// Reap idle subscribers on every topic.
    pub fn drop_idle_transports(&self) {
        let publishers: Vec<Arc<Publisher>> = self.topics.lock().values().cloned().collect();
        for publisher in publishers {
            publisher.drop_idle_transports();
        }
    }

    /// Handle a `RequestSubscription` OOB: returns the session hand-off
    /// and the response fields, or a refusal if the topic has no
    /// publisher.
    pub(crate) fn accept_subscriber(
        &self,
        topic: &str,
        remote_addr: String,
        sub_ping_interval_ms: u32,
    ) -> Option<(SubscriberHandle, wire::OobResponse)> {
        let publisher = {
            let topics = self.topics.lock();
            topics.get(topic).cloned()
        }?;
        let handle = publisher.register(remote_addr, sub_ping_interval_ms);
        let response = wire::OobResponse {
            error_code: 0,
            pub_ping_interval_ms: publisher.pub_ping_interval_ms,
            pings_enabled: sub_ping_interval_ms > 0,
            connection_guid: handle.guid.clone(),
        };
        Some((handle, response))
    }
}

/// Subscriber-side options.
#[derive(Clone)]
pub struct SubscriptionOptions {
    pub client: ClientOptions,
    /// Interval for oneway pings to the publisher; 0 disables.
    pub ping_interval_ms: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            ping_interval_ms: 0,
        }
    }
}

/// A live subscription on the subscriber side.
#[derive(Debug)]
pub struct Subscription {
    pub publisher_url: String,
    pub topic: String,
    /// Publisher-to-subscriber ping interval it promised, ms.
    pub pub_ping_interval_ms: u32,
    /// Correlation GUID assigned by the publisher.
    pub connection_guid: String,
    closed: Mutex<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Subscription {
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Tear the subscription down. Idempotent: the second call is a
    /// no-op. Takes the subscription's own lock before anything wider.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(topic = %self.topic, "subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscriber-side registry, so a process can enumerate and close its
/// subscriptions as a group.
#[derive(Default)]
pub struct SubscriptionService {
    subs: Mutex<Vec<Weak<Subscription>>>,
}

impl SubscriptionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active_subscriptions(&self) -> Vec<Arc<Subscription>> {
        let mut subs = self.subs.lock();
        subs.retain(|w| w.strong_count() > 0);
        subs.iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.is_closed())
            .collect()
    }

    pub fn close_all(&self) {
        for sub in self.active_subscriptions() {
            sub.close();
        }
    }

    /// Subscribe to `topic` on the publisher at `endpoint`.
    ///
    /// `on_publish` runs for every published payload; `on_disconnect`
    /// fires once if the publisher side goes away before `close`.
    pub async fn create_subscription(
        self: &Arc<Self>,
        endpoint: Endpoint,
        topic: &str,
        options: SubscriptionOptions,
        on_publish: impl Fn(Vec<u8>) + Send + Sync + 'static,
        on_disconnect: impl FnOnce() + Send + 'static,
    ) -> RpcResult<Arc<Subscription>> {
        let mut stub = ClientStub::with_options(endpoint.clone(), options.client.clone())?;
        stub.connect().await?;
        let response = stub
            .send_oob(OobRequest::RequestSubscription {
                runtime_version: stub.runtime_version(),
                topic: topic.to_owned(),
                sub_ping_interval_ms: options.ping_interval_ms,
            })
            .await?;
        if response.error_code != 0 {
            return Err(RpcError::with_what(
                ErrorCode::from_wire(response.error_code),
                format!("subscription to {topic} refused"),
            ));
        }
        let framed = stub.take_framed().ok_or_else(|| {
            RpcError::with_what(
                ErrorCode::SubscriptionRefused,
                "endpoint kind does not support subscriptions",
            )
        })?;

        let subscription = Arc::new(Subscription {
            publisher_url: endpoint.to_string(),
            topic: topic.to_owned(),
            pub_ping_interval_ms: response.pub_ping_interval_ms,
            connection_guid: response.connection_guid.clone(),
            closed: Mutex::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let (stream, chain, leftover) = framed.into_parts();
        let chain = Arc::new(Mutex::new(chain));
        let (mut rd, mut wr) = tokio::io::split(stream);

        // Receive loop: decode published oneway calls and hand the
        // payload to the callback. Holds only a weak reference so that
        // dropping the last user handle tears the subscription down.
        let recv_sub = Arc::downgrade(&subscription);
        let recv_chain = Arc::clone(&chain);
        let recv_topic = topic.to_owned();
        let recv_task = tokio::spawn(async move {
            let mut plain = leftover;
            let mut raw = [0u8; 8 * 1024];
            let mut on_disconnect = Some(on_disconnect);
            loop {
                while let Some(frame) = next_frame(&mut plain) {
                    match decode_publish(&frame) {
                        Ok(Some(payload)) => on_publish(payload),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(topic = %recv_topic, "bad published frame: {e}");
                        }
                    }
                }
                let n = match rd.read(&mut raw).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                match recv_chain.lock().read(&raw[..n]) {
                    Ok(app) => plain.extend_from_slice(&app),
                    Err(_) => break,
                }
            }
            // Publisher signalled disconnect (or the wire died).
            if let Some(sub) = recv_sub.upgrade() {
                if !sub.is_closed() {
                    sub.close();
                    if let Some(f) = on_disconnect.take() {
                        f();
                    }
                }
            }
        });

        // Ping loop: oneway keep-alives on the configured interval.
        let mut tasks = vec![recv_task];
        if options.ping_interval_ms > 0 {
            let ping_chain = Arc::clone(&chain);
            let interval = Duration::from_millis(u64::from(options.ping_interval_ms));
            let ping_topic = topic.to_owned();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let mut request =
                        MethodRequest::new(ping_topic.clone(), SUBSCRIBER_PING_METHOD_ID);
                    request.oneway = true;
                    let body = request.encode(&[]);
                    let encoded = match ping_chain.lock().write(&wire::frame(&body)) {
                        Ok(b) => b,
                        Err(_) => break,
                    };
                    if wr.write_all(&encoded).await.is_err() || wr.flush().await.is_err() {
                        break;
                    }
                }
            }));
        }
        *subscription.tasks.lock() = tasks;

        self.subs.lock().push(Arc::downgrade(&subscription));
        debug!(topic, guid = %response.connection_guid, "subscription established");
        Ok(subscription)
    }
}

/// Pop one complete frame body off the plaintext buffer.
fn next_frame(plain: &mut Vec<u8>) -> Option<Vec<u8>> {
    if plain.len() < wire::FRAME_HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
    if plain.len() < wire::FRAME_HEADER_LEN + len {
        return None;
    }
    let body = plain[wire::FRAME_HEADER_LEN..wire::FRAME_HEADER_LEN + len].to_vec();
    plain.drain(..wire::FRAME_HEADER_LEN + len);
    Some(body)
}

/// Decode a frame arriving on a subscription connection; publishes yield
/// their payload, anything else is ignored.
fn decode_publish(body: &[u8]) -> RpcResult<Option<Vec<u8>>> {
    let mut cursor = wire::WireCursor::new(body);
    if cursor.varint()? != wire::DESCRIPTOR_REQUEST {
        return Ok(None);
    }
    let request = MethodRequest::decode(&mut cursor)?;
    if request.method_id != PUBLISH_METHOD_ID {
        return Ok(None);
    }
    Ok(Some(cursor.remaining().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_registered_subscriber() {
        let service = PublishingService::new(0, 1000);
        let publisher = service.publisher("prices");
        let mut handle = publisher.register("test-addr".into(), 0);
        assert_eq!(publisher.subscriber_count(), 1);

        let delivered = publisher.publish(b"tick").await.unwrap();
        assert_eq!(delivered, 1);
        let frame = handle.rx.recv().await.unwrap();
        let payload = decode_publish(&frame).unwrap().unwrap();
        assert_eq!(payload, b"tick");

        handle.unregister();
        assert_eq!(publisher.subscriber_count(), 0);
        // A second unregister is harmless.
        handle.unregister();
    }

    #[tokio::test]
    async fn test_dead_subscriber_removed_on_publish() {
        let service = PublishingService::new(0, 0);
        let publisher = service.publisher("t");
        let handle = publisher.register("a".into(), 0);
        drop(handle); // receiver gone
        publisher.publish(b"x").await.unwrap();
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_idle_transports_honors_ping_deadline() {
        let service = PublishingService::new(0, 0);
        let publisher = service.publisher("t");
        // Declared a 1 ms ping interval, never pings again.
        let handle = publisher.register("a".into(), 1);
        *handle.last_ping.lock() = Instant::now() - Duration::from_secs(6);
        // Subscriber without pings must survive reaping.
        let _silent = publisher.register("b".into(), 0);

        publisher.drop_idle_transports();
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[test]
    fn test_frame_reassembly() {
        let mut plain = Vec::new();
        plain.extend(wire::frame(b"one"));
        plain.extend(wire::frame(b"two"));
        assert_eq!(next_frame(&mut plain).unwrap(), b"one");
        assert_eq!(next_frame(&mut plain).unwrap(), b"two");
        assert!(next_frame(&mut plain).is_none());
    }
}
