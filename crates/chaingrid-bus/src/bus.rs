//! Event bus for pub/sub and request/reply between components.
//!
//! Publications fan out to every subscriber of an address. Requests go to
//! the single handler registered at an address and wait for its reply with
//! a timeout. How messages travel is up to the [`BusTransport`] behind the
//! [`EventBus`] handle; the default keeps them inside the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};

const DEFAULT_CAPACITY: usize = 1024;

type ReplySender = oneshot::Sender<Result<Value, String>>;

/// A message delivered to a registered handler.
#[derive(Debug)]
pub struct Envelope {
    body: Value,
    reply: Option<ReplySender>,
}

impl Envelope {
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Decode the body into a typed message.
    pub fn parse<T: DeserializeOwned>(&self) -> BusResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Split into the body and a handle for answering the sender.
    pub fn into_parts(self) -> (Value, Responder) {
        (self.body, Responder { tx: self.reply })
    }
}

/// Answers a request. Dropping it without replying makes the requester
/// fail with [`BusError::Closed`]; one-way sends ignore replies.
#[derive(Debug)]
pub struct Responder {
    tx: Option<ReplySender>,
}

impl Responder {
    pub fn reply(self, body: Value) {
        if let Some(tx) = self.tx {
            let _ = tx.send(Ok(body));
        }
    }

    /// Serialize and send a typed reply.
    pub fn reply_with<T: Serialize>(self, body: &T) {
        match serde_json::to_value(body) {
            Ok(value) => self.reply(value),
            Err(e) => self.fail(format!("could not encode reply: {e}")),
        }
    }

    pub fn fail(self, message: impl Into<String>) {
        if let Some(tx) = self.tx {
            let _ = tx.send(Err(message.into()));
        }
    }
}

/// Receives publications on one address.
pub struct Subscription {
    address: String,
    receiver: broadcast::Receiver<Value>,
}

impl Subscription {
    pub fn new(address: &str, receiver: broadcast::Receiver<Value>) -> Self {
        Self {
            address: address.to_string(),
            receiver,
        }
    }

    /// Wait for the next publication. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(address = %self.address, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Receives requests sent to one address.
pub struct Handler {
    receiver: mpsc::Receiver<Envelope>,
}

impl Handler {
    pub fn new(receiver: mpsc::Receiver<Envelope>) -> Self {
        Self { receiver }
    }

    /// Wait for the next request. Returns `None` once unregistered.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

// ── Transport ───────────────────────────────────────────────────

/// Moves messages between components.
///
/// [`LocalTransport`] connects components of one process. A cluster-wide
/// implementation forwards to peers on other nodes and feeds what it
/// receives into the channels behind [`Subscription`] and [`Handler`].
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish to every current subscriber of `address`. Returns the number
    /// of subscribers reached.
    async fn publish(&self, address: &str, body: Value) -> usize;

    async fn subscribe(&self, address: &str) -> Subscription;

    /// Register the request handler for `address`, replacing any previous
    /// one.
    async fn register(&self, address: &str) -> Handler;

    async fn unregister(&self, address: &str);

    async fn has_handler(&self, address: &str) -> bool;

    /// Hand `envelope` to the handler at `address`.
    async fn deliver(&self, address: &str, envelope: Envelope) -> BusResult<()>;
}

/// In-process [`BusTransport`] over tokio channels.
#[derive(Default)]
pub struct LocalTransport {
    topics: RwLock<HashMap<String, broadcast::Sender<Value>>>,
    handlers: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn topic(&self, address: &str) -> broadcast::Sender<Value> {
        if let Some(sender) = self.topics.read().await.get(address) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BusTransport for LocalTransport {
    async fn publish(&self, address: &str, body: Value) -> usize {
        let sender = self.topic(address).await;
        let reached = sender.send(body).unwrap_or(0);
        debug!(%address, reached, "published");
        reached
    }

    async fn subscribe(&self, address: &str) -> Subscription {
        Subscription::new(address, self.topic(address).await.subscribe())
    }

    async fn register(&self, address: &str) -> Handler {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        let replaced = self
            .handlers
            .write()
            .await
            .insert(address.to_string(), tx)
            .is_some();
        debug!(%address, replaced, "handler registered");
        Handler::new(rx)
    }

    async fn unregister(&self, address: &str) {
        self.handlers.write().await.remove(address);
        debug!(%address, "handler unregistered");
    }

    async fn has_handler(&self, address: &str) -> bool {
        self.handlers.read().await.contains_key(address)
    }

    async fn deliver(&self, address: &str, envelope: Envelope) -> BusResult<()> {
        let sender = self
            .handlers
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| BusError::NoHandler(address.to_string()))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| BusError::Closed(address.to_string()))
    }
}

// ── EventBus ────────────────────────────────────────────────────

/// Handle to the event bus. Cheap to clone; clones share one transport.
/// Defaults to a [`LocalTransport`].
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn BusTransport>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_transport(Arc::new(LocalTransport::new()))
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(transport: Arc<dyn BusTransport>) -> Self {
        Self { transport }
    }

    /// Publish to every current subscriber of `address`. Returns the number
    /// of subscribers reached.
    pub async fn publish(&self, address: &str, body: Value) -> usize {
        self.transport.publish(address, body).await
    }

    /// Serialize and publish a typed message.
    pub async fn publish_as<T: Serialize>(&self, address: &str, body: &T) -> BusResult<usize> {
        let value = serde_json::to_value(body)?;
        Ok(self.publish(address, value).await)
    }

    /// Subscribe to publications on `address` made from now on.
    pub async fn subscribe(&self, address: &str) -> Subscription {
        self.transport.subscribe(address).await
    }

    /// Register the request handler for `address`, replacing any previous
    /// one.
    pub async fn register(&self, address: &str) -> Handler {
        self.transport.register(address).await
    }

    pub async fn unregister(&self, address: &str) {
        self.transport.unregister(address).await
    }

    pub async fn has_handler(&self, address: &str) -> bool {
        self.transport.has_handler(address).await
    }

    /// Deliver a one-way message to the handler at `address`.
    pub async fn send(&self, address: &str, body: Value) -> BusResult<()> {
        self.transport
            .deliver(address, Envelope { body, reply: None })
            .await
    }

    /// Send a request to the handler at `address` and wait for its reply
    /// for as long as it takes.
    pub async fn call(&self, address: &str, body: Value) -> BusResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.transport
            .deliver(
                address,
                Envelope {
                    body,
                    reply: Some(tx),
                },
            )
            .await?;
        match rx.await {
            Err(_) => Err(BusError::Closed(address.to_string())),
            Ok(Err(message)) => Err(BusError::Failed(message)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Send a request to the handler at `address` and wait up to `timeout`
    /// for its reply.
    pub async fn request(&self, address: &str, body: Value, timeout: Duration) -> BusResult<Value> {
        tokio::time::timeout(timeout, self.call(address, body))
            .await
            .map_err(|_| BusError::Timeout {
                address: address.to_string(),
                timeout,
            })?
    }

    /// Typed variant of [`request`](Self::request).
    pub async fn request_as<Req, Resp>(
        &self,
        address: &str,
        body: &Req,
        timeout: Duration,
    ) -> BusResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let value = self
            .request(address, serde_json::to_value(body)?, timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("topic").await;
        let mut b = bus.subscribe("topic").await;
        assert_eq!(bus.publish("topic", json!(1)).await, 2);
        assert_eq!(a.recv().await, Some(json!(1)));
        assert_eq!(b.recv().await, Some(json!(1)));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody", json!(null)).await, 0);
    }

    #[tokio::test]
    async fn request_reply() {
        let bus = EventBus::new();
        let mut handler = bus.register("echo").await;
        tokio::spawn(async move {
            while let Some(envelope) = handler.recv().await {
                let (body, responder) = envelope.into_parts();
                responder.reply(json!({"echo": body}));
            }
        });
        let reply = bus
            .request("echo", json!("hi"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!({"echo": "hi"}));
    }

    #[tokio::test]
    async fn request_without_handler_fails() {
        let bus = EventBus::new();
        let err = bus
            .request("nobody", json!(null), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoHandler(_)));
    }

    #[tokio::test]
    async fn request_times_out() {
        let bus = EventBus::new();
        // Keep the handler alive but never answer.
        let _handler = bus.register("slow").await;
        let err = bus
            .request("slow", json!(null), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn failed_reply_and_dropped_responder() {
        let bus = EventBus::new();
        let mut handler = bus.register("picky").await;
        tokio::spawn(async move {
            let first = handler.recv().await.unwrap();
            first.into_parts().1.fail("nope");
            let second = handler.recv().await.unwrap();
            drop(second);
        });
        let err = bus
            .request("picky", json!(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Failed(m) if m == "nope"));
        let err = bus
            .request("picky", json!(2), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Closed(_)));
    }

    #[tokio::test]
    async fn unregister_removes_handler() {
        let bus = EventBus::new();
        let _handler = bus.register("x").await;
        assert!(bus.has_handler("x").await);
        bus.unregister("x").await;
        assert!(!bus.has_handler("x").await);
        assert!(matches!(
            bus.send("x", json!(null)).await,
            Err(BusError::NoHandler(_))
        ));
    }

    /// Counts deliveries on their way to a [`LocalTransport`].
    #[derive(Default)]
    struct CountingTransport {
        local: LocalTransport,
        published: std::sync::atomic::AtomicUsize,
        delivered: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BusTransport for CountingTransport {
        async fn publish(&self, address: &str, body: Value) -> usize {
            self.published
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.local.publish(address, body).await
        }

        async fn subscribe(&self, address: &str) -> Subscription {
            self.local.subscribe(address).await
        }

        async fn register(&self, address: &str) -> Handler {
            self.local.register(address).await
        }

        async fn unregister(&self, address: &str) {
            self.local.unregister(address).await
        }

        async fn has_handler(&self, address: &str) -> bool {
            self.local.has_handler(address).await
        }

        async fn deliver(&self, address: &str, envelope: Envelope) -> BusResult<()> {
            self.delivered
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.local.deliver(address, envelope).await
        }
    }

    #[tokio::test]
    async fn traffic_goes_through_the_transport() {
        use std::sync::atomic::Ordering;

        let transport = Arc::new(CountingTransport::default());
        let bus = EventBus::with_transport(transport.clone());
        let other = bus.clone();

        let mut subscription = bus.subscribe("topic").await;
        assert_eq!(other.publish("topic", json!("x")).await, 1);
        assert_eq!(subscription.recv().await, Some(json!("x")));

        let mut handler = bus.register("echo").await;
        tokio::spawn(async move {
            while let Some(envelope) = handler.recv().await {
                let (body, responder) = envelope.into_parts();
                responder.reply(body);
            }
        });
        let reply = other
            .request("echo", json!(7), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!(7));
        other.send("echo", json!(8)).await.unwrap();

        assert_eq!(transport.published.load(Ordering::SeqCst), 1);
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 2);
    }
}
