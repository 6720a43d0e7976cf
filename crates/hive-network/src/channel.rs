use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use hive_protocol::Message;
use tokio::sync::mpsc;

use crate::NetworkError;

/// Handle returned by `subscribe`, used to remove the subscription later.
pub type SubscriptionId = u64;

/// Boxed future returned by a `MessageHandler`.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A message as observed on a specific topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub message: Message,
}

/// Callback invoked for each message published on a subscribed topic.
///
/// Invocations for one subscription never overlap: the next delivery is
/// handed over only after the previous future has completed.
pub trait MessageHandler: Send + Sync {
    fn handle<'a>(&'a self, delivery: Delivery) -> HandlerFuture<'a>;
}

/// Topic-based publish/subscribe transport.
///
/// `publish` returns once the message has been accepted for delivery to the
/// current subscribers, not once it has been handled. Messages published on
/// a topic nobody subscribes to are dropped and `publish` returns `Ok(0)`;
/// late subscribers never see earlier messages.
pub trait MessageChannel: Send + Sync {
    /// Register `handler` for every message published on `topic`.
    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, NetworkError>;

    /// Feed every message published on `topic` into `sink`.
    ///
    /// Several topics may share one sink, which gives the consumer a single
    /// sequential queue across them.
    fn subscribe_queue(
        &self,
        topic: &str,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionId, NetworkError>;

    /// Remove a subscription. Returns whether it existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Deliver `message` to all current subscribers of `topic`.
    /// Returns the number of subscribers it was accepted for.
    fn publish(&self, topic: &str, message: Message) -> Result<usize, NetworkError>;
}

struct Subscriber {
    id: SubscriptionId,
    sink: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct ChannelState {
    topics: HashMap<String, Vec<Subscriber>>,
    closed: bool,
}

/// In-process channel.
///
/// Each subscription owns an unbounded FIFO queue, so per-topic publish
/// order is preserved for every subscriber. With `with_wire_encoding` every
/// published message is encoded and decoded once, the way a broker-backed
/// binding would see it.
#[derive(Clone)]
pub struct InMemoryChannel {
    state: Arc<RwLock<ChannelState>>,
    next_id: Arc<AtomicU64>,
    wire_encoding: bool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ChannelState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            wire_encoding: false,
        }
    }

    /// Round-trip every published message through the JSON wire format.
    pub fn with_wire_encoding(mut self) -> Self {
        self.wire_encoding = true;
        self
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.sink.is_closed()).count())
            .unwrap_or(0)
    }

    /// Close the channel. All subscriptions are dropped and further
    /// publishes fail with `NetworkError::Closed`.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.topics.clear();
        tracing::debug!("message channel closed");
    }

    fn add_subscriber(
        &self,
        topic: &str,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionId, NetworkError> {
        if topic.is_empty() {
            return Err(NetworkError::InvalidTopic("topic must be non-empty".into()));
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(NetworkError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        tracing::debug!(topic = %topic, subscription = id, "subscribed");
        Ok(id)
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageChannel for InMemoryChannel {
    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, NetworkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NetworkError::NoRuntime(e.to_string()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let id = self.add_subscriber(topic, tx)?;
        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler.handle(delivery).await;
            }
        });
        Ok(id)
    }

    fn subscribe_queue(
        &self,
        topic: &str,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionId, NetworkError> {
        self.add_subscriber(topic, sink)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for subs in state.topics.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        state.topics.retain(|_, subs| !subs.is_empty());
        if removed {
            tracing::debug!(subscription = id, "unsubscribed");
        }
        removed
    }

    fn publish(&self, topic: &str, message: Message) -> Result<usize, NetworkError> {
        let message = if self.wire_encoding {
            Message::decode(&message.encode()?)?
        } else {
            message
        };

        let mut stale = Vec::new();
        let delivered = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(NetworkError::Closed);
            }
            let Some(subs) = state.topics.get(topic) else {
                tracing::debug!(
                    topic = %topic,
                    message_id = %message.id,
                    "no subscribers, message dropped"
                );
                return Ok(0);
            };

            let mut delivered = 0;
            for sub in subs {
                let delivery = Delivery {
                    topic: topic.to_string(),
                    message: message.clone(),
                };
                match sub.sink.send(delivery) {
                    Ok(()) => delivered += 1,
                    Err(_) => stale.push(sub.id),
                }
            }
            delivered
        };

        for id in stale {
            self.unsubscribe(id);
        }

        tracing::trace!(
            topic = %topic,
            message_id = %message.id,
            performative = %message.performative,
            delivered,
            "published"
        );
        Ok(delivered)
    }
}
