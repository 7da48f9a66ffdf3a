//! Topic-based broadcast/subscribe abstraction over the peer mesh.
//!
//! Delivery is best-effort: frames may be duplicated, reordered or lost and
//! peers come and go at any time. Nothing here retries; the document merge is
//! idempotent and state reconciliation fills gaps.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Prefix shared by every room topic.
pub const TOPIC_PREFIX: &str = "huddle-room-";

/// Frames buffered per subscription before new ones are dropped.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// A delivered frame. Shared so fan-out never copies the payload.
pub type Frame = Arc<Vec<u8>>;

/// Build the topic name for a room.
pub fn topic_for_room(room_id: &str) -> Result<String, TransportError> {
    if room_id.is_empty() {
        return Err(TransportError::InvalidTopic("room id must not be empty".into()));
    }
    Ok(format!("{TOPIC_PREFIX}{room_id}"))
}

/// Broadcast transport carrying opaque frames between the peers of a topic.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publish `bytes` to every other peer subscribed to `topic`.
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Start receiving frames published on `topic` by other peers.
    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, TransportError>;
}

type Release = Box<dyn FnOnce() + Send>;

/// An active topic subscription.
///
/// Frames are read with [`TopicSubscription::recv`]. Dropping the handle or
/// calling [`TopicSubscription::unsubscribe`] releases it on the transport.
pub struct TopicSubscription {
    topic: String,
    receiver: mpsc::Receiver<Frame>,
    release: Option<Release>,
}

impl TopicSubscription {
    /// Create a subscription fed by `receiver`. `release` runs exactly once,
    /// when the subscription is dropped.
    pub fn new<F>(topic: impl Into<String>, receiver: mpsc::Receiver<Frame>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            topic: topic.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// A subscription plus the sender transports push frames into.
    pub fn channel<F>(topic: impl Into<String>, capacity: usize, release: F) -> (FrameSink, Self)
    where
        F: FnOnce() + Send + 'static,
    {
        let topic = topic.into();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let sink = FrameSink {
            topic: topic.clone(),
            sender,
        };
        (sink, Self::new(topic, receiver, release))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next frame, or `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.receiver.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Transport-side end of a subscription.
#[derive(Debug, Clone)]
pub struct FrameSink {
    topic: String,
    sender: mpsc::Sender<Frame>,
}

/// What happened to a frame pushed into a [`FrameSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Subscriber buffer full; frame dropped
    Dropped,
    /// Subscriber gone
    Closed,
}

impl FrameSink {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Push a frame without waiting. A full buffer drops the frame.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        match self.sender.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Subscriber on {} is lagging; dropping frame", self.topic);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("frame error: {0}")]
    Frame(String),
}

impl TransportError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}
