//! Durable pub/sub bus with consumer-group semantics.
//!
//! Topics are append-only logs. A consumer group owns one cursor per topic, shared by
//! every consumer registered under the group name. Delivered messages sit in the
//! group's pending set until acknowledged. Pending entries whose consumer went away can
//! be claimed by another consumer id, which gives at-least-once delivery across crashes.

pub mod consumer;
pub mod jetstream;
pub mod redb_log;

use crate::codec::{CodecError, Payload};
use crate::metrics;
use crate::persistence::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

pub use consumer::{ConsumeLoop, ConsumerConfig, HandlerError, LoopState, LoopStats, MessageHandler};
pub use jetstream::JetStreamBus;
pub use redb_log::RedbBus;

/// Bus-assigned id. Monotonically increasing within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A delivered copy of a log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: Payload,
    /// 1 on first delivery, incremented on every claim/redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    pub id: MessageId,
    pub consumer: String,
    pub delivered_at: DateTime<Utc>,
    pub delivery_count: u32,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("Consumer group '{group}' is not registered on topic '{topic}'")]
    UnknownGroup { topic: String, group: String },
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Append `payload` to `topic`, creating the topic if needed.
    async fn publish(&self, topic: &str, payload: &Payload) -> Result<MessageId, BusError>;

    /// Register `group` on `topic`. Succeeds silently if it already exists and never
    /// moves an existing cursor.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BusError>;

    /// Deliver the next message not yet delivered to any consumer of `group`, waiting
    /// up to `block` for one to arrive.
    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Message>, BusError>;

    /// Remove `id` from the group's pending set. Acking an unknown id is a no-op.
    async fn ack(&self, topic: &str, group: &str, id: MessageId) -> Result<(), BusError>;

    /// Take over pending entries idle for at least `min_idle` and hand them to
    /// `consumer`.
    async fn claim_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<Message>, BusError>;

    async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>, BusError>;

    /// Highest id through which every delivered message has been acknowledged.
    async fn group_cursor(&self, topic: &str, group: &str) -> Result<Option<MessageId>, BusError>;

    /// Fire-and-forget publish: failures are logged and counted, never returned.
    async fn publish_logged(&self, topic: &str, payload: &Payload) -> Option<MessageId> {
        match self.publish(topic, payload).await {
            Ok(id) => {
                debug!("Published to {} (ID: {})", topic, id);
                Some(id)
            }
            Err(e) => {
                metrics::PUBLISH_FAILURES.inc();
                error!("❌ Failed to publish to {}: {}", topic, e);
                None
            }
        }
    }
}
