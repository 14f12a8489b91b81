use super::{BusError, Message, MessageBus, MessageId, PendingEntry};
use crate::codec::{EnvelopeCodec, Payload};
use crate::metrics;
use crate::persistence::{RedbStore, StoreError};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

// Tables
const LOG_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("bus_log");
const HEADS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("bus_heads");
const GROUPS_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("bus_groups");
const PENDING_TABLE: TableDefinition<(&str, &str, u64), &[u8]> =
    TableDefinition::new("bus_pending");

/// Upper bound on entries reassigned by a single claim.
const CLAIM_BATCH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupRecord {
    last_delivered: u64,
    acked_through: u64,
    created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingRecord {
    consumer: String,
    delivered_at_ms: i64,
    delivery_count: u32,
}

enum Delivery {
    Delivered {
        id: u64,
        bytes: Vec<u8>,
    },
    CaughtUp,
    NoGroup,
}

/// Embedded durable log.
///
/// Ids are contiguous per topic starting at 1 and entries are never removed, so a group
/// cursor is just the last delivered id. Every operation is a single write transaction.
/// Blocking reads park on an in-process notifier that `publish` wakes; agents sharing the
/// log must therefore share this handle.
pub struct RedbBus {
    store: Arc<RedbStore>,
    codec: EnvelopeCodec,
    published: Notify,
}

impl RedbBus {
    pub fn new(store: Arc<RedbStore>, codec: EnvelopeCodec) -> Result<Self, StoreError> {
        let txn = store.begin_write()?;
        {
            let _ = txn.open_table(LOG_TABLE)?;
            let _ = txn.open_table(HEADS_TABLE)?;
            let _ = txn.open_table(GROUPS_TABLE)?;
            let _ = txn.open_table(PENDING_TABLE)?;
        }
        txn.commit()?;
        info!("📜 Embedded bus log ready ({:?} envelopes)", codec.format());

        Ok(Self {
            store,
            codec,
            published: Notify::new(),
        })
    }

    fn append(&self, topic: &str, bytes: &[u8]) -> Result<u64, StoreError> {
        let txn = self.store.begin_write()?;
        let id = {
            let mut heads = txn.open_table(HEADS_TABLE)?;
            let next = heads.get(topic)?.map(|v| v.value()).unwrap_or(0) + 1;
            heads.insert(topic, next)?;

            let mut log = txn.open_table(LOG_TABLE)?;
            log.insert((topic, next), bytes)?;
            next
        };
        txn.commit()?;
        Ok(id)
    }

    fn create_group(&self, topic: &str, group: &str) -> Result<bool, StoreError> {
        let txn = self.store.begin_write()?;
        let created = {
            let mut groups = txn.open_table(GROUPS_TABLE)?;
            let exists = groups.get((topic, group))?.is_some();
            if exists {
                false
            } else {
                let record = GroupRecord {
                    last_delivered: 0,
                    acked_through: 0,
                    created_at_ms: Utc::now().timestamp_millis(),
                };
                groups.insert((topic, group), serde_json::to_vec(&record)?.as_slice())?;

                let mut heads = txn.open_table(HEADS_TABLE)?;
                let has_head = heads.get(topic)?.is_some();
                if !has_head {
                    heads.insert(topic, 0u64)?;
                }
                true
            }
        };
        txn.commit()?;
        Ok(created)
    }

    fn try_deliver(&self, topic: &str, group: &str, consumer: &str) -> Result<Delivery, StoreError> {
        let txn = self.store.begin_write()?;
        let delivery = {
            let mut groups = txn.open_table(GROUPS_TABLE)?;
            let record = groups
                .get((topic, group))?
                .map(|g| serde_json::from_slice::<GroupRecord>(g.value()))
                .transpose()?;
            let Some(mut record) = record else {
                return Ok(Delivery::NoGroup);
            };

            let head = txn
                .open_table(HEADS_TABLE)?
                .get(topic)?
                .map(|v| v.value())
                .unwrap_or(0);
            if record.last_delivered >= head {
                return Ok(Delivery::CaughtUp);
            }

            let id = record.last_delivered + 1;
            let bytes = txn
                .open_table(LOG_TABLE)?
                .get((topic, id))?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| StoreError::Integrity(format!("missing log entry {}#{}", topic, id)))?;

            record.last_delivered = id;
            groups.insert((topic, group), serde_json::to_vec(&record)?.as_slice())?;

            let pending = PendingRecord {
                consumer: consumer.to_string(),
                delivered_at_ms: Utc::now().timestamp_millis(),
                delivery_count: 1,
            };
            txn.open_table(PENDING_TABLE)?
                .insert((topic, group, id), serde_json::to_vec(&pending)?.as_slice())?;

            Delivery::Delivered { id, bytes }
        };
        txn.commit()?;
        Ok(delivery)
    }

    fn remove_pending(&self, topic: &str, group: &str, id: u64) -> Result<bool, StoreError> {
        let txn = self.store.begin_write()?;
        let removed = {
            let mut pending = txn.open_table(PENDING_TABLE)?;
            let removed = pending.remove((topic, group, id))?.is_some();

            if removed {
                let oldest = pending
                    .range((topic, group, 0u64)..=(topic, group, u64::MAX))?
                    .next()
                    .transpose()?
                    .map(|(k, _)| k.value().2);

                let mut groups = txn.open_table(GROUPS_TABLE)?;
                let record = groups
                    .get((topic, group))?
                    .map(|g| serde_json::from_slice::<GroupRecord>(g.value()))
                    .transpose()?;
                if let Some(mut record) = record {
                    record.acked_through = match oldest {
                        Some(oldest_pending) => oldest_pending - 1,
                        None => record.last_delivered,
                    };
                    groups.insert((topic, group), serde_json::to_vec(&record)?.as_slice())?;
                }
            }
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    fn reassign_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: i64,
    ) -> Result<Vec<(u64, Vec<u8>, u32)>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let txn = self.store.begin_write()?;
        let claimed = {
            let mut pending = txn.open_table(PENDING_TABLE)?;
            let mut stale = Vec::new();
            for entry in pending.range((topic, group, 0u64)..=(topic, group, u64::MAX))? {
                let (k, v) = entry?;
                let record: PendingRecord = serde_json::from_slice(v.value())?;
                if now - record.delivered_at_ms >= min_idle_ms {
                    stale.push((k.value().2, record));
                    if stale.len() >= CLAIM_BATCH {
                        break;
                    }
                }
            }

            let log = txn.open_table(LOG_TABLE)?;
            let mut claimed = Vec::with_capacity(stale.len());
            for (id, mut record) in stale {
                record.consumer = consumer.to_string();
                record.delivered_at_ms = now;
                record.delivery_count += 1;
                pending.insert((topic, group, id), serde_json::to_vec(&record)?.as_slice())?;

                let bytes = log
                    .get((topic, id))?
                    .map(|v| v.value().to_vec())
                    .ok_or_else(|| {
                        StoreError::Integrity(format!("missing log entry {}#{}", topic, id))
                    })?;
                claimed.push((id, bytes, record.delivery_count));
            }
            claimed
        };
        txn.commit()?;
        Ok(claimed)
    }

    fn list_pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(PENDING_TABLE)?;
        let mut items = Vec::new();
        for entry in table.range((topic, group, 0u64)..=(topic, group, u64::MAX))? {
            let (k, v) = entry?;
            let record: PendingRecord = serde_json::from_slice(v.value())?;
            items.push(PendingEntry {
                id: MessageId(k.value().2),
                consumer: record.consumer,
                delivered_at: Utc
                    .timestamp_millis_opt(record.delivered_at_ms)
                    .single()
                    .unwrap_or_default(),
                delivery_count: record.delivery_count,
            });
        }
        Ok(items)
    }

    fn load_group(&self, topic: &str, group: &str) -> Result<Option<GroupRecord>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(GROUPS_TABLE)?;
        let record = table
            .get((topic, group))?
            .map(|g| serde_json::from_slice::<GroupRecord>(g.value()))
            .transpose()?;
        Ok(record)
    }

    /// Undecodable records are delivered with an empty payload so handlers reject them as
    /// malformed and the group moves on.
    fn to_message(&self, topic: &str, id: u64, bytes: &[u8], delivery_count: u32) -> Message {
        let payload = self.codec.decode(bytes).unwrap_or_else(|e| {
            error!("❌ Undecodable record {}#{}: {}", topic, id, e);
            Payload::new()
        });
        Message {
            id: MessageId(id),
            topic: topic.to_string(),
            payload,
            delivery_count,
        }
    }
}

#[async_trait]
impl MessageBus for RedbBus {
    fn name(&self) -> &str {
        "redb"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> Result<MessageId, BusError> {
        let bytes = self.codec.encode(payload)?;
        let id = self.append(topic, &bytes)?;
        self.published.notify_waiters();

        metrics::MESSAGES_PUBLISHED.with_label_values(&[topic]).inc();
        debug!("📝 Log append: {}#{}", topic, id);
        Ok(MessageId(id))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        if self.create_group(topic, group)? {
            info!("Consumer group '{}' created for topic '{}'", group, topic);
        } else {
            debug!("Consumer group '{}' already exists for topic '{}'", group, topic);
        }
        Ok(())
    }

    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Message>, BusError> {
        let deadline = Instant::now() + block;
        loop {
            // Registered before the check so a publish in between is not missed.
            let notified = self.published.notified();

            match self.try_deliver(topic, group, consumer)? {
                Delivery::Delivered { id, bytes } => {
                    return Ok(Some(self.to_message(topic, id, &bytes, 1)));
                }
                Delivery::NoGroup => {
                    return Err(BusError::UnknownGroup {
                        topic: topic.to_string(),
                        group: group.to_string(),
                    });
                }
                Delivery::CaughtUp => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, topic: &str, group: &str, id: MessageId) -> Result<(), BusError> {
        if self.remove_pending(topic, group, id.0)? {
            metrics::MESSAGES_ACKED.with_label_values(&[topic, group]).inc();
        } else {
            debug!("Ack for {}#{} in '{}' matched nothing pending", topic, id, group);
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<Message>, BusError> {
        let min_idle_ms = i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);
        let claimed = self.reassign_stale(topic, group, consumer, min_idle_ms)?;
        if !claimed.is_empty() {
            info!(
                topic,
                group,
                consumer,
                count = claimed.len(),
                "♻️ Claimed stale pending messages"
            );
        }
        Ok(claimed
            .into_iter()
            .map(|(id, bytes, count)| self.to_message(topic, id, &bytes, count))
            .collect())
    }

    async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>, BusError> {
        Ok(self.list_pending(topic, group)?)
    }

    async fn group_cursor(&self, topic: &str, group: &str) -> Result<Option<MessageId>, BusError> {
        Ok(self
            .load_group(topic, group)?
            .map(|record| MessageId(record.acked_through)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_bus() -> (RedbBus, String) {
        let path = format!("/tmp/test_bus_{}.redb", uuid::Uuid::new_v4());
        let store = Arc::new(RedbStore::new(&path).expect("Failed to create RedbStore"));
        let bus = RedbBus::new(store, EnvelopeCodec::default()).expect("Failed to open bus");
        (bus, path)
    }

    fn payload(n: u32) -> Payload {
        let mut p = Payload::new();
        p.insert("n".into(), n.to_string());
        p
    }

    const NO_WAIT: Duration = Duration::ZERO;

    #[tokio::test]
    async fn test_ids_are_monotonic_per_topic() {
        let (bus, path) = open_bus();
        let a = bus.publish("fills", &payload(1)).await.unwrap();
        let b = bus.publish("fills", &payload(2)).await.unwrap();
        let other = bus.publish("orders", &payload(3)).await.unwrap();

        assert!(b > a);
        assert_eq!(other, MessageId(1), "topics number independently");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_delivery_follows_publish_order() {
        let (bus, path) = open_bus();
        bus.ensure_group("fills", "g").await.unwrap();
        for n in 1..=3 {
            bus.publish("fills", &payload(n)).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(msg) = bus.read_new("fills", "g", "c1", NO_WAIT).await.unwrap() {
            seen.push(msg.payload["n"].clone());
            bus.ack("fills", "g", msg.id).await.unwrap();
        }
        assert_eq!(seen, vec!["1", "2", "3"]);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_new_reads_skip_messages_pending_elsewhere() {
        let (bus, path) = open_bus();
        bus.ensure_group("fills", "g").await.unwrap();
        bus.publish("fills", &payload(1)).await.unwrap();
        bus.publish("fills", &payload(2)).await.unwrap();

        let first = bus.read_new("fills", "g", "c1", NO_WAIT).await.unwrap().unwrap();
        let second = bus.read_new("fills", "g", "c2", NO_WAIT).await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(bus.read_new("fills", "g", "c3", NO_WAIT).await.unwrap().is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_cursor_only_advances_through_acked_prefix() {
        let (bus, path) = open_bus();
        bus.ensure_group("fills", "g").await.unwrap();
        for n in 1..=3 {
            bus.publish("fills", &payload(n)).await.unwrap();
        }
        let m1 = bus.read_new("fills", "g", "c", NO_WAIT).await.unwrap().unwrap();
        let m2 = bus.read_new("fills", "g", "c", NO_WAIT).await.unwrap().unwrap();

        bus.ack("fills", "g", m2.id).await.unwrap();
        assert_eq!(bus.group_cursor("fills", "g").await.unwrap(), Some(MessageId(0)));

        bus.ack("fills", "g", m1.id).await.unwrap();
        assert_eq!(bus.group_cursor("fills", "g").await.unwrap(), Some(MessageId(2)));

        // Double ack is harmless.
        bus.ack("fills", "g", m1.id).await.unwrap();
        assert!(bus.pending("fills", "g").await.unwrap().is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_claim_respects_idle_time() {
        let (bus, path) = open_bus();
        bus.ensure_group("fills", "g").await.unwrap();
        bus.publish("fills", &payload(1)).await.unwrap();
        let original = bus.read_new("fills", "g", "dead", NO_WAIT).await.unwrap().unwrap();

        let none = bus
            .claim_stale("fills", "g", "rescuer", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(none.is_empty(), "fresh entries are not stolen");

        let claimed = bus.claim_stale("fills", "g", "rescuer", Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, original.id);
        assert_eq!(claimed[0].delivery_count, 2);

        let pending = bus.pending("fills", "g").await.unwrap();
        assert_eq!(pending[0].consumer, "rescuer");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_read_on_unknown_group_is_an_error() {
        let (bus, path) = open_bus();
        let err = bus.read_new("fills", "ghost", "c", NO_WAIT).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownGroup { .. }));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let (bus, path) = open_bus();
        let bus = Arc::new(bus);
        bus.ensure_group("news_raw", "g").await.unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.read_new("news_raw", "g", "c", Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish("news_raw", &payload(7)).await.unwrap();

        let msg = reader.await.unwrap().unwrap().expect("woken by publish");
        assert_eq!(msg.payload["n"], "7");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let (bus, path) = open_bus();
        bus.ensure_group("news_raw", "g").await.unwrap();
        let started = std::time::Instant::now();
        let msg = bus
            .read_new("news_raw", "g", "c", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(msg.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        let _ = std::fs::remove_file(path);
    }
}
