use super::{BusError, Message, MessageBus, MessageId, PendingEntry};
use crate::codec::{EnvelopeCodec, Payload};
use crate::metrics;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, consumer::PullConsumer, stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// NATS rejects a pull without expiry as "wait forever".
const MIN_PULL_EXPIRY: Duration = Duration::from_millis(100);

fn transport(e: impl std::fmt::Display) -> BusError {
    BusError::Transport(e.to_string())
}

/// One stream per topic: `FIRM_<TOPIC>` capturing subject `<topic>`.
pub fn stream_name(topic: &str) -> String {
    format!("FIRM_{}", topic.to_uppercase())
}

/// The server has handed an unacknowledged message to someone else once `ack_wait`
/// has passed, so the local handle is stale from then on.
fn past_ack_wait(delivered_at: DateTime<Utc>, now: DateTime<Utc>, ack_wait: Duration) -> bool {
    now.signed_duration_since(delivered_at)
        .to_std()
        .is_ok_and(|age| age >= ack_wait)
}

struct InFlight {
    message: jetstream::Message,
    consumer: String,
    delivered_at: DateTime<Utc>,
    delivery_count: u32,
}

/// JetStream-backed bus for agents running as separate processes.
///
/// Each group is a durable pull consumer with explicit acks. The server redelivers
/// anything unacknowledged after `ack_wait`, so `claim_stale` has nothing to do here
/// and `pending` reports only what this process holds in flight.
pub struct JetStreamBus {
    client: async_nats::Client,
    context: jetstream::Context,
    codec: EnvelopeCodec,
    ack_wait: Duration,
    streams: DashSet<String>,
    consumers: DashMap<(String, String), Arc<PullConsumer>>,
    in_flight: DashMap<(String, String, u64), InFlight>,
}

impl JetStreamBus {
    pub async fn connect(url: &str, codec: EnvelopeCodec, ack_wait: Duration) -> Result<Self, BusError> {
        info!("🔌 Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await.map_err(transport)?;
        let context = jetstream::new(client.clone());
        info!("✅ Connected to NATS JetStream");

        Ok(Self {
            client,
            context,
            codec,
            ack_wait,
            streams: DashSet::new(),
            consumers: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    /// Drop in-flight handles the server has already given up on.
    fn prune_in_flight(&self) {
        let now = Utc::now();
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, entry| !past_ack_wait(entry.delivered_at, now, self.ack_wait));
        let dropped = before.saturating_sub(self.in_flight.len());
        if dropped > 0 {
            debug!("Pruned {} in-flight message(s) past ack_wait", dropped);
        }
    }

    async fn ensure_stream(&self, topic: &str) -> Result<stream::Stream, BusError> {
        let name = stream_name(topic);
        let stream = match self.context.get_stream(&name).await {
            Ok(s) => s,
            Err(_) => {
                info!("Creating JetStream Stream: {}", name);
                self.context
                    .create_stream(stream::Config {
                        name: name.clone(),
                        subjects: vec![topic.to_string()],
                        storage: stream::StorageType::File,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        error!("❌ Failed to create JetStream stream {}: {}", name, e);
                        transport(e)
                    })?
            }
        };
        self.streams.insert(topic.to_string());
        Ok(stream)
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Arc<PullConsumer>, BusError> {
        let key = (topic.to_string(), group.to_string());
        if let Some(existing) = self.consumers.get(&key) {
            return Ok(existing.clone());
        }

        // Registered by another process: bind to it without creating.
        let stream = self
            .context
            .get_stream(stream_name(topic))
            .await
            .map_err(|_| unknown_group(topic, group))?;
        let consumer: PullConsumer = stream
            .get_consumer(group)
            .await
            .map_err(|_| unknown_group(topic, group))?;
        let consumer = Arc::new(consumer);
        self.consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

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

fn unknown_group(topic: &str, group: &str) -> BusError {
    BusError::UnknownGroup {
        topic: topic.to_string(),
        group: group.to_string(),
    }
}

#[async_trait]
impl MessageBus for JetStreamBus {
    fn name(&self) -> &str {
        "jetstream"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> Result<MessageId, BusError> {
        let bytes = self.codec.encode(payload)?;
        if !self.streams.contains(topic) {
            self.ensure_stream(topic).await?;
        }

        let ack = self
            .context
            .publish(topic.to_string(), bytes.into())
            .await
            .map_err(transport)?
            .await
            .map_err(transport)?;

        metrics::MESSAGES_PUBLISHED.with_label_values(&[topic]).inc();
        debug!("📝 JetStream publish: {}#{}", topic, ack.sequence);
        Ok(MessageId(ack.sequence))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        let stream = self.ensure_stream(topic).await?;

        let consumer: PullConsumer = match stream.get_consumer(group).await {
            Ok(existing) => {
                debug!("Consumer group '{}' already exists for topic '{}'", group, topic);
                existing
            }
            Err(_) => {
                let created = stream
                    .create_consumer(pull::Config {
                        durable_name: Some(group.to_string()),
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: self.ack_wait,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        error!("❌ Failed to create JetStream consumer {}: {}", group, e);
                        transport(e)
                    })?;
                info!("Consumer group '{}' created for topic '{}'", group, topic);
                created
            }
        };

        self.consumers
            .insert((topic.to_string(), group.to_string()), Arc::new(consumer));
        Ok(())
    }

    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Message>, BusError> {
        self.prune_in_flight();
        let pull_consumer = self.consumer(topic, group).await?;
        let mut batch = pull_consumer
            .batch()
            .max_messages(1)
            .expires(block.max(MIN_PULL_EXPIRY))
            .messages()
            .await
            .map_err(transport)?;

        let msg = match batch.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(transport(e)),
            None => return Ok(None),
        };

        let (id, delivery_count) = {
            let info = msg.info().map_err(transport)?;
            (info.stream_sequence, u32::try_from(info.delivered).unwrap_or(1).max(1))
        };
        let message = self.to_message(topic, id, &msg.payload, delivery_count);

        self.in_flight.insert(
            (topic.to_string(), group.to_string(), id),
            InFlight {
                message: msg,
                consumer: consumer.to_string(),
                delivered_at: Utc::now(),
                delivery_count,
            },
        );
        Ok(Some(message))
    }

    async fn ack(&self, topic: &str, group: &str, id: MessageId) -> Result<(), BusError> {
        let key = (topic.to_string(), group.to_string(), id.0);
        let Some((_, in_flight)) = self.in_flight.remove(&key) else {
            debug!("Ack for {}#{} in '{}' matched nothing in flight", topic, id, group);
            return Ok(());
        };

        in_flight.message.ack().await.map_err(transport)?;
        metrics::MESSAGES_ACKED.with_label_values(&[topic, group]).inc();
        Ok(())
    }

    async fn claim_stale(
        &self,
        _topic: &str,
        _group: &str,
        _consumer: &str,
        _min_idle: Duration,
    ) -> Result<Vec<Message>, BusError> {
        Ok(Vec::new())
    }

    async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>, BusError> {
        self.prune_in_flight();
        let mut items: Vec<PendingEntry> = self
            .in_flight
            .iter()
            .filter(|entry| entry.key().0 == topic && entry.key().1 == group)
            .map(|entry| PendingEntry {
                id: MessageId(entry.key().2),
                consumer: entry.consumer.clone(),
                delivered_at: entry.delivered_at,
                delivery_count: entry.delivery_count,
            })
            .collect();
        items.sort_by_key(|p| p.id);
        Ok(items)
    }

    async fn group_cursor(&self, topic: &str, group: &str) -> Result<Option<MessageId>, BusError> {
        let stream = match self.context.get_stream(stream_name(topic)).await {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        match stream.consumer_info(group).await {
            Ok(info) => Ok(Some(MessageId(info.ack_floor.stream_sequence))),
            Err(_) => Ok(None),
        }
    }
}
