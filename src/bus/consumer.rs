use super::{BusError, Message, MessageBus, MessageId};
use crate::config::BusConfig;
use crate::events::MalformedMessage;
use crate::metrics;
use crate::persistence::StoreError;
use crate::shutdown::ShutdownCoordinator;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedMessage),
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),
    #[error("Bus failure: {0}")]
    Bus(#[from] BusError),
}

impl HandlerError {
    /// Malformed input will never succeed, so it is acknowledged straight away. Everything
    /// else is left pending for another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Malformed(_))
    }
}

/// Per-message side effects of a consumer. `Ok` means the effects are durable and the
/// message may be acknowledged.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on a single blocking pull, and therefore on shutdown latency.
    pub block: Duration,
    /// Pending entries idle this long are claimed by the loop.
    pub claim_idle: Duration,
    /// Deliveries after which a failing message is dropped.
    pub max_deliveries: u32,
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block: Duration::from_millis(5000),
            claim_idle: Duration::from_millis(60_000),
            max_deliveries: 5,
            error_backoff: Duration::from_millis(1000),
        }
    }
}

impl From<&BusConfig> for ConsumerConfig {
    fn from(cfg: &BusConfig) -> Self {
        Self {
            block: Duration::from_millis(cfg.block_ms),
            claim_idle: Duration::from_millis(cfg.claim_idle_ms),
            max_deliveries: cfg.max_deliveries.max(1),
            error_backoff: Duration::from_millis(cfg.error_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Registering,
    Recovering,
    Pulling,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub pulls: u64,
    pub delivered: u64,
    pub claimed: u64,
    pub acked: u64,
    pub malformed: u64,
    pub failed: u64,
    pub poisoned: u64,
    pub panicked: u64,
}

/// Durable pull loop for one (topic, group, consumer).
///
/// `Registering → Recovering → Pulling ⇄ Recovering → Stopped`. Recovery claims stale
/// pending entries at start-up and again whenever a pull comes back empty and
/// `claim_idle` has passed since the last claim. Claimed messages are handed out before
/// any new pull.
pub struct ConsumeLoop {
    bus: Arc<dyn MessageBus>,
    topic: String,
    group: String,
    consumer: String,
    config: ConsumerConfig,
    shutdown: ShutdownCoordinator,
    state: LoopState,
    buffer: VecDeque<Message>,
    last_claim: Option<Instant>,
    idle: bool,
    stats: LoopStats,
}

impl ConsumeLoop {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: &str,
        group: &str,
        consumer: &str,
        config: ConsumerConfig,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            bus,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            config,
            shutdown,
            state: LoopState::Registering,
            buffer: VecDeque::new(),
            last_claim: None,
            idle: false,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    /// Next message for this consumer, or `None` once shutdown has been requested.
    ///
    /// Only group registration errors surface here; transport errors on pulls are logged
    /// and retried after a back-off.
    pub async fn next(&mut self) -> Result<Option<Message>, BusError> {
        loop {
            if self.shutdown.is_shutting_down() {
                self.stop();
                return Ok(None);
            }

            match self.state {
                LoopState::Stopped => return Ok(None),
                LoopState::Registering => {
                    self.bus.ensure_group(&self.topic, &self.group).await?;
                    info!(
                        "🎧 Consumer '{}' joined group '{}' on '{}' via {}",
                        self.consumer,
                        self.group,
                        self.topic,
                        self.bus.name()
                    );
                    self.state = LoopState::Recovering;
                }
                LoopState::Recovering => {
                    self.recover().await;
                    self.state = LoopState::Pulling;
                }
                LoopState::Pulling => {
                    if let Some(message) = self.buffer.pop_front() {
                        self.stats.delivered += 1;
                        return Ok(Some(message));
                    }
                    if self.idle && self.claim_due() {
                        self.state = LoopState::Recovering;
                        continue;
                    }
                    if let Some(message) = self.pull().await? {
                        self.stats.delivered += 1;
                        return Ok(Some(message));
                    }
                }
            }
        }
    }

    pub async fn ack(&mut self, id: MessageId) -> Result<(), BusError> {
        self.bus.ack(&self.topic, &self.group, id).await?;
        self.stats.acked += 1;
        Ok(())
    }

    /// Pull, process, ack until shutdown.
    pub async fn run<H: MessageHandler + ?Sized>(
        &mut self,
        handler: &H,
    ) -> Result<LoopStats, BusError> {
        while let Some(message) = self.next().await? {
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => self.settle(&message).await,
                Ok(Err(HandlerError::Malformed(e))) => {
                    warn!(
                        "⚠️ [{}] Malformed message {}#{}: {}. Acknowledging.",
                        handler.name(),
                        message.topic,
                        message.id,
                        e
                    );
                    self.stats.malformed += 1;
                    metrics::MALFORMED_MESSAGES
                        .with_label_values(&[&message.topic])
                        .inc();
                    self.settle(&message).await;
                }
                Ok(Err(e)) => {
                    self.stats.failed += 1;
                    metrics::HANDLER_FAILURES
                        .with_label_values(&[&message.topic])
                        .inc();
                    if message.delivery_count >= self.config.max_deliveries {
                        error!(
                            "☠️ [{}] Dropping {}#{} after {} deliveries: {}",
                            handler.name(),
                            message.topic,
                            message.id,
                            message.delivery_count,
                            e
                        );
                        self.stats.poisoned += 1;
                        metrics::POISON_DROPPED
                            .with_label_values(&[&message.topic])
                            .inc();
                        self.settle(&message).await;
                    } else {
                        error!(
                            "❌ [{}] Failed {}#{} (delivery {}): {}. Leaving pending.",
                            handler.name(),
                            message.topic,
                            message.id,
                            message.delivery_count,
                            e
                        );
                    }
                }
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    drop(panic);
                    error!(
                        "💥 [{}] Handler panicked on {}#{}: {}",
                        handler.name(),
                        message.topic,
                        message.id,
                        detail
                    );
                    self.stats.panicked += 1;
                    metrics::HANDLER_PANICS.inc();
                    self.settle(&message).await;
                }
            }
        }

        info!(
            "🏁 [{}] Consumer '{}' stopped: {:?}",
            handler.name(),
            self.consumer,
            self.stats
        );
        Ok(self.stats.clone())
    }

    async fn settle(&mut self, message: &Message) {
        if let Err(e) = self.ack(message.id).await {
            error!(
                "Failed to ACK {}#{}: {}. It will be redelivered.",
                message.topic, message.id, e
            );
        }
    }

    fn stop(&mut self) {
        if self.state != LoopState::Stopped {
            debug!("Consume loop {}/{} stopping", self.topic, self.group);
            self.state = LoopState::Stopped;
        }
    }

    fn claim_due(&self) -> bool {
        self.last_claim
            .is_none_or(|at| at.elapsed() >= self.config.claim_idle)
    }

    async fn recover(&mut self) {
        self.last_claim = Some(Instant::now());
        self.idle = false;
        match self
            .bus
            .claim_stale(&self.topic, &self.group, &self.consumer, self.config.claim_idle)
            .await
        {
            Ok(claimed) => {
                self.stats.claimed += claimed.len() as u64;
                self.buffer.extend(claimed);
            }
            Err(e) => warn!("Claiming stale messages on {} failed: {}", self.topic, e),
        }
    }

    /// One blocking pull, abandoned if shutdown fires first.
    async fn pull(&mut self) -> Result<Option<Message>, BusError> {
        self.stats.pulls += 1;
        let pulled = tokio::select! {
            biased;
            _ = self.shutdown.wait() => None,
            result = self.bus.read_new(&self.topic, &self.group, &self.consumer, self.config.block) => Some(result),
        };

        match pulled {
            None => {
                self.stop();
                Ok(None)
            }
            Some(Ok(Some(message))) => {
                self.idle = false;
                Ok(Some(message))
            }
            Some(Ok(None)) => {
                self.idle = true;
                Ok(None)
            }
            Some(Err(BusError::UnknownGroup { .. })) => {
                warn!(
                    "Group '{}' vanished from '{}'. Re-registering.",
                    self.group, self.topic
                );
                self.state = LoopState::Registering;
                Ok(None)
            }
            Some(Err(e)) => {
                metrics::PULL_ERRORS.inc();
                error!(
                    "❌ Pull from {} failed: {}. Retrying in {:?}",
                    self.topic, e, self.config.error_backoff
                );
                self.shutdown.sleep(self.config.error_backoff).await;
                Ok(None)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
