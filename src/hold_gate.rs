use crate::bus::{HandlerError, Message, MessageHandler};
use crate::clock::TimeProvider;
use crate::coordination::CoordinationStore;
use crate::events::{CatalystHold, PlaybookEvent};
use crate::metrics;
use crate::persistence::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CATALYST_TYPE: &str = "CatalystEvent";

/// Turns catalyst events on the playbook topic into timed per-ticker holds.
pub struct HoldWriter {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn TimeProvider>,
}

impl HoldWriter {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn TimeProvider>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl MessageHandler for HoldWriter {
    fn name(&self) -> &str {
        "hold_writer"
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        // Plans, halts and headlines share the topic; only catalysts matter here.
        if message.payload.get(PlaybookEvent::TYPE_FIELD).map(String::as_str) != Some(CATALYST_TYPE) {
            return Ok(());
        }

        let event = CatalystHold::from_payload(&message.payload)?;
        let event_name = event.event_name.as_deref().unwrap_or("unnamed");
        let (Some(ticker), Some(until)) = (event.ticker.as_deref(), event.hold_until_utc) else {
            debug!("Catalyst '{}' carries no hold", event_name);
            return Ok(());
        };

        if until <= self.clock.now() {
            debug!(
                "Catalyst '{}' hold for {} already expired at {}",
                event_name, ticker, until
            );
            return Ok(());
        }

        self.store.set_hold(ticker, until).await?;
        metrics::inc_holds_set();
        info!(
            "⏸️ HOLD ACTIVATED for {} until {} due to event '{}'.",
            ticker,
            until.to_rfc3339(),
            event_name
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldStatus {
    Held { until: DateTime<Utc> },
    Clear,
}

impl HoldStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, HoldStatus::Held { .. })
    }
}

/// Read side of the hold map, consulted before emitting a trade signal.
#[derive(Clone)]
pub struct HoldGate {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn TimeProvider>,
}

impl HoldGate {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn TimeProvider>) -> Self {
        Self { store, clock }
    }

    /// Same answer as [`check`](Self::check) without clearing anything.
    pub async fn peek(&self, ticker: &str) -> Result<HoldStatus, StoreError> {
        Ok(match self.store.get_hold(ticker).await? {
            Some(until) if self.clock.now() < until => HoldStatus::Held { until },
            _ => HoldStatus::Clear,
        })
    }

    /// `Held` while `now < expiry`. An expired entry is deleted on the way out; failing
    /// to delete it does not change the answer.
    pub async fn check(&self, ticker: &str) -> Result<HoldStatus, StoreError> {
        let Some(until) = self.store.get_hold(ticker).await? else {
            return Ok(HoldStatus::Clear);
        };

        if self.clock.now() < until {
            return Ok(HoldStatus::Held { until });
        }

        info!("Hold for {} expired at {}. Clearing.", ticker, until.to_rfc3339());
        if let Err(e) = self.store.clear_hold(ticker).await {
            warn!("Failed to clear expired hold for {}: {}", ticker, e);
        }
        Ok(HoldStatus::Clear)
    }
}
