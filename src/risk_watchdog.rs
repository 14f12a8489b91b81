use crate::bus::{HandlerError, Message, MessageBus, MessageHandler};
use crate::coordination::CoordinationStore;
use crate::events::{Fill, PlaybookEvent, SystemHalt};
use crate::metrics;
use crate::persistence::StoreError;
use crate::topics::PLAYBOOK;
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of folding one fill into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Within the ceiling.
    Accumulated(Decimal),
    /// Breach detected; this fold raised the halt flag and published the notification.
    Breached(Decimal),
    /// Over the ceiling but the flag was already up.
    AlreadyHalted(Decimal),
}

impl FoldOutcome {
    pub fn total(&self) -> Decimal {
        match *self {
            FoldOutcome::Accumulated(t) | FoldOutcome::Breached(t) | FoldOutcome::AlreadyHalted(t) => t,
        }
    }
}

/// Folds fills into the shared notional accumulator and trips the global halt when
/// |notional| exceeds the ceiling.
pub struct RiskWatchdog {
    store: Arc<dyn CoordinationStore>,
    bus: Arc<dyn MessageBus>,
    max_notional_usd: Decimal,
}

impl RiskWatchdog {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        bus: Arc<dyn MessageBus>,
        max_notional_usd: Decimal,
    ) -> Self {
        Self {
            store,
            bus,
            max_notional_usd,
        }
    }

    /// Read and report the persisted accumulator.
    pub async fn initialize(&self) -> Result<Decimal, StoreError> {
        let notional = self.store.get_notional().await?;
        metrics::set_notional(notional);
        info!(
            "🛡️ Risk watchdog armed. Initial portfolio notional: {} (max {})",
            format_usd(notional),
            format_usd(self.max_notional_usd)
        );
        Ok(notional)
    }

    pub fn halt_reason(&self) -> String {
        format!("Max notional limit of {} breached.", format_usd(self.max_notional_usd))
    }

    pub async fn fold(&self, fill: &Fill) -> Result<FoldOutcome, StoreError> {
        let delta = fill.signed_notional().ok_or_else(|| {
            StoreError::Integrity(format!(
                "notional of {} x {} for {} overflows",
                fill.qty, fill.price, fill.ticker
            ))
        })?;
        let total = self.store.add_notional(delta).await?;
        metrics::set_notional(total);
        info!(
            "Fill {} {} {} @ {}. Portfolio notional updated to: {}",
            fill.side.as_str(),
            fill.qty,
            fill.ticker,
            fill.price,
            format_usd(total)
        );

        if total.abs() <= self.max_notional_usd {
            return Ok(FoldOutcome::Accumulated(total));
        }

        if !self.store.trip_halt().await? {
            debug!("Notional {} still over limit; halt already active", format_usd(total));
            return Ok(FoldOutcome::AlreadyHalted(total));
        }

        error!(
            "🚨 RISK LIMIT BREACHED! Notional value {} exceeds max of {}. HALTING ALL TRADING.",
            format_usd(total),
            format_usd(self.max_notional_usd)
        );
        metrics::inc_halts_tripped();

        let halt = PlaybookEvent::Halt(SystemHalt {
            reason: self.halt_reason(),
        });
        self.bus.publish_logged(PLAYBOOK, &halt.to_payload()).await;
        Ok(FoldOutcome::Breached(total))
    }
}

#[async_trait]
impl MessageHandler for RiskWatchdog {
    fn name(&self) -> &str {
        "risk_watchdog"
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let fill = Fill::from_payload(&message.payload)?;
        self.fold(&fill).await?;
        Ok(())
    }
}

/// `$1,234,567.89`
pub fn format_usd(value: Decimal) -> String {
    let rounded = value
        .abs()
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let text = format!("{:.2}", rounded);
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{}${}.{}", sign, grouped, frac)
}
