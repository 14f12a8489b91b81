use crate::bus::{HandlerError, Message, MessageBus, MessageHandler};
use crate::events::{NewsItem, SignalAction, TradeSignal};
use crate::hold_gate::{HoldGate, HoldStatus};
use crate::metrics;
use crate::persistence::StoreError;
use crate::topics::{GROUP_SIGNAL_MAKER, TRADE_SIGNALS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub const BUY_THRESHOLD: f64 = 0.6;
pub const SELL_THRESHOLD: f64 = -0.6;

/// Headline sentiment in `[-1.0, 1.0]`.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, headline: &str) -> f64;
}

/// Word-list scorer: each positive word adds 0.7, each negative word subtracts 0.7.
pub struct KeywordScorer {
    positive: Vec<&'static str>,
    negative: Vec<&'static str>,
}

impl Default for KeywordScorer {
    fn default() -> Self {
        Self {
            positive: vec!["up", "beats", "gains", "rises", "profit", "upgrade"],
            negative: vec!["down", "misses", "losses", "falls", "plunges", "downgrade"],
        }
    }
}

impl SentimentScorer for KeywordScorer {
    fn score(&self, headline: &str) -> f64 {
        let lowered = headline.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let raw = 0.7 * (count_hits(&self.positive, &words) - count_hits(&self.negative, &words));
        raw.clamp(-1.0, 1.0)
    }
}

fn count_hits(list: &[&str], words: &[&str]) -> f64 {
    list.iter()
        .filter(|&&term| words.iter().any(|&word| word == term))
        .count() as f64
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalDecision {
    /// Only ticker-specific news is traded.
    NoTicker,
    Suppressed { ticker: String, until: DateTime<Utc> },
    Neutral { ticker: String, score: f64 },
    Emit(TradeSignal),
}

/// News to trade signals, gated by per-ticker holds.
pub struct SignalPath {
    bus: Arc<dyn MessageBus>,
    gate: HoldGate,
    scorer: Arc<dyn SentimentScorer>,
}

impl SignalPath {
    pub fn new(bus: Arc<dyn MessageBus>, gate: HoldGate, scorer: Arc<dyn SentimentScorer>) -> Self {
        Self { bus, gate, scorer }
    }

    pub async fn evaluate(&self, item: &NewsItem) -> Result<SignalDecision, StoreError> {
        let Some(ticker) = item.ticker.as_deref() else {
            return Ok(SignalDecision::NoTicker);
        };

        if let HoldStatus::Held { until } = self.gate.check(ticker).await? {
            return Ok(SignalDecision::Suppressed {
                ticker: ticker.to_string(),
                until,
            });
        }

        let score = self.scorer.score(&item.headline);
        let action = if score > BUY_THRESHOLD {
            SignalAction::Buy
        } else if score < SELL_THRESHOLD {
            SignalAction::Sell
        } else {
            return Ok(SignalDecision::Neutral {
                ticker: ticker.to_string(),
                score,
            });
        };

        Ok(SignalDecision::Emit(TradeSignal {
            ticker: ticker.to_string(),
            action,
            score,
            source: GROUP_SIGNAL_MAKER.to_string(),
            headline: item.headline.clone(),
        }))
    }

    /// Evaluate and publish. Emission is fire-and-forget.
    pub async fn process(&self, item: &NewsItem) -> Result<SignalDecision, StoreError> {
        let decision = self.evaluate(item).await?;
        match &decision {
            SignalDecision::NoTicker => debug!("Skipping headline without ticker: {}", item.headline),
            SignalDecision::Suppressed { ticker, until } => {
                metrics::inc_signals_suppressed();
                info!(
                    "🔇 Signal for {} SUPPRESSED due to active hold until {}.",
                    ticker,
                    until.to_rfc3339()
                );
            }
            SignalDecision::Neutral { ticker, score } => {
                debug!("Neutral sentiment for {} ({:.2})", ticker, score)
            }
            SignalDecision::Emit(signal) => {
                if self
                    .bus
                    .publish_logged(TRADE_SIGNALS, &signal.to_payload())
                    .await
                    .is_some()
                {
                    metrics::inc_signals_emitted();
                    info!(
                        "📈 Generated signal: {} {} (score {:.2})",
                        signal.action.as_str(),
                        signal.ticker,
                        signal.score
                    );
                }
            }
        }
        Ok(decision)
    }
}

#[async_trait]
impl MessageHandler for SignalPath {
    fn name(&self) -> &str {
        "signal_path"
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let item = NewsItem::from_payload(&message.payload)?;
        self.process(&item).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_scorer_thresholds() {
        let scorer = KeywordScorer::default();
        assert!(scorer.score("ACME beats estimates") > BUY_THRESHOLD);
        assert!(scorer.score("ACME plunges after guidance") < SELL_THRESHOLD);
        assert_eq!(scorer.score("ACME beats estimates but falls"), 0.0);
        assert_eq!(scorer.score("ACME upgrade as profit rises"), 1.0);
    }

    #[test]
    fn test_keyword_scorer_matches_whole_words() {
        let scorer = KeywordScorer::default();
        assert_eq!(scorer.score("Quarterly update scheduled"), 0.0);
    }
}
