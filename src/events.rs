//! Typed messages for every topic.
//!
//! Payloads arrive as flat string maps. Each message kind is validated here, at the
//! deserialization boundary, so handlers only ever see well-formed values. Anything
//! that fails validation is reported as [`MalformedMessage`].

use crate::codec::Payload;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedMessage {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}' = '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

fn required<'a>(p: &'a Payload, field: &'static str) -> Result<&'a str, MalformedMessage> {
    match p.get(field).map(|s| s.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MalformedMessage::MissingField(field)),
    }
}

/// Optional text field. Empty strings and the literal `None`/`null` some producers emit
/// count as absent.
fn optional<'a>(p: &'a Payload, field: &str) -> Option<&'a str> {
    p.get(field)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && *s != "None" && *s != "null")
}

fn invalid(field: &'static str, value: &str, reason: impl ToString) -> MalformedMessage {
    MalformedMessage::InvalidField {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a timestamp as RFC 3339, naive ISO-8601 (taken as UTC) or a bare date
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn timestamp_field(p: &Payload, field: &'static str) -> Result<DateTime<Utc>, MalformedMessage> {
    let raw = required(p, field)?;
    parse_timestamp(raw).ok_or_else(|| invalid(field, raw, "unparseable timestamp"))
}

fn optional_timestamp(
    p: &Payload,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, MalformedMessage> {
    optional(p, field)
        .map(|raw| parse_timestamp(raw).ok_or_else(|| invalid(field, raw, "unparseable timestamp")))
        .transpose()
}

/// Decimal from either plain or scientific notation (`"10"`, `"10.0"`, `"1e-05"`).
fn decimal_field(p: &Payload, field: &'static str) -> Result<Decimal, MalformedMessage> {
    let raw = required(p, field)?;
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| invalid(field, raw, e))
}

fn json_field<T: for<'de> Deserialize<'de>>(
    p: &Payload,
    field: &'static str,
) -> Result<T, MalformedMessage> {
    let raw = required(p, field)?;
    serde_json::from_str(raw).map_err(|e| invalid(field, raw, e))
}

fn put(p: &mut Payload, key: &str, value: impl Into<String>) {
    p.insert(key.to_string(), value.into());
}

fn put_opt(p: &mut Payload, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        put(p, key, v);
    }
}

// -----------------------------------------------------------------------------
// playbook topic
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Okr {
    pub objective: String,
    pub key_results: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub start_date: String,
    pub end_date: String,
    pub okrs: Vec<Okr>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalystEvent {
    pub event_name: String,
    pub ticker: Option<String>,
    pub event_time_utc: DateTime<Utc>,
    pub hold_until_utc: Option<DateTime<Utc>>,
    pub expected_impact: String,
}

/// The hold-relevant part of a catalyst. Only `ticker` and `hold_until_utc` are read,
/// so a catalyst missing its descriptive fields still produces a hold.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalystHold {
    pub event_name: Option<String>,
    pub ticker: Option<String>,
    pub hold_until_utc: Option<DateTime<Utc>>,
}

impl CatalystHold {
    pub fn from_payload(p: &Payload) -> Result<Self, MalformedMessage> {
        Ok(CatalystHold {
            event_name: optional(p, "event_name").map(str::to_string),
            ticker: optional(p, "ticker").map(str::to_string),
            hold_until_utc: optional_timestamp(p, "hold_until_utc")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemHalt {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewsHeadline {
    pub headline: String,
    pub source: String,
    pub ticker: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
}

/// Everything that travels on the shared `playbook` topic.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybookEvent {
    Playbook(Playbook),
    Catalyst(CatalystEvent),
    Halt(SystemHalt),
    Headline(NewsHeadline),
}

impl PlaybookEvent {
    pub const TYPE_FIELD: &'static str = "type";

    pub fn kind(&self) -> &'static str {
        match self {
            PlaybookEvent::Playbook(_) => "Playbook",
            PlaybookEvent::Catalyst(_) => "CatalystEvent",
            PlaybookEvent::Halt(_) => "SystemHalt",
            PlaybookEvent::Headline(_) => "NewsHeadline",
        }
    }

    pub fn from_payload(p: &Payload) -> Result<Self, MalformedMessage> {
        let kind = required(p, Self::TYPE_FIELD)?;
        match kind {
            "Playbook" => Ok(PlaybookEvent::Playbook(Playbook {
                start_date: required(p, "start_date")?.to_string(),
                end_date: required(p, "end_date")?.to_string(),
                okrs: json_field(p, "okrs")?,
                tasks: json_field(p, "tasks")?,
            })),
            "CatalystEvent" => Ok(PlaybookEvent::Catalyst(CatalystEvent {
                event_name: required(p, "event_name")?.to_string(),
                ticker: optional(p, "ticker").map(str::to_string),
                event_time_utc: timestamp_field(p, "event_time_utc")?,
                hold_until_utc: optional_timestamp(p, "hold_until_utc")?,
                expected_impact: required(p, "expected_impact")?.to_string(),
            })),
            "SystemHalt" => Ok(PlaybookEvent::Halt(SystemHalt {
                reason: required(p, "reason")?.to_string(),
            })),
            "NewsHeadline" => Ok(PlaybookEvent::Headline(NewsHeadline {
                headline: required(p, "headline")?.to_string(),
                source: required(p, "source")?.to_string(),
                ticker: optional(p, "ticker").map(str::to_string),
                timestamp_utc: timestamp_field(p, "timestamp_utc")?,
            })),
            other => Err(MalformedMessage::UnknownType(other.to_string())),
        }
    }

    pub fn to_payload(&self) -> Payload {
        let mut p = Payload::new();
        put(&mut p, Self::TYPE_FIELD, self.kind());
        match self {
            PlaybookEvent::Playbook(pb) => {
                put(&mut p, "start_date", pb.start_date.as_str());
                put(&mut p, "end_date", pb.end_date.as_str());
                // Vec of plain structs always serializes.
                put(&mut p, "okrs", serde_json::to_string(&pb.okrs).unwrap_or_default());
                put(&mut p, "tasks", serde_json::to_string(&pb.tasks).unwrap_or_default());
            }
            PlaybookEvent::Catalyst(ev) => {
                put(&mut p, "event_name", ev.event_name.as_str());
                put_opt(&mut p, "ticker", ev.ticker.as_deref());
                put(&mut p, "event_time_utc", ev.event_time_utc.to_rfc3339());
                if let Some(until) = ev.hold_until_utc {
                    put(&mut p, "hold_until_utc", until.to_rfc3339());
                }
                put(&mut p, "expected_impact", ev.expected_impact.as_str());
            }
            PlaybookEvent::Halt(halt) => {
                put(&mut p, "reason", halt.reason.as_str());
            }
            PlaybookEvent::Headline(h) => {
                put(&mut p, "headline", h.headline.as_str());
                put(&mut p, "source", h.source.as_str());
                put_opt(&mut p, "ticker", h.ticker.as_deref());
                put(&mut p, "timestamp_utc", h.timestamp_utc.to_rfc3339());
            }
        }
        p
    }
}

// -----------------------------------------------------------------------------
// fills topic
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: Option<String>,
    pub ticker: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub side: Side,
    pub timestamp_utc: Option<DateTime<Utc>>,
}

impl Fill {
    pub fn from_payload(p: &Payload) -> Result<Self, MalformedMessage> {
        let side = match required(p, "side")? {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => return Err(invalid("side", other, "expected 'buy' or 'sell'")),
        };

        let fill = Fill {
            order_id: optional(p, "order_id").map(str::to_string),
            ticker: required(p, "ticker")?.to_string(),
            qty: decimal_field(p, "qty")?,
            price: decimal_field(p, "price")?,
            side,
            timestamp_utc: optional_timestamp(p, "timestamp_utc")?,
        };
        if fill.signed_notional().is_none() {
            return Err(invalid(
                "qty",
                &fill.qty.to_string(),
                format!("qty x price ({}) overflows a decimal", fill.price),
            ));
        }
        Ok(fill)
    }

    pub fn to_payload(&self) -> Payload {
        let mut p = Payload::new();
        put_opt(&mut p, "order_id", self.order_id.as_deref());
        put(&mut p, "ticker", self.ticker.as_str());
        put(&mut p, "qty", self.qty.to_string());
        put(&mut p, "price", self.price.to_string());
        put(&mut p, "side", self.side.as_str());
        if let Some(ts) = self.timestamp_utc {
            put(&mut p, "timestamp_utc", ts.to_rfc3339());
        }
        p
    }

    /// Signed dollar value: positive for buys, negative for sells. `None` when
    /// `qty * price` does not fit in a `Decimal`.
    pub fn signed_notional(&self) -> Option<Decimal> {
        let value = self.qty.checked_mul(self.price)?;
        Some(match self.side {
            Side::Buy => value,
            Side::Sell => -value,
        })
    }
}

// -----------------------------------------------------------------------------
// news_raw / trade_signals topics
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NewsItem {
    pub headline: String,
    pub source: String,
    pub link: Option<String>,
    pub ticker: Option<String>,
}

impl NewsItem {
    pub fn from_payload(p: &Payload) -> Result<Self, MalformedMessage> {
        Ok(NewsItem {
            headline: required(p, "headline")?.to_string(),
            source: optional(p, "source").unwrap_or("Unknown").to_string(),
            link: optional(p, "link").map(str::to_string),
            ticker: optional(p, "ticker").map(str::to_string),
        })
    }

    pub fn to_payload(&self) -> Payload {
        let mut p = Payload::new();
        put(&mut p, "headline", self.headline.as_str());
        put(&mut p, "source", self.source.as_str());
        put_opt(&mut p, "link", self.link.as_deref());
        put_opt(&mut p, "ticker", self.ticker.as_deref());
        p
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeSignal {
    pub ticker: String,
    pub action: SignalAction,
    pub score: f64,
    pub source: String,
    pub headline: String,
}

impl TradeSignal {
    pub fn from_payload(p: &Payload) -> Result<Self, MalformedMessage> {
        let action = match required(p, "action")? {
            "BUY" => SignalAction::Buy,
            "SELL" => SignalAction::Sell,
            other => return Err(invalid("action", other, "expected 'BUY' or 'SELL'")),
        };
        let raw_score = required(p, "score")?;
        let score = raw_score
            .parse::<f64>()
            .map_err(|e| invalid("score", raw_score, e))?;

        Ok(TradeSignal {
            ticker: required(p, "ticker")?.to_string(),
            action,
            score,
            source: required(p, "source")?.to_string(),
            headline: optional(p, "headline").unwrap_or_default().to_string(),
        })
    }

    pub fn to_payload(&self) -> Payload {
        let mut p = Payload::new();
        put(&mut p, "ticker", self.ticker.as_str());
        put(&mut p, "action", self.action.as_str());
        put(&mut p, "score", self.score.to_string());
        put(&mut p, "source", self.source.as_str());
        put(&mut p, "headline", self.headline.as_str());
        p
    }
}
