//! Shared derived state fed by bus consumers: per-ticker holds, the global halt flag
//! and the notional accumulator. Every primitive is atomic on a single key.

pub mod kv_backend;
pub mod redb_backend;

use crate::persistence::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub use kv_backend::KvCoordination;
pub use redb_backend::RedbCoordination;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn name(&self) -> &str;

    /// Upsert. The last write wins.
    async fn set_hold(&self, ticker: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Raw stored expiry. Expired entries are returned as-is; the caller decides.
    async fn get_hold(&self, ticker: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn clear_hold(&self, ticker: &str) -> Result<(), StoreError>;

    /// Atomic read-modify-write. Returns the new total.
    async fn add_notional(&self, delta: Decimal) -> Result<Decimal, StoreError>;

    async fn get_notional(&self) -> Result<Decimal, StoreError>;

    async fn get_halt(&self) -> Result<bool, StoreError>;

    async fn set_halt(&self) -> Result<(), StoreError>;

    /// Raise the flag only if it is down. Returns `true` when this call raised it, so
    /// concurrent breach detectors agree on a single winner.
    async fn trip_halt(&self) -> Result<bool, StoreError>;

    async fn clear_halt(&self) -> Result<(), StoreError>;
}

pub(crate) fn parse_notional(key: &str, raw: &str) -> Result<Decimal, StoreError> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|e| StoreError::Integrity(format!("{} holds '{}': {}", key, raw, e)))
}

pub(crate) fn checked_total(current: Decimal, delta: Decimal) -> Result<Decimal, StoreError> {
    current.checked_add(delta).ok_or_else(|| {
        StoreError::Integrity(format!("notional {} + {} overflows", current, delta))
    })
}

pub(crate) fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "True")
}
