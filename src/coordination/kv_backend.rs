use super::{checked_total, parse_flag, parse_notional, CoordinationStore};
use crate::persistence::StoreError;
use crate::topics::{hold_key, NOTIONAL_KEY};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

const MAX_CAS_ATTEMPTS: u32 = 16;

fn transport(e: impl std::fmt::Display) -> StoreError {
    StoreError::Transport(e.to_string())
}

/// Coordination store on a JetStream key-value bucket.
///
/// Single-key writes are atomic on the server. The accumulator is updated with a
/// compare-and-swap on the key revision so concurrent watchdogs never lose a fold.
pub struct KvCoordination {
    kv: kv::Store,
    bucket: String,
    halt_key: String,
}

impl KvCoordination {
    pub async fn connect(
        context: &jetstream::Context,
        bucket: &str,
        halt_key: &str,
    ) -> Result<Self, StoreError> {
        let kv = match context.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => {
                info!("Creating KV bucket: {}", bucket);
                context
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(transport)?
            }
        };

        Ok(Self {
            kv,
            bucket: bucket.to_string(),
            halt_key: halt_key.to_string(),
        })
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.kv.get(key).await.map_err(transport)?;
        value
            .map(|bytes| {
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| StoreError::Integrity(format!("{}/{}: {}", self.bucket, key, e)))
            })
            .transpose()
    }
}

#[async_trait]
impl CoordinationStore for KvCoordination {
    fn name(&self) -> &str {
        "jetstream-kv"
    }

    async fn set_hold(&self, ticker: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.kv
            .put(hold_key(ticker), expires_at.to_rfc3339().into())
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn get_hold(&self, ticker: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.get_string(&hold_key(ticker)).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => Err(StoreError::Integrity(format!(
                "hold for {} is '{}': {}",
                ticker, raw, e
            ))),
        }
    }

    async fn clear_hold(&self, ticker: &str) -> Result<(), StoreError> {
        self.kv.delete(hold_key(ticker)).await.map_err(transport)?;
        Ok(())
    }

    async fn add_notional(&self, delta: Decimal) -> Result<Decimal, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let entry = self.kv.entry(NOTIONAL_KEY).await.map_err(transport)?;

            // Revision 0 asks the server for "no message on this key yet". A deleted key
            // still holds its tombstone, so the tombstone's revision is expected instead.
            let (current, expected) = match &entry {
                Some(e) if matches!(e.operation, kv::Operation::Put) => {
                    let raw = String::from_utf8_lossy(&e.value);
                    (parse_notional(NOTIONAL_KEY, &raw)?, e.revision)
                }
                Some(e) => (Decimal::ZERO, e.revision),
                None => (Decimal::ZERO, 0),
            };
            let total = checked_total(current, delta)?;
            let value = total.to_string();

            let written = self
                .kv
                .update(NOTIONAL_KEY, value.into(), expected)
                .await
                .is_ok();
            if written {
                return Ok(total);
            }
            debug!("Notional CAS conflict (attempt {}/{})", attempt, MAX_CAS_ATTEMPTS);
        }

        warn!("⚠️ Notional update gave up after {} attempts", MAX_CAS_ATTEMPTS);
        Err(StoreError::Contention {
            key: NOTIONAL_KEY.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn get_notional(&self) -> Result<Decimal, StoreError> {
        match self.get_string(NOTIONAL_KEY).await? {
            Some(raw) => parse_notional(NOTIONAL_KEY, &raw),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn get_halt(&self) -> Result<bool, StoreError> {
        Ok(self
            .get_string(&self.halt_key)
            .await?
            .is_some_and(|raw| parse_flag(&raw)))
    }

    async fn set_halt(&self) -> Result<(), StoreError> {
        self.kv
            .put(self.halt_key.as_str(), "1".into())
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn trip_halt(&self) -> Result<bool, StoreError> {
        let key = self.halt_key.as_str();
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let entry = self.kv.entry(key).await.map_err(transport)?;
            let expected = match &entry {
                Some(e) if matches!(e.operation, kv::Operation::Put) => {
                    if parse_flag(&String::from_utf8_lossy(&e.value)) {
                        return Ok(false);
                    }
                    e.revision
                }
                // Tombstone left by clear_halt.
                Some(e) => e.revision,
                None => 0,
            };

            match self.kv.update(key, "1".into(), expected).await {
                Ok(_) => return Ok(true),
                Err(e) => debug!(
                    "Halt CAS conflict (attempt {}/{}): {}",
                    attempt, MAX_CAS_ATTEMPTS, e
                ),
            }
        }

        warn!("⚠️ Halt trip gave up after {} attempts", MAX_CAS_ATTEMPTS);
        Err(StoreError::Contention {
            key: self.halt_key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn clear_halt(&self) -> Result<(), StoreError> {
        self.kv
            .delete(self.halt_key.as_str())
            .await
            .map_err(transport)?;
        Ok(())
    }
}
