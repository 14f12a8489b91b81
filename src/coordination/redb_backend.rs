use super::{checked_total, parse_flag, parse_notional, CoordinationStore};
use crate::persistence::{RedbStore, StoreError};
use crate::topics::NOTIONAL_KEY;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redb::{ReadableTable, TableDefinition};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

const HOLDS_TABLE: TableDefinition<&str, i64> = TableDefinition::new("holds");
const SCALARS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("coordination");

/// Coordination tables living in the same database file as the bus log.
pub struct RedbCoordination {
    store: Arc<RedbStore>,
    halt_key: String,
}

impl RedbCoordination {
    pub fn new(store: Arc<RedbStore>, halt_key: &str) -> Result<Self, StoreError> {
        let txn = store.begin_write()?;
        {
            let _ = txn.open_table(HOLDS_TABLE)?;
            let _ = txn.open_table(SCALARS_TABLE)?;
        }
        txn.commit()?;

        Ok(Self {
            store,
            halt_key: halt_key.to_string(),
        })
    }

    fn read_scalar(&self, key: &str) -> Result<Option<String>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(SCALARS_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    fn write_scalar(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(SCALARS_TABLE)?;
            match value {
                Some(v) => {
                    table.insert(key, v)?;
                }
                None => {
                    table.remove(key)?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for RedbCoordination {
    fn name(&self) -> &str {
        "redb"
    }

    async fn set_hold(&self, ticker: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(HOLDS_TABLE)?;
            table.insert(ticker, expires_at.timestamp_millis())?;
        }
        txn.commit()?;
        debug!("Hold stored: {} until {}", ticker, expires_at);
        Ok(())
    }

    async fn get_hold(&self, ticker: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(HOLDS_TABLE)?;
        let millis = table.get(ticker)?.map(|v| v.value());
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    async fn clear_hold(&self, ticker: &str) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(HOLDS_TABLE)?;
            table.remove(ticker)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn add_notional(&self, delta: Decimal) -> Result<Decimal, StoreError> {
        // redb admits one writer at a time, so the transaction is the lock.
        let txn = self.store.begin_write()?;
        let total = {
            let mut table = txn.open_table(SCALARS_TABLE)?;
            let current = match table.get(NOTIONAL_KEY)?.map(|v| v.value().to_string()) {
                Some(raw) => parse_notional(NOTIONAL_KEY, &raw)?,
                None => Decimal::ZERO,
            };
            let total = checked_total(current, delta)?;
            table.insert(NOTIONAL_KEY, total.to_string().as_str())?;
            total
        };
        txn.commit()?;
        Ok(total)
    }

    async fn get_notional(&self) -> Result<Decimal, StoreError> {
        match self.read_scalar(NOTIONAL_KEY)? {
            Some(raw) => parse_notional(NOTIONAL_KEY, &raw),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn get_halt(&self) -> Result<bool, StoreError> {
        Ok(self
            .read_scalar(&self.halt_key)?
            .is_some_and(|raw| parse_flag(&raw)))
    }

    async fn set_halt(&self) -> Result<(), StoreError> {
        self.write_scalar(&self.halt_key, Some("1"))
    }

    async fn trip_halt(&self) -> Result<bool, StoreError> {
        let txn = self.store.begin_write()?;
        let raised = {
            let mut table = txn.open_table(SCALARS_TABLE)?;
            let halted = table
                .get(self.halt_key.as_str())?
                .is_some_and(|v| parse_flag(v.value()));
            if !halted {
                table.insert(self.halt_key.as_str(), "1")?;
            }
            !halted
        };
        txn.commit()?;
        Ok(raised)
    }

    async fn clear_halt(&self) -> Result<(), StoreError> {
        self.write_scalar(&self.halt_key, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open() -> (RedbCoordination, String) {
        let path = format!("/tmp/test_coord_{}.redb", uuid::Uuid::new_v4());
        let store = Arc::new(RedbStore::new(&path).unwrap());
        (RedbCoordination::new(store, "system_halt").unwrap(), path)
    }

    #[tokio::test]
    async fn test_hold_last_write_wins() {
        let (coord, path) = open();
        let first = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2030, 1, 2, 0, 0, 0).unwrap();

        coord.set_hold("AAPL", first).await.unwrap();
        coord.set_hold("AAPL", second).await.unwrap();
        assert_eq!(coord.get_hold("AAPL").await.unwrap(), Some(second));
        assert_eq!(coord.get_hold("MSFT").await.unwrap(), None);

        coord.clear_hold("AAPL").await.unwrap();
        coord.clear_hold("AAPL").await.unwrap();
        assert_eq!(coord.get_hold("AAPL").await.unwrap(), None);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_notional_accumulates_exactly() {
        let (coord, path) = open();
        assert_eq!(coord.get_notional().await.unwrap(), Decimal::ZERO);
        assert_eq!(coord.add_notional(dec!(1000)).await.unwrap(), dec!(1000));
        assert_eq!(coord.add_notional(dec!(-400)).await.unwrap(), dec!(600));
        assert_eq!(coord.get_notional().await.unwrap(), dec!(600));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_concurrent_adds_do_not_lose_updates() {
        let (coord, path) = open();
        let coord = Arc::new(coord);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let coord = coord.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    coord.add_notional(dec!(1.5)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(coord.get_notional().await.unwrap(), dec!(300));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_halt_flag_round_trip() {
        let (coord, path) = open();
        assert!(!coord.get_halt().await.unwrap());
        coord.set_halt().await.unwrap();
        assert!(coord.get_halt().await.unwrap());
        coord.clear_halt().await.unwrap();
        assert!(!coord.get_halt().await.unwrap());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_trip_halt_has_one_winner() {
        let (coord, path) = open();
        assert!(coord.trip_halt().await.unwrap());
        assert!(!coord.trip_halt().await.unwrap());
        assert!(coord.get_halt().await.unwrap());
        let _ = std::fs::remove_file(path);
    }
}
