use redb::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redb error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Key-value transport error: {0}")]
    Transport(String),
    #[error("Update contention on '{key}' after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
    #[error("Data integrity error: {0}")]
    Integrity(String),
}

/// Shared handle to the embedded database.
///
/// The bus log and the coordination tables live in the same file, so one `RedbStore`
/// is opened per process and handed to both.
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Integrity(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let db = Database::create(&path)?;
        info!("📦 Redb Database opened at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_write(&self) -> Result<redb::WriteTransaction<'_>, StoreError> {
        Ok(self.db.begin_write()?)
    }

    pub fn begin_read(&self) -> Result<redb::ReadTransaction<'_>, StoreError> {
        Ok(self.db.begin_read()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::{ReadableTable, TableDefinition};

    const PROBE: TableDefinition<&str, u64> = TableDefinition::new("probe");

    #[test]
    fn test_reopen_keeps_committed_data() {
        let path = format!("/tmp/redb_store_{}.redb", uuid::Uuid::new_v4());
        {
            let store = RedbStore::new(&path).unwrap();
            let txn = store.begin_write().unwrap();
            {
                let mut table = txn.open_table(PROBE).unwrap();
                table.insert("answer", 42u64).unwrap();
            }
            txn.commit().unwrap();
        }

        let store = RedbStore::new(&path).unwrap();
        let txn = store.begin_read().unwrap();
        let table = txn.open_table(PROBE).unwrap();
        assert_eq!(table.get("answer").unwrap().map(|v| v.value()), Some(42));

        let _ = std::fs::remove_file(path);
    }
}
