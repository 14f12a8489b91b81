pub mod redb_store;

pub use redb_store::{RedbStore, StoreError};
