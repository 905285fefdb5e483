//! Key-value storage seams.
//!
//! Subscriber state lives in external stores reached through the [`Store`]
//! trait: a table/key/value interface with compare-and-swap tokens and TTLs.
//! Writers follow a read-modify-write discipline, retrying a bounded number
//! of times on contention. [`MemoryStore`] is the in-process implementation
//! with real contention semantics.

use thiserror::Error;

pub mod aor;
pub mod impi;
pub mod memory;

pub use aor::{AoR, Binding, SubscriberDataManager, Subscription};
pub use impi::{AuthChallenge, ImpiStore};
pub use memory::MemoryStore;

use std::time::Duration;

/// How often a read-modify-write is retried on CAS contention.
pub const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The CAS token did not match; re-read and retry.
    #[error("store data contention")]
    DataContention,

    #[error("store failure: {0}")]
    Backend(String),
}

/// A stored value with its CAS token.
#[derive(Debug, Clone)]
pub struct StoredData {
    pub data: String,
    pub cas: u64,
}

/// A key-value store with compare-and-swap writes and per-record TTLs.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads a record, returning its data and CAS token.
    async fn get_data(
        &self,
        table: &str,
        key: &str,
    ) -> std::result::Result<Option<StoredData>, StoreError>;

    /// Writes a record. `cas` 0 requires the record to be absent; any other
    /// value must match the token from the preceding read.
    async fn set_data(
        &self,
        table: &str,
        key: &str,
        data: &str,
        cas: u64,
        expiry: Duration,
    ) -> std::result::Result<(), StoreError>;

    /// Deletes a record unconditionally.
    async fn delete_data(&self, table: &str, key: &str) -> std::result::Result<(), StoreError>;
}
