//! In-process store with memcached-style CAS semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::{Store, StoreError, StoredData};

struct Record {
    data: String,
    cas: u64,
    expires: Instant,
}

/// An in-memory [`Store`]. Used as the local store in tests and small
/// deployments; contention behaviour matches the remote backends.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(String, String), Record>>,
    #[cfg(test)]
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Makes every operation fail with a backend error, for error-path
    /// tests.
    #[cfg(test)]
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failing(&self) -> std::result::Result<(), StoreError> {
        #[cfg(test)]
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_data(
        &self,
        table: &str,
        key: &str,
    ) -> std::result::Result<Option<StoredData>, StoreError> {
        self.check_failing()?;
        let mut records = self.records.lock().expect("Lock failed");
        let map_key = (table.to_string(), key.to_string());

        match records.get(&map_key) {
            Some(record) if record.expires > Instant::now() => {
                log::trace!("get {}/{} cas {}", table, key, record.cas);
                Ok(Some(StoredData {
                    data: record.data.clone(),
                    cas: record.cas,
                }))
            }
            Some(_) => {
                records.remove(&map_key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_data(
        &self,
        table: &str,
        key: &str,
        data: &str,
        cas: u64,
        expiry: Duration,
    ) -> std::result::Result<(), StoreError> {
        self.check_failing()?;
        let mut records = self.records.lock().expect("Lock failed");
        let map_key = (table.to_string(), key.to_string());

        let live = records
            .get(&map_key)
            .filter(|r| r.expires > Instant::now())
            .map(|r| r.cas);

        let new_cas = match (cas, live) {
            // Adding a fresh record.
            (0, None) => 1,
            (0, Some(_)) => {
                log::debug!("set {}/{} add conflict", table, key);
                return Err(StoreError::DataContention);
            }
            // Updating an existing record.
            (cas, Some(current)) if cas == current => current + 1,
            (_, _) => {
                log::debug!("set {}/{} CAS mismatch", table, key);
                return Err(StoreError::DataContention);
            }
        };

        log::trace!("set {}/{} cas {} -> {}", table, key, cas, new_cas);
        records.insert(
            map_key,
            Record {
                data: data.to_string(),
                cas: new_cas,
                expires: Instant::now() + expiry,
            },
        );
        Ok(())
    }

    async fn delete_data(&self, table: &str, key: &str) -> std::result::Result<(), StoreError> {
        self.check_failing()?;
        self.records
            .lock()
            .expect("Lock failed")
            .remove(&(table.to_string(), key.to_string()));
        Ok(())
    }
}
