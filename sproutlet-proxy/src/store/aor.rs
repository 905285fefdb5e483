//! Subscriber registration state.
//!
//! An [`AoR`] bundles the bindings and subscriptions registered against one
//! address of record, stored as a JSON document with absolute expiry times.
//! [`SubscriberDataManager`] wraps a [`Store`] with the document encoding;
//! deployments run one manager per site, local first, remote mirrored
//! best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{Store, StoreError};

const TABLE: &str = "reg";

/// A registered contact binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// The contact URI.
    pub uri: String,
    /// Absolute expiry, seconds since the epoch.
    pub expires: u64,
    /// The private identity that registered this binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_id: Option<String>,
}

/// A registration-event subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Where NOTIFYs for this subscription go.
    pub to_uri: String,
    /// Absolute expiry, seconds since the epoch.
    pub expires: u64,
}

/// The registration state of one address of record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AoR {
    #[serde(default)]
    pub bindings: HashMap<String, Binding>,
    #[serde(default)]
    pub subscriptions: HashMap<String, Subscription>,
    /// CSeq for registration-event NOTIFYs.
    #[serde(default)]
    pub notify_cseq: u32,
}

impl AoR {
    /// The latest expiry across bindings and subscriptions.
    pub fn max_expires(&self) -> u64 {
        self.bindings
            .values()
            .map(|b| b.expires)
            .chain(self.subscriptions.values().map(|s| s.expires))
            .max()
            .unwrap_or(0)
    }
}

/// Seconds since the epoch.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Document-level access to AoR state in one store.
pub struct SubscriberDataManager {
    store: Arc<dyn Store>,
}

impl SubscriberDataManager {
    pub fn new(store: Arc<dyn Store>) -> SubscriberDataManager {
        SubscriberDataManager { store }
    }

    /// Reads an AoR document and its CAS token.
    pub async fn get_aor_data(
        &self,
        aor_id: &str,
    ) -> std::result::Result<Option<(AoR, u64)>, StoreError> {
        let Some(stored) = self.store.get_data(TABLE, aor_id).await? else {
            return Ok(None);
        };
        let aor: AoR = serde_json::from_str(&stored.data)
            .map_err(|e| StoreError::Backend(format!("corrupt AoR document: {}", e)))?;
        Ok(Some((aor, stored.cas)))
    }

    /// Writes an AoR document under CAS. An AoR with nothing left in it is
    /// deleted instead.
    pub async fn set_aor_data(
        &self,
        aor_id: &str,
        aor: &AoR,
        cas: u64,
    ) -> std::result::Result<(), StoreError> {
        if aor.bindings.is_empty() && aor.subscriptions.is_empty() {
            log::debug!("removing empty AoR {}", aor_id);
            return self.store.delete_data(TABLE, aor_id).await;
        }

        let data = serde_json::to_string(aor)
            .map_err(|e| StoreError::Backend(format!("AoR encoding failed: {}", e)))?;
        let now = epoch_now();
        let ttl = Duration::from_secs(aor.max_expires().saturating_sub(now))
            .max(Duration::from_secs(1));
        self.store.set_data(TABLE, aor_id, &data, cas, ttl).await
    }
}
