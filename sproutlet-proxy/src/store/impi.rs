//! Authentication challenge storage.
//!
//! Challenges are JSON documents keyed `impi + "\" + nonce`, written with
//! CAS under a bounded TTL. A per-IMPI association record (the list of live
//! nonces) is maintained alongside so administrative deregistration can
//! find and delete a subscriber's challenges without knowing the nonces.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Store, StoreError, StoredData, MAX_CAS_ATTEMPTS};
use crate::TrailId;

/// How long a challenge may wait for its response.
pub const AV_EXPIRY: Duration = Duration::from_secs(40);

const CHALLENGE_TABLE: &str = "av";
const ASSOC_TABLE: &str = "impi";

/// One outstanding authentication challenge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub nonce: String,
    /// Via branch of the original challenge, for log correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Set once the challenge was answered successfully.
    #[serde(default)]
    pub authenticated: bool,
    /// Set when the challenge timed out unanswered.
    #[serde(default)]
    pub expired: bool,
}

/// Challenge storage for private identities.
pub struct ImpiStore {
    store: Arc<dyn Store>,
}

impl ImpiStore {
    pub fn new(store: Arc<dyn Store>) -> ImpiStore {
        ImpiStore { store }
    }

    fn challenge_key(impi: &str, nonce: &str) -> String {
        format!("{}\\{}", impi, nonce)
    }

    /// Reads a challenge and its CAS token.
    pub async fn get_challenge(
        &self,
        impi: &str,
        nonce: &str,
    ) -> std::result::Result<Option<(AuthChallenge, u64)>, StoreError> {
        let key = Self::challenge_key(impi, nonce);
        let Some(StoredData { data, cas }) = self.store.get_data(CHALLENGE_TABLE, &key).await?
        else {
            log::debug!("no authentication challenge for {}", key);
            return Ok(None);
        };
        let challenge: AuthChallenge = serde_json::from_str(&data)
            .map_err(|e| StoreError::Backend(format!("corrupt challenge document: {}", e)))?;
        log::debug!("retrieved challenge for {}", key);
        Ok(Some((challenge, cas)))
    }

    /// Writes a challenge under CAS and records its nonce against the IMPI.
    pub async fn set_challenge(
        &self,
        impi: &str,
        challenge: &AuthChallenge,
        cas: u64,
    ) -> std::result::Result<(), StoreError> {
        let key = Self::challenge_key(impi, &challenge.nonce);
        let data = serde_json::to_string(challenge)
            .map_err(|e| StoreError::Backend(format!("challenge encoding failed: {}", e)))?;
        log::debug!("writing challenge for {}", key);
        self.store
            .set_data(CHALLENGE_TABLE, &key, &data, cas, AV_EXPIRY)
            .await?;
        self.associate_nonce(impi, &challenge.nonce).await
    }

    /// Deletes every challenge recorded against an IMPI.
    pub async fn delete_impi(&self, impi: &str) -> std::result::Result<(), StoreError> {
        let nonces = match self.store.get_data(ASSOC_TABLE, impi).await? {
            Some(stored) => serde_json::from_str::<Vec<String>>(&stored.data)
                .map_err(|e| StoreError::Backend(format!("corrupt nonce list: {}", e)))?,
            None => Vec::new(),
        };
        log::debug!("deleting {} challenge(s) for {}", nonces.len(), impi);
        for nonce in nonces {
            self.store
                .delete_data(CHALLENGE_TABLE, &Self::challenge_key(impi, &nonce))
                .await?;
        }
        self.store.delete_data(ASSOC_TABLE, impi).await
    }

    async fn associate_nonce(
        &self,
        impi: &str,
        nonce: &str,
    ) -> std::result::Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut nonces, cas) = match self.store.get_data(ASSOC_TABLE, impi).await? {
                Some(stored) => (
                    serde_json::from_str::<Vec<String>>(&stored.data).unwrap_or_default(),
                    stored.cas,
                ),
                None => (Vec::new(), 0),
            };
            if nonces.iter().any(|n| n == nonce) {
                return Ok(());
            }
            nonces.push(nonce.to_string());
            let data = serde_json::to_string(&nonces)
                .map_err(|e| StoreError::Backend(format!("nonce list encoding failed: {}", e)))?;
            match self
                .store
                .set_data(ASSOC_TABLE, impi, &data, cas, AV_EXPIRY)
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::DataContention) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::DataContention)
    }
}

/// Raises the branch correlation marker for a stored challenge, so the
/// challenge's log trail can be tied back to the original request.
pub fn correlate_branch(challenge: &AuthChallenge, trail: TrailId) {
    match challenge.branch.as_deref() {
        None => log::warn!(
            "stored authentication challenge is missing its branch field ({:#x})",
            trail
        ),
        Some("") => log::warn!(
            "stored authentication challenge has an empty branch field ({:#x})",
            trail
        ),
        Some(branch) => log::debug!("challenge branch correlator {} ({:#x})", branch, trail),
    }
}
