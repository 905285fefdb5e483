//! Timer-service callback handlers.
//!
//! An external timer service drives subscriber state transitions by POSTing
//! back into this node: registration expiry, administrative deregistration
//! and authentication timeout. Each handler follows the same store
//! discipline: read-modify-write on the local store with bounded CAS
//! retries, then mirror to the remote store best-effort, then tell the HSS.
//!
//! The handlers are plain async values; [`http::HttpRouteTable`] wires them
//! to their paths (`/timers/<aor>`, `/registrations` and
//! `/authentication-timeout`).

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::hss::{DeregistrationEvent, HssConnection};
use crate::store::aor::epoch_now;
use crate::store::impi::correlate_branch;
use crate::store::{ImpiStore, StoreError, SubscriberDataManager, MAX_CAS_ATTEMPTS};
use crate::{Result, TrailId};

pub mod http;

pub const HTTP_OK: u16 = 200;
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_SERVER_ERROR: u16 = 500;
pub const HTTP_BAD_GATEWAY: u16 = 502;

/// Expires bindings and subscriptions when an AoR's registration timer
/// pops.
pub struct AorTimeoutHandler {
    sdm: Arc<SubscriberDataManager>,
    remote_sdm: Option<Arc<SubscriberDataManager>>,
    hss: Arc<dyn HssConnection>,
}

impl AorTimeoutHandler {
    pub fn new(
        sdm: Arc<SubscriberDataManager>,
        remote_sdm: Option<Arc<SubscriberDataManager>>,
        hss: Arc<dyn HssConnection>,
    ) -> AorTimeoutHandler {
        AorTimeoutHandler {
            sdm,
            remote_sdm,
            hss,
        }
    }

    pub async fn handle(&self, aor_id: &str, trail: TrailId) -> u16 {
        log::debug!("registration timer pop for {} ({:#x})", aor_id, trail);

        let all_expired = match self.expire_aor(&self.sdm, aor_id).await {
            Ok(all_expired) => all_expired,
            Err(e) => {
                log::error!("failed to update {}: {} ({:#x})", aor_id, e, trail);
                return HTTP_SERVER_ERROR;
            }
        };

        if let Some(remote) = &self.remote_sdm {
            if let Err(e) = self.expire_aor(remote, aor_id).await {
                log::warn!("remote update of {} failed: {} ({:#x})", aor_id, e, trail);
            }
        }

        if all_expired {
            log::debug!("all bindings for {} expired, deregistering", aor_id);
            let result = self
                .hss
                .update_registration_state(aor_id, None, DeregistrationEvent::Timeout, trail)
                .await;
            if let Err(e) = result {
                log::error!("HSS deregistration of {} failed: {} ({:#x})", aor_id, e, trail);
                return HTTP_BAD_GATEWAY;
            }
        }

        HTTP_OK
    }

    /// Drops expired bindings and subscriptions under CAS. Returns whether
    /// the expiry removed the last binding.
    async fn expire_aor(
        &self,
        sdm: &SubscriberDataManager,
        aor_id: &str,
    ) -> std::result::Result<bool, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some((mut aor, cas)) = sdm.get_aor_data(aor_id).await? else {
                log::debug!("no record of AoR {}", aor_id);
                return Ok(false);
            };

            let now = epoch_now();
            let before = aor.bindings.len();
            aor.bindings.retain(|_, b| b.expires > now);
            if aor.bindings.is_empty() {
                // Subscriptions cannot outlive the registration.
                aor.subscriptions.clear();
            } else {
                aor.subscriptions.retain(|_, s| s.expires > now);
            }
            let all_expired = before > 0 && aor.bindings.is_empty();
            log::debug!(
                "expired {} of {} binding(s) on {}",
                before - aor.bindings.len(),
                before,
                aor_id
            );

            match sdm.set_aor_data(aor_id, &aor, cas).await {
                Ok(()) => return Ok(all_expired),
                Err(StoreError::DataContention) => {
                    log::debug!("contention on {} (attempt {})", aor_id, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::DataContention)
    }
}

#[derive(Deserialize)]
struct RegistrationsBody {
    registrations: Vec<RegistrationEntry>,
}

#[derive(Deserialize)]
struct RegistrationEntry {
    #[serde(rename = "primary-impu")]
    primary_impu: String,
    #[serde(default)]
    impi: Option<String>,
}

/// The parsed deregistration request: `(AoR, private id)` pairs. A missing
/// private id removes every binding of the AoR.
pub(crate) fn parse_deregistration_body(body: &str) -> Result<Vec<(String, Option<String>)>> {
    let body: RegistrationsBody = serde_json::from_str(body)?;
    Ok(body
        .registrations
        .into_iter()
        .map(|r| (r.primary_impu, r.impi))
        .collect())
}

struct DeregOutcome {
    removed_any: bool,
    impis_to_delete: HashSet<String>,
}

/// Removes bindings administratively and cleans up the authentication
/// challenges of the private identities whose bindings went away.
pub struct DeregistrationHandler {
    sdm: Arc<SubscriberDataManager>,
    remote_sdm: Option<Arc<SubscriberDataManager>>,
    hss: Arc<dyn HssConnection>,
    impi_store: Arc<ImpiStore>,
}

impl DeregistrationHandler {
    pub fn new(
        sdm: Arc<SubscriberDataManager>,
        remote_sdm: Option<Arc<SubscriberDataManager>>,
        hss: Arc<dyn HssConnection>,
        impi_store: Arc<ImpiStore>,
    ) -> DeregistrationHandler {
        DeregistrationHandler {
            sdm,
            remote_sdm,
            hss,
            impi_store,
        }
    }

    pub async fn handle(&self, body: &str, send_notifications: bool, trail: TrailId) -> u16 {
        let pairs = match parse_deregistration_body(body) {
            Ok(pairs) => pairs,
            Err(e) => {
                log::warn!("malformed deregistration body: {} ({:#x})", e, trail);
                return HTTP_BAD_REQUEST;
            }
        };
        if !send_notifications {
            log::debug!("deregistering without notifications ({:#x})", trail);
        }

        for (aor_id, impi) in &pairs {
            let outcome = match self
                .deregister_bindings(&self.sdm, aor_id, impi.as_deref())
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("failed to deregister {}: {} ({:#x})", aor_id, e, trail);
                    return HTTP_SERVER_ERROR;
                }
            };

            if let Some(remote) = &self.remote_sdm {
                if let Err(e) = self
                    .deregister_bindings(remote, aor_id, impi.as_deref())
                    .await
                {
                    log::warn!("remote deregistration of {} failed: {} ({:#x})", aor_id, e, trail);
                }
            }

            for impi in &outcome.impis_to_delete {
                if let Err(e) = self.impi_store.delete_impi(impi).await {
                    log::warn!("challenge cleanup for {} failed: {} ({:#x})", impi, e, trail);
                }
            }

            if outcome.removed_any {
                let result = self
                    .hss
                    .update_registration_state(
                        aor_id,
                        impi.as_deref(),
                        DeregistrationEvent::Admin,
                        trail,
                    )
                    .await;
                if let Err(e) = result {
                    log::error!("HSS deregistration of {} failed: {} ({:#x})", aor_id, e, trail);
                    return HTTP_BAD_GATEWAY;
                }
            }
        }

        HTTP_OK
    }

    async fn deregister_bindings(
        &self,
        sdm: &SubscriberDataManager,
        aor_id: &str,
        impi: Option<&str>,
    ) -> std::result::Result<DeregOutcome, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some((mut aor, cas)) = sdm.get_aor_data(aor_id).await? else {
                log::debug!("no record of AoR {}", aor_id);
                return Ok(DeregOutcome {
                    removed_any: false,
                    impis_to_delete: HashSet::new(),
                });
            };

            let mut impis_to_delete = HashSet::new();
            let before = aor.bindings.len();
            aor.bindings.retain(|_, binding| {
                let matches = match impi {
                    Some(impi) => binding.private_id.as_deref() == Some(impi),
                    None => true,
                };
                if matches {
                    if let Some(private_id) = &binding.private_id {
                        impis_to_delete.insert(private_id.clone());
                    }
                }
                !matches
            });
            if aor.bindings.is_empty() {
                aor.subscriptions.clear();
            }
            let removed_any = before > aor.bindings.len();
            log::debug!(
                "removed {} of {} binding(s) on {}",
                before - aor.bindings.len(),
                before,
                aor_id
            );

            match sdm.set_aor_data(aor_id, &aor, cas).await {
                Ok(()) => {
                    return Ok(DeregOutcome {
                        removed_any,
                        impis_to_delete,
                    })
                }
                Err(StoreError::DataContention) => {
                    log::debug!("contention on {} (attempt {})", aor_id, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::DataContention)
    }
}

#[derive(Deserialize)]
struct AuthTimeoutBody {
    impu: String,
    impi: String,
    nonce: String,
}

/// Expires an unanswered authentication challenge and tells the HSS the
/// authentication attempt failed.
pub struct AuthTimeoutHandler {
    impi_store: Arc<ImpiStore>,
    hss: Arc<dyn HssConnection>,
}

impl AuthTimeoutHandler {
    pub fn new(impi_store: Arc<ImpiStore>, hss: Arc<dyn HssConnection>) -> AuthTimeoutHandler {
        AuthTimeoutHandler { impi_store, hss }
    }

    pub async fn handle(&self, body: &str, trail: TrailId) -> u16 {
        let body: AuthTimeoutBody = match serde_json::from_str(body) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("malformed auth-timeout body: {} ({:#x})", e, trail);
                return HTTP_BAD_REQUEST;
            }
        };
        log::debug!(
            "authentication timer pop for {} nonce {} ({:#x})",
            body.impi,
            body.nonce,
            trail
        );

        let (mut challenge, mut cas) =
            match self.impi_store.get_challenge(&body.impi, &body.nonce).await {
                Ok(Some(found)) => found,
                Ok(None) => {
                    // The challenge already aged out of the store; the pop
                    // is stale and there is nothing left to do.
                    return HTTP_OK;
                }
                Err(e) => {
                    log::error!("challenge lookup failed: {} ({:#x})", e, trail);
                    return HTTP_SERVER_ERROR;
                }
            };

        correlate_branch(&challenge, trail);

        if challenge.authenticated {
            log::debug!("challenge for {} was answered in time", body.impi);
            return HTTP_OK;
        }

        let result = self
            .hss
            .update_registration_state(
                &body.impu,
                Some(&body.impi),
                DeregistrationEvent::AuthTimeout,
                trail,
            )
            .await;
        if let Err(e) = result {
            log::error!("HSS auth-failure report failed: {} ({:#x})", e, trail);
            return HTTP_BAD_GATEWAY;
        }

        challenge.expired = true;
        for _ in 0..MAX_CAS_ATTEMPTS {
            match self
                .impi_store
                .set_challenge(&body.impi, &challenge, cas)
                .await
            {
                Ok(()) => return HTTP_OK,
                Err(StoreError::DataContention) => {
                    match self.impi_store.get_challenge(&body.impi, &body.nonce).await {
                        Ok(Some((fresh, fresh_cas))) => {
                            if fresh.authenticated {
                                return HTTP_OK;
                            }
                            challenge = fresh;
                            challenge.expired = true;
                            cas = fresh_cas;
                        }
                        Ok(None) => return HTTP_OK,
                        Err(e) => {
                            log::error!("challenge re-read failed: {} ({:#x})", e, trail);
                            return HTTP_SERVER_ERROR;
                        }
                    }
                }
                Err(e) => {
                    log::error!("challenge update failed: {} ({:#x})", e, trail);
                    return HTTP_SERVER_ERROR;
                }
            }
        }
        log::error!("challenge update kept conflicting ({:#x})", trail);
        HTTP_SERVER_ERROR
    }
}
