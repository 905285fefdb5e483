//! Home subscriber server seam.
//!
//! The concrete HSS client lives outside this crate; the timeout handlers
//! only need to push registration-state transitions through it.

use crate::{Result, TrailId};

/// Why a subscriber's registration state is being taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregistrationEvent {
    /// All bindings expired without a refresh.
    Timeout,
    /// Administrative removal.
    Admin,
    /// An authentication challenge went unanswered.
    AuthTimeout,
}

impl DeregistrationEvent {
    /// The wire form used by the HSS interface.
    pub fn as_str(self) -> &'static str {
        match self {
            DeregistrationEvent::Timeout => "dereg-timeout",
            DeregistrationEvent::Admin => "dereg-admin",
            DeregistrationEvent::AuthTimeout => "dereg-auth-timeout",
        }
    }
}

/// The registration-state operations the handlers require from the HSS.
#[async_trait::async_trait]
pub trait HssConnection: Send + Sync + 'static {
    /// Notifies the HSS that a public identity's registration state
    /// changed, optionally scoped to one private identity.
    async fn update_registration_state(
        &self,
        impu: &str,
        impi: Option<&str>,
        event: DeregistrationEvent,
        trail: TrailId,
    ) -> Result<()>;
}
