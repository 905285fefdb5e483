//! Client-leg strategy traits.
//!
//! External next-hops are reached through a [`UacTransaction`] created by
//! the proxy's [`UacFactory`]. The production factory belongs to the wire
//! stack glue: it resolves the next-hop (see [`crate::resolver`]) and drives
//! a real SIP client transaction, reporting progress back into the owning
//! UAS transaction through the event sender it was created with.

use tokio::sync::mpsc::UnboundedSender;

use crate::message::Request;
use crate::tsx::{TsxEvent, UacId};
use crate::{Result, TrailId};

/// One outbound client transaction.
pub trait UacTransaction: Send + 'static {
    /// Transmits the request. Must not block; responses, timeouts and
    /// transport errors are reported as [`TsxEvent`]s.
    fn send_request(&mut self, req: Request) -> Result<()>;

    /// Cancels the outstanding request, with an optional Reason cause code.
    fn cancel(&mut self, reason: Option<u16>) -> Result<()>;
}

/// Creates client transactions for external next-hops.
pub trait UacFactory: Send + Sync + 'static {
    fn create_uac(
        &self,
        id: UacId,
        events: UnboundedSender<TsxEvent>,
        trail: TrailId,
    ) -> Result<Box<dyn UacTransaction>>;
}
