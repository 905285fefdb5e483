//! Sproutlet service traits.
//!
//! A [`Sproutlet`] is a registered service module; for each SIP transaction
//! routed to it the proxy asks it for a [`SproutletTsx`], the per-transaction
//! service logic. The transaction talks back to the proxy exclusively
//! through its [`SproutletHelper`], which the hosting wrapper implements.

use std::time::Duration;

use crate::message::{Request, Response, SipUri, StatusCode};
use crate::tsx::{ForkId, ForkSnapshot, TimerId};
use crate::{Result, TrailId};

/// A pluggable SIP service module hosted in the proxy.
pub trait Sproutlet: Send + Sync + 'static {
    /// The unique service name.
    fn service_name(&self) -> &str;

    /// The port this sproutlet listens on, or 0 for none. Requests arriving
    /// on this port are routed here when no Route or Request-URI matches.
    fn port(&self) -> u16 {
        0
    }

    /// An optional dedicated service host FQDN that routes to this
    /// sproutlet.
    fn service_host(&self) -> Option<&str> {
        None
    }

    /// Creates the per-transaction service logic for an incoming request.
    fn create_tsx(&self, alias: &str, req: &Request) -> Box<dyn SproutletTsx>;
}

/// Per-transaction service logic.
///
/// Callbacks run synchronously on the owning transaction's task and must
/// return promptly; later input arrives through further callbacks. Messages
/// are received by value and handed back through the helper's
/// `send_request`/`send_response`; dropping a message discards it.
///
/// An `Err` return is caught by the hosting wrapper, which answers the
/// transaction with a 500 and completes.
#[allow(unused_variables)]
pub trait SproutletTsx: Send + 'static {
    /// Called with a request that starts a dialog (or a standalone
    /// out-of-dialog request). The default forwards it unchanged.
    fn on_rx_initial_request(
        &mut self,
        helper: &mut dyn SproutletHelper,
        req: Request,
    ) -> Result<()> {
        helper.send_request(req)?;
        Ok(())
    }

    /// Called with a request received within an established dialog. The
    /// default forwards it unchanged.
    fn on_rx_in_dialog_request(
        &mut self,
        helper: &mut dyn SproutletHelper,
        req: Request,
    ) -> Result<()> {
        helper.send_request(req)?;
        Ok(())
    }

    /// Called with a response received on a fork. The default forwards it
    /// upstream for aggregation.
    fn on_rx_response(
        &mut self,
        helper: &mut dyn SproutletHelper,
        fork_id: ForkId,
        rsp: Response,
    ) -> Result<()> {
        helper.send_response(rsp);
        Ok(())
    }

    /// Called when the transaction is cancelled from upstream. Pending forks
    /// are cancelled by the wrapper after this returns.
    fn on_rx_cancel(
        &mut self,
        helper: &mut dyn SproutletHelper,
        status: StatusCode,
        cancel: Request,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a timer scheduled through the helper pops.
    fn on_timer_expiry(&mut self, helper: &mut dyn SproutletHelper, context: u64) -> Result<()> {
        Ok(())
    }
}

/// The capabilities a hosted [`SproutletTsx`] gets from its wrapper.
pub trait SproutletHelper {
    /// The immutable original inbound request.
    fn original_request(&self) -> &Request;

    /// The top Route header as it stood when the request entered this
    /// sproutlet, before it was consumed by routing.
    fn route_hdr(&self) -> Option<&SipUri>;

    /// Deep-copies a request; the caller owns the clone.
    fn clone_request(&self, req: &Request) -> Request;

    /// Builds a response bound to the given request's transaction.
    fn create_response(
        &self,
        req: &Request,
        status: StatusCode,
        reason: Option<&str>,
    ) -> Response;

    /// Queues a request for downstream transmission and allocates its fork.
    /// Fails with [`crate::Error::TsxComplete`] once the transaction has
    /// completed.
    fn send_request(&mut self, req: Request) -> Result<ForkId>;

    /// Queues a response for upstream aggregation. Responses queued after
    /// completion are absorbed.
    fn send_response(&mut self, rsp: Response);

    /// Marks a fork for cancellation; a no-op if it already terminated. The
    /// CANCEL itself goes out once the fork has seen a provisional.
    fn cancel_fork(&mut self, fork_id: ForkId, reason: Option<u16>);

    /// Marks every non-terminated fork for cancellation.
    fn cancel_pending_forks(&mut self, reason: Option<u16>);

    /// The current state of a fork.
    fn fork_state(&self, fork_id: ForkId) -> Option<ForkSnapshot>;

    /// Schedules a timer whose expiry is delivered to
    /// [`SproutletTsx::on_timer_expiry`] on the transaction's task.
    fn schedule_timer(&mut self, context: u64, duration: Duration) -> TimerId;

    /// Cancels a scheduled timer.
    fn cancel_timer(&mut self, id: TimerId);

    /// Returns `true` while a scheduled timer has neither popped nor been
    /// cancelled.
    fn timer_running(&self, id: TimerId) -> bool;

    /// Tests whether a URI routes back into this proxy.
    fn is_uri_reflexive(&self, uri: &SipUri) -> bool;

    /// Builds a URI that routes back into this sproutlet.
    fn get_reflexive_uri(&self) -> SipUri;

    /// The trail id correlating all log events of this transaction.
    fn trail(&self) -> TrailId;
}
