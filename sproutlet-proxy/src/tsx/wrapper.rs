//! Per-sproutlet execution context.
//!
//! A `SproutletWrapper` hosts one [`SproutletTsx`] within a UAS transaction:
//! it holds the service's view of the request, the queues of actions the
//! service emitted during a callback, the fork table and the best-response
//! aggregation state. The coordinator drives it through the `rx_*` entry
//! points; each returns the actions for the coordinator to route.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::message::{Request, Response, SipMethod, SipUri, StatusCode};
use crate::proxy::SproutletProxy;
use crate::service::{Sproutlet, SproutletHelper, SproutletTsx};
use crate::tsx::{ForkErrorEvent, ForkId, ForkSnapshot, ForkState, TimerId, TsxEvent, WrapperId};
use crate::{Error, Result, TrailId};

/// An action emitted by a wrapper for the coordinator to route.
#[derive(Debug)]
pub(crate) enum WrapperAction {
    /// Send a request downstream on the given fork.
    TxRequest { fork: ForkId, req: Request },
    /// Send a response to this wrapper's upstream.
    TxResponse { rsp: Response },
    /// Cancel the downstream leg of the given fork.
    TxCancel {
        fork: ForkId,
        cancel: Request,
        reason: Option<u16>,
    },
}

#[derive(Debug, Default)]
struct ForkStatus {
    state: ForkState,
    /// Copy of the outbound request, kept for CANCEL synthesis and for
    /// binding synthesized error responses.
    req: Option<Request>,
    /// Status of the last response seen on this fork.
    last_status: Option<StatusCode>,
    pending_cancel: bool,
    cancel_reason: Option<u16>,
}

pub(crate) struct SproutletWrapper {
    proxy: SproutletProxy,
    events: UnboundedSender<TsxEvent>,
    id: WrapperId,
    service_name: String,
    label: String,
    tsx: Option<Box<dyn SproutletTsx>>,
    /// Immutable copy of the request as received; a clone is dispatched to
    /// the sproutlet.
    original: Option<Request>,
    /// The Route header consumed when this sproutlet was selected.
    route: Option<SipUri>,
    send_requests: BTreeMap<ForkId, Request>,
    send_responses: VecDeque<Response>,
    pending_sends: usize,
    pending_responses: usize,
    forks: Vec<ForkStatus>,
    best_rsp: Option<Response>,
    complete: bool,
    failed: bool,
    pending_timers: HashSet<TimerId>,
    trail: TrailId,
}

impl SproutletWrapper {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        proxy: SproutletProxy,
        events: UnboundedSender<TsxEvent>,
        id: WrapperId,
        sproutlet: &dyn Sproutlet,
        alias: &str,
        route: Option<SipUri>,
        req: &Request,
        trail: TrailId,
    ) -> SproutletWrapper {
        let service_name = sproutlet.service_name().to_string();
        let label = format!("{}#{}", alias, id.0);
        let tsx = sproutlet.create_tsx(alias, req);

        SproutletWrapper {
            proxy,
            events,
            id,
            service_name,
            label,
            tsx: Some(tsx),
            original: None,
            route,
            send_requests: BTreeMap::new(),
            send_responses: VecDeque::new(),
            pending_sends: 0,
            pending_responses: 0,
            forks: Vec::new(),
            best_rsp: None,
            complete: false,
            failed: false,
            pending_timers: HashSet::new(),
            trail,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn has_pending_timers(&self) -> bool {
        !self.pending_timers.is_empty()
    }

    /// Delivers the request to the sproutlet and pumps the resulting
    /// actions. ACKs complete the wrapper once their actions are drained;
    /// nothing will ever be sent upstream for them.
    pub(crate) fn rx_request(&mut self, req: Request) -> Vec<WrapperAction> {
        log::debug!("[{}] <= {} ({:#x})", self.label, req.method, self.trail);

        self.original = Some(req.clone());
        if self.best_rsp.is_none() {
            self.best_rsp = Some(Response::for_request(
                &req,
                StatusCode::REQUEST_TIMEOUT,
                None,
            ));
        }

        let complete_after = req.method == SipMethod::Ack;
        let in_dialog = req.is_in_dialog();
        self.dispatch(move |tsx, helper| {
            if in_dialog {
                tsx.on_rx_in_dialog_request(helper, req)
            } else {
                tsx.on_rx_initial_request(helper, req)
            }
        });
        self.process_actions(complete_after)
    }

    /// Delivers a downstream response on a fork.
    pub(crate) fn rx_response(&mut self, fork_id: ForkId, rsp: Response) -> Vec<WrapperAction> {
        let Some(fork) = self.forks.get_mut(fork_id) else {
            log::warn!(
                "[{}] response {} for unknown fork {} dropped",
                self.label,
                rsp.status,
                fork_id
            );
            return Vec::new();
        };

        if fork.state == ForkState::Terminated {
            log::debug!(
                "[{}] response {} on terminated fork {} dropped",
                self.label,
                rsp.status,
                fork_id
            );
            return self.process_actions(false);
        }

        fork.last_status = Some(rsp.status);
        if rsp.status.is_provisional() {
            if fork.state == ForkState::Calling {
                fork.state = ForkState::Proceeding;
                log::trace!("[{}] fork {} -> Proceeding", self.label, fork_id);
            }
        } else {
            fork.state = ForkState::Terminated;
            fork.pending_cancel = false;
            log::trace!(
                "[{}] fork {} -> Terminated ({})",
                self.label,
                fork_id,
                rsp.status
            );
        }

        if self.complete {
            log::debug!(
                "[{}] response {} absorbed, transaction complete",
                self.label,
                rsp.status
            );
            return self.process_actions(false);
        }

        self.dispatch(move |tsx, helper| tsx.on_rx_response(helper, fork_id, rsp));
        self.process_actions(false)
    }

    /// Delivers a CANCEL from upstream, then marks every live fork for
    /// cancellation.
    pub(crate) fn rx_cancel(&mut self, cancel: Request, reason: Option<u16>) -> Vec<WrapperAction> {
        log::debug!("[{}] <= CANCEL ({:#x})", self.label, self.trail);
        let status = StatusCode::REQUEST_TERMINATED;
        self.dispatch(move |tsx, helper| tsx.on_rx_cancel(helper, status, cancel));
        self.cancel_all_forks(reason);
        self.process_actions(false)
    }

    /// Converts a client-leg failure into the equivalent response.
    pub(crate) fn rx_fork_error(
        &mut self,
        fork_id: ForkId,
        event: ForkErrorEvent,
    ) -> Vec<WrapperAction> {
        let status = match event {
            ForkErrorEvent::Timeout => StatusCode::REQUEST_TIMEOUT,
            ForkErrorEvent::TransportError => StatusCode::SERVICE_UNAVAILABLE,
        };
        log::debug!(
            "[{}] fork {} error {:?} -> {}",
            self.label,
            fork_id,
            event,
            status
        );

        let rsp = match self.forks.get(fork_id) {
            Some(fork) if fork.state != ForkState::Terminated => {
                match fork.req.as_ref().or(self.original.as_ref()) {
                    Some(req) => Response::for_request(req, status, None),
                    None => Response::new(status),
                }
            }
            _ => return Vec::new(),
        };
        self.rx_response(fork_id, rsp)
    }

    /// Delivers a timer pop. Pops racing a cancellation are discarded.
    pub(crate) fn on_timer_pop(&mut self, timer: TimerId, context: u64) -> Vec<WrapperAction> {
        if !self.pending_timers.remove(&timer) {
            return Vec::new();
        }
        log::trace!("[{}] timer {} popped", self.label, timer);
        self.dispatch(move |tsx, helper| tsx.on_timer_expiry(helper, context));
        self.process_actions(false)
    }

    /// The central action pump, run after every synchronous sproutlet entry.
    pub(crate) fn process_actions(&mut self, complete_after: bool) -> Vec<WrapperAction> {
        let mut actions = Vec::new();

        // Queued responses first, in order.
        while let Some(rsp) = self.send_responses.pop_front() {
            self.pending_responses -= 1;
            self.aggregate_response(rsp, &mut actions);
        }

        // Queued requests in fork-id order. An ACK fork terminates the
        // moment it is sent; nothing will ever come back on it.
        let sends = std::mem::take(&mut self.send_requests);
        for (fork_id, req) in sends {
            self.pending_sends -= 1;
            let fork = &mut self.forks[fork_id];
            fork.req = Some(req.clone());
            fork.state = if req.method == SipMethod::Ack {
                ForkState::Terminated
            } else {
                ForkState::Calling
            };
            log::trace!(
                "[{}] fork {} -> {:?} ({})",
                self.label,
                fork_id,
                fork.state,
                req.method
            );
            actions.push(WrapperAction::TxRequest { fork: fork_id, req });
        }

        // Deferred cancels: a CANCEL only goes out once the fork has seen a
        // provisional (RFC 3261 section 9.1).
        for (fork_id, fork) in self.forks.iter_mut().enumerate() {
            if fork.pending_cancel && fork.state == ForkState::Proceeding {
                if let Some(req) = &fork.req {
                    let cancel = req.create_cancel(fork.cancel_reason);
                    log::debug!("[{}] cancelling fork {}", self.label, fork_id);
                    actions.push(WrapperAction::TxCancel {
                        fork: fork_id,
                        cancel,
                        reason: fork.cancel_reason,
                    });
                    fork.pending_cancel = false;
                }
            }
        }

        if self.failed && !self.complete {
            let rsp = self.error_response();
            log::debug!(
                "[{}] completing with {} after sproutlet failure",
                self.label,
                rsp.status
            );
            self.complete = true;
            actions.push(WrapperAction::TxResponse { rsp });
        } else if !self.complete {
            let outstanding = self
                .forks
                .iter()
                .any(|f| matches!(f.state, ForkState::Calling | ForkState::Proceeding));
            if !outstanding && self.send_responses.is_empty() && self.pending_timers.is_empty() {
                if complete_after {
                    self.complete = true;
                } else if let Some(best) = self.best_rsp.take() {
                    log::debug!(
                        "[{}] forwarding best final response {}",
                        self.label,
                        best.status
                    );
                    self.complete = true;
                    actions.push(WrapperAction::TxResponse { rsp: best });
                }
            }
        }

        debug_assert_eq!(self.pending_sends, self.send_requests.len());
        debug_assert_eq!(self.pending_responses, self.send_responses.len());
        actions
    }

    /// RFC 3261 section 16.7 best-response selection, specialised for B2BUA
    /// usage: any 2xx wins immediately and cancels the other forks;
    /// provisionals (except 100) pass straight through.
    fn aggregate_response(&mut self, rsp: Response, actions: &mut Vec<WrapperAction>) {
        let status = rsp.status;

        if status.is_provisional() {
            if status != StatusCode::TRYING {
                actions.push(WrapperAction::TxResponse { rsp });
            }
            return;
        }

        if status.is_success() {
            log::debug!("[{}] forwarding {} and cancelling forks", self.label, status);
            self.complete = true;
            self.cancel_all_forks(None);
            actions.push(WrapperAction::TxResponse { rsp });
            return;
        }

        let current = self
            .best_rsp
            .as_ref()
            .map(|b| b.status)
            .unwrap_or(StatusCode::REQUEST_TIMEOUT);
        if status_priority(status) > status_priority(current) {
            log::trace!(
                "[{}] new best response {} (was {})",
                self.label,
                status,
                current
            );
            self.best_rsp = Some(rsp);
        }
    }

    fn cancel_all_forks(&mut self, reason: Option<u16>) {
        for fork in &mut self.forks {
            if fork.state != ForkState::Terminated {
                fork.pending_cancel = true;
                fork.cancel_reason = reason;
            }
        }
    }

    fn dispatch<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn SproutletTsx, &mut dyn SproutletHelper) -> Result<()>,
    {
        let Some(mut tsx) = self.tsx.take() else {
            log::error!("[{}] dispatch with no service logic", self.label);
            return;
        };
        let result = f(tsx.as_mut(), self);
        self.tsx = Some(tsx);

        if let Err(e) = result {
            log::error!("[{}] sproutlet failed: {}", self.label, e);
            self.failed = true;
            // Drop whatever the failing callback queued and take the forks
            // down; the pump answers upstream with a 500.
            self.send_requests.clear();
            self.send_responses.clear();
            self.pending_sends = 0;
            self.pending_responses = 0;
            self.cancel_all_forks(None);
        }
    }

    fn error_response(&self) -> Response {
        match &self.original {
            Some(req) => Response::for_request(req, StatusCode::SERVER_ERROR, None),
            None => Response::new(StatusCode::SERVER_ERROR),
        }
    }

    /// Forces completion, discarding queued work. Used by internal
    /// transaction termination.
    pub(crate) fn force_complete(&mut self) {
        if !self.complete {
            log::debug!("[{}] forced complete", self.label);
        }
        self.complete = true;
        self.send_requests.clear();
        self.send_responses.clear();
        self.pending_sends = 0;
        self.pending_responses = 0;
        for fork in &mut self.forks {
            fork.state = ForkState::Terminated;
            fork.pending_cancel = false;
        }
    }

    pub(crate) fn cancel_all_timers(&mut self) {
        for id in std::mem::take(&mut self.pending_timers) {
            self.proxy.cancel_timer(id);
        }
    }

    /// Teardown check: a destroyed wrapper must have drained its queues.
    pub(crate) fn on_destroy(&mut self) {
        if !self.send_requests.is_empty() || !self.send_responses.is_empty() {
            log::error!(
                "[{}] destroyed with queued messages ({} requests, {} responses)",
                self.label,
                self.send_requests.len(),
                self.send_responses.len()
            );
        }
        self.cancel_all_timers();
    }

    #[cfg(test)]
    pub(crate) fn counters(&self) -> (usize, usize) {
        (self.pending_sends, self.pending_responses)
    }

    #[cfg(test)]
    pub(crate) fn queue_lens(&self) -> (usize, usize) {
        (self.send_requests.len(), self.send_responses.len())
    }

    #[cfg(test)]
    pub(crate) fn fork_state_of(&self, fork_id: ForkId) -> Option<ForkState> {
        self.forks.get(fork_id).map(|f| f.state)
    }
}

impl SproutletHelper for SproutletWrapper {
    fn original_request(&self) -> &Request {
        self.original.as_ref().expect("no request received yet")
    }

    fn route_hdr(&self) -> Option<&SipUri> {
        self.route.as_ref()
    }

    fn clone_request(&self, req: &Request) -> Request {
        req.clone()
    }

    fn create_response(&self, req: &Request, status: StatusCode, reason: Option<&str>) -> Response {
        Response::for_request(req, status, reason)
    }

    fn send_request(&mut self, req: Request) -> Result<ForkId> {
        if self.complete {
            return Err(Error::TsxComplete);
        }
        if req.method == SipMethod::Cancel {
            return Err(Error::Fatal(
                "CANCEL must be sent through cancel_fork".into(),
            ));
        }
        let fork_id = self.forks.len();
        self.forks.push(ForkStatus::default());
        self.send_requests.insert(fork_id, req);
        self.pending_sends += 1;
        log::trace!("[{}] queued request on fork {}", self.label, fork_id);
        Ok(fork_id)
    }

    fn send_response(&mut self, rsp: Response) {
        if self.complete {
            log::warn!(
                "[{}] response {} discarded, transaction complete",
                self.label,
                rsp.status
            );
            return;
        }
        self.send_responses.push_back(rsp);
        self.pending_responses += 1;
    }

    fn cancel_fork(&mut self, fork_id: ForkId, reason: Option<u16>) {
        if let Some(fork) = self.forks.get_mut(fork_id) {
            if fork.state != ForkState::Terminated {
                fork.pending_cancel = true;
                fork.cancel_reason = reason;
            }
        }
    }

    fn cancel_pending_forks(&mut self, reason: Option<u16>) {
        self.cancel_all_forks(reason);
    }

    fn fork_state(&self, fork_id: ForkId) -> Option<ForkSnapshot> {
        self.forks.get(fork_id).map(|f| ForkSnapshot {
            state: f.state,
            last_status: f.last_status,
            pending_cancel: f.pending_cancel,
        })
    }

    fn schedule_timer(&mut self, context: u64, duration: Duration) -> TimerId {
        let id = self
            .proxy
            .schedule_timer(self.events.clone(), self.id, context, duration);
        self.pending_timers.insert(id);
        id
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if self.pending_timers.remove(&id) {
            self.proxy.cancel_timer(id);
        }
    }

    fn timer_running(&self, id: TimerId) -> bool {
        self.pending_timers.contains(&id) && self.proxy.timer_running(id)
    }

    fn is_uri_reflexive(&self, uri: &SipUri) -> bool {
        self.proxy.is_uri_reflexive(uri)
    }

    fn get_reflexive_uri(&self) -> SipUri {
        self.proxy.create_sproutlet_uri(&self.service_name)
    }

    fn trail(&self) -> TrailId {
        self.trail
    }
}

/// Priority of a non-2xx final response for best-response selection. Higher
/// wins; ties keep the first received. 408 sits below everything real so a
/// genuine failure always displaces the synthesized timeout.
fn status_priority(status: StatusCode) -> u8 {
    match status.into_u16() {
        408 => 0,
        600..=699 => 6,
        401 | 407 | 415 | 420 | 484 => 5,
        400..=499 => 4,
        500..=599 => 3,
        300..=399 => 2,
        _ => 1,
    }
}
