//! UAS transaction coordination.
//!
//! One [`UasTsx`] exists per physical SIP server transaction. It owns the
//! sproutlet wrappers spawned within the transaction (an arena indexed by
//! [`WrapperId`]), the fork topology between them and the real client legs,
//! and the pending-request FIFO. All processing for a transaction runs on
//! the single task that owns the `UasTsx`; timers and client legs cross back
//! in through its event channel.
//!
//! The externally-received and internally-synthesized variants differ only
//! in their [`Upstream`] adaptor (wire vs absorbing) and, for internal
//! transactions, the [`TerminatePolicy`] applied by `terminate()`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::message::{Request, Response, SipMethod, StatusCode};
use crate::proxy::SproutletProxy;
use crate::service::Sproutlet;
use crate::{Error, Result, TrailId};

pub mod uac;
pub(crate) mod wrapper;

pub use uac::{UacFactory, UacTransaction};

use wrapper::{SproutletWrapper, WrapperAction};

/// Index of a fork within one sproutlet's fork table.
pub type ForkId = usize;

/// Identifier of a timer scheduled through the proxy.
pub type TimerId = u64;

/// Index of a wrapper within its transaction's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrapperId(pub(crate) usize);

/// Identifier of a client leg within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UacId(pub(crate) u64);

/// Either kind of downstream leg, as keyed in the inverse map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DownstreamId {
    Sproutlet(WrapperId),
    Uac(UacId),
}

/// State of one fork. Transitions are forward-only:
/// Null -> Calling -> Proceeding -> Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkState {
    #[default]
    Null,
    Calling,
    Proceeding,
    Terminated,
}

/// Snapshot of a fork's state returned to sproutlets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkSnapshot {
    pub state: ForkState,
    /// The status of the last response received on this fork.
    pub last_status: Option<StatusCode>,
    pub pending_cancel: bool,
}

/// Why a client leg gave up without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkErrorEvent {
    Timeout,
    TransportError,
}

/// What `terminate()` does to in-flight forks of an internal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminatePolicy {
    /// Drop them silently.
    #[default]
    DropForks,
    /// CANCEL the client legs first.
    CancelForks,
}

/// Events crossing into a transaction's task.
#[derive(Debug)]
pub enum TsxEvent {
    /// A response arrived on a client leg.
    UacResponse { uac: UacId, rsp: Response },
    /// A client leg gave up.
    UacNotResponding { uac: UacId, event: ForkErrorEvent },
    /// A timer scheduled by a wrapper popped.
    TimerPop {
        wrapper: WrapperId,
        timer: TimerId,
        context: u64,
    },
    /// A CANCEL arrived for the transaction.
    Cancel {
        cancel: Request,
        reason: Option<u16>,
    },
    /// Force completion of an internal transaction.
    Terminate,
}

/// Where the root wrapper's responses go.
pub trait Upstream: Send + 'static {
    fn send_response(&mut self, rsp: Response, trail: TrailId);

    fn is_internal(&self) -> bool {
        false
    }
}

/// The absorbing upstream of an internally-synthesized transaction.
#[derive(Default)]
pub(crate) struct InternalUpstream {
    final_seen: bool,
}

impl Upstream for InternalUpstream {
    fn send_response(&mut self, rsp: Response, trail: TrailId) {
        if rsp.status.is_final() && !self.final_seen {
            self.final_seen = true;
            log::debug!(
                "internal transaction concluded with {} {} ({:#x})",
                rsp.status,
                rsp.reason,
                trail
            );
        } else {
            log::debug!(
                "internal transaction response {} {} absorbed ({:#x})",
                rsp.status,
                rsp.reason,
                trail
            );
        }
    }

    fn is_internal(&self) -> bool {
        true
    }
}

struct PendingRequest {
    req: Request,
    upstream: (WrapperId, ForkId),
}

/// Handle for feeding events into a running transaction.
#[derive(Clone, Debug)]
pub struct UasTsxHandle {
    events: mpsc::UnboundedSender<TsxEvent>,
}

impl UasTsxHandle {
    /// Delivers a CANCEL received for the transaction's request.
    pub fn cancel(&self, cancel: Request, reason: Option<u16>) -> Result<()> {
        self.events
            .send(TsxEvent::Cancel { cancel, reason })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Forces completion of an internal transaction.
    pub fn terminate(&self) -> Result<()> {
        self.events
            .send(TsxEvent::Terminate)
            .map_err(|_| Error::ChannelClosed)
    }
}

/// One UAS transaction: the coordinator for every sproutlet and client leg
/// spawned from a single received (or synthesized) request.
pub struct UasTsx {
    proxy: SproutletProxy,
    trail: TrailId,
    wrappers: Vec<SproutletWrapper>,
    root: Option<WrapperId>,
    /// Upstream sproutlet/fork to downstream sproutlet.
    dmap_sproutlet: HashMap<(WrapperId, ForkId), WrapperId>,
    /// Upstream sproutlet/fork to downstream client leg.
    dmap_uac: HashMap<(WrapperId, ForkId), UacId>,
    /// Downstream leg back to its upstream sproutlet/fork.
    umap: HashMap<DownstreamId, (WrapperId, ForkId)>,
    uacs: HashMap<UacId, Box<dyn UacTransaction>>,
    pending: VecDeque<PendingRequest>,
    upstream: Box<dyn Upstream>,
    uac_factory: Arc<dyn UacFactory>,
    events_tx: mpsc::UnboundedSender<TsxEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TsxEvent>>,
    initial_req: Option<Request>,
    next_uac: u64,
    terminate_policy: TerminatePolicy,
    user_terminated: bool,
    destroyed: bool,
}

impl UasTsx {
    pub(crate) fn new(
        proxy: SproutletProxy,
        upstream: Box<dyn Upstream>,
        uac_factory: Arc<dyn UacFactory>,
        trail: TrailId,
        terminate_policy: TerminatePolicy,
    ) -> UasTsx {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        UasTsx {
            proxy,
            trail,
            wrappers: Vec::new(),
            root: None,
            dmap_sproutlet: HashMap::new(),
            dmap_uac: HashMap::new(),
            umap: HashMap::new(),
            uacs: HashMap::new(),
            pending: VecDeque::new(),
            upstream,
            uac_factory,
            events_tx,
            events_rx: Some(events_rx),
            initial_req: None,
            next_uac: 0,
            terminate_policy,
            user_terminated: false,
            destroyed: false,
        }
    }

    /// Dispatches an externally-received request into the transaction. If no
    /// sproutlet matches, the request is handed back for stateless
    /// forwarding by the wire stack.
    pub(crate) fn process_initial_request(
        &mut self,
        mut req: Request,
        port: u16,
    ) -> std::result::Result<(), Request> {
        let Some(target) = self.proxy.target_sproutlet(&mut req, port) else {
            return Err(req);
        };

        if req.method == SipMethod::Invite {
            let trying = Response::for_request(&req, StatusCode::TRYING, None);
            self.upstream.send_response(trying, self.trail);
        }

        self.initial_req = Some(req.clone());
        let root = self.add_wrapper(
            target.sproutlet.as_ref(),
            &target.alias,
            target.popped_route,
            &req,
        );
        self.root = Some(root);
        self.deliver_request(root, req);
        self.schedule_requests();
        self.verify_topology();
        self.check_destroy();
        Ok(())
    }

    /// Dispatches an internally-synthesized request to a named sproutlet.
    pub(crate) fn process_internal_request(
        &mut self,
        sproutlet: &Arc<dyn Sproutlet>,
        alias: &str,
        req: Request,
    ) {
        self.initial_req = Some(req.clone());
        let root = self.add_wrapper(sproutlet.as_ref(), alias, None, &req);
        self.root = Some(root);
        self.deliver_request(root, req);
        self.schedule_requests();
        self.verify_topology();
        self.check_destroy();
    }

    /// Handle for feeding events into this transaction.
    pub fn handle(&self) -> UasTsxHandle {
        UasTsxHandle {
            events: self.events_tx.clone(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Runs the transaction until it destroys itself.
    pub async fn run(mut self) {
        let mut rx = self.events_rx.take().expect("transaction already running");
        while !self.destroyed {
            match rx.recv().await {
                Some(ev) => self.handle_event(ev),
                None => break,
            }
        }
    }

    /// Processes one event, then drains the pending-request FIFO and checks
    /// whether the transaction can be torn down.
    pub(crate) fn handle_event(&mut self, ev: TsxEvent) {
        if self.destroyed {
            return;
        }
        match ev {
            TsxEvent::UacResponse { uac, rsp } => self.handle_client_response(uac, rsp),
            TsxEvent::UacNotResponding { uac, event } => {
                self.handle_client_not_responding(uac, event)
            }
            TsxEvent::TimerPop {
                wrapper,
                timer,
                context,
            } => self.process_timer_pop(wrapper, timer, context),
            TsxEvent::Cancel { cancel, reason } => self.process_cancel(cancel, reason),
            TsxEvent::Terminate => self.terminate(),
        }
        self.schedule_requests();
        self.verify_topology();
        self.check_destroy();
    }

    #[cfg(test)]
    pub(crate) fn pump_events(&mut self) {
        let mut rx = self.events_rx.take().expect("transaction already running");
        while let Ok(ev) = rx.try_recv() {
            self.handle_event(ev);
        }
        self.events_rx = Some(rx);
    }

    fn add_wrapper(
        &mut self,
        sproutlet: &dyn Sproutlet,
        alias: &str,
        route: Option<crate::message::SipUri>,
        req: &Request,
    ) -> WrapperId {
        let id = WrapperId(self.wrappers.len());
        let wrapper = SproutletWrapper::new(
            self.proxy.clone(),
            self.events_tx.clone(),
            id,
            sproutlet,
            alias,
            route,
            req,
            self.trail,
        );
        log::debug!("created wrapper [{}] ({:#x})", wrapper.label(), self.trail);
        self.wrappers.push(wrapper);
        id
    }

    fn deliver_request(&mut self, id: WrapperId, req: Request) {
        let Some(wrapper) = self.wrappers.get_mut(id.0) else {
            log::error!("request for unknown wrapper {:?}", id);
            return;
        };
        let actions = wrapper.rx_request(req);
        self.process_wrapper_actions(id, actions);
    }

    fn process_wrapper_actions(&mut self, from: WrapperId, actions: Vec<WrapperAction>) {
        for action in actions {
            match action {
                WrapperAction::TxRequest { fork, req } => self.pending.push_back(PendingRequest {
                    req,
                    upstream: (from, fork),
                }),
                WrapperAction::TxResponse { rsp } => self.route_response_upstream(from, rsp),
                WrapperAction::TxCancel {
                    fork,
                    cancel,
                    reason,
                } => self.tx_cancel(from, fork, cancel, reason),
            }
        }
    }

    /// Drains the pending-request FIFO, dispatching each request to a local
    /// sproutlet or a new client leg. Dispatching may enqueue further
    /// requests; those are processed in strict FIFO order.
    fn schedule_requests(&mut self) {
        while let Some(PendingRequest { mut req, upstream }) = self.pending.pop_front() {
            // No response ever returns for an ACK, so its downstream is
            // never linked into the fork topology.
            let linked = req.method != SipMethod::Ack;
            match self.proxy.target_sproutlet(&mut req, 0) {
                Some(target) => {
                    let id = self.add_wrapper(
                        target.sproutlet.as_ref(),
                        &target.alias,
                        target.popped_route,
                        &req,
                    );
                    if linked {
                        self.dmap_sproutlet.insert(upstream, id);
                        self.umap.insert(DownstreamId::Sproutlet(id), upstream);
                    }
                    self.deliver_request(id, req);
                }
                None => self.dispatch_to_uac(upstream, req, linked),
            }
        }
    }

    fn dispatch_to_uac(&mut self, upstream: (WrapperId, ForkId), req: Request, linked: bool) {
        let uac_id = UacId(self.next_uac);
        self.next_uac += 1;

        match self
            .uac_factory
            .create_uac(uac_id, self.events_tx.clone(), self.trail)
        {
            Ok(mut uac) => match uac.send_request(req) {
                Ok(()) if linked => {
                    self.dmap_uac.insert(upstream, uac_id);
                    self.umap.insert(DownstreamId::Uac(uac_id), upstream);
                    self.uacs.insert(uac_id, uac);
                }
                Ok(()) => {}
                Err(e) if linked => {
                    log::warn!("client leg send failed: {} ({:#x})", e, self.trail);
                    self.deliver_fork_error(upstream.0, upstream.1, ForkErrorEvent::TransportError);
                }
                Err(e) => log::warn!("ACK send failed: {} ({:#x})", e, self.trail),
            },
            Err(e) if linked => {
                log::warn!("client leg creation failed: {} ({:#x})", e, self.trail);
                self.deliver_fork_error(upstream.0, upstream.1, ForkErrorEvent::TransportError);
            }
            Err(e) => log::warn!("ACK leg creation failed: {} ({:#x})", e, self.trail),
        }
    }

    fn handle_client_response(&mut self, uac: UacId, rsp: Response) {
        let Some(&(up, fork)) = self.umap.get(&DownstreamId::Uac(uac)) else {
            log::debug!(
                "response {} from released client leg absorbed ({:#x})",
                rsp.status,
                self.trail
            );
            return;
        };

        if rsp.status.is_final() {
            self.umap.remove(&DownstreamId::Uac(uac));
            self.dmap_uac.remove(&(up, fork));
            self.uacs.remove(&uac);
        }

        let Some(wrapper) = self.wrappers.get_mut(up.0) else {
            return;
        };
        let actions = wrapper.rx_response(fork, rsp);
        self.process_wrapper_actions(up, actions);
    }

    fn handle_client_not_responding(&mut self, uac: UacId, event: ForkErrorEvent) {
        let Some(&(up, fork)) = self.umap.get(&DownstreamId::Uac(uac)) else {
            return;
        };
        self.umap.remove(&DownstreamId::Uac(uac));
        self.dmap_uac.remove(&(up, fork));
        self.uacs.remove(&uac);
        self.deliver_fork_error(up, fork, event);
    }

    fn deliver_fork_error(&mut self, id: WrapperId, fork: ForkId, event: ForkErrorEvent) {
        let Some(wrapper) = self.wrappers.get_mut(id.0) else {
            return;
        };
        let actions = wrapper.rx_fork_error(fork, event);
        self.process_wrapper_actions(id, actions);
    }

    fn process_timer_pop(&mut self, id: WrapperId, timer: TimerId, context: u64) {
        let Some(wrapper) = self.wrappers.get_mut(id.0) else {
            return;
        };
        let actions = wrapper.on_timer_pop(timer, context);
        self.process_wrapper_actions(id, actions);
    }

    fn process_cancel(&mut self, cancel: Request, reason: Option<u16>) {
        let Some(root) = self.root else {
            return;
        };
        let Some(wrapper) = self.wrappers.get_mut(root.0) else {
            return;
        };
        let actions = wrapper.rx_cancel(cancel, reason);
        self.process_wrapper_actions(root, actions);
    }

    /// Routes a response emitted by a wrapper to its upstream: the wire (or
    /// internal absorber) for the root, the parent wrapper otherwise. Final
    /// responses clear the fork's topology entries.
    fn route_response_upstream(&mut self, from: WrapperId, rsp: Response) {
        if Some(from) == self.root {
            log::debug!(
                "=> response {} {} upstream ({:#x})",
                rsp.status,
                rsp.reason,
                self.trail
            );
            self.upstream.send_response(rsp, self.trail);
            return;
        }

        let Some(&(up, fork)) = self.umap.get(&DownstreamId::Sproutlet(from)) else {
            log::debug!(
                "response {} from unlinked wrapper absorbed ({:#x})",
                rsp.status,
                self.trail
            );
            return;
        };

        if rsp.status.is_final() {
            self.umap.remove(&DownstreamId::Sproutlet(from));
            self.dmap_sproutlet.remove(&(up, fork));
        }

        let Some(wrapper) = self.wrappers.get_mut(up.0) else {
            return;
        };
        let actions = wrapper.rx_response(fork, rsp);
        self.process_wrapper_actions(up, actions);
    }

    /// Routes a CANCEL to the existing downstream of a fork.
    fn tx_cancel(&mut self, from: WrapperId, fork: ForkId, cancel: Request, reason: Option<u16>) {
        if let Some(&down) = self.dmap_sproutlet.get(&(from, fork)) {
            let Some(wrapper) = self.wrappers.get_mut(down.0) else {
                return;
            };
            let actions = wrapper.rx_cancel(cancel, reason);
            self.process_wrapper_actions(down, actions);
        } else if let Some(&uac_id) = self.dmap_uac.get(&(from, fork)) {
            if let Some(uac) = self.uacs.get_mut(&uac_id) {
                if let Err(e) = uac.cancel(reason) {
                    log::warn!("client leg cancel failed: {} ({:#x})", e, self.trail);
                }
            }
        } else {
            log::debug!(
                "CANCEL for fork {} with no downstream dropped ({:#x})",
                fork,
                self.trail
            );
        }
    }

    /// Forces completion of an internal transaction. In-flight client legs
    /// are dropped or cancelled according to the terminate policy.
    fn terminate(&mut self) {
        log::debug!("terminating transaction ({:#x})", self.trail);
        self.user_terminated = true;

        if self.terminate_policy == TerminatePolicy::CancelForks {
            let legs: Vec<UacId> = self.dmap_uac.values().copied().collect();
            for uac_id in legs {
                if let Some(uac) = self.uacs.get_mut(&uac_id) {
                    let _ = uac.cancel(None);
                }
            }
        }

        self.pending.clear();
        self.dmap_sproutlet.clear();
        self.dmap_uac.clear();
        self.umap.clear();
        self.uacs.clear();
        for wrapper in &mut self.wrappers {
            wrapper.cancel_all_timers();
            wrapper.force_complete();
        }
    }

    /// A transaction is destroyable once every wrapper is complete, both
    /// downstream maps are empty, nothing is pending and no timers are
    /// outstanding.
    fn can_destroy(&self) -> bool {
        self.pending.is_empty()
            && self.dmap_sproutlet.is_empty()
            && self.dmap_uac.is_empty()
            && self
                .wrappers
                .iter()
                .all(|w| w.is_complete() && !w.has_pending_timers())
    }

    fn check_destroy(&mut self) {
        if !self.destroyed && self.can_destroy() {
            for wrapper in &mut self.wrappers {
                wrapper.on_destroy();
            }
            log::trace!(
                "transaction destroyed{} ({:#x})",
                if self.user_terminated {
                    ", user terminated"
                } else {
                    ""
                },
                self.trail
            );
            self.destroyed = true;
        }
    }

    /// Corrupted fork topology is not recoverable: answer 500 and abort the
    /// transaction.
    fn verify_topology(&mut self) {
        if self.destroyed || self.topology_consistent() {
            return;
        }
        log::error!("fork topology corrupted, aborting ({:#x})", self.trail);
        if let Some(req) = &self.initial_req {
            let rsp = Response::for_request(req, StatusCode::SERVER_ERROR, None);
            self.upstream.send_response(rsp, self.trail);
        }
        self.pending.clear();
        self.dmap_sproutlet.clear();
        self.dmap_uac.clear();
        self.umap.clear();
        self.uacs.clear();
        for wrapper in &mut self.wrappers {
            wrapper.cancel_all_timers();
            wrapper.force_complete();
        }
        self.check_destroy();
    }

    fn topology_consistent(&self) -> bool {
        self.umap.len() == self.dmap_sproutlet.len() + self.dmap_uac.len()
            && self.dmap_sproutlet.iter().all(|(&link, &down)| {
                self.umap.get(&DownstreamId::Sproutlet(down)) == Some(&link)
            })
            && self
                .dmap_uac
                .iter()
                .all(|(&link, &uac)| self.umap.get(&DownstreamId::Uac(uac)) == Some(&link))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::uac::mock::MockUacFactory;
    use super::*;
    use crate::message::SipUri;
    use crate::proxy::Builder;
    use crate::service::{SproutletHelper, SproutletTsx};

    const ROOT: &str = "proxy1.homedomain";

    #[derive(Clone, Default)]
    struct MockUpstream {
        responses: Arc<Mutex<Vec<Response>>>,
    }

    impl MockUpstream {
        fn statuses(&self) -> Vec<u16> {
            self.responses
                .lock()
                .expect("Lock failed")
                .iter()
                .map(|r| r.status.into_u16())
                .collect()
        }
    }

    impl Upstream for MockUpstream {
        fn send_response(&mut self, rsp: Response, _trail: TrailId) {
            self.responses.lock().expect("Lock failed").push(rsp);
        }
    }

    // A sproutlet whose transactions just use the default pass-through
    // callbacks.
    struct Forwarder {
        name: String,
    }

    struct ForwarderTsx;
    impl SproutletTsx for ForwarderTsx {}

    impl Sproutlet for Forwarder {
        fn service_name(&self) -> &str {
            &self.name
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(ForwarderTsx)
        }
    }

    // Responds with a fixed status and never forwards.
    struct Reject {
        status: u16,
    }

    struct RejectTsx {
        status: u16,
    }

    impl SproutletTsx for RejectTsx {
        fn on_rx_initial_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            req: Request,
        ) -> crate::Result<()> {
            let rsp = helper.create_response(&req, StatusCode(self.status), None);
            helper.send_response(rsp);
            Ok(())
        }
    }

    impl Sproutlet for Reject {
        fn service_name(&self) -> &str {
            "reject"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(RejectTsx {
                status: self.status,
            })
        }
    }

    // Forks the request to two external targets.
    struct Forker;

    struct ForkerTsx;
    impl SproutletTsx for ForkerTsx {
        fn on_rx_initial_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            req: Request,
        ) -> crate::Result<()> {
            let mut second = helper.clone_request(&req);
            second.uri = "sip:bob@target2.example.net".parse().unwrap();
            helper.send_request(req)?;
            helper.send_request(second)?;
            Ok(())
        }
    }

    impl Sproutlet for Forker {
        fn service_name(&self) -> &str {
            "forker"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(ForkerTsx)
        }
    }

    // Routes the request through another sproutlet before it leaves.
    struct Chainer;

    struct ChainerTsx;
    impl SproutletTsx for ChainerTsx {
        fn on_rx_initial_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            mut req: Request,
        ) -> crate::Result<()> {
            let next: SipUri = format!("sip:fwd@{};lr", ROOT).parse().unwrap();
            assert!(helper.is_uri_reflexive(&next));
            req.headers.push_route_front(&next);
            helper.send_request(req)?;
            Ok(())
        }
    }

    impl Sproutlet for Chainer {
        fn service_name(&self) -> &str {
            "chain"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(ChainerTsx)
        }
    }

    // Fails its request callback outright.
    struct Faulty;

    struct FaultyTsx;
    impl SproutletTsx for FaultyTsx {
        fn on_rx_initial_request(
            &mut self,
            _helper: &mut dyn SproutletHelper,
            _req: Request,
        ) -> crate::Result<()> {
            Err(Error::Parse("unusable request".into()))
        }
    }

    impl Sproutlet for Faulty {
        fn service_name(&self) -> &str {
            "faulty"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(FaultyTsx)
        }
    }

    // Answers 200 when its timer pops.
    struct Deferred;

    struct DeferredTsx;
    impl SproutletTsx for DeferredTsx {
        fn on_rx_initial_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            _req: Request,
        ) -> crate::Result<()> {
            let id = helper.schedule_timer(7, std::time::Duration::from_millis(20));
            assert!(helper.timer_running(id));
            Ok(())
        }

        fn on_timer_expiry(
            &mut self,
            helper: &mut dyn SproutletHelper,
            context: u64,
        ) -> crate::Result<()> {
            assert_eq!(context, 7);
            let req = helper.original_request().clone();
            let rsp = helper.create_response(&req, StatusCode::OK, None);
            helper.send_response(rsp);
            Ok(())
        }
    }

    impl Sproutlet for Deferred {
        fn service_name(&self) -> &str {
            "deferred"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(DeferredTsx)
        }
    }

    // Schedules a timer and immediately cancels it again.
    struct TimerCanceller;

    struct TimerCancellerTsx;
    impl SproutletTsx for TimerCancellerTsx {
        fn on_rx_initial_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            _req: Request,
        ) -> crate::Result<()> {
            let id = helper.schedule_timer(1, std::time::Duration::from_secs(60));
            helper.cancel_timer(id);
            assert!(!helper.timer_running(id));
            Ok(())
        }
    }

    impl Sproutlet for TimerCanceller {
        fn service_name(&self) -> &str {
            "cancelling"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(TimerCancellerTsx)
        }
    }

    fn proxy_with(sproutlets: Vec<Arc<dyn Sproutlet>>) -> SproutletProxy {
        let mut builder = Builder::new().with_root_uri(&format!("sip:{}", ROOT));
        for s in sproutlets {
            builder = builder.with_sproutlet_arc(s);
        }
        builder.build().expect("proxy build failed")
    }

    fn invite_via(service: &str) -> Request {
        let mut req = Request::new(
            SipMethod::Invite,
            "sip:bob@target.example.net".parse().unwrap(),
        );
        req.headers
            .push("Via", "SIP/2.0/UDP 10.83.18.38:36530;branch=z9hG4bKPjmo1aim");
        req.headers.push("From", "<sip:alice@homedomain>;tag=8c8b232a");
        req.headers.push("To", "<sip:bob@homedomain>");
        req.headers.push("Call-ID", "0gQAAC8WAAACBAAALxYAAAL8P3U");
        req.headers.push("CSeq", "16567 INVITE");
        req.headers
            .push("Route", &format!("<sip:{}@{};lr>", service, ROOT));
        req
    }

    fn ext_tsx(
        proxy: &SproutletProxy,
        factory: &MockUacFactory,
        upstream: &MockUpstream,
    ) -> UasTsx {
        UasTsx::new(
            proxy.clone(),
            Box::new(upstream.clone()),
            Arc::new(factory.clone()),
            0x7e57,
            TerminatePolicy::DropForks,
        )
    }

    #[test_log::test(tokio::test)]
    async fn forwards_and_relays_responses() {
        let proxy = proxy_with(vec![Arc::new(Forwarder {
            name: "fwd".into(),
        })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("fwd"), 0).unwrap();

        // 100 Trying goes upstream immediately; one client leg exists and
        // the matched Route has been consumed.
        assert_eq!(upstream.statuses(), vec![100]);
        assert_eq!(factory.leg_count(), 1);
        let sent = factory.requests(0);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].headers.top_route().is_none());

        let leg = factory.leg_id(0);

        // A downstream 100 reaches the sproutlet (which forwards it by
        // default) but is absorbed by aggregation; only the fork state
        // advances.
        let rsp100 = Response::for_request(&sent[0], StatusCode::TRYING, None);
        tsx.handle_event(TsxEvent::UacResponse {
            uac: leg,
            rsp: rsp100,
        });
        assert_eq!(upstream.statuses(), vec![100]);
        let root = tsx.root.unwrap();
        assert_eq!(
            tsx.wrappers[root.0].fork_state_of(0),
            Some(ForkState::Proceeding)
        );

        let rsp180 = Response::for_request(&sent[0], StatusCode::RINGING, None);
        tsx.handle_event(TsxEvent::UacResponse {
            uac: leg,
            rsp: rsp180,
        });
        assert_eq!(upstream.statuses(), vec![100, 180]);
        assert!(!tsx.is_destroyed());

        let rsp200 = Response::for_request(&sent[0], StatusCode::OK, None);
        tsx.handle_event(TsxEvent::UacResponse {
            uac: leg,
            rsp: rsp200,
        });
        assert_eq!(upstream.statuses(), vec![100, 180, 200]);

        // Teardown: both downstream maps drained.
        assert!(tsx.is_destroyed());
        assert!(tsx.dmap_sproutlet.is_empty());
        assert!(tsx.dmap_uac.is_empty());
        assert!(tsx.umap.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn chains_sproutlets_before_leaving() {
        let proxy = proxy_with(vec![
            Arc::new(Chainer),
            Arc::new(Forwarder { name: "fwd".into() }),
        ]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("chain"), 0).unwrap();

        // chain -> fwd -> client leg.
        assert_eq!(tsx.wrappers.len(), 2);
        assert_eq!(factory.leg_count(), 1);

        let sent = factory.requests(0);
        let rsp = Response::for_request(&sent[0], StatusCode::OK, None);
        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp,
        });

        // Exactly one final response reaches the wire, through both
        // wrappers.
        assert_eq!(upstream.statuses(), vec![100, 200]);
        assert!(tsx.is_destroyed());
        assert!(tsx.umap.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn local_rejection_needs_no_leg() {
        let proxy = proxy_with(vec![Arc::new(Reject { status: 404 })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("reject"), 0).unwrap();

        assert_eq!(upstream.statuses(), vec![100, 404]);
        assert_eq!(factory.leg_count(), 0);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test)]
    async fn aggregates_best_error_response() {
        let proxy = proxy_with(vec![Arc::new(Forker)]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("forker"), 0).unwrap();
        assert_eq!(factory.leg_count(), 2);

        let first = factory.requests(0).remove(0);
        let second = factory.requests(1).remove(0);

        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&first, StatusCode(486), None),
        });
        // One fork still live: nothing final upstream yet.
        assert_eq!(upstream.statuses(), vec![100]);

        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(1),
            rsp: Response::for_request(&second, StatusCode(603), None),
        });

        // 6xx outranks 4xx in the aggregation order.
        assert_eq!(upstream.statuses(), vec![100, 603]);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test)]
    async fn two_hundred_wins_and_cancels_losers() {
        let proxy = proxy_with(vec![Arc::new(Forker)]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("forker"), 0).unwrap();

        let first = factory.requests(0).remove(0);
        let second = factory.requests(1).remove(0);

        // Fork 0 reaches Proceeding, fork 1 answers 200.
        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&first, StatusCode::RINGING, None),
        });
        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(1),
            rsp: Response::for_request(&second, StatusCode::OK, None),
        });

        assert_eq!(upstream.statuses(), vec![100, 180, 200]);
        // The losing leg is cancelled, and its eventual 487 is absorbed.
        assert_matches!(factory.cancelled(0), Some(_));
        assert!(!tsx.is_destroyed());

        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&first, StatusCode::REQUEST_TERMINATED, None),
        });
        assert_eq!(upstream.statuses(), vec![100, 180, 200]);
        assert!(tsx.is_destroyed());
        assert!(tsx.dmap_uac.is_empty() && tsx.umap.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn cancel_is_deferred_until_proceeding() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        let req = invite_via("fwd");
        tsx.process_initial_request(req.clone(), 0).unwrap();
        let sent = factory.requests(0).remove(0);

        // CANCEL while the fork is still Calling: nothing may go out yet.
        let cancel = req.create_cancel(None);
        tsx.handle_event(TsxEvent::Cancel {
            cancel,
            reason: None,
        });
        assert_eq!(factory.cancelled(0), None);

        // The first provisional releases the deferred CANCEL.
        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&sent, StatusCode::RINGING, None),
        });
        assert_matches!(factory.cancelled(0), Some(None));

        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&sent, StatusCode::REQUEST_TERMINATED, None),
        });
        assert_eq!(upstream.statuses(), vec![100, 180, 487]);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test)]
    async fn client_timeout_becomes_408() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("fwd"), 0).unwrap();
        tsx.handle_event(TsxEvent::UacNotResponding {
            uac: factory.leg_id(0),
            event: ForkErrorEvent::Timeout,
        });

        assert_eq!(upstream.statuses(), vec![100, 408]);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test)]
    async fn sproutlet_failure_becomes_500() {
        let proxy = proxy_with(vec![Arc::new(Faulty)]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("faulty"), 0).unwrap();

        assert_eq!(upstream.statuses(), vec![100, 500]);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test)]
    async fn no_match_returns_request_for_stateless_forwarding() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        let mut req = invite_via("fwd");
        req.headers.remove("Route");
        let back = tsx.process_initial_request(req, 0);

        assert_matches!(back, Err(_));
        assert_eq!(upstream.statuses(), Vec::<u16>::new());
        assert_eq!(factory.leg_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn ack_passes_through_without_waiting() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        let mut ack = invite_via("fwd");
        ack.method = SipMethod::Ack;
        ack.headers.set("CSeq", "16567 ACK");
        ack.headers.set("To", "<sip:bob@homedomain>;tag=424242");
        tsx.process_initial_request(ack, 0).unwrap();

        // The ACK is relayed, nothing is awaited and no response is ever
        // sent upstream for it.
        assert_eq!(factory.requests(0).len(), 1);
        assert_eq!(upstream.statuses(), Vec::<u16>::new());
        assert!(tsx.is_destroyed());
        assert!(tsx.dmap_uac.is_empty() && tsx.umap.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn fork_state_is_monotonic() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("fwd"), 0).unwrap();
        let sent = factory.requests(0).remove(0);
        let leg = factory.leg_id(0);

        tsx.handle_event(TsxEvent::UacResponse {
            uac: leg,
            rsp: Response::for_request(&sent, StatusCode::OK, None),
        });
        let root = tsx.root.unwrap();
        assert_eq!(
            tsx.wrappers[root.0].fork_state_of(0),
            Some(ForkState::Terminated)
        );

        // A straggling provisional on the dead leg is absorbed and never
        // resurrects the fork.
        tsx.handle_event(TsxEvent::UacResponse {
            uac: leg,
            rsp: Response::for_request(&sent, StatusCode::RINGING, None),
        });
        assert_eq!(
            tsx.wrappers[root.0].fork_state_of(0),
            Some(ForkState::Terminated)
        );
        assert_eq!(upstream.statuses(), vec![100, 200]);
    }

    #[test_log::test(tokio::test)]
    async fn counters_track_queue_lengths() {
        let proxy = proxy_with(vec![Arc::new(Forker)]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("forker"), 0).unwrap();

        let root = tsx.root.unwrap();
        let wrapper = &tsx.wrappers[root.0];
        assert_eq!(wrapper.counters(), wrapper.queue_lens());
        assert_eq!(wrapper.counters(), (0, 0));

        let first = factory.requests(0).remove(0);
        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&first, StatusCode(486), None),
        });
        let wrapper = &tsx.wrappers[root.0];
        assert_eq!(wrapper.counters(), wrapper.queue_lens());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn timer_pop_reaches_the_sproutlet() {
        let proxy = proxy_with(vec![Arc::new(Deferred)]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("deferred"), 0).unwrap();
        // The transaction must stay alive while its timer is outstanding.
        assert!(!tsx.is_destroyed());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tsx.pump_events();

        assert_eq!(upstream.statuses(), vec![100, 200]);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cancelled_timer_never_fires() {
        let proxy = proxy_with(vec![Arc::new(TimerCanceller)]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("cancelling"), 0).unwrap();

        // With the timer cancelled there is no pending work left; the
        // wrapper answers with the synthesized 408 and tears down.
        assert_eq!(upstream.statuses(), vec![100, 408]);
        assert!(tsx.is_destroyed());

        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        tsx.pump_events();
        assert_eq!(upstream.statuses(), vec![100, 408]);
    }

    #[test_log::test(tokio::test)]
    async fn corrupted_topology_aborts_with_500() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let upstream = MockUpstream::default();
        let mut tsx = ext_tsx(&proxy, &factory, &upstream);

        tsx.process_initial_request(invite_via("fwd"), 0).unwrap();

        // Desynchronize the maps behind the coordinator's back.
        tsx.umap.clear();
        let sent = factory.requests(0).remove(0);
        tsx.handle_event(TsxEvent::UacResponse {
            uac: factory.leg_id(0),
            rsp: Response::for_request(&sent, StatusCode::RINGING, None),
        });

        assert_eq!(upstream.statuses(), vec![100, 500]);
        assert!(tsx.is_destroyed());
    }

    #[test_log::test(tokio::test)]
    async fn internal_terminate_drops_forks() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let mut tsx = UasTsx::new(
            proxy.clone(),
            Box::new(InternalUpstream::default()),
            Arc::new(factory.clone()),
            0x1d7,
            TerminatePolicy::DropForks,
        );

        let sproutlet = proxy.get_sproutlet("fwd").unwrap();
        let mut req = invite_via("fwd");
        req.headers.remove("Route");
        tsx.process_internal_request(&sproutlet, "fwd", req);

        assert_eq!(factory.leg_count(), 1);
        assert!(!tsx.is_destroyed());

        tsx.handle_event(TsxEvent::Terminate);
        assert!(tsx.is_destroyed());
        // DropForks: the in-flight leg is abandoned, not cancelled.
        assert_eq!(factory.cancelled(0), None);
    }

    #[test_log::test(tokio::test)]
    async fn internal_terminate_can_cancel_forks() {
        let proxy = proxy_with(vec![Arc::new(Forwarder { name: "fwd".into() })]);
        let factory = MockUacFactory::new();
        let mut tsx = UasTsx::new(
            proxy.clone(),
            Box::new(InternalUpstream::default()),
            Arc::new(factory.clone()),
            0x1d8,
            TerminatePolicy::CancelForks,
        );

        let sproutlet = proxy.get_sproutlet("fwd").unwrap();
        let mut req = invite_via("fwd");
        req.headers.remove("Route");
        tsx.process_internal_request(&sproutlet, "fwd", req);
        tsx.handle_event(TsxEvent::Terminate);

        assert!(tsx.is_destroyed());
        assert_eq!(factory.cancelled(0), Some(None));
    }
}
