//! Sproutlet proxy dispatch.
//!
//! The proxy owns the process-wide sproutlet registry and the host-alias
//! set, selects the target sproutlet for each request, builds reflexive
//! URIs, and runs the timer table that backs wrapper-scoped timers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::mpsc::UnboundedSender;

use crate::message::{Host, Request, SipUri};
use crate::service::Sproutlet;
use crate::tsx::{
    InternalUpstream, TerminatePolicy, TimerId, TsxEvent, UacFactory, UasTsx, UasTsxHandle,
    Upstream, WrapperId,
};
use crate::{Error, Result, TrailId};

struct TimerEntry {
    task: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    /// The URI other nodes use to route to this proxy.
    root_uri: SipUri,

    /// The normalized root host.
    root_host: String,

    /// Hosts that refer to this proxy, the root host included.
    host_aliases: HashSet<String>,

    /// The sproutlets loaded in this proxy.
    sproutlets: Vec<Arc<dyn Sproutlet>>,

    /// Factory for client legs to external next-hops.
    uac_factory: Option<Arc<dyn UacFactory>>,

    /// Outstanding wrapper-scoped timers.
    timers: Mutex<HashMap<TimerId, TimerEntry>>,

    next_timer: AtomicU64,
}

/// The sproutlet proxy.
///
/// Cheap to clone; all configuration is read-only after startup and shared
/// between transactions.
#[derive(Clone)]
pub struct SproutletProxy(Arc<Inner>);

/// The outcome of selecting a sproutlet for a request.
pub(crate) struct TargetSelection {
    pub sproutlet: Arc<dyn Sproutlet>,
    pub alias: String,
    /// The Route header consumed by the selection, if any.
    pub popped_route: Option<SipUri>,
}

/// What became of an externally-received request.
#[derive(Debug)]
pub enum NewRequestOutcome {
    /// A sproutlet matched; the transaction is running.
    Handled(UasTsxHandle),
    /// No sproutlet matched; forward statelessly to the Request-URI (or
    /// reject with a 404 if that is not forwardable).
    NoSproutletMatched(Request),
}

impl SproutletProxy {
    /// Returns a builder to create a `SproutletProxy`.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Dispatches an externally-received request. On a match the initial
    /// sproutlet runs synchronously (an INVITE gets its 100 Trying before
    /// this returns) and the transaction task is spawned.
    pub fn on_new_request(
        &self,
        req: Request,
        port: u16,
        upstream: Box<dyn Upstream>,
    ) -> Result<NewRequestOutcome> {
        let factory = self
            .0
            .uac_factory
            .clone()
            .ok_or_else(|| Error::Fatal("no UAC factory configured".into()))?;

        let trail = crate::new_trail();
        let mut tsx = UasTsx::new(
            self.clone(),
            upstream,
            factory,
            trail,
            TerminatePolicy::DropForks,
        );
        match tsx.process_initial_request(req, port) {
            Ok(()) => {
                let handle = tsx.handle();
                if !tsx.is_destroyed() {
                    tokio::spawn(tsx.run());
                }
                Ok(NewRequestOutcome::Handled(handle))
            }
            Err(req) => Ok(NewRequestOutcome::NoSproutletMatched(req)),
        }
    }

    /// Creates an internally-initiated transaction rooted at the named
    /// sproutlet. The caller keeps the handle to `terminate()` it.
    pub fn create_internal_tsx(
        &self,
        req: Request,
        alias: &str,
        trail: TrailId,
        policy: TerminatePolicy,
    ) -> Result<UasTsxHandle> {
        let factory = self
            .0
            .uac_factory
            .clone()
            .ok_or_else(|| Error::Fatal("no UAC factory configured".into()))?;
        let sproutlet = self
            .get_sproutlet(alias)
            .ok_or_else(|| Error::RoutingDeadEnd(alias.to_string()))?;

        let mut tsx = UasTsx::new(self.clone(), Box::new(InternalUpstream::default()), factory, trail, policy);
        tsx.process_internal_request(&sproutlet, alias, req);
        let handle = tsx.handle();
        if !tsx.is_destroyed() {
            tokio::spawn(tsx.run());
        }
        Ok(handle)
    }

    /// Finds a sproutlet by service name.
    pub fn get_sproutlet(&self, name: &str) -> Option<Arc<dyn Sproutlet>> {
        self.0
            .sproutlets
            .iter()
            .find(|s| s.service_name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Selects the target sproutlet for a request.
    ///
    /// The top Route header is consulted first and consumed on a match;
    /// failing that the Request-URI, and finally (for externally received
    /// requests) the port the request arrived on.
    pub(crate) fn target_sproutlet(
        &self,
        req: &mut Request,
        port: u16,
    ) -> Option<TargetSelection> {
        if let Some(route) = req.headers.top_route() {
            if let Some((sproutlet, alias)) = self.match_uri(&route) {
                log::debug!(
                    "routing to sproutlet '{}' via Route {}",
                    sproutlet.service_name(),
                    route
                );
                req.headers.pop_route();
                return Some(TargetSelection {
                    sproutlet,
                    alias,
                    popped_route: Some(route),
                });
            }
        }

        if let Some((sproutlet, alias)) = self.match_uri(&req.uri) {
            log::debug!(
                "routing to sproutlet '{}' via Request-URI {}",
                sproutlet.service_name(),
                req.uri
            );
            return Some(TargetSelection {
                sproutlet,
                alias,
                popped_route: None,
            });
        }

        if port != 0 {
            if let Some(sproutlet) = self
                .0
                .sproutlets
                .iter()
                .find(|s| s.port() == port)
                .cloned()
            {
                let alias = sproutlet.service_name().to_string();
                log::debug!("routing to sproutlet '{}' via port {}", alias, port);
                return Some(TargetSelection {
                    sproutlet,
                    alias,
                    popped_route: None,
                });
            }
        }

        None
    }

    /// Matches a URI against the registry: the `services` parameter, then
    /// the user part (both require a locally-aliased host), then the host
    /// itself (`<service>.<root-host>` or a configured service host).
    fn match_uri(&self, uri: &SipUri) -> Option<(Arc<dyn Sproutlet>, String)> {
        if self.is_host_local(&uri.host) {
            if let Some(found) = self.service_from_params(uri) {
                return Some(found);
            }
            if let Some(found) = self.service_from_user(uri) {
                return Some(found);
            }
        }
        self.service_from_host(uri)
    }

    fn service_from_params(&self, uri: &SipUri) -> Option<(Arc<dyn Sproutlet>, String)> {
        let service = uri.services()?;
        let sproutlet = self.get_sproutlet(service)?;
        Some((sproutlet, service.to_string()))
    }

    fn service_from_user(&self, uri: &SipUri) -> Option<(Arc<dyn Sproutlet>, String)> {
        let user = uri.user.as_deref()?;
        let sproutlet = self.get_sproutlet(user)?;
        Some((sproutlet, user.to_string()))
    }

    fn service_from_host(&self, uri: &SipUri) -> Option<(Arc<dyn Sproutlet>, String)> {
        let Host::Domain(host) = &uri.host else {
            return None;
        };
        for sproutlet in &self.0.sproutlets {
            if let Some(service_host) = sproutlet.service_host() {
                if host.eq_ignore_ascii_case(service_host) {
                    return Some((sproutlet.clone(), sproutlet.service_name().to_string()));
                }
            }
            // The label preceding the proxy's root host names the service.
            let prefixed = format!("{}.{}", sproutlet.service_name(), self.0.root_host);
            if host.eq_ignore_ascii_case(&prefixed) {
                return Some((sproutlet.clone(), sproutlet.service_name().to_string()));
            }
        }
        None
    }

    /// Tests whether a URI routes back into this proxy: its host is a
    /// configured alias, its user part names a loaded sproutlet, or a
    /// `services` parameter does.
    pub fn is_uri_reflexive(&self, uri: &SipUri) -> bool {
        self.is_host_local(&uri.host)
            || self.service_from_params(uri).is_some()
            || self.service_from_user(uri).is_some()
            || self.service_from_host(uri).is_some()
    }

    fn is_host_local(&self, host: &Host) -> bool {
        self.0.host_aliases.contains(&host.as_str())
    }

    /// Builds an absolute URI that routes back into the named sproutlet.
    pub fn create_sproutlet_uri(&self, service_name: &str) -> SipUri {
        let mut uri = SipUri::new(Host::Domain(self.0.root_host.clone())).with_user(service_name);
        uri.port = self.0.root_uri.port;
        uri.lr = true;
        uri
    }

    /// The URI other nodes use to route to this proxy.
    pub fn root_uri(&self) -> &SipUri {
        &self.0.root_uri
    }

    /// Schedules a timer on behalf of a wrapper. The pop is posted onto the
    /// owning transaction's event channel, so the callback runs on the
    /// transaction's task rather than the timer task.
    pub(crate) fn schedule_timer(
        &self,
        events: UnboundedSender<TsxEvent>,
        wrapper: WrapperId,
        context: u64,
        duration: Duration,
    ) -> TimerId {
        let id = self.0.next_timer.fetch_add(1, Ordering::SeqCst) + 1;
        self.0
            .timers
            .lock()
            .expect("Lock failed")
            .insert(id, TimerEntry { task: None });

        let proxy = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let popped = proxy
                .0
                .timers
                .lock()
                .expect("Lock failed")
                .remove(&id)
                .is_some();
            if popped {
                let _ = events.send(TsxEvent::TimerPop {
                    wrapper,
                    timer: id,
                    context,
                });
            }
        });

        if let Some(entry) = self.0.timers.lock().expect("Lock failed").get_mut(&id) {
            entry.task = Some(task);
        }
        log::trace!("scheduled timer {} for {:?}", id, duration);
        id
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) {
        let entry = self.0.timers.lock().expect("Lock failed").remove(&id);
        if let Some(entry) = entry {
            if let Some(task) = entry.task {
                task.abort();
            }
            log::trace!("cancelled timer {}", id);
        }
    }

    pub(crate) fn timer_running(&self, id: TimerId) -> bool {
        self.0.timers.lock().expect("Lock failed").contains_key(&id)
    }
}

/// Builder for creating a new [`SproutletProxy`].
pub struct Builder {
    root_uri: Option<SipUri>,
    host_aliases: HashSet<String>,
    sproutlets: Vec<Arc<dyn Sproutlet>>,
    uac_factory: Option<Arc<dyn UacFactory>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            root_uri: None,
            host_aliases: HashSet::new(),
            sproutlets: Vec::new(),
            uac_factory: None,
        }
    }

    /// Sets the URI other nodes use to route to this proxy. Required.
    pub fn with_root_uri(mut self, uri: &str) -> Builder {
        self.root_uri = uri.parse().ok();
        self
    }

    /// Adds a host that refers to this proxy.
    pub fn with_host_alias<T: AsRef<str>>(mut self, alias: T) -> Builder {
        self.host_aliases
            .insert(alias.as_ref().to_ascii_lowercase());
        self
    }

    /// Loads a sproutlet. Duplicate service names are rejected.
    pub fn with_sproutlet(self, sproutlet: impl Sproutlet) -> Builder {
        self.with_sproutlet_arc(Arc::new(sproutlet))
    }

    /// Loads an already-shared sproutlet.
    pub fn with_sproutlet_arc(mut self, sproutlet: Arc<dyn Sproutlet>) -> Builder {
        let name = sproutlet.service_name();
        if self
            .sproutlets
            .iter()
            .any(|s| s.service_name().eq_ignore_ascii_case(name))
        {
            log::warn!("sproutlet with name '{}' already loaded", name);
            return self;
        }
        self.sproutlets.push(sproutlet);
        self
    }

    /// Sets the factory for client legs to external next-hops.
    pub fn with_uac_factory(mut self, factory: Arc<dyn UacFactory>) -> Builder {
        self.uac_factory = Some(factory);
        self
    }

    /// Finalize the builder into a `SproutletProxy`.
    pub fn build(self) -> Result<SproutletProxy> {
        let root_uri = self
            .root_uri
            .ok_or_else(|| Error::Parse("proxy root URI missing or malformed".into()))?;
        let root_host = root_uri.host_str();

        let mut host_aliases = self.host_aliases;
        host_aliases.insert(root_host.clone());

        log::debug!(
            "sproutlets loaded ({})",
            self.sproutlets.iter().map(|s| s.service_name()).join(", ")
        );

        Ok(SproutletProxy(Arc::new(Inner {
            root_uri,
            root_host,
            host_aliases,
            sproutlets: self.sproutlets,
            uac_factory: self.uac_factory,
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(0),
        })))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
