//! # sproutlet-proxy
//!
//! A stateful SIP B2BUA/proxy framework that hosts pluggable SIP
//! micro-transactions ("sproutlets") and composes them across a single
//! physical SIP transaction.
//!
//! The crate is layered leaves-first:
//!
//! - [`resolver`] resolves SIP next-hops to concrete targets per RFC 3263,
//!   with failure blacklisting.
//! - [`proxy`] owns the sproutlet registry and selects a target sproutlet
//!   for each request by inspecting the top Route header or Request-URI.
//! - [`tsx`] coordinates one UAS transaction: the fork topology between
//!   sproutlets and real UAC legs, the pending-request pump and teardown.
//! - [`handlers`] hosts the HTTP-triggered subscriber state transitions
//!   (registration timeout, administrative deregistration, auth timeout).
//!
//! The concrete SIP wire stack, the HSS client and the physical stores are
//! external collaborators, reached through the traits in [`tsx::uac`],
//! [`hss`] and [`store`].

pub mod handlers;
pub mod hss;
pub mod message;
pub mod proxy;
pub mod resolver;
pub mod service;
pub mod session_timer;
pub mod store;
pub mod tsx;

pub(crate) mod error;

pub use error::{Error, Result};
pub use proxy::SproutletProxy;
pub use service::{Sproutlet, SproutletHelper, SproutletTsx};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

/// Correlation identifier propagated through all log events of one request.
pub type TrailId = u64;

/// Generates a fresh trail id for a request entering the system.
pub fn new_trail() -> TrailId {
    rand::random()
}
