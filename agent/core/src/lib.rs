//! Walden agent domain model
//!
//! The agent makes a Service's cluster address reachable from outside the cluster by installing
//! address-translation rules on the node's packet filter. This crate holds the types shared by the
//! rest of the agent:
//!
//! - A [`ServiceBinding`] is the desired state for a single Service: its virtual address, its
//!   ports, and the set of [`BackendEndpoint`]s currently eligible to receive traffic.
//! - A [`RuleRecord`] describes a single rule in a packet filter chain.
//! - A [`RuleEngine`] is the packet filter itself: a mutable set of tables, chains, and rules with
//!   no transactional primitives.
//!
//! ```text
//! [ Service ] + [ Endpoints ] -> [ ServiceBinding ] -> [ RuleRecord ]* -> [ RuleEngine ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod binding;
pub mod engine;
mod identity;
pub mod mac;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod ports;
pub mod rule;

pub use self::{
    binding::{BackendEndpoint, InvalidProtocol, Protocol, ServiceBinding, ServicePort},
    engine::RuleEngine,
    identity::ServiceIdentity,
    mac::MacAddr,
    rule::{Position, RuleRecord},
};
