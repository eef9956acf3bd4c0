//! Walden agent reconciliation
//!
//! Keeps the node's NAT table in step with the desired state held by the
//! [`Store`](walden_agent_k8s_index::Store):
//!
//! - [`rules`] translates a single binding into the DNAT/SNAT rules that expose it.
//! - The [`Synchronizer`] diffs those rules against what it installed previously and applies the
//!   difference, one binding at a time.
//! - The controller runs a pass whenever the store changes, and periodically to repair rules
//!   that were removed behind the agent's back.
//! - [`admission`] installs the static link-layer admission filter.
//!
//! An [`Agent`] wires these together; [`Agent::start`] returns a [`Handle`] that controls the
//! agent's lifetime.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
mod agent;
mod controller;
mod metrics;
pub mod rules;
mod synchronizer;


pub use self::{
    admission::AdmissionConfig,
    agent::{Agent, Handle},
    metrics::Metrics,
    rules::NatConfig,
    synchronizer::{PassReport, Synchronizer},
};
use walden_agent_core::engine;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to initialize {table}/{chain}")]
    Init {
        table: &'static str,
        chain: &'static str,
        #[source]
        source: engine::Error,
    },

    #[error("failed to install admission filter chain {chain}")]
    Admission {
        chain: &'static str,
        #[source]
        source: engine::Error,
    },
}
