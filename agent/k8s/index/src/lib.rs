//! Walden agent Kubernetes index
//!
//! Turns watches of `Service` and `Endpoints` resources into the agent's desired state:
//!
//! - A [`NamespaceFilter`] decides which objects the agent is responsible for. Everything else is
//!   dropped before it reaches the store.
//! - A [`Handler`] consumes a single resource kind's watch and converts each event into a
//!   [`Notification`]. All handlers publish onto the same queue.
//! - The [`Store`] is the queue's only consumer. It folds notifications into a map of
//!   [`ServiceBinding`](walden_agent_core::ServiceBinding)s and signals whenever the desired state
//!   actually changes.
//!
//! ```text
//! [ Service ]   -> [ Handler ] \
//!                               -> [ Notification ]* -> [ Store ] -> (changed)
//! [ Endpoints ] -> [ Handler ] /
//! ```
//!
//! Each handler also forwards the end of its kind's initial listing. Once every kind has been
//! listed *and* the store has applied the listing, the [`SyncWait`] barrier opens.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoints;
mod handler;
pub mod metrics;
mod namespace;
mod notification;
mod service;
mod store;
mod sync;


pub use self::{
    handler::{Handler, Watched},
    namespace::{EmptyNamespaces, NamespaceFilter},
    notification::{Kind, Notification},
    store::{SharedStore, Store},
    sync::{barrier, Barrier, SyncError, SyncWait},
};
