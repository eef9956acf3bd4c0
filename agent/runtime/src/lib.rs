#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use walden_agent_core as core;
pub use walden_agent_iptables as iptables;
pub use walden_agent_k8s_api as k8s;
pub use walden_agent_k8s_index as index;
pub use walden_agent_reconcile as reconcile;

mod args;

pub use self::args::Args;
