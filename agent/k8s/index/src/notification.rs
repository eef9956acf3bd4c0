use std::{collections::BTreeSet, fmt, net::IpAddr};
use walden_agent_core::{BackendEndpoint, ServiceIdentity, ServicePort};

/// The resource kinds the agent watches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Service,
    Endpoints,
}

/// A single change to the desired state, as published by a [`Handler`](crate::Handler).
///
/// Notifications always carry the full current state of the object so that the store never has to
/// merge partial updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    ServiceApplied {
        id: ServiceIdentity,
        virtual_addr: Option<IpAddr>,
        ports: BTreeSet<ServicePort>,
    },
    ServiceDeleted(ServiceIdentity),

    EndpointsApplied {
        id: ServiceIdentity,
        backends: BTreeSet<BackendEndpoint>,
    },
    EndpointsDeleted(ServiceIdentity),

    /// Marks the end of a kind's initial listing. Every object that existed when the watch started
    /// has been published ahead of this marker.
    Synced(Kind),
}

// === impl Kind ===

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Service, Kind::Endpoints];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "services",
            Self::Endpoints => "endpoints",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Notification ===

impl Notification {
    pub fn identity(&self) -> Option<&ServiceIdentity> {
        match self {
            Self::ServiceApplied { id, .. }
            | Self::ServiceDeleted(id)
            | Self::EndpointsApplied { id, .. }
            | Self::EndpointsDeleted(id) => Some(id),
            Self::Synced(_) => None,
        }
    }
}
