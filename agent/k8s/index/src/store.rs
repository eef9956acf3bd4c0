use crate::{Barrier, Notification};
use parking_lot::RwLock;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walden_agent_core::{BackendEndpoint, ServiceBinding, ServiceIdentity, ServicePort};

pub type SharedStore = Arc<RwLock<Store>>;

/// Holds the desired state of every Service in scope.
///
/// Each mutation returns whether the desired state actually changed, so that duplicate
/// notifications never trigger reconciliation.
#[derive(Debug, Default)]
pub struct Store {
    bindings: BTreeMap<ServiceIdentity, ServiceBinding>,
}

// === impl Store ===

impl Store {
    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Applies notifications from `rx` until the token is cancelled or every sender is dropped.
    ///
    /// This is the store's only writer. Effective changes are signaled on `changed`; the signal
    /// holds at most one permit, so a burst of changes wakes the reader once.
    pub async fn run(
        store: SharedStore,
        mut rx: mpsc::UnboundedReceiver<Notification>,
        mut barrier: Barrier,
        changed: Arc<Notify>,
        shutdown: CancellationToken,
    ) {
        loop {
            let notification = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                n = rx.recv() => match n {
                    Some(n) => n,
                    None => break,
                },
            };

            if let Notification::Synced(kind) = notification {
                barrier.mark(kind);
                // Wake the reader even if the listing was empty so that it observes the barrier.
                changed.notify_one();
                continue;
            }

            if store.write().apply(notification) {
                changed.notify_one();
            }
        }
        debug!("Store closed");
    }

    pub fn apply(&mut self, notification: Notification) -> bool {
        match notification {
            Notification::ServiceApplied {
                id,
                virtual_addr,
                ports,
            } => self.upsert_service_meta(id, virtual_addr, ports),
            Notification::ServiceDeleted(id) => self.delete_service(&id),
            Notification::EndpointsApplied { id, backends } => self.upsert_backends(id, backends),
            Notification::EndpointsDeleted(id) => self.clear_backends(&id),
            Notification::Synced(_) => false,
        }
    }

    /// Sets a Service's address and ports, leaving its backends untouched.
    pub fn upsert_service_meta(
        &mut self,
        id: ServiceIdentity,
        virtual_addr: Option<IpAddr>,
        ports: BTreeSet<ServicePort>,
    ) -> bool {
        let binding = match self.bindings.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(_) if virtual_addr.is_none() && ports.is_empty() => return false,
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                entry.insert(ServiceBinding::new(id))
            }
        };
        if binding.virtual_addr == virtual_addr && binding.ports == ports {
            return false;
        }

        info!(
            id = %binding.identity,
            addr = ?virtual_addr,
            ports = ports.len(),
            "Service updated"
        );
        binding.virtual_addr = virtual_addr;
        binding.ports = ports;
        self.prune_if_empty();
        true
    }

    /// Replaces a Service's backends wholesale.
    ///
    /// The binding is created if the Endpoints are observed before their Service.
    pub fn upsert_backends(
        &mut self,
        id: ServiceIdentity,
        backends: BTreeSet<BackendEndpoint>,
    ) -> bool {
        let binding = match self.bindings.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            // An empty binding is indistinguishable from no binding at all.
            Entry::Vacant(_) if backends.is_empty() => return false,
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                entry.insert(ServiceBinding::new(id))
            }
        };
        if binding.backends == backends {
            return false;
        }

        info!(id = %binding.identity, backends = backends.len(), "Endpoints updated");
        binding.backends = backends;
        self.prune_if_empty();
        true
    }

    pub fn delete_service(&mut self, id: &ServiceIdentity) -> bool {
        if self.bindings.remove(id).is_none() {
            debug!(%id, "Unknown service deleted");
            return false;
        }
        info!(%id, "Service deleted");
        true
    }

    /// Empties a Service's backends. The binding itself is kept while its Service exists.
    pub fn clear_backends(&mut self, id: &ServiceIdentity) -> bool {
        let Some(binding) = self.bindings.get_mut(id) else {
            return false;
        };
        if binding.backends.is_empty() {
            return false;
        }

        info!(%id, "Endpoints deleted");
        binding.backends.clear();
        self.prune_if_empty();
        true
    }

    /// Returns a point-in-time copy of every binding, ordered by identity.
    pub fn snapshot(&self) -> Vec<ServiceBinding> {
        self.bindings.values().cloned().collect()
    }

    pub fn get(&self, id: &ServiceIdentity) -> Option<&ServiceBinding> {
        self.bindings.get(id)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn backends_len(&self) -> usize {
        self.bindings.values().map(|b| b.backends.len()).sum()
    }

    fn prune_if_empty(&mut self) {
        self.bindings.retain(|_, b| !b.is_empty());
    }
}
