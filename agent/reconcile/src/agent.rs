use crate::{controller, Metrics, NatConfig, Synchronizer};
use futures::prelude::*;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinSet,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};
use walden_agent_core::RuleEngine;
use walden_agent_k8s_api::watcher;
use walden_agent_k8s_index::{
    self as index, Handler, Kind, NamespaceFilter, Notification, SharedStore, Store, SyncError,
    SyncWait, Watched,
};

/// Everything needed to run the agent's control loop.
#[derive(Debug)]
pub struct Agent<E> {
    engine: E,
    nat: NatConfig,
    resync: Duration,
    metrics: Metrics,
    store: SharedStore,
}

/// Controls a running [`Agent`].
///
/// Watches are attached with [`Handle::watch`]. [`Handle::stop`] signals every task to finish and
/// [`Handle::wait`] blocks until they have.
#[derive(Debug)]
pub struct Handle {
    shutdown: CancellationToken,
    tx: mpsc::UnboundedSender<Notification>,
    synced: SyncWait,
    store: SharedStore,
    tasks: JoinSet<()>,
}

// === impl Agent ===

impl<E: RuleEngine + 'static> Agent<E> {
    pub fn new(engine: E, nat: NatConfig, resync: Duration, metrics: Metrics) -> Self {
        Self {
            engine,
            nat,
            resync,
            metrics,
            store: Store::shared(),
        }
    }

    /// The desired state. Exposed so that it may be instrumented before the agent starts.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Spawns the store and reconciliation tasks.
    ///
    /// The agent stops when `parent` is cancelled or when the returned handle is stopped.
    pub fn start(self, parent: &CancellationToken) -> Handle {
        let Self {
            engine,
            nat,
            resync,
            metrics,
            store,
        } = self;

        let shutdown = parent.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let (barrier, synced) = index::barrier(Kind::ALL);
        let changed = Arc::new(Notify::new());

        let mut tasks = JoinSet::new();
        tasks.spawn(
            Store::run(
                store.clone(),
                rx,
                barrier,
                changed.clone(),
                shutdown.clone(),
            )
            .instrument(info_span!("store")),
        );
        tasks.spawn(
            controller::run(
                Synchronizer::new(engine, nat, metrics),
                store.clone(),
                synced.clone(),
                changed,
                resync,
                shutdown.clone(),
            )
            .instrument(info_span!("reconcile")),
        );

        Handle {
            shutdown,
            tx,
            synced,
            store,
            tasks,
        }
    }
}

// === impl Handle ===

impl Handle {
    /// Feeds a resource watch into the agent's desired state.
    pub fn watch<T, S>(&mut self, events: S, filter: NamespaceFilter)
    where
        T: Watched,
        S: Stream<Item = watcher::Event<T>> + Send + 'static,
    {
        let handler = Handler::<T>::new(filter, self.tx.clone());
        self.tasks.spawn(
            handler
                .run(events, self.shutdown.clone())
                .instrument(info_span!("watch", kind = %T::KIND)),
        );
    }

    /// Waits for every watched kind to complete its initial listing.
    pub async fn synced(&self, timeout: Duration) -> Result<(), SyncError> {
        self.synced.timeout(timeout).await
    }

    pub fn is_synced(&self) -> bool {
        self.synced.is_synced()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Signals all of the agent's tasks to stop.
    ///
    /// A reconciliation pass in progress completes its current binding before stopping.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits for all of the agent's tasks to complete.
    ///
    /// This does not stop the agent; call [`Handle::stop`] first or cancel the parent token.
    pub async fn wait(self) {
        let Self { tx, mut tasks, .. } = self;
        drop(tx);
        while let Some(res) = tasks.join_next().await {
            if let Err(error) = res {
                error!(%error, "Task failed");
            }
        }
        debug!("Stopped");
    }
}
