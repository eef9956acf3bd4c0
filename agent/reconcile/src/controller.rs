use crate::Synchronizer;
use std::sync::Arc;
use tokio::{
    sync::Notify,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use walden_agent_core::RuleEngine;
use walden_agent_k8s_index::{SharedStore, SyncWait};

/// Drives reconciliation passes.
///
/// Waits for the initial listing to be applied, then runs a pass immediately and again whenever the
/// store signals a change or the resync interval elapses. Changes that arrive during a pass are
/// coalesced into a single follow-up pass.
pub(crate) async fn run<E>(
    mut sync: Synchronizer<E>,
    store: SharedStore,
    synced: SyncWait,
    changed: Arc<Notify>,
    resync: Duration,
    shutdown: CancellationToken,
) where
    E: RuleEngine + 'static,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        ok = synced.synced() => if !ok {
            debug!("Store closed before caches synced");
            return;
        },
    }
    info!("Caches synced");

    let mut interval = time::interval_at(Instant::now() + resync, resync);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let snapshot = store.read().snapshot();

        // Rule engine operations block, so passes run off of the runtime's worker threads. The
        // token is checked between bindings.
        let token = shutdown.clone();
        let pass = tokio::task::spawn_blocking(move || {
            let report = sync.reconcile(snapshot, || token.is_cancelled());
            (sync, report)
        });
        let report = match pass.await {
            Ok((s, report)) => {
                sync = s;
                report
            }
            Err(error) => {
                error!(%error, "Reconciliation panicked");
                return;
            }
        };
        match report {
            Ok(report) if report.failures.is_empty() => {
                debug!(mutations = report.mutations, "Reconciled")
            }
            Ok(report) => info!(
                mutations = report.mutations,
                failures = report.failures.len(),
                "Reconciled with failures; retrying on the next pass"
            ),
            Err(error) => error!(%error, "Failed to reconcile"),
        }
        interval.reset();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = changed.notified() => debug!("Desired state changed"),
            _ = interval.tick() => debug!("Resyncing"),
        }
    }
    debug!("Shutdown");
}
