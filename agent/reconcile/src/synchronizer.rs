use crate::{
    rules::{self, NatConfig, PlannedRule, Slot, NAT_TABLE, POSTROUTING_CHAIN, SERVICES_CHAIN},
    Error, Metrics,
};
use ipnet::IpNet;
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, HashSet};
use tracing::{debug, error, warn};
use walden_agent_core::{
    engine, Position, RuleEngine, RuleRecord, ServiceBinding, ServiceIdentity,
};

/// Reconciles the desired state against the packet filter's NAT table.
///
/// The synchronizer remembers which rules it installed for each binding. The engine remains the
/// source of truth for whether a rule is actually installed: every insert and delete is preceded by
/// an existence check, so a pass may be repeated against any partial result of a previous one.
///
/// Passes take `&mut self`, so at most one can be in flight.
#[derive(Debug)]
pub struct Synchronizer<E> {
    engine: E,
    config: NatConfig,
    installed: BTreeMap<ServiceIdentity, Vec<PlannedRule>>,
    shared_subnets: BTreeSet<IpNet>,
    initialized: bool,
    metrics: Metrics,
}

/// Describes the outcome of a single reconciliation pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// The number of rules inserted or deleted.
    pub mutations: usize,

    /// The number of bindings whose rules were reconciled.
    pub bindings: usize,

    /// The number of bindings that could not be expressed as rules.
    pub skipped: usize,

    /// Bindings that failed to reconcile. They are retried by the next pass.
    pub failures: Vec<(ServiceIdentity, engine::Error)>,

    /// Indicates that the pass stopped before visiting every binding.
    pub interrupted: bool,
}

// === impl Synchronizer ===

impl<E: RuleEngine> Synchronizer<E> {
    pub fn new(engine: E, config: NatConfig, metrics: Metrics) -> Self {
        Self {
            engine,
            config,
            installed: BTreeMap::new(),
            shared_subnets: BTreeSet::new(),
            initialized: false,
            metrics,
        }
    }

    /// Prepares the agent's chains.
    ///
    /// Both chains are flushed: rules left behind by a previous process are not known to this one
    /// and could never be cleaned up otherwise. The jumps into the chains are installed at most
    /// once.
    pub fn init(&mut self) -> Result<(), Error> {
        for chain in [SERVICES_CHAIN, POSTROUTING_CHAIN] {
            self.engine
                .clear_chain(NAT_TABLE, chain)
                .map_err(|source| Error::Init {
                    table: NAT_TABLE,
                    chain,
                    source,
                })?;
        }

        for jump in rules::jumps() {
            let installed = jump.is_installed(&self.engine).and_then(|installed| {
                if !installed {
                    debug!(rule = %jump, "Installing jump");
                    jump.install(&self.engine)?;
                }
                Ok(installed)
            });
            if let Err(source) = installed {
                return Err(Error::Init {
                    table: jump.table,
                    chain: jump.chain,
                    source,
                });
            }
        }

        self.installed.clear();
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Runs a single reconciliation pass over `snapshot`.
    ///
    /// Bindings are visited in identity order. `stop` is consulted before each binding; a pass is
    /// never interrupted in the middle of a binding. Bindings that are no longer in the snapshot are
    /// reconciled against an empty target so none of their rules remain. A backend subnet claimed
    /// by several bindings is translated only by the first of them.
    ///
    /// Fails only if the chains could not be initialized.
    pub fn reconcile(
        &mut self,
        snapshot: Vec<ServiceBinding>,
        mut stop: impl FnMut() -> bool,
    ) -> Result<PassReport, Error> {
        if !self.initialized {
            self.init()?;
        }

        let mut desired = snapshot
            .into_iter()
            .map(|b| (b.identity.clone(), b))
            .collect::<BTreeMap<_, _>>();
        let ids = desired
            .keys()
            .chain(self.installed.keys())
            .cloned()
            .collect::<BTreeSet<_>>();
        let owners = self.claim_subnets(&desired);

        let mut report = PassReport::default();
        for id in ids {
            if stop() {
                debug!("Pass interrupted");
                report.interrupted = true;
                break;
            }

            let mut target = match desired.remove(&id) {
                None => Vec::new(),
                Some(binding) => match binding.virtual_addr {
                    None => {
                        debug!(%id, "Skipping incomplete binding");
                        report.skipped += 1;
                        Vec::new()
                    }
                    Some(addr) if !self.config.accepts(&addr) => {
                        debug!(%id, %addr, "Skipping binding of another address family");
                        report.skipped += 1;
                        Vec::new()
                    }
                    Some(_) => rules::plan(&binding, &self.config),
                },
            };
            target.retain(|rule| match &rule.slot {
                Slot::Snat(subnet) => owners.get(subnet) == Some(&id),
                Slot::Dnat { .. } => true,
            });
            if target.is_empty() && !self.installed.contains_key(&id) {
                continue;
            }

            report.bindings += 1;
            let mut shadow = self.installed.remove(&id).unwrap_or_default();
            let result = self.sync_binding(&id, &mut shadow, &target, &mut report.mutations);
            if !shadow.is_empty() {
                self.installed.insert(id.clone(), shadow);
            }
            if let Err(error) = result {
                error!(%id, %error, "Failed to reconcile binding");
                self.metrics.failure();
                report.failures.push((id, error));
            }
        }

        self.metrics.pass(report.failures.len(), report.interrupted);
        debug!(
            mutations = report.mutations,
            bindings = report.bindings,
            skipped = report.skipped,
            failures = report.failures.len(),
            "Pass complete"
        );
        Ok(report)
    }

    /// Assigns each backend subnet to the first binding, in identity order, that translates it.
    fn claim_subnets(
        &mut self,
        desired: &BTreeMap<ServiceIdentity, ServiceBinding>,
    ) -> BTreeMap<IpNet, ServiceIdentity> {
        let mut owners = BTreeMap::new();
        let mut shared = BTreeSet::new();
        for (id, binding) in desired {
            for subnet in rules::snat_subnets(binding, &self.config) {
                match owners.entry(subnet) {
                    Entry::Vacant(entry) => {
                        entry.insert(id.clone());
                    }
                    Entry::Occupied(entry) => {
                        if shared.insert(subnet) && !self.shared_subnets.contains(&subnet) {
                            warn!(
                                %subnet,
                                owner = %entry.get(),
                                %id,
                                "Backend subnet is shared by multiple services; only its owner's traffic is translated"
                            );
                            self.metrics.conflict();
                        }
                    }
                }
            }
        }
        self.shared_subnets = shared;
        owners
    }

    /// Iterates over every rule this synchronizer believes it has installed.
    pub fn installed(&self) -> impl Iterator<Item = &RuleRecord> + '_ {
        self.installed.values().flatten().map(|r| &r.record)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Converges a single binding's installed rules onto `target`.
    ///
    /// `shadow` is updated as each operation succeeds, so on failure it still covers every rule
    /// that may be installed.
    fn sync_binding(
        &self,
        id: &ServiceIdentity,
        shadow: &mut Vec<PlannedRule>,
        target: &[PlannedRule],
        mutations: &mut usize,
    ) -> engine::Result<()> {
        let wanted = target.iter().collect::<HashSet<_>>();
        let slots = target.iter().map(|r| &r.slot).collect::<HashSet<_>>();

        // A stale rule that matches the same traffic as a wanted rule must go first; otherwise both
        // would be installed at once.
        let conflicts = shadow
            .iter()
            .filter(|r| !wanted.contains(r) && slots.contains(&r.slot))
            .cloned()
            .collect::<Vec<_>>();
        for stale in conflicts {
            warn!(%id, slot = %stale.slot, rule = %stale.record, "Replacing conflicting rule");
            self.metrics.conflict();
            self.remove(&stale.record, mutations)?;
            shadow.retain(|r| *r != stale);
        }

        for (i, rule) in target.iter().enumerate() {
            if !rule.record.is_installed(&self.engine)? {
                debug!(%id, rule = %rule.record, "Inserting rule");
                self.install(&rule.record, &target[i + 1..], shadow)?;
                self.metrics.inserted();
                *mutations += 1;
            }
            if !shadow.contains(rule) {
                shadow.push(rule.clone());
            }
        }

        let stale = shadow
            .iter()
            .filter(|r| !wanted.contains(r))
            .cloned()
            .collect::<Vec<_>>();
        for rule in stale {
            self.remove(&rule.record, mutations)?;
            shadow.retain(|r| *r != rule);
        }

        Ok(())
    }

    /// Installs a missing rule ahead of any installed rule of the same binding that is planned to
    /// follow it, so that a rule restored after the others keeps its place in evaluation order.
    fn install(
        &self,
        record: &RuleRecord,
        later: &[PlannedRule],
        shadow: &[PlannedRule],
    ) -> engine::Result<()> {
        if record.position == Position::Tail {
            let following = later
                .iter()
                .filter(|r| r.record.table == record.table && r.record.chain == record.chain)
                .filter(|r| shadow.contains(r))
                .map(|r| &r.record.spec)
                .collect::<Vec<_>>();
            if !following.is_empty() {
                let rules = self.engine.list_rules(record.table, record.chain)?;
                if let Some(idx) = rules.iter().position(|spec| following.contains(&spec)) {
                    return self
                        .engine
                        .insert(record.table, record.chain, idx + 1, &record.spec);
                }
            }
        }
        record.install(&self.engine)
    }

    fn remove(&self, record: &RuleRecord, mutations: &mut usize) -> engine::Result<()> {
        if record.is_installed(&self.engine)? {
            debug!(rule = %record, "Deleting rule");
            record.uninstall(&self.engine)?;
            self.metrics.deleted();
            *mutations += 1;
        }
        Ok(())
    }
}
