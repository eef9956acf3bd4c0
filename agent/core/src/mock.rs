//! An in-memory [`RuleEngine`] for tests.

use crate::engine::{Error, Result, RuleEngine};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Records every mutation and supports failure injection.
///
/// Tables start out with the builtin chains of the `filter` and `nat` tables.
#[derive(Debug)]
pub struct Engine {
    state: Mutex<State>,
}

/// A mutating call made against the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Clear {
        table: String,
        chain: String,
    },
    Insert {
        table: String,
        chain: String,
        position: usize,
        spec: Vec<String>,
    },
    Append {
        table: String,
        chain: String,
        spec: Vec<String>,
    },
    Delete {
        table: String,
        chain: String,
        spec: Vec<String>,
    },
    DeleteChain {
        table: String,
        chain: String,
    },
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<String, Vec<Vec<String>>>>,
    mutations: Vec<Mutation>,
    unavailable: bool,
    failing_tokens: Vec<String>,
}

const BUILTIN: &[(&str, &[&str])] = &[
    ("filter", &["INPUT", "FORWARD", "OUTPUT"]),
    ("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
];

// === impl Engine ===

impl Default for Engine {
    fn default() -> Self {
        let tables = BUILTIN
            .iter()
            .map(|(table, chains)| {
                let chains = chains
                    .iter()
                    .map(|c| (c.to_string(), Vec::new()))
                    .collect();
                (table.to_string(), chains)
            })
            .collect();
        Self {
            state: Mutex::new(State {
                tables,
                ..Default::default()
            }),
        }
    }
}

impl Engine {
    /// Returns the rules currently installed in `chain`, in evaluation order.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the rules in `chain` joined as strings, which reads better in assertions.
    pub fn rule_strings(&self, table: &str, chain: &str) -> Vec<String> {
        self.rules(table, chain)
            .into_iter()
            .map(|spec| spec.join(" "))
            .collect()
    }

    /// Drains the list of mutations recorded so far.
    pub fn take_mutations(&self) -> Vec<Mutation> {
        std::mem::take(&mut self.state.lock().mutations)
    }

    /// Causes every subsequent call to fail as if the tables could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Causes inserts and appends of rules containing `token` to fail.
    pub fn fail_rules_containing(&self, token: impl ToString) {
        self.state.lock().failing_tokens.push(token.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.unavailable = false;
        state.failing_tokens.clear();
    }

    /// Removes a rule without recording a mutation, simulating an out-of-band change.
    pub fn remove_out_of_band(&self, table: &str, chain: &str, spec: &[String]) -> bool {
        let mut state = self.state.lock();
        let Some(rules) = state.tables.get_mut(table).and_then(|t| t.get_mut(chain)) else {
            return false;
        };
        match rules.iter().position(|r| r == spec) {
            Some(idx) => {
                rules.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl State {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn check_spec(&self, spec: &[String]) -> Result<()> {
        self.check_available()?;
        if let Some(token) = self
            .failing_tokens
            .iter()
            .find(|t| spec.iter().any(|s| s == *t))
        {
            return Err(Error::Unavailable(format!("injected failure for {token}")));
        }
        Ok(())
    }

    fn chain_mut(&mut self, table: &str, chain: &str) -> Result<&mut Vec<Vec<String>>> {
        self.tables
            .get_mut(table)
            .and_then(|t| t.get_mut(chain))
            .ok_or_else(|| invalid(table, chain, "no chain by that name"))
    }
}

fn invalid(table: &str, chain: &str, reason: &str) -> Error {
    Error::Invalid {
        table: table.to_string(),
        chain: chain.to_string(),
        reason: reason.to_string(),
    }
}

impl RuleEngine for Engine {
    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state
            .tables
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
        let mut state = self.state.lock();
        state.check_available()?;
        Ok(state.chain_mut(table, chain)?.clone())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default()
            .clear();
        state.mutations.push(Mutation::Clear {
            table: table.to_string(),
            chain: chain.to_string(),
        });
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_available()?;
        let rules = state.chain_mut(table, chain)?;
        Ok(rules.iter().any(|r| r == spec))
    }

    fn insert(&self, table: &str, chain: &str, position: usize, spec: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_spec(spec)?;
        let rules = state.chain_mut(table, chain)?;
        if position == 0 || position > rules.len() + 1 {
            return Err(invalid(table, chain, "index of insertion too big"));
        }
        rules.insert(position - 1, spec.to_vec());
        state.mutations.push(Mutation::Insert {
            table: table.to_string(),
            chain: chain.to_string(),
            position,
            spec: spec.to_vec(),
        });
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_spec(spec)?;
        state.chain_mut(table, chain)?.push(spec.to_vec());
        state.mutations.push(Mutation::Append {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: spec.to_vec(),
        });
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        let rules = state.chain_mut(table, chain)?;
        let idx = rules
            .iter()
            .position(|r| r == spec)
            .ok_or_else(|| invalid(table, chain, "no rule matches the specification"))?;
        rules.remove(idx);
        state.mutations.push(Mutation::Delete {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: spec.to_vec(),
        });
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        if !state.chain_mut(table, chain)?.is_empty() {
            return Err(invalid(table, chain, "chain is not empty"));
        }
        let referenced = state.tables.get(table).into_iter().flat_map(|t| t.values()).any(
            |rules| {
                rules
                    .iter()
                    .any(|r| r.windows(2).any(|w| w[0] == "-j" && w[1] == chain))
            },
        );
        if referenced {
            return Err(invalid(table, chain, "chain is still referenced"));
        }
        if let Some(t) = state.tables.get_mut(table) {
            t.remove(chain);
        }
        state.mutations.push(Mutation::DeleteChain {
            table: table.to_string(),
            chain: chain.to_string(),
        });
        Ok(())
    }
}
