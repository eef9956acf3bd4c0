//! The packet filter's rule tables.

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The rule tables could not be reached or the underlying command failed.
    #[error("rule engine unavailable: {0}")]
    Unavailable(String),

    /// The operation does not make sense against the current tables, e.g. deleting a chain that
    /// still holds rules.
    #[error("invalid operation on {table}/{chain}: {reason}")]
    Invalid {
        table: String,
        chain: String,
        reason: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A mutable, shared packet filter.
///
/// All operations are synchronous and there is no transaction primitive: callers that need a
/// multi-step read-modify-write must serialize it themselves. Rules are ordered token lists and
/// the engine does not deduplicate identical rules.
pub trait RuleEngine: Send + Sync {
    fn list_chains(&self, table: &str) -> Result<Vec<String>>;

    /// Lists the rules in `chain` in evaluation order.
    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>>;

    /// Flushes all rules from `chain`, creating it if it doesn't exist.
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()>;

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool>;

    /// Inserts a rule at the 1-based `position` in `chain`.
    fn insert(&self, table: &str, chain: &str, position: usize, spec: &[String]) -> Result<()>;

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;

    /// Deletes the first rule in `chain` that matches `spec`.
    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;

    /// Deletes an empty, unreferenced chain.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;
}

impl<E: RuleEngine + ?Sized> RuleEngine for Arc<E> {
    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        (**self).list_chains(table)
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
        (**self).list_rules(table, chain)
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        (**self).clear_chain(table, chain)
    }

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        (**self).exists(table, chain, spec)
    }

    fn insert(&self, table: &str, chain: &str, position: usize, spec: &[String]) -> Result<()> {
        (**self).insert(table, chain, position, spec)
    }

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        (**self).append(table, chain, spec)
    }

    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        (**self).delete(table, chain, spec)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        (**self).delete_chain(table, chain)
    }
}
