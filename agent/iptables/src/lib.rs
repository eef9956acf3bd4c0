//! A [`RuleEngine`] backed by the host's `iptables`/`ip6tables` binaries.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use tracing::debug;
use walden_agent_core::engine::{Error, Result, RuleEngine};

pub struct IpTables {
    inner: iptables::IPTables,
    ipv6: bool,
}

// === impl IpTables ===

impl IpTables {
    /// Locates the `iptables` (or `ip6tables`) binary and probes its capabilities.
    pub fn new(ipv6: bool) -> Result<Self> {
        let inner = iptables::new(ipv6).map_err(unavailable)?;
        Ok(Self { inner, ipv6 })
    }

    pub fn is_ipv6(&self) -> bool {
        self.ipv6
    }
}

impl std::fmt::Debug for IpTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpTables")
            .field("ipv6", &self.ipv6)
            .finish_non_exhaustive()
    }
}

impl RuleEngine for IpTables {
    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        self.inner.list_chains(table).map_err(unavailable)
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
        let lines = self.inner.list(table, chain).map_err(unavailable)?;
        Ok(lines.iter().filter_map(|line| parse_rule(chain, line)).collect())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        if self.inner.chain_exists(table, chain).map_err(unavailable)? {
            debug!(%table, %chain, "Flushing chain");
            self.inner.flush_chain(table, chain).map_err(unavailable)
        } else {
            debug!(%table, %chain, "Creating chain");
            self.inner.new_chain(table, chain).map_err(unavailable)
        }
    }

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        self.inner
            .exists(table, chain, &spec.join(" "))
            .map_err(unavailable)
    }

    fn insert(&self, table: &str, chain: &str, position: usize, spec: &[String]) -> Result<()> {
        let position = i32::try_from(position).map_err(|_| Error::Invalid {
            table: table.to_string(),
            chain: chain.to_string(),
            reason: format!("position {position} out of range"),
        })?;
        self.inner
            .insert(table, chain, &spec.join(" "), position)
            .map_err(unavailable)
    }

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.inner
            .append(table, chain, &spec.join(" "))
            .map_err(unavailable)
    }

    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.inner
            .delete(table, chain, &spec.join(" "))
            .map_err(unavailable)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        // `iptables -S` lists the chain's policy or declaration followed by its `-A` rules.
        let lines = self.inner.list(table, chain).map_err(unavailable)?;
        if lines.iter().any(|line| parse_rule(chain, line).is_some()) {
            return Err(Error::Invalid {
                table: table.to_string(),
                chain: chain.to_string(),
                reason: "chain is not empty".to_string(),
            });
        }
        self.inner.delete_chain(table, chain).map_err(unavailable)
    }
}

/// The `iptables` crate reports every failure as a boxed error carrying the command's output.
fn unavailable(error: Box<dyn std::error::Error>) -> Error {
    Error::Unavailable(error.to_string())
}

/// Extracts a rule's tokens from an `iptables -S` line, skipping chain declarations and policies.
///
/// Quotes are stripped from quoted arguments such as comments.
fn parse_rule(chain: &str, line: &str) -> Option<Vec<String>> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("-A") || tokens.next() != Some(chain) {
        return None;
    }
    Some(tokens.map(|t| t.trim_matches('"').to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listed_rules() {
        assert_eq!(parse_rule("WALDEN-SERVICES", "-N WALDEN-SERVICES"), None);
        assert_eq!(parse_rule("INPUT", "-P INPUT ACCEPT"), None);
        assert_eq!(
            parse_rule(
                "WALDEN-POSTROUTING",
                "-A WALDEN-POSTROUTING -s 10.1.0.0/24 -m comment --comment \"default/web\" -j SNAT --to-source 10.0.0.5",
            ),
            Some(
                "-s 10.1.0.0/24 -m comment --comment default/web -j SNAT --to-source 10.0.0.5"
                    .split_whitespace()
                    .map(String::from)
                    .collect()
            )
        );
        assert_eq!(parse_rule("INPUT", "-A FORWARD -j DROP"), None);
    }
}
