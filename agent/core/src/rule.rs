use crate::engine::{self, RuleEngine};
use std::fmt;

/// Where a rule is placed in its chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Position {
    /// Inserted as the first rule so it is evaluated before anything already in the chain.
    Head,
    /// Appended after every existing rule.
    Tail,
}

/// A single packet filter rule as the agent installs it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleRecord {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
    pub position: Position,
}

// === impl RuleRecord ===

impl RuleRecord {
    pub fn new(
        table: &'static str,
        chain: &'static str,
        position: Position,
        spec: impl AsRef<str>,
    ) -> Self {
        Self {
            table,
            chain,
            position,
            spec: spec.as_ref().split_whitespace().map(String::from).collect(),
        }
    }

    pub fn is_installed<E: RuleEngine + ?Sized>(&self, engine: &E) -> engine::Result<bool> {
        engine.exists(self.table, self.chain, &self.spec)
    }

    pub fn install<E: RuleEngine + ?Sized>(&self, engine: &E) -> engine::Result<()> {
        match self.position {
            Position::Head => engine.insert(self.table, self.chain, 1, &self.spec),
            Position::Tail => engine.append(self.table, self.chain, &self.spec),
        }
    }

    pub fn uninstall<E: RuleEngine + ?Sized>(&self, engine: &E) -> engine::Result<()> {
        engine.delete(self.table, self.chain, &self.spec)
    }
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.position {
            Position::Head => "-I",
            Position::Tail => "-A",
        };
        write!(f, "-t {} {} {} {}", self.table, op, self.chain, self.spec.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    #[test]
    fn tokenizes_spec() {
        let rule = RuleRecord::new("filter", "mac_filter", Position::Tail, "-j  DROP");
        assert_eq!(rule.spec, ["-j", "DROP"]);
        assert_eq!(rule.to_string(), "-t filter -A mac_filter -j DROP");
    }

    #[test]
    fn head_rules_are_inserted_first() {
        let engine = mock::Engine::default();
        RuleRecord::new("filter", "INPUT", Position::Tail, "-j ACCEPT")
            .install(&engine)
            .unwrap();
        let jump = RuleRecord::new("filter", "INPUT", Position::Head, "-j port_jump");
        jump.install(&engine).unwrap();

        assert!(jump.is_installed(&engine).unwrap());
        assert_eq!(
            engine.rules("filter", "INPUT"),
            vec![jump.spec.clone(), vec!["-j".to_string(), "ACCEPT".to_string()]]
        );

        jump.uninstall(&engine).unwrap();
        assert!(!jump.is_installed(&engine).unwrap());
    }
}
