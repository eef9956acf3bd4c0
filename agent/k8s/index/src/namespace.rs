use std::{str::FromStr, sync::Arc};

/// Limits the agent to objects in a fixed set of namespaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceFilter(Arc<[String]>);

#[derive(Debug, thiserror::Error)]
#[error("at least one namespace must be specified")]
pub struct EmptyNamespaces(());

// === impl NamespaceFilter ===

impl NamespaceFilter {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let mut namespaces = namespaces
            .into_iter()
            .map(|ns| ns.to_string())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        Self(namespaces.into())
    }

    pub fn accept(&self, namespace: &str) -> bool {
        self.0.iter().any(|ns| ns == namespace)
    }

    pub fn namespaces(&self) -> &[String] {
        &self.0
    }
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        Self::new(["default"])
    }
}

impl FromStr for NamespaceFilter {
    type Err = EmptyNamespaces;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let namespaces = s
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .collect::<Vec<_>>();
        if namespaces.is_empty() {
            return Err(EmptyNamespaces(()));
        }
        Ok(Self::new(namespaces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_default_namespace() {
        let filter = NamespaceFilter::default();
        assert!(filter.accept("default"));
        assert!(!filter.accept("kube-system"));
        assert!(!filter.accept(""));
    }

    #[test]
    fn parses_namespace_list() {
        let filter = "web, default,web".parse::<NamespaceFilter>().unwrap();
        assert_eq!(filter.namespaces(), ["default", "web"]);
        assert!(filter.accept("web"));
        assert!(!filter.accept("Web"));

        assert!(" , ".parse::<NamespaceFilter>().is_err());
    }
}
