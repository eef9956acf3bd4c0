//! Translates a [`ServiceBinding`] into the address-translation rules that expose it.

use ipnet::IpNet;
use std::{collections::BTreeSet, fmt, net::IpAddr, num::NonZeroU16};
use walden_agent_core::{BackendEndpoint, Position, Protocol, RuleRecord, ServiceBinding};

pub const NAT_TABLE: &str = "nat";

/// Holds a DNAT rule per service port and backend. Jumped to from `PREROUTING`.
pub const SERVICES_CHAIN: &str = "WALDEN-SERVICES";

/// Holds an SNAT rule per backend subnet. Jumped to from `POSTROUTING`.
pub const POSTROUTING_CHAIN: &str = "WALDEN-POSTROUTING";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NatConfig {
    /// Restricts DNAT rules to traffic arriving on this interface.
    pub ingress_interface: Option<String>,

    /// The width of the backend subnets that are source-translated. Defaults to /24 for IPv4 and
    /// /64 for IPv6.
    pub snat_prefix_len: Option<u8>,

    /// The agent manages a single address family.
    pub ipv6: bool,
}

/// Identifies what a rule matches, independent of what it does with the match.
///
/// Two different rules for the same slot would both match the same packets, so at most one of them
/// may be installed at a time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    Dnat {
        vip: IpAddr,
        protocol: Protocol,
        port: NonZeroU16,
        backend: IpAddr,
    },
    Snat(IpNet),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlannedRule {
    pub slot: Slot,
    pub record: RuleRecord,
}

/// The rules that jump from the builtin chains into the agent's chains.
pub fn jumps() -> [RuleRecord; 2] {
    [
        RuleRecord::new(
            NAT_TABLE,
            "PREROUTING",
            Position::Head,
            format!("-j {SERVICES_CHAIN}"),
        ),
        RuleRecord::new(
            NAT_TABLE,
            "POSTROUTING",
            Position::Head,
            format!("-j {POSTROUTING_CHAIN}"),
        ),
    ]
}

// === impl NatConfig ===

impl NatConfig {
    pub fn snat_prefix_len(&self) -> u8 {
        match (self.snat_prefix_len, self.ipv6) {
            (Some(len), _) => len,
            (None, false) => 24,
            (None, true) => 64,
        }
    }

    pub fn accepts(&self, addr: &IpAddr) -> bool {
        addr.is_ipv6() == self.ipv6
    }
}

/// Computes the rules a binding requires, in evaluation order.
///
/// DNAT rules are ordered by service port and then by backend, so the first backend in the
/// binding's ordering is matched first. Incomplete bindings and bindings of another address
/// family require no rules.
pub fn plan(binding: &ServiceBinding, config: &NatConfig) -> Vec<PlannedRule> {
    let Some(vip) = binding.virtual_addr else {
        return Vec::new();
    };
    if !config.accepts(&vip) {
        return Vec::new();
    }

    let id = &binding.identity;
    let vip_len = if vip.is_ipv6() { 128 } else { 32 };
    let backends = backends(binding, vip).collect::<Vec<_>>();

    let mut rules = Vec::new();
    for port in &binding.ports {
        let proto = port.protocol;
        for backend in backends.iter().filter(|b| b.serves(port)) {
            let mut spec = format!("-d {vip}/{vip_len}");
            if let Some(iface) = config.ingress_interface.as_deref() {
                spec.push_str(&format!(" -i {iface}"));
            }
            spec.push_str(&format!(
                " -p {proto} -m {proto} --dport {} -m comment --comment {id} -j DNAT --to-destination {}",
                port.port,
                backend.socket_addr(),
            ));
            rules.push(PlannedRule {
                slot: Slot::Dnat {
                    vip,
                    protocol: proto,
                    port: port.port,
                    backend: backend.addr,
                },
                record: RuleRecord::new(NAT_TABLE, SERVICES_CHAIN, Position::Tail, spec),
            });
        }
    }

    for subnet in snat_subnets(binding, config) {
        let spec = format!("-s {subnet} -m comment --comment {id} -j SNAT --to-source {vip}");
        rules.push(PlannedRule {
            slot: Slot::Snat(subnet),
            record: RuleRecord::new(NAT_TABLE, POSTROUTING_CHAIN, Position::Tail, spec),
        });
    }

    rules
}

/// The backend subnets whose return traffic a binding translates.
///
/// A subnet can only be translated to a single source address, so when several bindings claim the
/// same subnet only one of them may install its rule.
pub fn snat_subnets(binding: &ServiceBinding, config: &NatConfig) -> BTreeSet<IpNet> {
    let Some(vip) = binding.virtual_addr.filter(|vip| config.accepts(vip)) else {
        return BTreeSet::new();
    };
    backends(binding, vip)
        .filter_map(|b| IpNet::new(b.addr, config.snat_prefix_len()).ok())
        .map(|net| net.trunc())
        .collect()
}

fn backends(
    binding: &ServiceBinding,
    vip: IpAddr,
) -> impl Iterator<Item = &BackendEndpoint> + '_ {
    binding
        .backends
        .iter()
        .filter(move |b| b.addr.is_ipv6() == vip.is_ipv6())
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dnat {
                vip,
                protocol,
                port,
                backend,
            } => write!(f, "dnat {vip}:{port}/{protocol} -> {backend}"),
            Self::Snat(net) => write!(f, "snat {net}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use walden_agent_core::{ServiceIdentity, ServicePort};

    fn nz(p: u16) -> NonZeroU16 {
        NonZeroU16::new(p).unwrap()
    }

    fn mk_binding(vip: &str, ports: &[(&str, u16)], backends: &[(&str, &str, u16)]) -> ServiceBinding {
        let mut binding = ServiceBinding::new(ServiceIdentity::new("default", "web"));
        binding.virtual_addr = Some(vip.parse().unwrap());
        binding.ports = ports
            .iter()
            .map(|(name, port)| {
                let port = ServicePort::new(Protocol::Tcp, nz(*port));
                if name.is_empty() {
                    port
                } else {
                    port.named(name)
                }
            })
            .collect();
        binding.backends = backends
            .iter()
            .map(|(name, addr, port)| {
                let backend = BackendEndpoint::new(addr.parse().unwrap(), nz(*port));
                if name.is_empty() {
                    backend
                } else {
                    backend.named(name)
                }
            })
            .collect();
        binding
    }

    fn rendered(rules: &[PlannedRule]) -> Vec<String> {
        rules.iter().map(|r| r.record.to_string()).collect()
    }

    #[test]
    fn single_port_service() {
        let binding = mk_binding(
            "10.0.0.5",
            &[("", 80)],
            &[("", "10.1.0.4", 8080), ("", "10.1.0.3", 8080)],
        );
        assert_eq!(
            rendered(&plan(&binding, &NatConfig::default())),
            [
                "-t nat -A WALDEN-SERVICES -d 10.0.0.5/32 -p tcp -m tcp --dport 80 -m comment --comment default/web -j DNAT --to-destination 10.1.0.3:8080",
                "-t nat -A WALDEN-SERVICES -d 10.0.0.5/32 -p tcp -m tcp --dport 80 -m comment --comment default/web -j DNAT --to-destination 10.1.0.4:8080",
                "-t nat -A WALDEN-POSTROUTING -s 10.1.0.0/24 -m comment --comment default/web -j SNAT --to-source 10.0.0.5",
            ]
        );
    }

    #[test]
    fn named_ports_pair_with_endpoints() {
        let binding = mk_binding(
            "10.0.0.5",
            &[("http", 80), ("admin", 9990)],
            &[
                ("http", "10.1.0.3", 8080),
                ("admin", "10.1.0.3", 9091),
                ("metrics", "10.2.0.3", 9100),
            ],
        );
        let config = NatConfig {
            ingress_interface: Some("eth0".to_string()),
            ..Default::default()
        };
        assert_eq!(
            rendered(&plan(&binding, &config)),
            [
                "-t nat -A WALDEN-SERVICES -d 10.0.0.5/32 -i eth0 -p tcp -m tcp --dport 80 -m comment --comment default/web -j DNAT --to-destination 10.1.0.3:8080",
                "-t nat -A WALDEN-SERVICES -d 10.0.0.5/32 -i eth0 -p tcp -m tcp --dport 9990 -m comment --comment default/web -j DNAT --to-destination 10.1.0.3:9091",
                "-t nat -A WALDEN-POSTROUTING -s 10.1.0.0/24 -m comment --comment default/web -j SNAT --to-source 10.0.0.5",
                "-t nat -A WALDEN-POSTROUTING -s 10.2.0.0/24 -m comment --comment default/web -j SNAT --to-source 10.0.0.5",
            ]
        );
    }

    #[test]
    fn incomplete_and_foreign_bindings_need_no_rules() {
        let mut binding = mk_binding("10.0.0.5", &[("", 80)], &[("", "10.1.0.3", 8080)]);
        assert!(plan(
            &binding,
            &NatConfig {
                ipv6: true,
                ..Default::default()
            }
        )
        .is_empty());

        binding.virtual_addr = None;
        assert!(plan(&binding, &NatConfig::default()).is_empty());
    }

    #[test]
    fn ipv6_rules() {
        let binding = mk_binding(
            "fd00::5",
            &[("", 80)],
            &[("", "fd01::3", 8080), ("", "10.1.0.3", 8080)],
        );
        let config = NatConfig {
            ipv6: true,
            ..Default::default()
        };
        assert_eq!(
            rendered(&plan(&binding, &config)),
            [
                "-t nat -A WALDEN-SERVICES -d fd00::5/128 -p tcp -m tcp --dport 80 -m comment --comment default/web -j DNAT --to-destination [fd01::3]:8080",
                "-t nat -A WALDEN-POSTROUTING -s fd01::/64 -m comment --comment default/web -j SNAT --to-source fd00::5",
            ]
        );
    }

    #[test]
    fn slots_identify_matches() {
        let binding = mk_binding(
            "10.0.0.5",
            &[("", 80)],
            &[("", "10.1.0.3", 8080), ("", "10.1.0.3", 9090)],
        );
        let slots = plan(&binding, &NatConfig::default())
            .into_iter()
            .map(|r| r.slot.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            slots,
            [
                "dnat 10.0.0.5:80/tcp -> 10.1.0.3",
                "dnat 10.0.0.5:80/tcp -> 10.1.0.3",
                "snat 10.1.0.0/24"
            ]
        );
    }
}
