use crate::{Kind, Notification, Watched};
use std::{collections::BTreeSet, net::IpAddr, num::NonZeroU16};
use tracing::warn;
use walden_agent_core::{BackendEndpoint, ServiceIdentity};
use walden_agent_k8s_api as k8s;

impl Watched for k8s::Endpoints {
    const KIND: Kind = Kind::Endpoints;

    /// Only ready addresses are eligible. Every address in a subset serves every port of that
    /// subset.
    fn applied(self, id: ServiceIdentity) -> Notification {
        let mut backends = BTreeSet::new();
        for subset in self.subsets.into_iter().flatten() {
            let ports = subset
                .ports
                .into_iter()
                .flatten()
                .filter_map(|p| endpoint_port(&id, p))
                .collect::<Vec<_>>();

            for addr in subset.addresses.into_iter().flatten() {
                let ip = match addr.ip.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(error) => {
                        warn!(%id, ip = %addr.ip, %error, "Ignoring invalid endpoint address");
                        continue;
                    }
                };
                backends.extend(ports.iter().map(|(port, name)| BackendEndpoint {
                    addr: ip,
                    port: *port,
                    name: name.clone(),
                }));
            }
        }

        Notification::EndpointsApplied { id, backends }
    }

    fn deleted(id: ServiceIdentity) -> Notification {
        Notification::EndpointsDeleted(id)
    }
}

fn endpoint_port(
    id: &ServiceIdentity,
    port: k8s::EndpointPort,
) -> Option<(NonZeroU16, Option<String>)> {
    let Some(number) = u16::try_from(port.port).ok().and_then(NonZeroU16::new) else {
        warn!(%id, port = port.port, "Ignoring invalid endpoint port");
        return None;
    };
    Some((number, port.name.filter(|n| !n.is_empty())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mk_endpoints(subsets: Vec<k8s::EndpointSubset>) -> k8s::Endpoints {
        k8s::Endpoints {
            metadata: k8s::ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            subsets: Some(subsets),
        }
    }

    fn mk_subset(ready: &[&str], not_ready: &[&str], ports: &[(&str, i32)]) -> k8s::EndpointSubset {
        let addrs = |ips: &[&str]| {
            ips.iter()
                .map(|ip| k8s::EndpointAddress {
                    ip: ip.to_string(),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        };
        k8s::EndpointSubset {
            addresses: Some(addrs(ready)),
            not_ready_addresses: Some(addrs(not_ready)),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| k8s::EndpointPort {
                        name: Some(name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    fn backends(n: Notification) -> Vec<String> {
        let Notification::EndpointsApplied { backends, .. } = n else {
            panic!("unexpected notification: {n:?}");
        };
        backends
            .into_iter()
            .map(|b| format!("{}/{}", b.socket_addr(), b.name.unwrap_or_default()))
            .collect()
    }

    #[test]
    fn ready_addresses_serve_subset_ports() {
        let endpoints = mk_endpoints(vec![
            mk_subset(
                &["10.1.0.4", "10.1.0.3"],
                &["10.1.0.9"],
                &[("http", 8080), ("admin", 9990)],
            ),
            mk_subset(&["10.1.0.5"], &[], &[("http", 8081)]),
        ]);

        assert_eq!(
            backends(endpoints.applied(ServiceIdentity::new("default", "web"))),
            [
                "10.1.0.3:8080/http",
                "10.1.0.3:9990/admin",
                "10.1.0.4:8080/http",
                "10.1.0.4:9990/admin",
                "10.1.0.5:8081/http",
            ]
        );
    }

    #[test]
    fn no_subsets_means_no_backends() {
        let endpoints = k8s::Endpoints {
            metadata: k8s::ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            subsets: None,
        };
        assert!(backends(endpoints.applied(ServiceIdentity::new("default", "web"))).is_empty());
    }

    #[test]
    fn invalid_addresses_and_ports_are_skipped() {
        let endpoints = mk_endpoints(vec![mk_subset(
            &["10.1.0.3", "bogus"],
            &[],
            &[("http", 8080), ("zero", 0)],
        )]);
        assert_eq!(
            backends(endpoints.applied(ServiceIdentity::new("default", "web"))),
            ["10.1.0.3:8080/http"]
        );
    }
}
