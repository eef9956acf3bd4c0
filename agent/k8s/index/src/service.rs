use crate::{Kind, Notification, Watched};
use std::{collections::BTreeSet, net::IpAddr, num::NonZeroU16};
use tracing::{debug, warn};
use walden_agent_core::{Protocol, ServiceIdentity, ServicePort};
use walden_agent_k8s_api as k8s;

impl Watched for k8s::Service {
    const KIND: Kind = Kind::Service;

    fn applied(self, id: ServiceIdentity) -> Notification {
        let spec = self.spec.unwrap_or_default();
        let virtual_addr = virtual_addr(&id, spec.cluster_ip.as_deref());
        let ports = spec
            .ports
            .into_iter()
            .flatten()
            .filter_map(|p| service_port(&id, p))
            .collect::<BTreeSet<_>>();

        Notification::ServiceApplied {
            id,
            virtual_addr,
            ports,
        }
    }

    fn deleted(id: ServiceIdentity) -> Notification {
        Notification::ServiceDeleted(id)
    }
}

fn virtual_addr(id: &ServiceIdentity, cluster_ip: Option<&str>) -> Option<IpAddr> {
    match cluster_ip {
        None | Some("") | Some("None") => {
            debug!(%id, "Service has no cluster IP");
            None
        }
        Some(ip) => match ip.parse() {
            Ok(addr) => Some(addr),
            Err(error) => {
                warn!(%id, %ip, %error, "Invalid cluster IP");
                None
            }
        },
    }
}

fn service_port(id: &ServiceIdentity, port: k8s::ServicePort) -> Option<ServicePort> {
    let protocol = match port.protocol.as_deref().unwrap_or("TCP").parse::<Protocol>() {
        Ok(protocol) => protocol,
        Err(error) => {
            warn!(%id, port = port.port, %error, "Ignoring service port");
            return None;
        }
    };
    let Some(number) = u16::try_from(port.port).ok().and_then(NonZeroU16::new) else {
        warn!(%id, port = port.port, "Ignoring invalid service port");
        return None;
    };

    Some(ServicePort {
        protocol,
        port: number,
        name: port.name.filter(|n| !n.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mk_service(cluster_ip: Option<&str>, ports: Vec<k8s::ServicePort>) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                cluster_ip: cluster_ip.map(Into::into),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mk_port(name: Option<&str>, protocol: Option<&str>, port: i32) -> k8s::ServicePort {
        k8s::ServicePort {
            name: name.map(Into::into),
            protocol: protocol.map(Into::into),
            port,
            ..Default::default()
        }
    }

    fn id() -> ServiceIdentity {
        ServiceIdentity::new("default", "web")
    }

    #[test]
    fn converts_cluster_ip_and_ports() {
        let svc = mk_service(
            Some("10.0.0.5"),
            vec![
                mk_port(Some("http"), None, 80),
                mk_port(Some("dns"), Some("UDP"), 53),
                mk_port(Some("bogus"), Some("ICMP"), 1),
                mk_port(Some("zero"), Some("TCP"), 0),
                mk_port(Some("huge"), Some("TCP"), 70000),
            ],
        );

        let nz = |p| NonZeroU16::new(p).unwrap();
        assert_eq!(
            svc.applied(id()),
            Notification::ServiceApplied {
                id: id(),
                virtual_addr: Some("10.0.0.5".parse().unwrap()),
                ports: [
                    ServicePort::new(Protocol::Tcp, nz(80)).named("http"),
                    ServicePort::new(Protocol::Udp, nz(53)).named("dns"),
                ]
                .into_iter()
                .collect(),
            }
        );
    }

    #[test]
    fn headless_services_have_no_virtual_addr() {
        for ip in [None, Some(""), Some("None"), Some("not-an-ip")] {
            let Notification::ServiceApplied { virtual_addr, .. } =
                mk_service(ip, vec![mk_port(None, None, 80)]).applied(id())
            else {
                panic!("unexpected notification");
            };
            assert_eq!(virtual_addr, None, "{ip:?}");
        }
    }

    #[test]
    fn empty_port_names_are_unnamed() {
        let Notification::ServiceApplied { ports, .. } =
            mk_service(Some("10.0.0.5"), vec![mk_port(Some(""), None, 80)]).applied(id())
        else {
            panic!("unexpected notification");
        };
        assert!(ports.iter().all(|p| p.name.is_none()));
    }
}
