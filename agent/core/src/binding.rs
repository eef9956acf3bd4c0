use crate::ServiceIdentity;
use std::{
    collections::BTreeSet,
    fmt,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
    str::FromStr,
};

/// The desired forwarding state for a single Service.
///
/// A binding may be created by either the Service or its Endpoints, whichever is observed first,
/// so its virtual address is absent until the Service itself has been seen. Such a binding is
/// *incomplete* and has no rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceBinding {
    pub identity: ServiceIdentity,
    pub virtual_addr: Option<IpAddr>,
    pub ports: BTreeSet<ServicePort>,

    /// Ordered by address so that the first backend is the preferred one.
    pub backends: BTreeSet<BackendEndpoint>,
}

/// A port exposed on a Service's virtual address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServicePort {
    pub protocol: Protocol,
    pub port: NonZeroU16,

    /// Pairs the service port with the endpoint ports of the same name.
    pub name: Option<String>,
}

/// An address/port pair that is currently eligible to receive a Service's traffic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendEndpoint {
    pub addr: IpAddr,
    pub port: NonZeroU16,
    pub name: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unsupported protocol: {0}")]
pub struct InvalidProtocol(String);

// === impl ServiceBinding ===

impl ServiceBinding {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            virtual_addr: None,
            ports: BTreeSet::new(),
            backends: BTreeSet::new(),
        }
    }

    /// A binding is incomplete until its Service has provided a virtual address.
    pub fn is_complete(&self) -> bool {
        self.virtual_addr.is_some()
    }

    /// Indicates whether the binding holds no state at all and may be dropped.
    pub fn is_empty(&self) -> bool {
        self.virtual_addr.is_none() && self.ports.is_empty() && self.backends.is_empty()
    }
}

// === impl BackendEndpoint ===

impl BackendEndpoint {
    pub fn new(addr: IpAddr, port: NonZeroU16) -> Self {
        Self {
            addr,
            port,
            name: None,
        }
    }

    pub fn named(self, name: impl ToString) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port.get())
    }

    /// Endpoint ports are matched to service ports by name. Unnamed ports only exist when a
    /// Service exposes a single port, in which case both names are absent.
    pub fn serves(&self, port: &ServicePort) -> bool {
        self.name == port.name
    }
}

// === impl ServicePort ===

impl ServicePort {
    pub fn new(protocol: Protocol, port: NonZeroU16) -> Self {
        Self {
            protocol,
            port,
            name: None,
        }
    }

    pub fn named(self, name: impl ToString) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            Err(InvalidProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(p: u16) -> NonZeroU16 {
        NonZeroU16::new(p).unwrap()
    }

    #[test]
    fn backends_sort_by_address() {
        let backends = [
            BackendEndpoint::new("10.1.0.4".parse().unwrap(), port(8080)),
            BackendEndpoint::new("10.1.0.3".parse().unwrap(), port(9090)),
            BackendEndpoint::new("10.1.0.3".parse().unwrap(), port(8080)),
        ]
        .into_iter()
        .collect::<BTreeSet<_>>();

        let addrs = backends
            .iter()
            .map(BackendEndpoint::socket_addr)
            .map(|sa| sa.to_string())
            .collect::<Vec<_>>();
        assert_eq!(addrs, ["10.1.0.3:8080", "10.1.0.3:9090", "10.1.0.4:8080"]);
    }

    #[test]
    fn backends_serve_ports_by_name() {
        let http = ServicePort::new(Protocol::Tcp, port(80)).named("http");
        let unnamed = ServicePort::new(Protocol::Tcp, port(80));
        let ip = "10.1.0.3".parse().unwrap();

        assert!(BackendEndpoint::new(ip, port(8080))
            .named("http")
            .serves(&http));
        assert!(!BackendEndpoint::new(ip, port(8080))
            .named("admin")
            .serves(&http));
        assert!(BackendEndpoint::new(ip, port(8080)).serves(&unnamed));
        assert!(!BackendEndpoint::new(ip, port(8080)).serves(&http));
    }

    #[test]
    fn parse_protocol() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("SCTP".parse::<Protocol>().unwrap(), Protocol::Sctp);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn incomplete_until_addressed() {
        let mut binding = ServiceBinding::new(ServiceIdentity::new("default", "web"));
        assert!(!binding.is_complete());
        assert!(binding.is_empty());

        binding.virtual_addr = Some("10.0.0.5".parse().unwrap());
        assert!(binding.is_complete());
        assert!(!binding.is_empty());
    }
}
