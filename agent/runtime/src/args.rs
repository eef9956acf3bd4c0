use crate::{
    core::{ports::parse_portlist, MacAddr, Protocol},
    index::{self, NamespaceFilter},
    iptables::IpTables,
    k8s,
    reconcile::{admission, AdmissionConfig, Agent, Metrics, NatConfig},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "walden-agent",
    about = "Exposes cluster Services through the node's packet filter"
)]
pub struct Args {
    #[clap(long, default_value = "walden=info,warn", env = "WALDEN_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// A comma-separated list of namespaces whose Services are exposed.
    #[clap(long, default_value = "default")]
    namespaces: NamespaceFilter,

    /// Only translates traffic arriving on this interface.
    #[clap(long)]
    ingress_interface: Option<String>,

    /// The prefix length of the backend subnets that are source-translated.
    ///
    /// Defaults to 24 for IPv4 and 64 for IPv6.
    #[clap(long)]
    snat_prefix_len: Option<u8>,

    /// Manages IPv6 rules instead of IPv4 rules.
    #[clap(long)]
    ipv6: bool,

    /// Seconds between full reconciliation passes when nothing changes.
    #[clap(long = "resync-interval", default_value = "30")]
    resync_interval_secs: u64,

    /// Seconds to wait for the initial Service and Endpoints listings.
    #[clap(long = "sync-timeout", default_value = "60")]
    sync_timeout_secs: u64,

    /// Link-layer addresses admitted to the filtered ports.
    #[clap(long)]
    admission_macs: Option<Macs>,

    /// Ports that only admitted addresses may reach. The filter is disabled when empty.
    #[clap(long, default_value = "")]
    admission_ports: String,

    #[clap(long, default_value = "tcp,udp")]
    admission_protocols: Protocols,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespaces,
            ingress_interface,
            snat_prefix_len,
            ipv6,
            resync_interval_secs,
            sync_timeout_secs,
            admission_macs,
            admission_ports,
            admission_protocols: Protocols(protocols),
        } = self;

        let nat = nat_config(ingress_interface, snat_prefix_len, ipv6)?;
        let admission = AdmissionConfig {
            macs: admission_macs.map(|Macs(macs)| macs).unwrap_or_default(),
            ports: parse_portlist(&admission_ports)?,
            protocols,
        };

        let mut prom = <Registry>::default();
        let reg = prom.sub_registry_with_prefix("walden");
        let engine = Arc::new(IpTables::new(ipv6)?);
        let agent = Agent::new(
            engine.clone(),
            nat,
            Duration::from_secs(resync_interval_secs),
            Metrics::register(reg),
        );
        index::metrics::register(reg, agent.store());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(namespaces = ?namespaces.namespaces(), ipv6, "Starting");

        // The admission filter is static: it is installed once, before any Service is exposed.
        admission::install(&engine, &admission)?;

        let mut handle = agent.start(&CancellationToken::new());

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        handle.watch(services, namespaces.clone());

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        handle.watch(endpoints, namespaces);

        if let Err(error) = handle
            .synced(Duration::from_secs(sync_timeout_secs))
            .await
        {
            handle.stop();
            handle.wait().await;
            return Err(error.into());
        }

        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                let release = drain.signaled().await;
                release
                    .release_after(async move {
                        handle.stop();
                        handle.wait().await;
                    })
                    .await;
            }
            .instrument(info_span!("agent")),
        );

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn nat_config(
    ingress_interface: Option<String>,
    snat_prefix_len: Option<u8>,
    ipv6: bool,
) -> Result<NatConfig> {
    let max = if ipv6 { 128 } else { 32 };
    if let Some(len) = snat_prefix_len {
        if len > max {
            bail!("--snat-prefix-len must not exceed {max}");
        }
    }
    Ok(NatConfig {
        ingress_interface: ingress_interface.filter(|i| !i.is_empty()),
        snat_prefix_len,
        ipv6,
    })
}

#[derive(Clone, Debug)]
struct Macs(Vec<MacAddr>);

impl std::str::FromStr for Macs {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| m.parse().map_err(Into::into))
            .collect::<Result<Vec<MacAddr>>>()
            .map(Self)
    }
}

#[derive(Clone, Debug)]
struct Protocols(Vec<Protocol>);

impl std::str::FromStr for Protocols {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut protocols = Vec::new();
        for p in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let p = p.parse::<Protocol>()?;
            if !protocols.contains(&p) {
                protocols.push(p);
            }
        }
        if protocols.is_empty() {
            bail!("at least one protocol must be specified");
        }
        Ok(Self(protocols))
    }
}
