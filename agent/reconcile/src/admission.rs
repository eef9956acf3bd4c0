//! Restricts access to selected ports by link-layer source address.
//!
//! ```text
//! INPUT -j port_jump
//! port_jump: -p <proto> --dport <port> -j mac_filter
//! mac_filter: -m mac --mac-source <mac> -j ACCEPT ... -j DROP
//! ```
//!
//! Both chains are derived entirely from static configuration. They are rebuilt from scratch
//! whenever the agent starts.

use crate::Error;
use tracing::{debug, info};
use walden_agent_core::{
    engine, ports::PortList, MacAddr, Position, Protocol, RuleEngine, RuleRecord,
};

pub const FILTER_TABLE: &str = "filter";
pub const MAC_FILTER_CHAIN: &str = "mac_filter";
pub const PORT_JUMP_CHAIN: &str = "port_jump";
const INPUT_CHAIN: &str = "INPUT";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Link-layer addresses that may reach the filtered ports.
    pub macs: Vec<MacAddr>,

    /// Ports subject to filtering. The filter is disabled when empty.
    pub ports: PortList,

    pub protocols: Vec<Protocol>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            macs: Vec::new(),
            ports: PortList::new(),
            protocols: vec![Protocol::Tcp, Protocol::Udp],
        }
    }
}

// === impl AdmissionConfig ===

impl AdmissionConfig {
    pub fn is_enabled(&self) -> bool {
        !self.ports.is_empty()
    }

    /// The `mac_filter` chain's rules in evaluation order: every allowed address, then the default
    /// deny.
    pub fn mac_filter(&self) -> Vec<RuleRecord> {
        self.macs
            .iter()
            .map(|mac| format!("-m mac --mac-source {mac} -j ACCEPT"))
            .chain(Some("-j DROP".to_string()))
            .map(|spec| RuleRecord::new(FILTER_TABLE, MAC_FILTER_CHAIN, Position::Tail, spec))
            .collect()
    }

    pub fn port_jump(&self) -> Vec<RuleRecord> {
        let mut rules = Vec::new();
        for port in &self.ports {
            for proto in &self.protocols {
                rules.push(RuleRecord::new(
                    FILTER_TABLE,
                    PORT_JUMP_CHAIN,
                    Position::Tail,
                    format!("-p {proto} --dport {port} -j {MAC_FILTER_CHAIN}"),
                ));
            }
        }
        rules
    }

    pub fn input_jump() -> RuleRecord {
        RuleRecord::new(
            FILTER_TABLE,
            INPUT_CHAIN,
            Position::Tail,
            format!("-j {PORT_JUMP_CHAIN}"),
        )
    }
}

/// Installs the admission filter.
///
/// `mac_filter` is populated before `port_jump` so that nothing jumps into a chain that doesn't
/// exist yet. Safe to repeat: both chains are cleared first and the `INPUT` jump is only added
/// when absent.
pub fn install<E: RuleEngine + ?Sized>(engine: &E, config: &AdmissionConfig) -> Result<(), Error> {
    if !config.is_enabled() {
        debug!("Admission filter disabled");
        return Ok(());
    }

    populate(engine, MAC_FILTER_CHAIN, &config.mac_filter())?;
    populate(engine, PORT_JUMP_CHAIN, &config.port_jump())?;

    let jump = AdmissionConfig::input_jump();
    let installed = jump.is_installed(engine).and_then(|installed| {
        if !installed {
            jump.install(engine)?;
        }
        Ok(())
    });
    installed.map_err(|source| Error::Admission {
        chain: INPUT_CHAIN,
        source,
    })?;

    info!(
        macs = config.macs.len(),
        ports = config.ports.len(),
        "Admission filter installed"
    );
    Ok(())
}

fn populate<E: RuleEngine + ?Sized>(
    engine: &E,
    chain: &'static str,
    rules: &[RuleRecord],
) -> Result<(), Error> {
    let populated: engine::Result<()> = (|| {
        engine.clear_chain(FILTER_TABLE, chain)?;
        for rule in rules {
            debug!(%rule, "Appending rule");
            rule.install(engine)?;
        }
        Ok(())
    })();
    populated.map_err(|source| Error::Admission { chain, source })
}
