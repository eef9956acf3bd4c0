use anyhow::{bail, Context, Result};
use std::{collections::BTreeSet, num::NonZeroU16};

/// An ordered set of ports.
///
/// Rules generated from a port list are installed in port order, so an ordered set keeps the
/// resulting chains stable across restarts.
pub type PortList = BTreeSet<NonZeroU16>;

/// Read a comma-separated list of ports or port ranges from the given string.
pub fn parse_portlist(s: &str) -> Result<PortList> {
    let mut ports = PortList::new();

    for spec in s.split(',') {
        match spec.split_once('-') {
            None => {
                if !spec.trim().is_empty() {
                    let port = spec.trim().parse().context("parsing port")?;
                    ports.insert(port);
                }
            }
            Some((floor, ceil)) => {
                let floor = floor.trim().parse::<NonZeroU16>().context("parsing port")?;
                let ceil = ceil.trim().parse::<NonZeroU16>().context("parsing port")?;
                if floor > ceil {
                    bail!("Port range must be increasing");
                }
                ports.extend((floor.get()..=ceil.get()).filter_map(NonZeroU16::new));
            }
        }
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! ports {
        ($($x:expr),+ $(,)?) => (
            vec![$($x),+]
                .into_iter()
                .map(NonZeroU16::try_from)
                .collect::<Result<PortList, _>>()
                .unwrap()
        );
    }

    #[test]
    fn parse_portlist() {
        use super::parse_portlist;

        assert!(parse_portlist("").unwrap().is_empty(), "empty");
        assert!(parse_portlist("0").is_err(), "0");
        assert_eq!(parse_portlist("80").unwrap(), ports![80], "80");
        assert_eq!(parse_portlist("1-3").unwrap(), ports![1, 2, 3], "1-3");
        assert_eq!(parse_portlist("443, 80").unwrap(), ports![80, 443], "443, 80");
        assert!(parse_portlist("2-1").is_err(), "2-1");
        assert!(parse_portlist("2-").is_err(), "2-");
        assert!(parse_portlist("65537").is_err(), "65537");
    }
}
