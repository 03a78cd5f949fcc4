//! Static port/address block lists
//!
//! Rules are parsed once from configuration into an immutable `FilterRules`
//! snapshot that the classifier reads concurrently without locking.
//! Malformed entries are logged and skipped; they never match.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::warn;

use crate::config::FilterConfig;

/// Parse one "<proto>/<port>" entry for the given protocol
///
/// Returns None when the entry is malformed or names another protocol.
fn parse_port_rule(entry: &str, proto: &str) -> Option<u16> {
    let (rule_proto, port) = entry.trim().split_once('/')?;
    if !rule_proto.trim().eq_ignore_ascii_case(proto) {
        return None;
    }
    port.trim().parse::<u16>().ok()
}

fn is_well_formed_port_rule(entry: &str) -> bool {
    match entry.trim().split_once('/') {
        Some((proto, port)) => {
            let proto = proto.trim();
            (proto.eq_ignore_ascii_case("tcp") || proto.eq_ignore_ascii_case("udp"))
                && port.trim().parse::<u16>().is_ok()
        }
        None => false,
    }
}

/// Collect the ports blocked for `proto` from a rule list
fn ports_for(list: &[String], proto: &str) -> HashSet<u16> {
    list.iter()
        .filter_map(|entry| parse_port_rule(entry, proto))
        .collect()
}

/// Collect the IP literals of a rule list, in canonical form
fn addrs_from(list: &[String]) -> HashSet<IpAddr> {
    list.iter()
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .map(|ip| ip.to_canonical())
        .collect()
}

/// Build a predicate telling whether a port is blocked for `proto`
///
/// `block_port_fn(&["tcp/22".into()], "tcp")(22)` is true; entries without a
/// slash or with a non-numeric port never match.
pub fn block_port_fn(list: &[String], proto: &str) -> impl Fn(u16) -> bool + Send + Sync {
    let ports = ports_for(list, proto);
    move |port| ports.contains(&port)
}

/// Build a predicate telling whether an address is blocked
///
/// IPv4-mapped IPv6 literals and addresses compare equal to their IPv4 form.
pub fn block_ip_fn(list: &[String]) -> impl Fn(IpAddr) -> bool + Send + Sync {
    let addrs = addrs_from(list);
    move |ip| addrs.contains(&ip.to_canonical())
}

/// Interpret a raw 4- or 16-byte address
pub fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let b: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(b)))
        }
        16 => {
            let b: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

/// Immutable snapshot of every block list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    tcp_ports: HashSet<u16>,
    udp_ports: HashSet<u16>,
    src_addrs: HashSet<IpAddr>,
    dst_addrs: HashSet<IpAddr>,
}

impl FilterRules {
    /// Rules that block nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the configured block lists, logging and skipping malformed entries
    pub fn from_config(config: &FilterConfig) -> Self {
        for entry in &config.blocked_ports {
            if !is_well_formed_port_rule(entry) {
                warn!("Skipping malformed port filter {:?} (expected <proto>/<port>)", entry);
            }
        }
        for entry in config
            .blocked_sources
            .iter()
            .chain(config.blocked_destinations.iter())
        {
            if entry.trim().parse::<IpAddr>().is_err() {
                warn!("Skipping malformed address filter {:?}", entry);
            }
        }

        Self {
            tcp_ports: ports_for(&config.blocked_ports, "tcp"),
            udp_ports: ports_for(&config.blocked_ports, "udp"),
            src_addrs: addrs_from(&config.blocked_sources),
            dst_addrs: addrs_from(&config.blocked_destinations),
        }
    }

    pub fn blocks_tcp_port(&self, port: u16) -> bool {
        self.tcp_ports.contains(&port)
    }

    pub fn blocks_udp_port(&self, port: u16) -> bool {
        self.udp_ports.contains(&port)
    }

    pub fn blocks_src(&self, ip: IpAddr) -> bool {
        !self.src_addrs.is_empty() && self.src_addrs.contains(&ip.to_canonical())
    }

    pub fn blocks_dst(&self, ip: IpAddr) -> bool {
        !self.dst_addrs.is_empty() && self.dst_addrs.contains(&ip.to_canonical())
    }

    /// Total number of valid rules
    pub fn len(&self) -> usize {
        self.tcp_ports.len() + self.udp_ports.len() + self.src_addrs.len() + self.dst_addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tcp_port_count(&self) -> usize {
        self.tcp_ports.len()
    }

    pub fn udp_port_count(&self) -> usize {
        self.udp_ports.len()
    }

    pub fn address_count(&self) -> usize {
        self.src_addrs.len() + self.dst_addrs.len()
    }
}
