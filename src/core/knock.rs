//! Probe records
//!
//! A `Knock` is emitted for every inbound frame carrying a recognized
//! transport header, whatever the filter verdict, so that scans against
//! blocked ports stay visible.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use super::frame::{MacAddr, NicId};

/// What was probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum KnockKind {
    Icmp { ip_version: u8 },
    Udp { port: u16 },
    Tcp { port: u16 },
}

impl KnockKind {
    pub fn protocol(&self) -> &'static str {
        match self {
            KnockKind::Icmp { .. } => "icmp",
            KnockKind::Udp { .. } => "udp",
            KnockKind::Tcp { .. } => "tcp",
        }
    }

    /// Destination port for TCP/UDP knocks
    pub fn port(&self) -> Option<u16> {
        match self {
            KnockKind::Icmp { .. } => None,
            KnockKind::Udp { port } | KnockKind::Tcp { port } => Some(*port),
        }
    }
}

impl fmt::Display for KnockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnockKind::Icmp { ip_version } => write!(f, "icmpv{}", ip_version),
            KnockKind::Udp { port } => write!(f, "udp/{}", port),
            KnockKind::Tcp { port } => write!(f, "tcp/{}", port),
        }
    }
}

/// One observed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Knock {
    pub kind: KnockKind,
    /// Prober hardware address, if the NIC has a link header
    pub src_mac: Option<MacAddr>,
    /// Prober network address
    pub src_ip: Option<IpAddr>,
    pub nic: NicId,
}

impl fmt::Display for Knock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = self
            .src_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "?".to_string());
        match self.src_mac {
            Some(mac) => write!(f, "{} from {} ({}) on nic {}", self.kind, ip, mac, self.nic),
            None => write!(f, "{} from {} on nic {}", self.kind, ip, self.nic),
        }
    }
}
