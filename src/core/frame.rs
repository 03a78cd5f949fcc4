//! Link-layer frames as delivered by the virtual stack
//!
//! A `Frame` holds the network-layer bytes of one inbound packet together with
//! the parsed link header (if the NIC has one) and the id of the NIC it arrived on.

use std::fmt;
use std::str::FromStr;

use etherparse::Ethernet2HeaderSlice;
use serde::{Deserialize, Serialize};

/// Identifier of a NIC inside the virtual stack
pub type NicId = u32;

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(b: [u8; 6]) -> Self {
        MacAddr(b)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("hardware address too short: {}", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid hardware address octet {:?} in {}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(format!("hardware address too long: {}", s));
        }
        Ok(MacAddr(out))
    }
}

/// Network protocol numbers carried in the EtherType field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtherType {
    Ipv4,
    Arp,
    Ipv6,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(val: u16) -> Self {
        match val {
            0x0800 => EtherType::Ipv4,
            0x0806 => EtherType::Arp,
            0x86dd => EtherType::Ipv6,
            other => EtherType::Unknown(other),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(val: EtherType) -> Self {
        match val {
            EtherType::Ipv4 => 0x0800,
            EtherType::Arp => 0x0806,
            EtherType::Ipv6 => 0x86dd,
            EtherType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::Ipv4 => write!(f, "IPv4"),
            EtherType::Arp => write!(f, "ARP"),
            EtherType::Ipv6 => write!(f, "IPv6"),
            EtherType::Unknown(n) => write!(f, "EtherType(0x{:04x})", n),
        }
    }
}

/// Parsed link header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkHeader {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ether_type: EtherType,
}

/// One packet handed over by the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// NIC the frame arrived on
    pub nic: NicId,
    /// Link header, absent on NICs without one (tun-style)
    pub link: Option<LinkHeader>,
    /// Network-layer bytes (link header already stripped)
    pub data: Vec<u8>,
}

impl Frame {
    /// Frame without a link header
    pub fn new(nic: NicId, data: Vec<u8>) -> Self {
        Self {
            nic,
            link: None,
            data,
        }
    }

    pub fn with_link(nic: NicId, link: LinkHeader, data: Vec<u8>) -> Self {
        Self {
            nic,
            link: Some(link),
            data,
        }
    }

    /// Split a raw Ethernet II frame into link header and network payload
    ///
    /// Returns None if the buffer is shorter than an Ethernet header.
    pub fn from_ethernet(nic: NicId, raw: &[u8]) -> Option<Self> {
        let eth = Ethernet2HeaderSlice::from_slice(raw).ok()?;
        let link = LinkHeader {
            src: MacAddr(eth.source()),
            dst: MacAddr(eth.destination()),
            ether_type: EtherType::from(eth.ether_type().0),
        };
        let data = raw[eth.slice().len()..].to_vec();
        Some(Self::with_link(nic, link, data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn src_mac(&self) -> Option<MacAddr> {
        self.link.map(|l| l.src)
    }

    pub fn dst_mac(&self) -> Option<MacAddr> {
        self.link.map(|l| l.dst)
    }

    /// EtherType announced by the link header, if any
    pub fn ether_type(&self) -> Option<EtherType> {
        self.link.map(|l| l.ether_type)
    }
}
