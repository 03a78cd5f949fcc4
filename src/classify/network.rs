//! Network layer decoding (IPv4, IPv6, ARP)
//!
//! Every function returns None on a header it cannot trust; callers treat
//! that as "stop decoding, let the frame through".

use std::net::{IpAddr, Ipv4Addr};

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};

use crate::core::MacAddr;

pub(crate) const IPV6_HEADER_LEN: usize = 40;
pub(crate) const ARP_PACKET_LEN: usize = 28;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
pub(crate) const ARP_OP_REQUEST: u16 = 1;
pub(crate) const ARP_OP_REPLY: u16 = 2;

/// Decoded IP header with the payload trimmed to the declared length
#[derive(Debug, Clone, Copy)]
pub(crate) struct IpHeader<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Next-protocol id
    pub protocol: u8,
    pub identification: Option<u16>,
    pub fragment_offset: u16,
    pub more_fragments: bool,
    pub payload: &'a [u8],
}

/// Validate and decode an IPv4 header
///
/// Rejects headers whose IHL or total length disagree with the buffer.
pub(crate) fn parse_ipv4(data: &[u8]) -> Option<IpHeader<'_>> {
    let header = Ipv4HeaderSlice::from_slice(data).ok()?;
    let header_len = header.slice().len();
    let total_len = usize::from(header.total_len());
    if total_len < header_len || total_len > data.len() {
        return None;
    }

    Some(IpHeader {
        src: IpAddr::V4(header.source_addr()),
        dst: IpAddr::V4(header.destination_addr()),
        protocol: header.protocol().0,
        identification: Some(header.identification()),
        fragment_offset: header.fragments_offset().value(),
        more_fragments: header.more_fragments(),
        payload: &data[header_len..total_len],
    })
}

/// Validate and decode a fixed IPv6 header
///
/// Extension headers are not walked; their id is reported as the transport.
pub(crate) fn parse_ipv6(data: &[u8]) -> Option<IpHeader<'_>> {
    let header = Ipv6HeaderSlice::from_slice(data).ok()?;
    let end = IPV6_HEADER_LEN + usize::from(header.payload_length());
    if end > data.len() {
        return None;
    }

    Some(IpHeader {
        src: IpAddr::V6(header.source_addr()),
        dst: IpAddr::V6(header.destination_addr()),
        protocol: header.next_header().0,
        identification: None,
        fragment_offset: 0,
        more_fragments: false,
        payload: &data[IPV6_HEADER_LEN..end],
    })
}

/// ARP packet for Ethernet/IPv4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArpPacket {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
    /// Hardware/protocol types and address sizes match Ethernet/IPv4
    pub valid: bool,
}

impl ArpPacket {
    pub fn op_valid(&self) -> bool {
        self.op == ARP_OP_REQUEST || self.op == ARP_OP_REPLY
    }

    pub fn op_name(&self) -> &'static str {
        match self.op {
            ARP_OP_REQUEST => "request",
            ARP_OP_REPLY => "reply",
            _ => "unknown",
        }
    }
}

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn mac_at(data: &[u8], at: usize) -> MacAddr {
    let mut b = [0u8; 6];
    b.copy_from_slice(&data[at..at + 6]);
    MacAddr(b)
}

fn ipv4_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

/// Decode an ARP packet; None when shorter than the Ethernet/IPv4 layout
pub(crate) fn parse_arp(data: &[u8]) -> Option<ArpPacket> {
    if data.len() < ARP_PACKET_LEN {
        return None;
    }

    let hardware_type = be16(data, 0);
    let protocol_type = be16(data, 2);
    let hlen = data[4];
    let plen = data[5];

    Some(ArpPacket {
        hardware_type,
        protocol_type,
        op: be16(data, 6),
        sender_mac: mac_at(data, 8),
        sender_ip: ipv4_at(data, 14),
        target_mac: mac_at(data, 18),
        target_ip: ipv4_at(data, 24),
        valid: hardware_type == ARP_HTYPE_ETHERNET
            && protocol_type == ARP_PTYPE_IPV4
            && hlen == 6
            && plen == 4,
    })
}
