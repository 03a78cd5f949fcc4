//! Transport layer decoding (TCP, UDP, ICMP)

use std::fmt;

use etherparse::{TcpHeaderSlice, UdpHeaderSlice};
use serde::{Serialize, Serializer};

pub(crate) const TCP_MIN_HEADER: usize = 20;
pub(crate) const UDP_HEADER: usize = 8;
pub(crate) const ICMPV4_MIN_HEADER: usize = 8;
pub(crate) const ICMPV6_MIN_HEADER: usize = 4;

const TCP_OPT_EOL: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;
const TCP_OPT_WS: u8 = 3;
const TCP_OPT_SACK_PERMITTED: u8 = 4;
const TCP_OPT_SACK: u8 = 5;
const TCP_OPT_TS: u8 = 8;

/// TCP control bits (FIN..URG in the low six bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_syn(&self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

/// Fixed six-letter rendering, unset bits blanked: "FSRPAU"
impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(6);
        for (i, letter) in "FSRPAU".chars().enumerate() {
            s.push(if self.0 & (1 << i) != 0 { letter } else { ' ' });
        }
        f.write_str(&s)
    }
}

impl Serialize for TcpFlags {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// Options negotiated on a SYN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SynOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamp: Option<(u32, u32)>,
}

impl fmt::Display for SynOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{mss:")?;
        match self.mss {
            Some(mss) => write!(f, "{}", mss)?,
            None => write!(f, "-")?,
        }
        write!(f, " ws:")?;
        match self.window_scale {
            Some(ws) => write!(f, "{}", ws)?,
            None => write!(f, "-")?,
        }
        write!(f, " sack_permitted:{}", self.sack_permitted)?;
        if let Some((val, ecr)) = self.timestamp {
            write!(f, " ts_val:{} ts_ecr:{}", val, ecr)?;
        }
        write!(f, "}}")
    }
}

/// Options carried on an established-connection segment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentOptions {
    pub timestamp: Option<(u32, u32)>,
    pub sack_blocks: Vec<(u32, u32)>,
}

impl fmt::Display for SegmentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        match self.timestamp {
            Some((val, ecr)) => write!(f, "ts_val:{} ts_ecr:{}", val, ecr)?,
            None => write!(f, "ts:-")?,
        }
        write!(f, " sack:[")?;
        for (i, (start, end)) in self.sack_blocks.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}-{}", start, end)?;
        }
        write!(f, "]}}")
    }
}

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Walk a TCP option list, stopping at EOL or the first malformed option
fn walk_options(options: &[u8], mut visit: impl FnMut(u8, &[u8])) {
    let mut pos = 0;
    while pos < options.len() {
        let kind = options[pos];
        match kind {
            TCP_OPT_EOL => return,
            TCP_OPT_NOP => {
                pos += 1;
            }
            _ => {
                if pos + 1 >= options.len() {
                    return;
                }
                let len = usize::from(options[pos + 1]);
                if len < 2 || pos + len > options.len() {
                    return;
                }
                visit(kind, &options[pos + 2..pos + len]);
                pos += len;
            }
        }
    }
}

pub fn parse_syn_options(options: &[u8]) -> SynOptions {
    let mut out = SynOptions::default();
    walk_options(options, |kind, body| match (kind, body.len()) {
        (TCP_OPT_MSS, 2) => out.mss = Some(be16(body, 0)),
        (TCP_OPT_WS, 1) => out.window_scale = Some(body[0].min(14)),
        (TCP_OPT_SACK_PERMITTED, 0) => out.sack_permitted = true,
        (TCP_OPT_TS, 8) => out.timestamp = Some((be32(body, 0), be32(body, 4))),
        _ => {}
    });
    out
}

pub fn parse_segment_options(options: &[u8]) -> SegmentOptions {
    let mut out = SegmentOptions::default();
    walk_options(options, |kind, body| match kind {
        TCP_OPT_TS if body.len() == 8 => {
            out.timestamp = Some((be32(body, 0), be32(body, 4)));
        }
        TCP_OPT_SACK if !body.is_empty() && body.len() % 8 == 0 => {
            out.sack_blocks = body
                .chunks_exact(8)
                .map(|block| (be32(block, 0), be32(block, 4)))
                .collect();
        }
        _ => {}
    });
    out
}

/// Fields of a TCP segment header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub checksum: u16,
    pub header_len: usize,
    pub options: String,
}

impl TcpSegment {
    pub fn details(&self) -> String {
        format!(
            "flags: {} seqnum: {} ack: {} win: {} xsum:0x{:x} options: {}",
            self.flags, self.seq, self.ack, self.window, self.checksum, self.options
        )
    }
}

fn render_options(flags: TcpFlags, options: &[u8]) -> String {
    if flags.contains(TcpFlags::SYN) {
        parse_syn_options(options).to_string()
    } else {
        parse_segment_options(options).to_string()
    }
}

/// Decode an unfragmented TCP segment
///
/// Err carries the reason the declared data offset can't be trusted.
pub(crate) fn decode_tcp(segment: &[u8], more_fragments: bool) -> Result<TcpSegment, String> {
    if segment.len() < TCP_MIN_HEADER {
        return Err(format!("tcp segment too short {}", segment.len()));
    }
    let offset = usize::from(segment[12] >> 4) * 4;
    if offset < TCP_MIN_HEADER {
        return Err(format!("invalid packet: tcp data offset too small {}", offset));
    }
    if offset > segment.len() {
        if !more_fragments {
            return Err(format!(
                "invalid packet: tcp data offset {} larger than tcp packet length {}",
                offset,
                segment.len()
            ));
        }
        // First fragment cut inside the options; only the fixed part is usable
        let flags = TcpFlags(segment[13] & 0x3f);
        return Ok(TcpSegment {
            src_port: be16(segment, 0),
            dst_port: be16(segment, 2),
            flags,
            seq: be32(segment, 4),
            ack: be32(segment, 8),
            window: be16(segment, 14),
            checksum: be16(segment, 16),
            header_len: segment.len(),
            options: render_options(flags, &segment[TCP_MIN_HEADER..]),
        });
    }

    let tcp = TcpHeaderSlice::from_slice(segment).map_err(|e| format!("invalid packet: {}", e))?;
    let flags = TcpFlags(segment[13] & 0x3f);
    Ok(TcpSegment {
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        flags,
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        window: tcp.window_size(),
        checksum: tcp.checksum(),
        header_len: tcp.slice().len(),
        options: render_options(flags, tcp.options()),
    })
}

/// Fields of a UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

pub(crate) fn decode_udp(datagram: &[u8]) -> Option<UdpDatagram> {
    let udp = UdpHeaderSlice::from_slice(datagram).ok()?;
    Some(UdpDatagram {
        src_port: udp.source_port(),
        dst_port: udp.destination_port(),
        length: udp.length(),
        checksum: udp.checksum(),
    })
}

/// Readable name of an ICMP message type
pub fn icmp_type_name(ip_version: u8, icmp_type: u8) -> &'static str {
    if ip_version == 6 {
        match icmp_type {
            1 => "destination unreachable",
            2 => "packet too big",
            3 => "time exceeded",
            4 => "parameter problem",
            128 => "echo request",
            129 => "echo reply",
            130 => "multicast listener query",
            131 => "multicast listener report",
            132 => "multicast listener done",
            133 => "router solicitation",
            134 => "router advertisement",
            135 => "neighbor solicitation",
            136 => "neighbor advertisement",
            137 => "redirect message",
            _ => "unknown type",
        }
    } else {
        match icmp_type {
            0 => "echo reply",
            3 => "destination unreachable",
            4 => "source quench",
            5 => "redirect",
            8 => "echo request",
            11 => "time exceeded",
            12 => "parameter problem",
            13 => "timestamp",
            14 => "timestamp reply",
            15 => "info request",
            16 => "info reply",
            _ => "unknown type",
        }
    }
}

pub(crate) fn icmp_min_header(ip_version: u8) -> usize {
    if ip_version == 6 {
        ICMPV6_MIN_HEADER
    } else {
        ICMPV4_MIN_HEADER
    }
}
