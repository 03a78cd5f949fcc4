//! Protocol classifier
//!
//! Decodes a frame's network and transport headers into an `Observation`,
//! applies the static `FilterRules` to compute a verdict, and emits one
//! `Knock` and one `Event` per frame:
//! - `network` - IPv4/IPv6/ARP header validation
//! - `transport` - TCP/UDP/ICMP decoding, flag and option rendering
//!
//! Hostile bytes are parsed here directly, so every step degrades to
//! "stop decoding, let the frame through" instead of failing.

pub mod network;
pub mod transport;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::core::{EtherType, Event, EventSink, Frame, Knock, KnockKind, MacAddr, NullSink};
use crate::filter::FilterRules;

pub use transport::{icmp_type_name, parse_segment_options, parse_syn_options, TcpFlags};

/// Network family of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Arp,
    Ipv4,
    Ipv6,
    Unknown(u16),
}

impl From<EtherType> for NetworkKind {
    fn from(proto: EtherType) -> Self {
        match proto {
            EtherType::Arp => NetworkKind::Arp,
            EtherType::Ipv4 => NetworkKind::Ipv4,
            EtherType::Ipv6 => NetworkKind::Ipv6,
            EtherType::Unknown(n) => NetworkKind::Unknown(n),
        }
    }
}

/// Transport protocol of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Udp,
    Icmp,
    /// Unrecognized id, or no id at all when the network protocol is unknown
    Unknown(Option<u8>),
}

impl TransportKind {
    pub fn from_id(id: Option<u8>) -> Self {
        match id {
            Some(6) => TransportKind::Tcp,
            Some(17) => TransportKind::Udp,
            Some(1) | Some(58) => TransportKind::Icmp,
            other => TransportKind::Unknown(other),
        }
    }

    /// Event category for this transport
    pub fn category(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Icmp => "icmp",
            TransportKind::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

fn serialize_hex<S: Serializer>(bytes: &&[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

/// Everything decoded from one frame; the payload borrows from the frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation<'a> {
    pub network: NetworkKind,
    /// None when decoding stopped before the transport layer (ARP, bad IP header)
    pub transport: Option<TransportKind>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<TcpFlags>,
    pub ip_id: Option<u16>,
    pub fragment_offset: u16,
    pub more_fragments: bool,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: &'a [u8],
}

impl<'a> Observation<'a> {
    fn new(network: NetworkKind, payload: &'a [u8]) -> Self {
        Self {
            network,
            transport: None,
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
            ip_id: None,
            fragment_offset: 0,
            more_fragments: false,
            payload,
        }
    }

    fn ip_version(&self) -> u8 {
        match self.network {
            NetworkKind::Ipv6 => 6,
            _ => 4,
        }
    }
}

/// Result of inspecting one frame, before any side effect
#[derive(Debug, Clone, Serialize)]
pub struct Inspection<'a> {
    pub observation: Observation<'a>,
    /// true = deliver to the virtual stack, false = drop here
    pub verdict: bool,
    pub knock: Option<Knock>,
    pub event: Option<Event>,
    pub log_line: Option<String>,
}

impl<'a> Inspection<'a> {
    /// Let the frame through without reporting anything
    fn pass(observation: Observation<'a>) -> Self {
        Self {
            observation,
            verdict: true,
            knock: None,
            event: None,
            log_line: None,
        }
    }
}

/// Counters updated on the dispatch path
#[derive(Debug, Default)]
pub struct ClassifierStats {
    frames: AtomicU64,
    dropped: AtomicU64,
    knocks: AtomicU64,
    knocks_dropped: AtomicU64,
    events: AtomicU64,
}

/// Point-in-time copy of `ClassifierStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub dropped: u64,
    pub knocks: u64,
    pub knocks_dropped: u64,
    pub events: u64,
}

impl ClassifierStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            knocks: self.knocks.load(Ordering::Relaxed),
            knocks_dropped: self.knocks_dropped.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// Frame classifier for one NIC
pub struct Classifier {
    own_mac: Option<MacAddr>,
    rules: Arc<FilterRules>,
    knocks: Option<mpsc::Sender<Knock>>,
    events: Arc<dyn EventSink>,
    prefix: String,
    max_event_payload: usize,
    stats: ClassifierStats,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("own_mac", &self.own_mac)
            .field("rules", &self.rules)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Classifier {
    /// Create a classifier that reports nowhere
    pub fn new(rules: Arc<FilterRules>) -> Self {
        Self {
            own_mac: None,
            rules,
            knocks: None,
            events: Arc::new(NullSink),
            prefix: "recv".to_string(),
            max_event_payload: 4096,
            stats: ClassifierStats::default(),
        }
    }

    /// Frames from this hardware address are our own egress and are not reported
    pub fn with_own_mac(mut self, mac: MacAddr) -> Self {
        self.own_mac = Some(mac);
        self
    }

    pub fn with_knocks(mut self, tx: mpsc::Sender<Knock>) -> Self {
        self.knocks = Some(tx);
        self
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_event_payload(mut self, max: usize) -> Self {
        self.max_event_payload = max;
        self
    }

    pub fn own_mac(&self) -> Option<MacAddr> {
        self.own_mac
    }

    pub fn rules(&self) -> &FilterRules {
        &self.rules
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Classify a frame and publish its knock and event
    ///
    /// Returns the observation and the verdict (true = let the stack process it).
    pub fn classify<'a>(&self, frame: &'a Frame, proto: EtherType) -> (Observation<'a>, bool) {
        let inspection = self.inspect(frame, proto);
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        if !inspection.verdict {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(line) = &inspection.log_line {
            debug!(nic = frame.nic, verdict = inspection.verdict, "{}", line);
        }

        if let Some(knock) = inspection.knock {
            self.send_knock(knock);
        }

        if let Some(event) = inspection.event {
            self.stats.events.fetch_add(1, Ordering::Relaxed);
            self.events.publish(event);
        }

        (inspection.observation, inspection.verdict)
    }

    /// Knocks never block dispatch: a full queue drops the knock
    fn send_knock(&self, knock: Knock) {
        let Some(tx) = &self.knocks else {
            return;
        };
        match tx.try_send(knock) {
            Ok(()) => {
                self.stats.knocks.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(k)) => {
                self.stats.knocks_dropped.fetch_add(1, Ordering::Relaxed);
                trace!("knock queue full, dropping {}", k);
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.knocks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Decode a frame and decide its verdict without side effects
    pub fn inspect<'a>(&self, frame: &'a Frame, proto: EtherType) -> Inspection<'a> {
        let mut obs = Observation::new(NetworkKind::from(proto), &frame.data);

        if let (Some(own), Some(src)) = (self.own_mac, frame.src_mac()) {
            if own == src {
                return Inspection::pass(obs);
            }
        }

        let mut details = String::new();
        let transport_id = match proto {
            EtherType::Ipv4 | EtherType::Ipv6 => {
                let parsed = if proto == EtherType::Ipv4 {
                    network::parse_ipv4(&frame.data)
                } else {
                    network::parse_ipv6(&frame.data)
                };
                let Some(ip) = parsed else {
                    trace!(nic = frame.nic, "invalid {} header, passing through", proto);
                    return Inspection::pass(obs);
                };
                obs.src_ip = Some(ip.src);
                obs.dst_ip = Some(ip.dst);
                obs.ip_id = ip.identification;
                obs.fragment_offset = ip.fragment_offset;
                obs.more_fragments = ip.more_fragments;
                obs.payload = ip.payload;
                Some(ip.protocol)
            }
            EtherType::Arp => return self.inspect_arp(frame, obs),
            EtherType::Unknown(n) => {
                details.push_str(&format!("unknown network protocol 0x{:04x}", n));
                None
            }
        };

        let mut verdict = true;
        if obs.src_ip.is_some_and(|ip| self.rules.blocks_src(ip))
            || obs.dst_ip.is_some_and(|ip| self.rules.blocks_dst(ip))
        {
            verdict = false;
        }

        let transport = TransportKind::from_id(transport_id);
        obs.transport = Some(transport);

        let unfragmented = obs.fragment_offset == 0;
        let ip_payload = obs.payload;
        let mut size = ip_payload.len();
        let mut knock = None;
        let mut event = Event::new(transport.category());

        match transport {
            TransportKind::Icmp => {
                let ip_version = obs.ip_version();
                if ip_payload.len() >= transport::icmp_min_header(ip_version) {
                    if unfragmented {
                        let icmp_type = ip_payload[0];
                        let code = ip_payload[1];
                        details = format!(
                            "type: {} code: {}",
                            icmp_type_name(ip_version, icmp_type),
                            code
                        );
                        event = event
                            .field("icmp_type", icmp_type)
                            .field("icmp_code", code)
                            .field("icmp_name", icmp_type_name(ip_version, icmp_type));
                    }
                    knock = Some(KnockKind::Icmp { ip_version });
                } else {
                    details = format!("truncated icmp header {}", ip_payload.len());
                }
            }
            TransportKind::Udp => match transport::decode_udp(ip_payload) {
                Some(udp) => {
                    if unfragmented {
                        obs.src_port = Some(udp.src_port);
                        obs.dst_port = Some(udp.dst_port);
                        obs.payload = &ip_payload[transport::UDP_HEADER..];
                        size -= transport::UDP_HEADER;
                        details = format!("xsum: 0x{:x}", udp.checksum);
                        if self.rules.blocks_udp_port(udp.src_port)
                            || self.rules.blocks_udp_port(udp.dst_port)
                        {
                            verdict = false;
                        }
                    }
                    knock = Some(KnockKind::Udp {
                        port: obs.dst_port.unwrap_or(0),
                    });
                }
                None => details = format!("truncated udp header {}", ip_payload.len()),
            },
            TransportKind::Tcp => {
                if ip_payload.len() >= transport::TCP_MIN_HEADER {
                    if unfragmented {
                        match transport::decode_tcp(ip_payload, obs.more_fragments) {
                            Ok(tcp) => {
                                obs.src_port = Some(tcp.src_port);
                                obs.dst_port = Some(tcp.dst_port);
                                obs.tcp_flags = Some(tcp.flags);
                                obs.payload = &ip_payload[tcp.header_len..];
                                size -= tcp.header_len;
                                details = tcp.details();
                                event = event
                                    .field("flags", tcp.flags.to_string())
                                    .field("seq", tcp.seq)
                                    .field("ack", tcp.ack)
                                    .field("window", tcp.window)
                                    .field("options", tcp.options.clone());
                                if self.rules.blocks_tcp_port(tcp.src_port)
                                    || self.rules.blocks_tcp_port(tcp.dst_port)
                                {
                                    verdict = false;
                                }
                            }
                            Err(reason) => details = reason,
                        }
                    }
                    knock = Some(KnockKind::Tcp {
                        port: obs.dst_port.unwrap_or(0),
                    });
                } else {
                    details = format!("truncated tcp header {}", ip_payload.len());
                }
            }
            TransportKind::Unknown(id) => {
                if let Some(id) = id {
                    if !details.is_empty() {
                        details.push(' ');
                    }
                    details.push_str(&format!("unknown transport protocol {}", id));
                }
                event = event.field("type", "unknown transport protocol");
            }
        }

        let log_line = format!(
            "{} {} {}:{} -> {}:{} len:{} id:{:04x} {}",
            self.prefix,
            transport,
            display_ip(obs.src_ip),
            obs.src_port.unwrap_or(0),
            display_ip(obs.dst_ip),
            obs.dst_port.unwrap_or(0),
            size,
            obs.ip_id.unwrap_or(0),
            details
        );

        let knock = knock.map(|kind| Knock {
            kind,
            src_mac: frame.src_mac(),
            src_ip: obs.src_ip,
            nic: frame.nic,
        });

        let payload_len = obs.payload.len().min(self.max_event_payload);
        let mut event = event
            .with_src(obs.src_ip, obs.src_port)
            .with_dst(obs.dst_ip, obs.dst_port)
            .field("nic", frame.nic)
            .field("network", network_name(obs.network))
            .field("len", size)
            .field("fragment_offset", obs.fragment_offset)
            .field("more_fragments", obs.more_fragments)
            .field("verdict", if verdict { "accept" } else { "drop" })
            .field("details", details)
            .with_payload(&obs.payload[..payload_len]);
        if let Some(id) = obs.ip_id {
            event = event.field("ip_id", id);
        }
        if let Some(mac) = frame.src_mac() {
            event = event.field("src_mac", mac.to_string());
        }

        Inspection {
            observation: obs,
            verdict,
            knock,
            event: Some(event),
            log_line: Some(log_line),
        }
    }

    /// ARP ends classification: one event, no transport, no knock
    fn inspect_arp<'a>(&self, frame: &'a Frame, mut obs: Observation<'a>) -> Inspection<'a> {
        let Some(arp) = network::parse_arp(&frame.data) else {
            trace!(nic = frame.nic, "truncated arp packet, passing through");
            return Inspection::pass(obs);
        };

        obs.src_ip = Some(IpAddr::V4(arp.sender_ip));
        obs.dst_ip = Some(IpAddr::V4(arp.target_ip));

        let log_line = format!(
            "{} arp {} ({}) -> {} ({}) op:{} valid:{}",
            self.prefix,
            arp.sender_ip,
            arp.sender_mac,
            arp.target_ip,
            arp.target_mac,
            arp.op_name(),
            arp.valid
        );

        let mut event = Event::new("arp")
            .with_src(obs.src_ip, None)
            .with_dst(obs.dst_ip, None)
            .field("nic", frame.nic)
            .field("sender_hw", arp.sender_mac.to_string())
            .field("sender_ip", arp.sender_ip.to_string())
            .field("target_hw", arp.target_mac.to_string())
            .field("target_ip", arp.target_ip.to_string())
            .field("op", arp.op)
            .field("op_name", arp.op_name())
            .field("op_valid", arp.op_valid())
            .field("valid", arp.valid);
        if let Some(mac) = frame.src_mac() {
            event = event.field("src_mac", mac.to_string());
        }

        Inspection {
            observation: obs,
            verdict: true,
            knock: None,
            event: Some(event),
            log_line: Some(log_line),
        }
    }
}

fn display_ip(ip: Option<IpAddr>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_else(|| "?".to_string())
}

fn network_name(kind: NetworkKind) -> String {
    match kind {
        NetworkKind::Arp => "arp".to_string(),
        NetworkKind::Ipv4 => "ipv4".to_string(),
        NetworkKind::Ipv6 => "ipv6".to_string(),
        NetworkKind::Unknown(n) => format!("0x{:04x}", n),
    }
}

#[cfg(test)]
mod tests {
    use super::network::tests::{arp_request, ipv4, ipv6};
    use super::transport::tests::{tcp, udp};
    use super::*;
    use crate::config::FilterConfig;
    use crate::core::LinkHeader;

    const PROBER_MAC: MacAddr = MacAddr([0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    const OWN_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

    fn rules(ports: &[&str], sources: &[&str]) -> Arc<FilterRules> {
        Arc::new(FilterRules::from_config(&FilterConfig {
            blocked_ports: ports.iter().map(|s| s.to_string()).collect(),
            blocked_sources: sources.iter().map(|s| s.to_string()).collect(),
            blocked_destinations: Vec::new(),
        }))
    }

    fn frame_from(src_mac: MacAddr, ether_type: EtherType, data: Vec<u8>) -> Frame {
        Frame::with_link(
            1,
            LinkHeader {
                src: src_mac,
                dst: OWN_MAC,
                ether_type,
            },
            data,
        )
    }

    fn syn_to(port: u16) -> Frame {
        let seg = tcp(40000, port, TcpFlags::SYN, &[2, 4, 0x05, 0xb4], &[]);
        frame_from(
            PROBER_MAC,
            EtherType::Ipv4,
            ipv4([203, 0, 113, 9], [10, 0, 0, 1], 6, &seg),
        )
    }

    #[test]
    fn test_blocked_syn_is_dropped_but_reported() {
        let classifier = Classifier::new(rules(&["tcp/4444"], &[]));
        let frame = syn_to(4444);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);

        assert!(!inspection.verdict);
        let obs = &inspection.observation;
        assert_eq!(obs.transport, Some(TransportKind::Tcp));
        assert_eq!(obs.dst_port, Some(4444));
        assert_eq!(obs.src_port, Some(40000));
        assert!(obs.tcp_flags.unwrap().is_syn());

        let knock = inspection.knock.unwrap();
        assert_eq!(knock.kind, KnockKind::Tcp { port: 4444 });
        assert_eq!(knock.src_mac, Some(PROBER_MAC));
        assert_eq!(knock.src_ip, Some("203.0.113.9".parse().unwrap()));

        let event = inspection.event.unwrap();
        assert_eq!(event.category, "tcp");
        assert_eq!(event.fields["verdict"], "drop");
        assert_eq!(event.fields["flags"], " S    ");
    }

    #[test]
    fn test_unblocked_syn_passes() {
        let classifier = Classifier::new(rules(&["tcp/4444"], &[]));
        let frame = syn_to(22);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        assert!(inspection.verdict);
        assert_eq!(inspection.knock.unwrap().kind, KnockKind::Tcp { port: 22 });
        let line = inspection.log_line.unwrap();
        assert!(line.starts_with("recv tcp 203.0.113.9:40000 -> 10.0.0.1:22 len:0 id:1234 flags:"));
    }

    #[test]
    fn test_source_port_filter_applies() {
        let classifier = Classifier::new(rules(&["tcp/40000"], &[]));
        assert!(!classifier.inspect(&syn_to(80), EtherType::Ipv4).verdict);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = Classifier::new(rules(&["udp/53"], &["198.51.100.1"]));
        let frame = frame_from(
            PROBER_MAC,
            EtherType::Ipv4,
            ipv4([198, 51, 100, 1], [10, 0, 0, 1], 17, &udp(1234, 53, b"query")),
        );
        let (first, v1) = classifier.classify(&frame, EtherType::Ipv4);
        let (second, v2) = classifier.classify(&frame, EtherType::Ipv4);
        assert_eq!(first, second);
        assert_eq!(v1, v2);
        assert!(!v1);
        assert_eq!(classifier.stats().frames, 2);
        assert_eq!(classifier.stats().dropped, 2);
    }

    #[test]
    fn test_own_egress_short_circuits() {
        let classifier = Classifier::new(rules(&["tcp/4444"], &[])).with_own_mac(OWN_MAC);
        let seg = tcp(4444, 4444, TcpFlags::SYN, &[], &[]);
        let frame = frame_from(OWN_MAC, EtherType::Ipv4, ipv4([10, 0, 0, 1], [10, 0, 0, 2], 6, &seg));
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        assert!(inspection.verdict);
        assert!(inspection.knock.is_none());
        assert!(inspection.event.is_none());
        assert_eq!(inspection.observation.transport, None);
    }

    #[test]
    fn test_udp_decode_and_filter() {
        let classifier = Classifier::new(rules(&["udp/1"], &[]));
        let data = ipv4([192, 0, 2, 1], [10, 0, 0, 1], 17, &udp(1, 9999, b"abc"));
        let frame = Frame::new(0, data);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);

        assert!(!inspection.verdict);
        assert_eq!(inspection.observation.payload, b"abc");
        assert_eq!(inspection.knock.unwrap().kind, KnockKind::Udp { port: 9999 });
        assert_eq!(inspection.knock.unwrap().src_mac, None);
        let event = inspection.event.unwrap();
        assert_eq!(event.category, "udp");
        assert_eq!(event.payload.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_icmpv6_echo() {
        let classifier = Classifier::new(rules(&[], &[]));
        let data = ipv6("2001:db8::1", "2001:db8::2", 58, &[128, 0, 0, 0, 0, 1, 0, 1]);
        let frame = Frame::new(0, data);
        let inspection = classifier.inspect(&frame, EtherType::Ipv6);

        assert!(inspection.verdict);
        assert_eq!(inspection.observation.transport, Some(TransportKind::Icmp));
        assert_eq!(inspection.knock.unwrap().kind, KnockKind::Icmp { ip_version: 6 });
        let event = inspection.event.unwrap();
        assert_eq!(event.category, "icmp");
        assert_eq!(event.fields["icmp_name"], "echo request");
    }

    #[test]
    fn test_address_filter_drops_icmp() {
        let classifier = Classifier::new(rules(&[], &["192.0.2.66"]));
        let data = ipv4([192, 0, 2, 66], [10, 0, 0, 1], 1, &[8, 0, 0, 0, 0, 1, 0, 1]);
        let frame = Frame::new(0, data);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        assert!(!inspection.verdict);
        assert_eq!(inspection.knock.unwrap().kind, KnockKind::Icmp { ip_version: 4 });
    }

    #[test]
    fn test_arp_emits_event_without_knock() {
        let classifier = Classifier::new(rules(&[], &["192.168.1.100"]));
        let frame = frame_from(PROBER_MAC, EtherType::Arp, arp_request());
        let inspection = classifier.inspect(&frame, EtherType::Arp);

        assert!(inspection.verdict);
        assert!(inspection.knock.is_none());
        assert_eq!(inspection.observation.transport, None);
        let event = inspection.event.unwrap();
        assert_eq!(event.category, "arp");
        assert_eq!(event.fields["sender_ip"], "192.168.1.100");
        assert_eq!(event.fields["op_valid"], true);
    }

    #[test]
    fn test_invalid_ip_header_passes_silently() {
        let classifier = Classifier::new(rules(&["tcp/4444"], &[]));
        let mut data = ipv4([1, 1, 1, 1], [2, 2, 2, 2], 6, &tcp(1, 4444, TcpFlags::SYN, &[], &[]));
        data[3] = 0xff; // total length beyond buffer
        let frame = Frame::new(0, data);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        assert!(inspection.verdict);
        assert!(inspection.event.is_none());
        assert!(inspection.knock.is_none());
    }

    #[test]
    fn test_bad_tcp_offset_keeps_verdict() {
        let classifier = Classifier::new(rules(&["tcp/4444"], &["203.0.113.9"]));
        let mut seg = tcp(1, 4444, TcpFlags::SYN, &[], &[]);
        seg[12] = 0xf0;
        let data = ipv4([203, 0, 113, 9], [10, 0, 0, 1], 6, &seg);
        let frame = Frame::new(0, data.clone());
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        // Address filter still applies, port decode was aborted
        assert!(!inspection.verdict);
        assert_eq!(inspection.observation.dst_port, None);
        assert!(inspection.log_line.unwrap().contains("larger than tcp packet length"));

        let open = Classifier::new(rules(&["tcp/4444"], &[]));
        assert!(open.inspect(&Frame::new(0, data), EtherType::Ipv4).verdict);
    }

    #[test]
    fn test_unknown_protocols() {
        let classifier = Classifier::new(rules(&[], &[]));

        let data = ipv4([192, 0, 2, 1], [10, 0, 0, 1], 47, &[1, 2, 3]);
        let frame = Frame::new(0, data);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        assert!(inspection.verdict);
        assert!(inspection.knock.is_none());
        assert_eq!(inspection.observation.transport, Some(TransportKind::Unknown(Some(47))));
        let event = inspection.event.unwrap();
        assert_eq!(event.category, "unknown");
        assert_eq!(event.payload.as_deref(), Some(&[1u8, 2, 3][..]));

        let frame = Frame::new(0, vec![0xaa; 12]);
        let inspection = classifier.inspect(&frame, EtherType::Unknown(0x88cc));
        assert_eq!(inspection.observation.network, NetworkKind::Unknown(0x88cc));
        assert_eq!(inspection.observation.transport, Some(TransportKind::Unknown(None)));
        assert!(inspection
            .log_line
            .unwrap()
            .contains("unknown network protocol 0x88cc"));
    }

    #[test]
    fn test_non_first_fragment_has_no_ports() {
        let classifier = Classifier::new(rules(&["tcp/4444"], &[]));
        let mut data = ipv4([192, 0, 2, 1], [10, 0, 0, 1], 6, &tcp(1, 4444, 0, &[], b"tail"));
        data[7] = 0x10; // fragment offset 16
        let frame = Frame::new(0, data);
        let inspection = classifier.inspect(&frame, EtherType::Ipv4);
        assert!(inspection.verdict);
        assert_eq!(inspection.observation.fragment_offset, 16);
        assert_eq!(inspection.observation.dst_port, None);
    }

    #[test]
    fn test_garbage_never_panics() {
        let classifier = Classifier::new(rules(&["tcp/1", "udp/1"], &["10.0.0.1"]));
        let mut seed: u32 = 0x1234_5678;
        for len in 0..200usize {
            let mut data = Vec::with_capacity(len);
            for _ in 0..len {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                data.push((seed >> 16) as u8);
            }
            if len > 0 {
                data[0] = 0x45;
            }
            let frame = Frame::new(0, data);
            for proto in [EtherType::Ipv4, EtherType::Ipv6, EtherType::Arp, EtherType::Unknown(1)] {
                let _ = classifier.inspect(&frame, proto);
            }
        }
    }

    #[tokio::test]
    async fn test_knock_queue_overflow_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        let classifier = Classifier::new(rules(&[], &[])).with_knocks(tx);
        let frame = syn_to(80);
        classifier.classify(&frame, EtherType::Ipv4);
        classifier.classify(&frame, EtherType::Ipv4);

        assert_eq!(rx.recv().await.unwrap().kind, KnockKind::Tcp { port: 80 });
        assert!(rx.try_recv().is_err());
        let stats = classifier.stats();
        assert_eq!(stats.knocks, 1);
        assert_eq!(stats.knocks_dropped, 1);
    }

    #[tokio::test]
    async fn test_event_payload_is_capped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let classifier = Classifier::new(rules(&[], &[]))
            .with_events(Arc::new(tx))
            .with_max_event_payload(4);
        let data = ipv4([192, 0, 2, 1], [10, 0, 0, 1], 17, &udp(1, 2, b"0123456789"));
        classifier.classify(&Frame::new(0, data), EtherType::Ipv4);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.as_deref(), Some(&b"0123"[..]));
        assert_eq!(event.fields["len"], 10);
    }
}
