//! Telemetry events
//!
//! Every observation the sensor makes (classified frames, TLS handshakes,
//! decrypted reads, scan alerts) leaves as an `Event` through an `EventSink`.
//! The sensor never stores or re-reads events.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

/// Structured telemetry record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    /// Broad category ("tcp", "udp", "icmp", "arp", "unknown", "scan")
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    /// Free-form key/value fields
    pub fields: BTreeMap<String, Value>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_payload"
    )]
    pub payload: Option<Vec<u8>>,
}

fn serialize_payload<S: Serializer>(payload: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match payload {
        Some(bytes) => s.serialize_str(&hex::encode(bytes)),
        None => s.serialize_none(),
    }
}

impl Event {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category: category.into(),
            src_ip: None,
            src_port: None,
            dst_ip: None,
            dst_port: None,
            fields: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn with_src(mut self, ip: Option<IpAddr>, port: Option<u16>) -> Self {
        self.src_ip = ip;
        self.src_port = port;
        self
    }

    pub fn with_dst(mut self, ip: Option<IpAddr>, port: Option<u16>) -> Self {
        self.dst_ip = ip;
        self.dst_port = port;
        self
    }

    /// Set a custom field
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Attach payload bytes
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = Some(payload.to_vec());
        self
    }

    /// Value of the "type" field, if set
    pub fn event_type(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }
}

/// Downstream telemetry consumer
pub trait EventSink: Send + Sync {
    /// Hand one event to the sink. Must not block.
    fn publish(&self, event: Event);
}

/// Bounded channel sink; events are dropped while the receiver lags
impl EventSink for mpsc::Sender<Event> {
    fn publish(&self, event: Event) {
        if let Err(e) = self.try_send(event) {
            trace!("event dropped: {}", e);
        }
    }
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn publish(&self, event: Event) {
        let _ = self.send(event);
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new("tcp")
            .with_src(Some("10.0.0.1".parse().unwrap()), Some(4242))
            .with_dst(Some("10.0.0.2".parse().unwrap()), Some(22))
            .field("type", "tls")
            .field("len", 3)
            .with_payload(&[0xde, 0xad]);

        assert_eq!(event.category, "tcp");
        assert_eq!(event.event_type(), Some("tls"));
        assert_eq!(event.fields["len"], Value::from(3));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"], "dead");
        assert_eq!(json["src_port"], 4242);
        assert_eq!(json["fields"]["type"], "tls");
    }

    #[test]
    fn test_missing_fields_are_skipped() {
        let json = serde_json::to_value(Event::new("arp")).unwrap();
        assert!(json.get("src_ip").is_none());
        assert!(json.get("payload").is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel::<Event>(1);
        tx.publish(Event::new("udp"));
        tx.publish(Event::new("tcp"));

        assert_eq!(rx.recv().await.unwrap().category, "udp");
        assert!(rx.try_recv().is_err());
    }
}
