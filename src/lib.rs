//! honeytap: packet interception and traffic sniffing core for network honeypots
//!
//! Sits between a user-space network stack and the protocol emulators:
//! - `classify` decodes every inbound frame, applies the static filters and
//!   reports knocks and events
//! - `link` wraps the NIC endpoint so classification happens before the stack
//! - `tls` sniffs accepted TCP connections and terminates TLS passively
//! - `udp` turns new UDP 4-tuples into per-flow handler tasks
//! - `knock_tracker` turns the knock stream into scan alerts

pub mod classify;
pub mod config;
pub mod core;
pub mod error;
pub mod filter;
pub mod knock_tracker;
pub mod link;
pub mod tls;
pub mod udp;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub use crate::core::{EtherType, Event, EventSink, Frame, Knock, KnockKind, MacAddr};
pub use classify::{Classifier, Inspection, NetworkKind, Observation, TransportKind};
pub use config::SensorConfig;
pub use error::{Error, Op, OpError, Result};
pub use filter::{block_ip_fn, block_port_fn, FilterRules};
pub use knock_tracker::{KnockTracker, ScanAlert};
pub use link::{Decision, LinkEndpoint, NetworkDispatcher, SniffingEndpoint};
pub use tls::{
    is_tls_prefix, Acceptor, ConnQueue, MaybeTlsStream, PendingConnection, SniffingListener,
    TlsTerminator,
};
pub use udp::{
    DatagramEndpoint, DatagramStack, FlowHandler, FlowKey, FlowWriter, Route, UdpFlow,
    UdpForwarder,
};

/// Sensor components built from one configuration
///
/// Filter rules and TLS identities are built once and shared by every
/// component created from the sensor.
pub struct Sensor {
    config: SensorConfig,
    rules: Arc<FilterRules>,
    own_mac: Option<MacAddr>,
    terminator: Arc<TlsTerminator>,
    events: Arc<dyn EventSink>,
    knock_tx: mpsc::Sender<Knock>,
    knock_rx: Option<mpsc::Receiver<Knock>>,
}

impl Sensor {
    /// Build the sensor, publishing every event to `events`
    pub fn new(config: SensorConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let rules = Arc::new(FilterRules::from_config(&config.filter));
        let own_mac = match &config.link.hardware_address {
            Some(addr) => Some(
                addr.parse::<MacAddr>()
                    .map_err(|e| Error::Config(format!("link.hardware_address: {}", e)))?,
            ),
            None => None,
        };
        let terminator = Arc::new(
            TlsTerminator::from_config(&config.tls)?
                .with_peek_timeout(config.listener.peek_timeout()),
        );
        let (knock_tx, knock_rx) = mpsc::channel(config.knocks.channel_capacity.max(1));

        info!(
            "Sensor ready: {} filter rules, TLS {}",
            rules.len(),
            if terminator.is_enabled() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config,
            rules,
            own_mac,
            terminator,
            events,
            knock_tx,
            knock_rx: Some(knock_rx),
        })
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn rules(&self) -> Arc<FilterRules> {
        self.rules.clone()
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    pub fn terminator(&self) -> Arc<TlsTerminator> {
        self.terminator.clone()
    }

    /// Classifier wired to the sensor's rules, knock queue and event sink
    pub fn classifier(&self) -> Classifier {
        let classifier = Classifier::new(self.rules.clone())
            .with_knocks(self.knock_tx.clone())
            .with_events(self.events.clone())
            .with_prefix(self.config.link.log_prefix.clone())
            .with_max_event_payload(self.config.link.max_event_payload);
        match self.own_mac {
            Some(mac) => classifier.with_own_mac(mac),
            None => classifier,
        }
    }

    /// Wrap a NIC endpoint so its inbound frames are classified
    pub fn wrap_endpoint<E: LinkEndpoint>(&self, inner: E) -> SniffingEndpoint<E> {
        SniffingEndpoint::new(inner, self.classifier())
    }

    /// Sniffing listener over an accept primitive
    pub fn listener<A: Acceptor>(&self, acceptor: A) -> SniffingListener<A> {
        SniffingListener::new(acceptor, &self.config.listener)
    }

    /// UDP forwarder spawning handlers on the current runtime
    pub fn udp_forwarder(
        &self,
        stack: Arc<dyn DatagramStack>,
        handler: Arc<dyn FlowHandler>,
    ) -> Result<UdpForwarder> {
        UdpForwarder::new(stack, handler, &self.config.udp)
    }

    /// Take the knock queue for a custom consumer
    ///
    /// Returns None once taken (directly or by `spawn_knock_tracker`).
    pub fn take_knocks(&mut self) -> Option<mpsc::Receiver<Knock>> {
        self.knock_rx.take()
    }

    /// Run the scan tracker over the knock queue on the current runtime
    pub fn spawn_knock_tracker(&mut self) -> Option<JoinHandle<()>> {
        let knocks = self.knock_rx.take()?;
        let tracker = KnockTracker::new(&self.config.knocks);
        Some(tokio::spawn(tracker.run(knocks, self.events.clone())))
    }
}
