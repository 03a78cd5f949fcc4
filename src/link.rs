//! Sniffing link endpoint
//!
//! `SniffingEndpoint` wraps the NIC-facing endpoint of the virtual stack.
//! It reports the wrapped endpoint's capabilities unchanged and interposes
//! its own dispatcher so that every inbound frame is classified before the
//! stack sees it. Outbound traffic is delegated untouched.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::classify::Classifier;
use crate::core::{EtherType, Frame, LinkHeader, MacAddr};
use crate::error::Result;

/// Link endpoint capability bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCapabilities(pub u32);

impl LinkCapabilities {
    pub const RX_CHECKSUM_OFFLOAD: u32 = 1 << 0;
    pub const TX_CHECKSUM_OFFLOAD: u32 = 1 << 1;
    pub const RESOLUTION_REQUIRED: u32 = 1 << 2;
    pub const SAVE_RESTORE: u32 = 1 << 3;
    pub const DISCONNECT_OK: u32 = 1 << 4;
    pub const LOOPBACK: u32 = 1 << 5;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Segmentation offload supported by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GsoKind {
    #[default]
    None,
    Hardware,
    Software,
}

/// Receives inbound frames from a link endpoint
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(
        &self,
        remote: Option<MacAddr>,
        local: Option<MacAddr>,
        proto: EtherType,
        frame: Frame,
    );
}

/// NIC-facing endpoint of the virtual stack
pub trait LinkEndpoint: Send + Sync {
    fn mtu(&self) -> u32;

    fn max_header_length(&self) -> u16;

    fn link_address(&self) -> Option<MacAddr>;

    fn capabilities(&self) -> LinkCapabilities;

    fn gso_max_size(&self) -> u32 {
        0
    }

    fn supported_gso(&self) -> GsoKind {
        GsoKind::None
    }

    /// Attach a dispatcher for inbound frames; None detaches
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    fn is_attached(&self) -> bool;

    /// Write outbound frames, returning how many were written
    fn write_packets(&self, frames: Vec<Frame>) -> Result<usize>;

    /// Write a raw link-layer buffer
    fn write_raw(&self, raw: &[u8]) -> Result<()>;
}

/// What to do with an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward unchanged to the real dispatcher
    Handle,
    /// Discard the frame
    Drop,
}

impl From<bool> for Decision {
    fn from(verdict: bool) -> Self {
        if verdict {
            Decision::Handle
        } else {
            Decision::Drop
        }
    }
}

/// Dispatcher the wrapped endpoint delivers into
struct SniffingDispatcher {
    classifier: Classifier,
    outer: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
}

impl SniffingDispatcher {
    fn on_inbound(
        &self,
        remote: Option<MacAddr>,
        local: Option<MacAddr>,
        proto: EtherType,
        frame: &Frame,
    ) -> Decision {
        let (_, verdict) = self.classifier.classify(frame, proto);
        let decision = Decision::from(verdict);
        if decision == Decision::Drop {
            trace!(
                nic = frame.nic,
                remote = ?remote,
                local = ?local,
                "dropping filtered {} frame",
                proto
            );
        }
        decision
    }
}

impl NetworkDispatcher for SniffingDispatcher {
    fn deliver_network_packet(
        &self,
        remote: Option<MacAddr>,
        local: Option<MacAddr>,
        proto: EtherType,
        frame: Frame,
    ) {
        // Endpoints that strip the link header still report the addresses;
        // the classifier sees them, the stack gets the frame as delivered
        let decision = match (frame.link, remote) {
            (None, Some(src)) => {
                let mut view = frame.clone();
                view.link = Some(LinkHeader {
                    src,
                    dst: local.unwrap_or_default(),
                    ether_type: proto,
                });
                self.on_inbound(remote, local, proto, &view)
            }
            _ => self.on_inbound(remote, local, proto, &frame),
        };
        if decision == Decision::Drop {
            return;
        }

        let outer = self.outer.read().clone();
        match outer {
            Some(dispatcher) => dispatcher.deliver_network_packet(remote, local, proto, frame),
            None => trace!(nic = frame.nic, "no dispatcher attached, frame discarded"),
        }
    }
}

/// Link endpoint that classifies inbound frames before the stack sees them
pub struct SniffingEndpoint<E> {
    inner: E,
    dispatcher: Arc<SniffingDispatcher>,
}

impl<E: LinkEndpoint> fmt::Debug for SniffingEndpoint<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniffingEndpoint")
            .field("classifier", &self.dispatcher.classifier)
            .field("attached", &self.inner.is_attached())
            .finish()
    }
}

impl<E: LinkEndpoint> SniffingEndpoint<E> {
    /// Wrap `inner`
    ///
    /// The own hardware address is taken from `inner` unless the classifier
    /// was already given one.
    pub fn new(inner: E, classifier: Classifier) -> Self {
        let classifier = match (classifier.own_mac(), inner.link_address()) {
            (None, Some(mac)) => classifier.with_own_mac(mac),
            _ => classifier,
        };
        debug!("sniffing endpoint created, own address {:?}", classifier.own_mac());

        Self {
            inner,
            dispatcher: Arc::new(SniffingDispatcher {
                classifier,
                outer: RwLock::new(None),
            }),
        }
    }

    /// Classify one inbound frame and decide its fate
    pub fn on_inbound(
        &self,
        remote: Option<MacAddr>,
        local: Option<MacAddr>,
        proto: EtherType,
        frame: &Frame,
    ) -> Decision {
        self.dispatcher.on_inbound(remote, local, proto, frame)
    }

    pub fn classifier(&self) -> &Classifier {
        &self.dispatcher.classifier
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: LinkEndpoint> LinkEndpoint for SniffingEndpoint<E> {
    fn mtu(&self) -> u32 {
        self.inner.mtu()
    }

    fn max_header_length(&self) -> u16 {
        self.inner.max_header_length()
    }

    fn link_address(&self) -> Option<MacAddr> {
        self.inner.link_address()
    }

    fn capabilities(&self) -> LinkCapabilities {
        self.inner.capabilities()
    }

    fn gso_max_size(&self) -> u32 {
        self.inner.gso_max_size()
    }

    fn supported_gso(&self) -> GsoKind {
        self.inner.supported_gso()
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        let attaching = dispatcher.is_some();
        *self.dispatcher.outer.write() = dispatcher;
        if attaching {
            let ours: Arc<dyn NetworkDispatcher> = self.dispatcher.clone();
            self.inner.attach(Some(ours));
        } else {
            self.inner.attach(None);
        }
    }

    fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    fn write_packets(&self, frames: Vec<Frame>) -> Result<usize> {
        self.inner.write_packets(frames)
    }

    fn write_raw(&self, raw: &[u8]) -> Result<()> {
        self.inner.write_raw(raw)
    }
}
