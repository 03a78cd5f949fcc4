//! UDP flow forwarder
//!
//! Each new 4-tuple seen by the virtual stack becomes a flow: a datagram
//! endpoint is created for it and an independent handler task receives the
//! first payload, later datagrams of the same flow, and a `FlowWriter` for
//! replies. A flow is torn down when its handler returns or outlives the
//! configured flow timeout.

mod writer;

pub use writer::FlowWriter;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use etherparse::UdpHeaderSlice;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::config::UdpConfig;
use crate::core::NicId;
use crate::error::Result;

const UDP_HEADER_LEN: usize = 8;

/// Flow identity: local and remote address/port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// Network-layer route of an inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub local: IpAddr,
    pub remote: IpAddr,
    pub nic: NicId,
}

/// Datagram endpoint owned by one flow
#[async_trait]
pub trait DatagramEndpoint: Send + Sync {
    /// Send without waiting; "would block" when the endpoint is full
    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Wait until the endpoint may accept a write
    async fn writable(&self) -> io::Result<()>;

    fn close(&self);
}

#[async_trait]
impl DatagramEndpoint for UdpSocket {
    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, data, dest)
    }

    async fn writable(&self) -> io::Result<()> {
        UdpSocket::writable(self).await
    }

    /// The socket closes when its last reference drops
    fn close(&self) {}
}

/// Creates endpoints for new flows
pub trait DatagramStack: Send + Sync {
    /// Called with the forwarder's flow table entry locked, which keeps
    /// endpoint creation to one per new 4-tuple. Implementations must not
    /// call back into the `UdpForwarder`.
    fn create_endpoint(&self, key: &FlowKey) -> Result<Arc<dyn DatagramEndpoint>>;
}

/// Stack that answers every flow from one shared socket
#[derive(Debug, Clone)]
pub struct SharedSocketStack {
    socket: Arc<UdpSocket>,
}

impl SharedSocketStack {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl DatagramStack for SharedSocketStack {
    fn create_endpoint(&self, _key: &FlowKey) -> Result<Arc<dyn DatagramEndpoint>> {
        let endpoint: Arc<dyn DatagramEndpoint> = self.socket.clone();
        Ok(endpoint)
    }
}

/// Everything a handler gets for one flow
pub struct UdpFlow {
    pub key: FlowKey,
    pub nic: NicId,
    /// Payload of the datagram that created the flow
    pub payload: Vec<u8>,
    /// Later datagrams of the same flow
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub writer: FlowWriter,
}

impl fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpFlow")
            .field("key", &self.key)
            .field("nic", &self.nic)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Protocol emulator run once per flow
#[async_trait]
pub trait FlowHandler: Send + Sync + 'static {
    async fn handle(&self, flow: UdpFlow);
}

struct FlowEntry {
    id: u64,
    inbound: mpsc::Sender<Vec<u8>>,
}

/// Dispatches inbound UDP datagrams to per-flow handler tasks
pub struct UdpForwarder {
    stack: Arc<dyn DatagramStack>,
    handler: Arc<dyn FlowHandler>,
    flows: Arc<DashMap<FlowKey, FlowEntry>>,
    runtime: Handle,
    config: UdpConfig,
    next_id: AtomicU64,
}

impl fmt::Debug for UdpForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpForwarder")
            .field("flows", &self.flows.len())
            .field("config", &self.config)
            .finish()
    }
}

impl UdpForwarder {
    /// Create a forwarder spawning handlers on the current runtime
    pub fn new(
        stack: Arc<dyn DatagramStack>,
        handler: Arc<dyn FlowHandler>,
        config: &UdpConfig,
    ) -> Result<Self> {
        Ok(Self::with_runtime(stack, handler, config, Handle::try_current()?))
    }

    pub fn with_runtime(
        stack: Arc<dyn DatagramStack>,
        handler: Arc<dyn FlowHandler>,
        config: &UdpConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            stack,
            handler,
            flows: Arc::new(DashMap::new()),
            runtime,
            config: config.clone(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn has_flow(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Hand one inbound UDP datagram (header included) to its flow
    ///
    /// Returns false when the datagram is malformed or no endpoint could be
    /// created for a new flow; the stack then handles it itself.
    pub fn handle_packet(&self, route: &Route, packet: &[u8]) -> bool {
        let Ok(header) = UdpHeaderSlice::from_slice(packet) else {
            trace!("udp datagram too short ({} bytes)", packet.len());
            return false;
        };
        let declared = usize::from(header.length());
        if declared < UDP_HEADER_LEN || declared > packet.len() {
            trace!(
                "udp length {} invalid for {} byte datagram",
                declared,
                packet.len()
            );
            return false;
        }

        let key = FlowKey {
            local: SocketAddr::new(route.local, header.destination_port()),
            remote: SocketAddr::new(route.remote, header.source_port()),
        };
        let payload = &packet[UDP_HEADER_LEN..declared];

        match self.flows.entry(key) {
            Entry::Occupied(mut entry) => match entry.get().inbound.try_send(payload.to_vec()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!("flow {} queue full, datagram dropped", key);
                    true
                }
                // Handler already returned; the entry is about to be removed
                Err(TrySendError::Closed(_)) => match self.start_flow(key, route.nic, payload) {
                    Some(flow) => {
                        debug!("flow {} ended, restarted for new datagram", key);
                        entry.insert(flow);
                        true
                    }
                    None => {
                        entry.remove();
                        false
                    }
                },
            },
            Entry::Vacant(entry) => match self.start_flow(key, route.nic, payload) {
                Some(flow) => {
                    entry.insert(flow);
                    true
                }
                None => false,
            },
        }
    }

    /// Create the endpoint and spawn the handler of a new flow
    ///
    /// Runs while the caller holds the flow table entry, so the new flow is
    /// visible to the next datagram before its handler can finish.
    fn start_flow(&self, key: FlowKey, nic: NicId, payload: &[u8]) -> Option<FlowEntry> {
        let endpoint = match self.stack.create_endpoint(&key) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!("cannot create endpoint for {}: {}", key, e);
                return None;
            }
        };
        let (tx, rx) = mpsc::channel(self.config.inbound_queue.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let flow = UdpFlow {
            key,
            nic,
            payload: payload.to_vec(),
            inbound: rx,
            writer: FlowWriter::new(endpoint.clone(), key.remote, &self.config),
        };
        self.spawn_flow(id, flow, endpoint);
        Some(FlowEntry { id, inbound: tx })
    }

    fn spawn_flow(&self, id: u64, flow: UdpFlow, endpoint: Arc<dyn DatagramEndpoint>) {
        let flows = self.flows.clone();
        let handler = self.handler.clone();
        let lifetime: Duration = self.config.flow_timeout();
        let key = flow.key;
        debug!("new udp flow {}", key);

        self.runtime.spawn(async move {
            if tokio::time::timeout(lifetime, handler.handle(flow)).await.is_err() {
                debug!("udp flow {} exceeded {:?}", key, lifetime);
            }
            flows.remove_if(&key, |_, entry| entry.id == id);
            endpoint.close();
            debug!("udp flow {} closed", key);
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    /// Endpoint recording writes; can be switched to "would block" or hard failure
    #[derive(Default)]
    pub(crate) struct MockEndpoint {
        pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        pub blocked: AtomicBool,
        pub fail: AtomicBool,
        pub closed: AtomicBool,
        pub writable: Notify,
    }

    impl MockEndpoint {
        pub fn blocked() -> Self {
            let ep = Self::default();
            ep.blocked.store(true, Ordering::SeqCst);
            ep
        }
    }

    #[async_trait]
    impl DatagramEndpoint for MockEndpoint {
        fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            if self.blocked.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.sent.lock().push((data.to_vec(), dest));
            Ok(data.len())
        }

        async fn writable(&self) -> io::Result<()> {
            if self.blocked.load(Ordering::SeqCst) {
                self.writable.notified().await;
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Stack handing out one mock endpoint per flow
    #[derive(Default)]
    pub(crate) struct MockStack {
        pub created: AtomicUsize,
        pub endpoints: Mutex<Vec<(FlowKey, Arc<MockEndpoint>)>>,
        /// Remote ports whose endpoints never become writable
        pub stalled_ports: Vec<u16>,
        pub refuse: bool,
    }

    impl MockStack {
        pub fn endpoint(&self, remote_port: u16) -> Option<Arc<MockEndpoint>> {
            self.endpoints
                .lock()
                .iter()
                .find(|(k, _)| k.remote.port() == remote_port)
                .map(|(_, ep)| ep.clone())
        }
    }

    impl DatagramStack for MockStack {
        fn create_endpoint(&self, key: &FlowKey) -> Result<Arc<dyn DatagramEndpoint>> {
            if self.refuse {
                return Err(Error::Endpoint("port exhausted".to_string()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let ep = if self.stalled_ports.contains(&key.remote.port()) {
                Arc::new(MockEndpoint::blocked())
            } else {
                Arc::new(MockEndpoint::default())
            };
            self.endpoints.lock().push((*key, ep.clone()));
            Ok(ep)
        }
    }

    /// Replies "echo:<payload>" to every datagram of the flow
    pub(crate) struct EchoHandler {
        pub seen: Mutex<Vec<(FlowKey, Vec<u8>)>>,
        pub results: Mutex<Vec<std::result::Result<usize, String>>>,
    }

    impl EchoHandler {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
            })
        }

        async fn echo(&self, flow: &UdpFlow, payload: Vec<u8>) {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&payload);
            self.seen.lock().push((flow.key, payload));
            let res = flow.writer.reply(&reply).await.map_err(|e| e.to_string());
            self.results.lock().push(res);
        }
    }

    #[async_trait]
    impl FlowHandler for EchoHandler {
        async fn handle(&self, mut flow: UdpFlow) {
            let first = std::mem::take(&mut flow.payload);
            self.echo(&flow, first).await;
            while let Some(next) = flow.inbound.recv().await {
                self.echo(&flow, next).await;
            }
        }
    }

    /// Returns as soon as it has seen the first payload
    pub(crate) struct OneShotHandler;

    #[async_trait]
    impl FlowHandler for OneShotHandler {
        async fn handle(&self, _flow: UdpFlow) {}
    }

    pub(crate) fn datagram(src: u16, dst: u16, payload: &[u8]) -> Vec<u8> {
        let len = (UDP_HEADER_LEN + payload.len()) as u16;
        let mut out = Vec::new();
        out.extend_from_slice(&src.to_be_bytes());
        out.extend_from_slice(&dst.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(payload);
        out
    }

    fn route() -> Route {
        Route {
            local: "10.0.0.1".parse().unwrap(),
            remote: "198.51.100.3".parse().unwrap(),
            nic: 1,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_new_flow_runs_handler() {
        let stack = Arc::new(MockStack::default());
        let handler = EchoHandler::new();
        let fwd = UdpForwarder::new(stack.clone(), handler.clone(), &UdpConfig::default()).unwrap();

        assert!(fwd.handle_packet(&route(), &datagram(5000, 53, b"ping")));
        assert!(fwd.handle_packet(&route(), &datagram(5000, 53, b"again")));
        wait_until(|| handler.seen.lock().len() == 2).await;

        let seen = handler.seen.lock().clone();
        assert_eq!(seen[0].0.local, "10.0.0.1:53".parse().unwrap());
        assert_eq!(seen[0].0.remote, "198.51.100.3:5000".parse().unwrap());
        assert_eq!(seen[0].1, b"ping");
        assert_eq!(seen[1].1, b"again");
        assert_eq!(stack.created.load(Ordering::SeqCst), 1);

        let ep = stack.endpoint(5000).unwrap();
        wait_until(|| ep.sent.lock().len() == 2).await;
        assert_eq!(ep.sent.lock()[0].0, b"echo:ping");
    }

    #[tokio::test]
    async fn test_trailing_bytes_are_trimmed() {
        let stack = Arc::new(MockStack::default());
        let handler = EchoHandler::new();
        let fwd = UdpForwarder::new(stack, handler.clone(), &UdpConfig::default()).unwrap();

        let mut packet = datagram(7, 7, b"abc");
        packet.extend_from_slice(&[0xee; 4]);
        assert!(fwd.handle_packet(&route(), &packet));
        wait_until(|| !handler.seen.lock().is_empty()).await;
        assert_eq!(handler.seen.lock()[0].1, b"abc");
    }

    #[tokio::test]
    async fn test_malformed_datagrams_create_no_flow() {
        let stack = Arc::new(MockStack::default());
        let fwd = UdpForwarder::new(stack.clone(), EchoHandler::new(), &UdpConfig::default()).unwrap();

        let mut too_long = datagram(1, 2, b"abcd");
        too_long[4] = 0x01; // declared 256+ bytes
        assert!(!fwd.handle_packet(&route(), &too_long));

        let mut too_small = datagram(1, 2, b"abcd");
        too_small[5] = 4;
        too_small[4] = 0;
        assert!(!fwd.handle_packet(&route(), &too_small));

        assert!(!fwd.handle_packet(&route(), &[0, 1, 0, 2]));

        assert_eq!(stack.created.load(Ordering::SeqCst), 0);
        assert_eq!(fwd.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_failure_returns_false() {
        let stack = Arc::new(MockStack {
            refuse: true,
            ..Default::default()
        });
        let fwd = UdpForwarder::new(stack, EchoHandler::new(), &UdpConfig::default()).unwrap();
        assert!(!fwd.handle_packet(&route(), &datagram(1, 2, b"x")));
        assert_eq!(fwd.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_flow_torn_down_when_handler_returns() {
        let stack = Arc::new(MockStack::default());
        let fwd = UdpForwarder::new(stack.clone(), Arc::new(OneShotHandler), &UdpConfig::default())
            .unwrap();

        assert!(fwd.handle_packet(&route(), &datagram(9, 9, b"x")));
        wait_until(|| fwd.flow_count() == 0).await;
        let ep = stack.endpoint(9).unwrap();
        wait_until(|| ep.closed.load(Ordering::SeqCst)).await;

        // Same 4-tuple starts a fresh flow
        assert!(fwd.handle_packet(&route(), &datagram(9, 9, b"y")));
        assert_eq!(stack.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_datagram_after_inbox_closed_starts_new_flow() {
        /// Stops reading right away but keeps the flow alive until released
        struct DeafHandler {
            seen: Mutex<Vec<Vec<u8>>>,
            release_first: Notify,
            release_second: Notify,
        }

        #[async_trait]
        impl FlowHandler for DeafHandler {
            async fn handle(&self, flow: UdpFlow) {
                self.seen.lock().push(flow.payload.clone());
                drop(flow.inbound);
                if flow.payload == b"first" {
                    self.release_first.notified().await;
                } else {
                    self.release_second.notified().await;
                }
            }
        }

        let stack = Arc::new(MockStack::default());
        let handler = Arc::new(DeafHandler {
            seen: Mutex::new(Vec::new()),
            release_first: Notify::new(),
            release_second: Notify::new(),
        });
        let fwd = UdpForwarder::new(stack.clone(), handler.clone(), &UdpConfig::default()).unwrap();

        assert!(fwd.handle_packet(&route(), &datagram(4000, 69, b"first")));
        wait_until(|| handler.seen.lock().len() == 1).await;
        assert_eq!(fwd.flow_count(), 1);

        assert!(fwd.handle_packet(&route(), &datagram(4000, 69, b"second")));
        wait_until(|| handler.seen.lock().len() == 2).await;
        assert_eq!(handler.seen.lock()[1], b"second");
        assert_eq!(stack.created.load(Ordering::SeqCst), 2);
        assert_eq!(fwd.flow_count(), 1);

        // The replaced flow finishing does not remove its successor
        handler.release_first.notify_one();
        let first_ep = stack.endpoint(4000).unwrap();
        wait_until(|| first_ep.closed.load(Ordering::SeqCst)).await;
        assert_eq!(fwd.flow_count(), 1);

        handler.release_second.notify_one();
        wait_until(|| fwd.flow_count() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_timeout() {
        struct Forever;

        #[async_trait]
        impl FlowHandler for Forever {
            async fn handle(&self, _flow: UdpFlow) {
                std::future::pending::<()>().await;
            }
        }

        let stack = Arc::new(MockStack::default());
        let config = UdpConfig {
            flow_timeout_secs: 1,
            ..Default::default()
        };
        let fwd = UdpForwarder::new(stack.clone(), Arc::new(Forever), &config).unwrap();

        assert!(fwd.handle_packet(&route(), &datagram(11, 53, b"q")));
        assert_eq!(fwd.flow_count(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fwd.flow_count(), 0);
        assert!(stack.endpoint(11).unwrap().closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_arrivals_create_one_flow() {
        let stack = Arc::new(MockStack::default());
        let handler = EchoHandler::new();
        let config = UdpConfig {
            inbound_queue: 64,
            ..Default::default()
        };
        let fwd = UdpForwarder::new(stack.clone(), handler.clone(), &config).unwrap();

        let threads = 8;
        let barrier = std::sync::Barrier::new(threads);
        std::thread::scope(|s| {
            for i in 0..threads {
                let fwd = &fwd;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    assert!(fwd.handle_packet(&route(), &datagram(6000, 161, &[i as u8])));
                });
            }
        });

        assert_eq!(stack.created.load(Ordering::SeqCst), 1);
        wait_until(|| handler.seen.lock().len() == threads).await;
        let mut payloads: Vec<u8> = handler.seen.lock().iter().map(|(_, p)| p[0]).collect();
        payloads.sort_unstable();
        assert_eq!(payloads, (0..threads as u8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_flow_does_not_block_others() {
        let stack = Arc::new(MockStack {
            stalled_ports: vec![1111],
            ..Default::default()
        });
        let handler = EchoHandler::new();
        let fwd = UdpForwarder::new(stack.clone(), handler.clone(), &UdpConfig::default()).unwrap();

        assert!(fwd.handle_packet(&route(), &datagram(1111, 53, b"slow")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fwd.handle_packet(&route(), &datagram(2222, 53, b"fast")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The healthy flow answered while the stalled one is still retrying
        let fast = stack.endpoint(2222).unwrap();
        assert_eq!(fast.sent.lock().len(), 1);
        assert!(handler.results.lock().iter().all(|r| r.is_ok()));
        assert_eq!(handler.results.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let results = handler.results.lock().clone();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[1],
            Err("write timed out after 5 attempts".to_string())
        );
        // Backpressure does not tear the flow down
        assert!(fwd.has_flow(&FlowKey {
            local: "10.0.0.1:53".parse().unwrap(),
            remote: "198.51.100.3:1111".parse().unwrap(),
        }));
    }

    #[tokio::test]
    async fn test_shared_socket_stack_replies() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let fwd = UdpForwarder::new(
            Arc::new(SharedSocketStack::new(server.clone())),
            EchoHandler::new(),
            &UdpConfig::default(),
        )
        .unwrap();

        let route = Route {
            local: "127.0.0.1".parse().unwrap(),
            remote: client_addr.ip(),
            nic: 0,
        };
        let packet = datagram(client_addr.port(), server.local_addr().unwrap().port(), b"hi");
        assert!(fwd.handle_packet(&route, &packet));

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"echo:hi");
        assert_eq!(from, server.local_addr().unwrap());
    }
}
