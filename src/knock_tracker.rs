//! Scan detection over the knock stream
//!
//! Tracks the distinct targets each prober touched within a sliding window
//! and raises one "scan" event per prober once the threshold is reached.
//! The alert re-arms only after the prober's window empties.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::KnockConfig;
use crate::core::{Event, EventSink, Knock, KnockKind, MacAddr};

/// Who sent a knock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prober {
    Ip(IpAddr),
    /// Frames without a network address (never the case for TCP/UDP/ICMP today)
    Mac(MacAddr),
}

impl Prober {
    fn of(knock: &Knock) -> Option<Self> {
        knock
            .src_ip
            .map(|ip| Prober::Ip(ip.to_canonical()))
            .or(knock.src_mac.map(Prober::Mac))
    }
}

impl fmt::Display for Prober {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prober::Ip(ip) => write!(f, "{}", ip),
            Prober::Mac(mac) => write!(f, "{}", mac),
        }
    }
}

/// Targets touched by one prober
#[derive(Debug)]
struct TargetAccess {
    targets: HashMap<KnockKind, Instant>,
    alerted: bool,
}

impl TargetAccess {
    fn new() -> Self {
        Self {
            targets: HashMap::new(),
            alerted: false,
        }
    }

    fn add(&mut self, kind: KnockKind, now: Instant) {
        self.targets.insert(kind, now);
    }

    fn cleanup_old(&mut self, window: Duration, now: Instant) {
        self.targets
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
    }
}

/// Raised when a prober reaches the distinct-target threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanAlert {
    pub prober: Prober,
    pub distinct_targets: usize,
    pub window: Duration,
    /// Targets in the window, rendered "tcp/22", sorted
    pub targets: Vec<String>,
}

impl ScanAlert {
    pub fn to_event(&self) -> Event {
        let mut event = Event::new("scan")
            .field("type", "port_scan")
            .field("prober", self.prober.to_string())
            .field("distinct_targets", self.distinct_targets)
            .field("window_secs", self.window.as_secs())
            .field("targets", self.targets.clone());
        if let Prober::Ip(ip) = self.prober {
            event = event.with_src(Some(ip), None);
        }
        event
    }
}

/// Per-prober distinct-target counter
#[derive(Debug)]
pub struct KnockTracker {
    window: Duration,
    threshold: usize,
    probers: HashMap<Prober, TargetAccess>,
}

impl KnockTracker {
    pub fn new(config: &KnockConfig) -> Self {
        Self {
            window: config.scan_window(),
            threshold: config.scan_port_threshold.max(1),
            probers: HashMap::new(),
        }
    }

    /// Number of probers with targets inside the window
    pub fn tracked(&self) -> usize {
        self.probers.len()
    }

    /// Record one knock; returns an alert the first time the threshold is reached
    pub fn record(&mut self, knock: &Knock, now: Instant) -> Option<ScanAlert> {
        let prober = Prober::of(knock)?;
        let access = self.probers.entry(prober).or_insert_with(TargetAccess::new);
        access.cleanup_old(self.window, now);
        if access.targets.is_empty() {
            access.alerted = false;
        }
        access.add(knock.kind, now);

        let count = access.targets.len();
        debug!("knock {} from {} ({} distinct targets)", knock.kind, prober, count);

        if count < self.threshold || access.alerted {
            return None;
        }
        access.alerted = true;

        let mut targets: Vec<String> = access.targets.keys().map(|k| k.to_string()).collect();
        targets.sort();
        Some(ScanAlert {
            prober,
            distinct_targets: count,
            window: self.window,
            targets,
        })
    }

    /// Drop probers whose window has emptied
    pub fn cleanup(&mut self, now: Instant) {
        let window = self.window;
        self.probers.retain(|prober, access| {
            access.cleanup_old(window, now);
            let keep = !access.targets.is_empty();
            if !keep {
                debug!("Cleaned up knock tracking for {}", prober);
            }
            keep
        });
    }

    /// Consume knocks until the queue closes, publishing scan events
    pub async fn run(mut self, mut knocks: mpsc::Receiver<Knock>, events: Arc<dyn EventSink>) {
        info!(
            "Knock tracker started: {} targets in {:?}",
            self.threshold, self.window
        );
        let mut sweep = tokio::time::interval(self.window.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                knock = knocks.recv() => {
                    let Some(knock) = knock else {
                        break;
                    };
                    if let Some(alert) = self.record(&knock, Instant::now()) {
                        warn!(
                            "Scan detected from {}: {} distinct targets in {:?}",
                            alert.prober, alert.distinct_targets, alert.window
                        );
                        events.publish(alert.to_event());
                    }
                }
                _ = sweep.tick() => self.cleanup(Instant::now()),
            }
        }

        info!("Knock tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: usize, window_secs: u64) -> KnockTracker {
        KnockTracker::new(&KnockConfig {
            channel_capacity: 16,
            scan_window_secs: window_secs,
            scan_port_threshold: threshold,
        })
    }

    fn tcp_knock(ip: &str, port: u16) -> Knock {
        Knock {
            kind: KnockKind::Tcp { port },
            src_mac: None,
            src_ip: Some(ip.parse().unwrap()),
            nic: 1,
        }
    }

    #[test]
    fn test_one_alert_per_window() {
        let mut t = tracker(3, 60);
        let start = Instant::now();

        assert!(t.record(&tcp_knock("192.0.2.1", 22), start).is_none());
        // Repeat of the same target does not count twice
        assert!(t.record(&tcp_knock("192.0.2.1", 22), start).is_none());
        assert!(t.record(&tcp_knock("192.0.2.1", 23), start).is_none());

        let alert = t.record(&tcp_knock("192.0.2.1", 80), start).unwrap();
        assert_eq!(alert.distinct_targets, 3);
        assert_eq!(alert.targets, vec!["tcp/22", "tcp/23", "tcp/80"]);

        assert!(t.record(&tcp_knock("192.0.2.1", 443), start).is_none());
        assert!(t.record(&tcp_knock("192.0.2.1", 8080), start).is_none());
    }

    #[test]
    fn test_rearms_after_window_empties() {
        let mut t = tracker(2, 10);
        let start = Instant::now();
        t.record(&tcp_knock("192.0.2.1", 1), start);
        assert!(t.record(&tcp_knock("192.0.2.1", 2), start).is_some());

        let later = start + Duration::from_secs(11);
        assert!(t.record(&tcp_knock("192.0.2.1", 3), later).is_none());
        assert!(t.record(&tcp_knock("192.0.2.1", 4), later).is_some());
    }

    #[test]
    fn test_probers_and_protocols_are_separate() {
        let mut t = tracker(2, 60);
        let now = Instant::now();
        t.record(&tcp_knock("192.0.2.1", 53), now);
        assert!(t.record(&tcp_knock("192.0.2.2", 54), now).is_none());

        let udp = Knock {
            kind: KnockKind::Udp { port: 53 },
            ..tcp_knock("192.0.2.1", 0)
        };
        let alert = t.record(&udp, now).unwrap();
        assert_eq!(alert.targets, vec!["tcp/53", "udp/53"]);
        assert_eq!(t.tracked(), 2);
    }

    #[test]
    fn test_mapped_address_is_same_prober() {
        let mut t = tracker(2, 60);
        let now = Instant::now();
        t.record(&tcp_knock("192.0.2.9", 1), now);
        assert!(t.record(&tcp_knock("::ffff:192.0.2.9", 2), now).is_some());
    }

    #[test]
    fn test_cleanup() {
        let mut t = tracker(5, 5);
        let now = Instant::now();
        t.record(&tcp_knock("192.0.2.1", 1), now);
        t.record(&tcp_knock("192.0.2.2", 1), now + Duration::from_secs(4));
        t.cleanup(now + Duration::from_secs(6));
        assert_eq!(t.tracked(), 1);

        let anonymous = Knock {
            src_ip: None,
            ..tcp_knock("192.0.2.1", 9)
        };
        assert!(t.record(&anonymous, now).is_none());
        assert_eq!(t.tracked(), 1);
    }

    #[test]
    fn test_alert_event() {
        let alert = ScanAlert {
            prober: Prober::Ip("192.0.2.1".parse().unwrap()),
            distinct_targets: 2,
            window: Duration::from_secs(60),
            targets: vec!["tcp/1".to_string(), "tcp/2".to_string()],
        };
        let event = alert.to_event();
        assert_eq!(event.category, "scan");
        assert_eq!(event.src_ip, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(event.fields["targets"][1], "tcp/2");
        assert_eq!(event.fields["window_secs"], 60);
    }

    #[tokio::test]
    async fn test_run_publishes_scan_event() {
        let (knock_tx, knock_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(tracker(3, 60).run(knock_rx, Arc::new(event_tx)));

        for port in [21, 22, 23, 25] {
            knock_tx.send(tcp_knock("198.51.100.77", port)).await.unwrap();
        }
        drop(knock_tx);
        task.await.unwrap();

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.category, "scan");
        assert_eq!(event.fields["distinct_targets"], 3);
        assert!(event_rx.try_recv().is_err());
    }
}
