use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub knocks: KnockConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub udp: UdpConfig,
}

impl SensorConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: SensorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/honeytap/config.toml"),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

/// Static block lists, parsed once into `FilterRules`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// "<proto>/<port>" entries, e.g. "tcp/4444" or "udp/1900"
    #[serde(default)]
    pub blocked_ports: Vec<String>,

    /// Source IP literals whose frames never reach the virtual stack
    #[serde(default)]
    pub blocked_sources: Vec<String>,

    /// Destination IP literals whose frames never reach the virtual stack
    #[serde(default)]
    pub blocked_destinations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Overrides the hardware address reported by the wrapped endpoint
    #[serde(default)]
    pub hardware_address: Option<String>,

    /// First word of every classifier log line
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// Payload bytes copied into each packet event
    #[serde(default = "default_max_event_payload")]
    pub max_event_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            hardware_address: None,
            log_prefix: default_log_prefix(),
            max_event_payload: default_max_event_payload(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnockConfig {
    /// Capacity of the knock queue; knocks are dropped when it is full
    #[serde(default = "default_knock_capacity")]
    pub channel_capacity: usize,

    /// Time window for counting distinct probed ports per source
    #[serde(default = "default_scan_window")]
    pub scan_window_secs: u64,

    /// Distinct ports within the window that make a scan
    #[serde(default = "default_scan_threshold")]
    pub scan_port_threshold: usize,
}

impl Default for KnockConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_knock_capacity(),
            scan_window_secs: default_scan_window(),
            scan_port_threshold: default_scan_threshold(),
        }
    }
}

impl KnockConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// How long to wait for the first bytes of a new connection
    #[serde(default = "default_peek_timeout")]
    pub peek_timeout_ms: u64,

    /// Optional deadline for a single accept call
    #[serde(default)]
    pub accept_timeout_ms: Option<u64>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            peek_timeout_ms: default_peek_timeout(),
            accept_timeout_ms: None,
        }
    }
}

impl ListenerConfig {
    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Enable passive TLS termination
    #[serde(default)]
    pub enabled: bool,

    /// Default certificate chain (PEM)
    #[serde(default)]
    pub cert_path: Option<String>,

    /// Default private key (PEM)
    #[serde(default)]
    pub key_path: Option<String>,

    /// Common name of the generated certificate when no default is configured
    #[serde(default = "default_common_name")]
    pub common_name: String,

    /// Per-port identities, keyed by port number
    #[serde(default)]
    pub ports: HashMap<String, TlsIdentityConfig>,

    /// Upper bound on a TLS handshake once a client looked like TLS
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            common_name: default_common_name(),
            ports: HashMap::new(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsIdentityConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Wait for writability after a would-block before retrying
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Number of waits before a write gives up
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Datagrams queued per flow while its handler is busy
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,

    /// Maximum lifetime of a flow handler
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout_secs: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            write_attempts: default_write_attempts(),
            inbound_queue: default_inbound_queue(),
            flow_timeout_secs: default_flow_timeout(),
        }
    }
}

impl UdpConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs)
    }
}

// Default value functions
fn default_log_prefix() -> String {
    "recv".to_string()
}

fn default_max_event_payload() -> usize {
    4096
}

fn default_knock_capacity() -> usize {
    1024
}

fn default_scan_window() -> u64 {
    60
}

fn default_scan_threshold() -> usize {
    10
}

fn default_peek_timeout() -> u64 {
    1000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_common_name() -> String {
    "localhost".to_string()
}

fn default_write_wait() -> u64 {
    1000
}

fn default_write_attempts() -> u32 {
    5
}

fn default_inbound_queue() -> usize {
    64
}

fn default_flow_timeout() -> u64 {
    300
}
