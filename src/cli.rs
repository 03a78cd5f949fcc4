use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use honeytap::config::SensorConfig;
use honeytap::core::{Frame, NicId};
use honeytap::tls::certs::SelfSigned;
use honeytap::{Classifier, FilterRules, TlsTerminator};

#[derive(Parser)]
#[command(name = "honeytap")]
#[command(author, version, about = "Traffic sniffing core for network honeypots")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration and show what it enables
    CheckConfig,

    /// Generate default configuration
    GenConfig {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a self-signed certificate and key as PEM
    GenCert {
        /// Common name (and DNS name) of the certificate
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// Certificate output file
        #[arg(long)]
        cert: PathBuf,

        /// Private key output file
        #[arg(long)]
        key: PathBuf,
    },

    /// Classify one hex-encoded Ethernet frame and print the result as JSON
    Classify {
        /// Frame bytes, Ethernet header included
        hex: String,

        /// NIC id reported for the frame
        #[arg(long, default_value = "0")]
        nic: NicId,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SensorConfig::load(path)?,
        None => SensorConfig::load_or_default()?,
    };

    match cli.command {
        Commands::CheckConfig => cmd_check_config(config),
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::GenCert {
            common_name,
            cert,
            key,
        } => cmd_gen_cert(&common_name, cert, key),
        Commands::Classify { hex, nic } => cmd_classify(config, &hex, nic),
    }
}

fn cmd_check_config(config: SensorConfig) -> Result<()> {
    let rules = FilterRules::from_config(&config.filter);
    let terminator =
        TlsTerminator::from_config(&config.tls).context("Failed to load TLS identities")?;

    println!("{}", "Configuration OK".green().bold());
    println!(
        "Blocked ports:     {} tcp, {} udp",
        rules.tcp_port_count(),
        rules.udp_port_count()
    );
    println!("Blocked addresses: {}", rules.address_count());
    let skipped = config.filter.blocked_ports.len()
        + config.filter.blocked_sources.len()
        + config.filter.blocked_destinations.len();
    if skipped > rules.len() {
        println!(
            "{}",
            format!("Skipped entries:   {}", skipped - rules.len()).yellow()
        );
    }
    println!(
        "Hardware address:  {}",
        config
            .link
            .hardware_address
            .as_deref()
            .unwrap_or("(from endpoint)")
    );
    println!("Knock queue:       {}", config.knocks.channel_capacity);
    println!(
        "Scan threshold:    {} targets in {}s",
        config.knocks.scan_port_threshold, config.knocks.scan_window_secs
    );
    println!("Peek timeout:      {}ms", config.listener.peek_timeout_ms);
    println!("TLS termination:   {:?}", terminator);
    println!("TLS handshake:     {}ms", config.tls.handshake_timeout_ms);
    println!(
        "UDP writes:        {} x {}ms",
        config.udp.write_attempts, config.udp.write_wait_ms
    );

    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = SensorConfig::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn cmd_gen_cert(common_name: &str, cert: PathBuf, key: PathBuf) -> Result<()> {
    let generated = SelfSigned::generate(common_name).context("Failed to generate certificate")?;
    generated
        .save(&cert, &key)
        .with_context(|| format!("Failed to write {} / {}", cert.display(), key.display()))?;

    println!("Certificate written to {}", cert.display());
    println!("Private key written to {}", key.display());
    Ok(())
}

fn cmd_classify(config: SensorConfig, hex_frame: &str, nic: NicId) -> Result<()> {
    let raw: String = hex_frame.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&raw).context("Frame is not valid hex")?;
    let frame = Frame::from_ethernet(nic, &bytes)
        .context("Frame is shorter than an Ethernet header")?;
    let proto = frame
        .ether_type()
        .context("Frame has no link header")?;

    let rules = Arc::new(FilterRules::from_config(&config.filter));
    let mut classifier = Classifier::new(rules)
        .with_prefix(config.link.log_prefix.clone())
        .with_max_event_payload(config.link.max_event_payload);
    if let Some(addr) = &config.link.hardware_address {
        let mac = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid link.hardware_address: {}", e))?;
        classifier = classifier.with_own_mac(mac);
    }

    let inspection = classifier.inspect(&frame, proto);
    println!("{}", serde_json::to_string_pretty(&inspection)?);

    Ok(())
}
