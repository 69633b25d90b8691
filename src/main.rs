use anyhow::{Context, Result};
use clap::Parser;
use pcap::Device;
use std::fs::File;
use std::io::BufWriter;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use tlstap::capture::PacketSource;
use tlstap::output::{Formatter, OutputMode};
use tlstap::{Engine, EngineConfig, Error, KeyFormat};

/// Capture-time interval between idle-session sweeps.
const SWEEP_EVERY: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "tlstap",
    version,
    about = "Decrypt TLS sessions from captured traffic with the server's RSA key"
)]
struct Cli {
    /// Read from pcap/pcapng file instead of live capture
    #[arg(short = 'I', long)]
    input: Option<PathBuf>,

    /// Network interface to capture on
    #[arg(short = 'd', long)]
    interface: Option<String>,

    /// BPF filter expression (same syntax as tcpdump)
    #[arg(short = 'F', long)]
    bpf: Option<String>,

    /// Server private key as ADDR:PORT:PATH ([ADDR]:PORT:PATH for IPv6).
    /// 0.0.0.0 or :: matches any address on that port. Repeatable.
    #[arg(short = 'k', long = "key", value_name = "ADDR:PORT:PATH", value_parser = parse_key_spec)]
    keys: Vec<KeySpec>,

    /// Bind the keys given with --key to this SNI server name
    #[arg(long)]
    key_name: Option<String>,

    /// Password for encrypted PEM keys
    #[arg(long, env = "TLSTAP_KEY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Keys are DER encoded instead of PEM
    #[arg(long)]
    der: bool,

    /// Survive ack faults by resynchronizing at the next record boundary
    #[arg(long)]
    recovery: bool,

    /// Per-session out-of-order buffer budget in bytes
    #[arg(long, value_name = "BYTES")]
    max_reassembly: Option<usize>,

    /// Engine configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write session lifecycle events to FILE
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Hex dump output
    #[arg(short = 'x', long)]
    hex: bool,

    /// JSON output (one object per line)
    #[arg(long, conflicts_with = "hex")]
    json: bool,

    /// Suppress per-chunk headers
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Print session statistics at exit
    #[arg(long)]
    stats: bool,

    /// Stop after N decrypted chunks
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Snap length for live capture
    #[arg(short = 's', long, default_value_t = 65535)]
    snaplen: i32,

    /// List available network interfaces
    #[arg(short = 'L', long)]
    list_interfaces: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeySpec {
    addr: IpAddr,
    port: u16,
    path: PathBuf,
}

fn parse_key_spec(s: &str) -> std::result::Result<KeySpec, String> {
    const USAGE: &str = "expected ADDR:PORT:PATH";
    let (addr, rest) = match s.strip_prefix('[') {
        Some(v6) => v6.split_once("]:").ok_or(USAGE)?,
        None => s.split_once(':').ok_or(USAGE)?,
    };
    let (port, path) = rest.split_once(':').ok_or(USAGE)?;
    let addr = addr
        .parse::<IpAddr>()
        .map_err(|e| format!("bad address '{}': {}", addr, e))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("bad port '{}': {}", port, e))?;
    if path.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok(KeySpec {
        addr,
        port,
        path: PathBuf::from(path),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.list_interfaces {
        list_interfaces()?;
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    let mut source = if let Some(ref path) = cli.input {
        PacketSource::from_file(path, cli.bpf.as_deref())?
    } else {
        PacketSource::live(cli.interface.as_deref(), cli.snaplen, cli.bpf.as_deref())?
    };
    config.link_type = source.link_type();

    let engine = Engine::new(config).context("Invalid engine configuration")?;
    if cli.recovery || cli.max_reassembly.is_some() {
        engine.enable_recovery(
            cli.recovery || engine.config().recovery,
            cli.max_reassembly.or(engine.config().max_reassembly_bytes),
        );
    }

    let format = if cli.der { KeyFormat::Der } else { KeyFormat::Pem };
    for spec in &cli.keys {
        let bytes = std::fs::read(&spec.path)
            .context(format!("Failed to read key file: {}", spec.path.display()))?;
        engine
            .register_key(
                spec.addr,
                spec.port,
                cli.key_name.as_deref(),
                &bytes,
                format,
                cli.password.as_deref().map(str::as_bytes),
            )
            .context(format!("Failed to load key: {}", spec.path.display()))?;
    }
    if engine.registry().is_empty() {
        warn!("no server keys registered; nothing will be decrypted");
    }

    if let Some(ref path) = cli.trace {
        let file = File::create(path)
            .context(format!("Failed to create trace file: {}", path.display()))?;
        engine.set_trace(Some(Box::new(BufWriter::new(file))));
    }

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.hex {
        OutputMode::Hex
    } else {
        OutputMode::Text
    };
    let formatter = Formatter::new(mode, cli.quiet);
    let mut printed: usize = 0;
    let mut last_sweep: Option<SystemTime> = None;

    source.for_each_packet(|packet| {
        match engine.process_frame(packet.data, packet.timestamp) {
            Ok(chunks) => {
                for chunk in &chunks {
                    formatter.print_data(chunk, packet.timestamp);
                    printed += 1;
                }
            }
            Err(e @ (Error::ServerNotRegistered { .. } | Error::NoSession | Error::MalformedPacket(_))) => {
                debug!(error = %e, "packet skipped");
            }
            Err(e) => warn!(error = %e, "decode failed"),
        }

        let due = last_sweep.map_or(true, |t| {
            packet
                .timestamp
                .duration_since(t)
                .map_or(false, |elapsed| elapsed >= SWEEP_EVERY)
        });
        if due {
            engine.sweep_stale(packet.timestamp);
            last_sweep = Some(packet.timestamp);
        }

        match cli.count {
            Some(n) => printed < n,
            None => true,
        }
    })?;

    if cli.stats {
        formatter.print_stats(&engine.session_stats());
    }
    // Flushes the trace file.
    engine.set_trace(None);

    Ok(())
}

fn list_interfaces() -> Result<()> {
    let devices = Device::list()?;
    for dev in devices {
        let desc = dev.desc.as_deref().unwrap_or("");
        let addrs: Vec<String> = dev
            .addresses
            .iter()
            .map(|a| a.addr.to_string())
            .collect();
        println!("{:<16} {}  [{}]", dev.name, desc, addrs.join(", "));
    }
    Ok(())
}
