use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::SystemTime;

use packwatch::capture::{self, CaptureEvent, PacketSource};
use packwatch::config::Config;
use packwatch::output::Formatter;
use packwatch::protocol;
use packwatch::reassembly::SessionTable;
use packwatch::service::ServiceTable;
use packwatch::session::{FinalizerOptions, Pipeline, SessionFinalizer};
use packwatch::store::SessionStore;
use packwatch::tls::RsaKeyStore;

#[derive(Parser)]
#[command(
    name = "packwatch",
    version,
    about = "Reassemble, search and decrypt the traffic of monitored services"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long, env = "PACKWATCH_CONFIG", default_value = "packwatch.toml")]
    config: PathBuf,

    /// Network interface to capture on (overrides the config)
    #[arg(short = 'd', long)]
    interface: Option<String>,

    /// Read from pcap/pcapng file instead of live capture
    #[arg(short = 'I', long)]
    input: Option<PathBuf>,

    /// Append stored sessions as JSON lines to this file (overrides the config)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Directory of PEM RSA private keys (overrides the config)
    #[arg(long)]
    keys_dir: Option<PathBuf>,

    /// Print sessions as JSON
    #[arg(long)]
    json: bool,

    /// Show hex dump of packet content
    #[arg(short = 'x', long)]
    hex: bool,

    /// Quiet mode (content only, no session headers)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Don't use promiscuous mode
    #[arg(short = 'p', long)]
    no_promisc: bool,

    /// Snap length (bytes to capture per packet)
    #[arg(short = 's', long, default_value_t = 65535)]
    snaplen: i32,

    /// List available interfaces and exit
    #[arg(short = 'L', long)]
    list_interfaces: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let cli = Cli::parse();

    if cli.list_interfaces {
        for (name, desc) in capture::list_interfaces()? {
            println!("{:<16} {}", name, desc.unwrap_or_default());
        }
        return Ok(());
    }

    let config = Config::from_file(&cli.config)?;

    let services = Arc::new(ServiceTable::new(config.local_ip, &config.services));
    if services.is_empty() {
        warn!("No services configured, no traffic will be admitted");
    }

    let store = Arc::new(match cli.output.as_ref().or(config.output.as_ref()) {
        Some(path) => SessionStore::open(path)?,
        None => SessionStore::in_memory(),
    });

    let sessions = store.subscribe();
    let formatter = Formatter::new(cli.json, cli.hex, cli.quiet);
    let printer = std::thread::Builder::new()
        .name("printer".into())
        .spawn(move || {
            for stored in sessions {
                formatter.print_session(&stored);
            }
        })
        .context("Failed to spawn printer thread")?;

    let mut finalizer = SessionFinalizer::new(
        services,
        store.clone(),
        Arc::new(config.patterns.clone()),
        FinalizerOptions {
            ignore_empty_packets: config.ignore_empty_packets,
            decrypt_tls: config.decrypt_tls,
        },
    );
    if config.decrypt_tls {
        if let Some(dir) = cli.keys_dir.as_ref().or(config.keys_dir.as_ref()) {
            finalizer = finalizer.with_keys(Arc::new(RsaKeyStore::from_dir(dir)?));
        }
    }

    let table = SessionTable::new(config.local_ip).with_max_sessions(config.max_sessions);
    let mut pipeline = Pipeline::new(table, finalizer, config.timeouts());

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .context("Failed to install signal handler")?;
    }

    let mut source = match &cli.input {
        Some(path) => PacketSource::from_file(path)?,
        None => {
            let interface = cli.interface.as_deref().or(config.interface.as_deref());
            PacketSource::live(interface, cli.snaplen, !cli.no_promisc)?
        }
    };
    let link_type = source.link_type();

    let result = source.run(&stop, |event| {
        match event {
            CaptureEvent::Packet(packet) => {
                if let Some(parsed) = protocol::parse_packet(packet.data, link_type) {
                    pipeline.handle_packet(&parsed, packet.timestamp);
                }
                pipeline.maybe_sweep(packet.timestamp);
            }
            CaptureEvent::Idle => {
                pipeline.maybe_sweep(SystemTime::now());
            }
        }
        true
    });

    if source.is_offline() {
        pipeline.flush();
    } else if pipeline.pending_sessions() > 0 {
        info!("Dropping {} open session(s)", pipeline.pending_sessions());
    }

    let stats = pipeline.stats();
    info!(
        "{} packets seen, {} admitted, {} sessions stored, {} dropped",
        stats.packets_seen, stats.packets_admitted, stats.sessions_stored, stats.sessions_dropped
    );

    store.close_subscribers();
    if printer.join().is_err() {
        warn!("Printer thread panicked");
    }

    result
}
