//! ipcbus broker daemon
//!
//! Owns the bus socket: accepts peer connections, keeps the channel
//! registry, and routes messages, requests and responses between peers.
//!
//! ```text
//! ipcbusd start [-d] [--address ADDR]   run the broker (foreground unless -d)
//! ipcbusd stop                          SIGTERM the recorded broker and wait
//! ipcbusd status                        PID plus a live subscription summary
//! ```
//!
//! The PID and daemon log live in `<state dir>/ipcbus/`. `status` does not
//! trust the PID file alone: it joins the bus and asks the broker for its
//! subscription table.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ipcbus_broker::{spawn_broker, BrokerConfig, BrokerServer};
use ipcbus_core::StateRecord;
use ipcbus_peer::{Peer, PeerConfig};

/// How long `stop` waits for the broker to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `status` waits for the broker to answer.
const STATUS_TIMEOUT: Duration = Duration::from_millis(500);

/// ipcbus broker daemon
#[derive(Parser, Debug)]
#[command(name = "ipcbusd", version, about)]
struct Args {
    /// Configuration file (default: <config dir>/ipcbus/broker.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker
    Start {
        /// Detach from the terminal and log to the state directory
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Listen address: host:port, a bare port, or a socket path
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Stop the running broker
    Stop,
    /// Show whether the broker runs and what it routes
    Status,
}

// ============================================================================
// Runtime Files
// ============================================================================

fn runtime_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ipcbus")
}

/// PID file held for the lifetime of a running broker.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn path() -> PathBuf {
        runtime_dir().join("ipcbusd.pid")
    }

    /// Records this process. The file is removed again on drop.
    fn create() -> Result<Self> {
        let path = Self::path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        fs::write(&path, process::id().to_string())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Self { path })
    }

    /// PID of a live broker, clearing a stale file on the way.
    fn running() -> Option<i32> {
        let path = Self::path();
        let pid = fs::read_to_string(&path).ok()?.trim().parse().ok()?;
        if is_alive(pid) {
            Some(pid)
        } else {
            let _ = fs::remove_file(&path);
            None
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn is_alive(pid: i32) -> bool {
    // Signal 0 checks existence and permission without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn is_alive(_pid: i32) -> bool {
    false
}

// ============================================================================
// Commands
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        address: None,
    });

    match command {
        Command::Start { daemon, address } => start(args.config.as_deref(), daemon, address),
        Command::Stop => stop(),
        Command::Status => status(args.config.as_deref()),
    }
}

fn start(config_path: Option<&Path>, daemon: bool, address: Option<String>) -> Result<()> {
    if let Some(pid) = PidFile::running() {
        bail!("Broker is already running (PID {pid}); run 'ipcbusd stop' first");
    }

    // Configuration errors should reach the terminal, so resolve before forking.
    let mut config = BrokerConfig::load(config_path)?;
    config.override_address(address.as_deref())?;

    if daemon {
        detach()?;
    }

    let _pid_file = PidFile::create()?;
    run_broker(config)
}

fn detach() -> Result<()> {
    let log_path = runtime_dir().join("ipcbusd.log");
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate log handle")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}

fn stop() -> Result<()> {
    let Some(pid) = PidFile::running() else {
        println!("Broker is not running.");
        return Ok(());
    };

    println!("Stopping broker (PID {pid})...");
    terminate(pid)?;

    let deadline = std::time::Instant::now() + STOP_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if !is_alive(pid) {
            println!("Broker stopped.");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("Broker did not stop within {} seconds", STOP_TIMEOUT.as_secs())
}

#[cfg(unix)]
fn terminate(pid: i32) -> Result<()> {
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        bail!(
            "Failed to signal PID {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: i32) -> Result<()> {
    bail!("Stopping the broker is only supported on Unix systems")
}

fn status(config_path: Option<&Path>) -> Result<()> {
    let config = BrokerConfig::load(config_path)?;
    match PidFile::running() {
        Some(pid) => println!("Broker process: running (PID {pid})"),
        None => println!("Broker process: no PID file"),
    }
    println!("Address:        {}", config.address);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    match runtime.block_on(query_broker(&config)) {
        Ok(records) => {
            print!("{}", summarize(&records));
            Ok(())
        }
        Err(e) => {
            println!("Broker is not answering: {e:#}");
            process::exit(1);
        }
    }
}

async fn query_broker(config: &BrokerConfig) -> Result<Vec<StateRecord>> {
    let peer = Peer::new(
        PeerConfig::default()
            .with_name("ipcbusd-status")
            .with_address(config.address.clone()),
    );
    peer.connect(STATUS_TIMEOUT).await?;
    let records = peer.query_state("").await;
    let _ = peer.close();
    Ok(records?)
}

/// Renders the subscription table as per-channel subscriber counts.
fn summarize(records: &[StateRecord]) -> String {
    let mut channels: BTreeMap<&str, (usize, u32)> = BTreeMap::new();
    for record in records {
        let entry = channels.entry(record.channel.as_str()).or_default();
        entry.0 += 1;
        entry.1 += record.count;
    }

    let mut out = format!("Channels:       {}\n", channels.len());
    for (channel, (peers, refs)) in channels {
        out.push_str(&format!("  {channel:<32} {peers:>3} peer(s) {refs:>4} ref(s)\n"));
    }
    out
}

// ============================================================================
// Broker
// ============================================================================

#[tokio::main]
async fn run_broker(config: BrokerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ipcbusd=info".parse()?)
                .add_directive("ipcbus_broker=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        address = %config.address,
        max_connections = config.max_connections,
        max_packet_size = config.max_packet_size,
        "ipcbus broker starting"
    );

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel_token.clone()));

    let broker = spawn_broker();
    let server = BrokerServer::new(config, broker.clone(), cancel_token);
    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    if let Ok(stats) = broker.stats().await {
        info!(
            connections = stats.connections,
            channels = stats.channels,
            pending_requests = stats.pending_requests,
            "ipcbus broker stopped"
        );
    }
    Ok(())
}

async fn cancel_on_signal(cancel_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!(signal = name, "Shutting down");
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to wait for Ctrl+C");
            return;
        }
        info!(signal = "ctrl-c", "Shutting down");
    }

    cancel_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcbus_core::{PeerDescriptor, PeerId};

    fn record(channel: &str, peer: &str, count: u32) -> StateRecord {
        StateRecord {
            channel: channel.to_string(),
            peer: PeerDescriptor::new(PeerId::new(peer), peer, Default::default()),
            count,
        }
    }

    #[test]
    fn test_summarize_groups_by_channel() {
        let text = summarize(&[
            record("b", "p1", 1),
            record("a", "p1", 2),
            record("a", "p2", 1),
        ]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Channels:       2");
        assert!(lines[1].trim_start().starts_with('a'));
        assert!(lines[1].contains("2 peer(s)"));
        assert!(lines[1].contains("3 ref(s)"));
        assert!(lines[2].contains("1 peer(s)"));
    }

    #[test]
    fn test_summarize_empty_table() {
        assert_eq!(summarize(&[]), "Channels:       0\n");
    }
}
