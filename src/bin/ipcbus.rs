//! ipcbus command-line peer
//!
//! Joins the bus as a short-lived peer to publish, listen, issue requests or
//! inspect the broker's subscription table.
//!
//! # Usage
//!
//! ```text
//! ipcbus publish files/changed '"a.txt"' 3      # args are JSON, else plain strings
//! ipcbus listen files/changed other/channel     # print events until Ctrl+C
//! ipcbus request math/add 1 2 --timeout-ms 500
//! ipcbus state [channel]
//! ```
//!
//! The broker address comes from `--address`, then `IPCBUS_ADDRESS`, then
//! the default `127.0.0.1:45454`.

use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ipcbus_core::{Address, Value};
use ipcbus_peer::{BusEvent, Peer, PeerConfig, PeerError};

// ============================================================================
// CLI Arguments
// ============================================================================

/// ipcbus - talk to a running ipcbus broker
#[derive(Parser, Debug)]
#[command(name = "ipcbus", version, about)]
struct Args {
    /// Broker address: host:port, a bare port, or a socket path
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// How long to keep trying to reach the broker
    #[arg(long, global = true, default_value_t = 2000)]
    connect_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one message on a channel
    Publish {
        channel: String,
        /// Message arguments (JSON, or plain strings)
        args: Vec<String>,
    },
    /// Print every message on the given channels until interrupted
    Listen {
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Send a request and print the response
    Request {
        channel: String,
        args: Vec<String>,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Print the broker's subscription table
    State {
        /// Only this channel
        channel: Option<String>,
    },
}

// ============================================================================
// Value Conversion
// ============================================================================

/// Parses a CLI argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => from_json(json),
        Err(_) => Value::from(raw),
    }
}

fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Bool(b) => Value::from(b),
        serde_json::Value::String(s) => Value::from(s),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::Array(items) => Value::from(items.into_iter().map(from_json).collect::<Vec<_>>()),
        other => Value::Object(other),
    }
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Boolean(b) => serde_json::Value::from(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Double(d) => serde_json::Value::from(*d),
        Value::String(s) => serde_json::Value::from(s.as_str()),
        Value::Buffer(bytes) => serde_json::Value::from(format!("<{} bytes>", bytes.len())),
        Value::Object(json) => json.clone(),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
    }
}

fn render(args: &[Value]) -> String {
    serde_json::Value::Array(args.iter().map(to_json).collect()).to_string()
}

// ============================================================================
// Commands
// ============================================================================

async fn connect(args: &Args, name: &str) -> Result<Peer> {
    let mut config = PeerConfig::from_env()?.with_name(name);
    if let Some(address) = &args.address {
        config = config.with_address(Address::parse(address)?);
    }
    let peer = Peer::new(config);
    peer.connect(Duration::from_millis(args.connect_timeout_ms))
        .await
        .context("Failed to reach broker")?;
    debug!(peer = %peer.descriptor(), "Connected");
    Ok(peer)
}

async fn publish(peer: &Peer, channel: &str, args: &[String]) -> Result<()> {
    peer.send(channel, args.iter().map(|a| parse_arg(a)).collect())?;
    peer.close()?;
    // The writer flushes queued frames after close; let it finish.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

async fn listen(peer: &Peer, channels: &[String]) -> Result<()> {
    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel::<BusEvent>();
    for channel in channels {
        let tx = tx.clone();
        peer.subscribe(
            channel,
            std::sync::Arc::new(move |event: &BusEvent| {
                let _ = tx.send(event.clone());
            }),
        )?;
    }
    drop(tx);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let marker = if event.is_request() { "?" } else { " " };
                println!("{marker} {} <- {} {}", event.channel, event.sender.name, render(&event.args));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        if !peer.is_connected() {
            eprintln!("Broker connection lost");
            process::exit(1);
        }
    }
    let _ = peer.close();
    Ok(())
}

async fn request(peer: &Peer, channel: &str, args: &[String], timeout_ms: u64) -> Result<()> {
    let args = args.iter().map(|a| parse_arg(a)).collect();
    match peer.request(channel, args, Duration::from_millis(timeout_ms)).await {
        Ok(response) => {
            println!("{}", render(&response));
            let _ = peer.close();
            Ok(())
        }
        Err(PeerError::Rejected(reason)) => {
            eprintln!("rejected: {}", render(&reason));
            process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

async fn state(peer: &Peer, channel: Option<&str>) -> Result<()> {
    let records = peer.query_state(channel.unwrap_or_default()).await?;
    if records.is_empty() {
        println!("No subscriptions.");
    }
    for record in records {
        println!("{:<32} {:>4}  {}", record.channel, record.count, record.peer);
    }
    let _ = peer.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("ipcbus_peer=warn".parse()?),
        )
        .init();

    let args = Args::parse();
    let peer = connect(&args, "ipcbus-cli").await?;

    match &args.command {
        Command::Publish { channel, args } => publish(&peer, channel, args).await,
        Command::Listen { channels } => listen(&peer, channels).await,
        Command::Request {
            channel,
            args,
            timeout_ms,
        } => request(&peer, channel, args, *timeout_ms).await,
        Command::State { channel } => state(&peer, channel.as_deref()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_prefers_json() {
        assert_eq!(parse_arg("3"), Value::from(3));
        assert_eq!(parse_arg("true"), Value::from(true));
        assert_eq!(parse_arg("\"quoted\""), Value::from("quoted"));
        assert_eq!(parse_arg("plain text"), Value::from("plain text"));
        assert_eq!(
            parse_arg("[1, \"a\"]"),
            Value::Array(vec![Value::from(1), Value::from("a")])
        );
        assert_eq!(
            parse_arg("{\"k\": 1}"),
            Value::Object(serde_json::json!({"k": 1}))
        );
    }

    #[test]
    fn test_render_buffers_as_length() {
        let args = vec![Value::from(vec![1u8, 2, 3]), Value::from(1.5)];
        assert_eq!(render(&args), "[\"<3 bytes>\",1.5]");
    }
}
