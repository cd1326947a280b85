//! DriftKV Node Binary
//!
//! Opens a replicated store and serves a line-oriented console on stdin.
//!
//! ```text
//! put <key> <value>   store a value
//! get <key>           print a value
//! del <key>           remove a key
//! peers               list replication connections
//! quit                close the store and exit
//! ```

use std::io::{self, BufRead, Write};
use std::time::Duration;

use clap::Parser;
use driftkv::{Config, DriftMap, ReplicationConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// DriftKV Node
#[derive(Parser, Debug)]
#[command(name = "driftkv-node")]
#[command(about = "Replicated off-heap key-value store node")]
#[command(version)]
struct Args {
    /// Node id of this replica (1-255)
    #[arg(short, long)]
    node_id: u8,

    /// Replication listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    listen: String,

    /// Peer endpoint to connect to (repeatable)
    #[arg(short, long)]
    peer: Vec<String>,

    /// Store file; anonymous memory when omitted
    #[arg(short = 'f', long)]
    file: Option<String>,

    /// Number of segments
    #[arg(short, long, default_value = "16")]
    segments: usize,

    /// Expected number of entries
    #[arg(short, long, default_value = "65536")]
    entries: u64,

    /// Seconds a removed entry is kept for late peers
    #[arg(long, default_value = "60")]
    cleanup_secs: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,driftkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    tracing::info!("DriftKV Node v{}", driftkv::VERSION);
    tracing::info!("Node id: {}", args.node_id);
    tracing::info!("Listen address: {}", args.listen);

    // Build config from args
    let mut replication = ReplicationConfig::builder(args.node_id).listen_addr(&args.listen);
    for peer in &args.peer {
        replication = replication.endpoint(peer);
    }
    let mut builder = Config::builder()
        .segments(args.segments)
        .entries(args.entries)
        .removed_entry_cleanup_timeout(Duration::from_secs(args.cleanup_secs))
        .replication(replication.build());
    if let Some(file) = &args.file {
        builder = builder.persist_path(file);
    }

    let map: DriftMap<String, String> = match DriftMap::open(builder.build()) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = console(&map) {
        tracing::error!("Console error: {}", e);
    }

    if let Err(e) = map.close() {
        tracing::error!("Failed to close store: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Node stopped");
}

/// Read commands until `quit` or end of input
fn console(map: &DriftMap<String, String>) -> driftkv::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.trim().splitn(3, ' ');
        let command = parts.next().unwrap_or("");
        let key = parts.next().map(str::to_string);
        let value = parts.next().map(str::to_string);

        let reply = match (command, key, value) {
            ("", _, _) => continue,
            ("quit" | "exit", _, _) => break,
            ("get", Some(key), None) => match map.get(&key) {
                Ok(Some(value)) => value,
                Ok(None) => "(nil)".to_string(),
                Err(e) => format!("ERR {}", e),
            },
            ("put", Some(key), Some(value)) => match map.put(&key, &value) {
                Ok(Some(previous)) => format!("OK (was {})", previous),
                Ok(None) => "OK".to_string(),
                Err(e) => format!("ERR {}", e),
            },
            ("del", Some(key), None) => match map.remove(&key) {
                Ok(Some(previous)) => format!("OK (was {})", previous),
                Ok(None) => "(nil)".to_string(),
                Err(e) => format!("ERR {}", e),
            },
            ("peers", None, None) => match map.peers() {
                Ok(peers) if peers.is_empty() => "(no peers)".to_string(),
                Ok(peers) => peers
                    .iter()
                    .map(|p| {
                        format!(
                            "{} node={} state={:?}{}",
                            p.endpoint,
                            p.peer_id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string()),
                            p.state,
                            if p.inbound { " (inbound)" } else { "" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("ERR {}", e),
            },
            _ => "ERR usage: get <key> | put <key> <value> | del <key> | peers | quit".to_string(),
        };

        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }
    Ok(())
}
