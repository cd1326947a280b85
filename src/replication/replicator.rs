//! Replication threads
//!
//! `Replicator` owns the listener thread and one connector thread per
//! configured endpoint. Every accepted or established connection runs a
//! session on its own thread.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::session::{run_session, PeerRegistry, PeerState, PeerStatus};
use super::watermark::WatermarkTable;
use crate::config::ReplicationConfig;
use crate::error::{DriftError, Result};
use crate::store::StoreCore;

/// How often the listener polls for connections and shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Granularity of interruptible sleeps
const SLEEP_STEP: Duration = Duration::from_millis(20);

/// State shared by every replication thread of one store
pub(crate) struct ReplicationContext {
    pub core: Arc<StoreCore>,
    pub config: ReplicationConfig,
    pub watermarks: WatermarkTable,
    pub registry: PeerRegistry,
    shutdown: AtomicBool,
}

impl ReplicationContext {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Handle to the running replication threads
pub(crate) struct Replicator {
    context: Arc<ReplicationContext>,
    local_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Replicator {
    pub fn start(core: Arc<StoreCore>, config: ReplicationConfig) -> Result<Self> {
        let listen_addr = config.listen_addr.clone();
        let endpoints = config.endpoints.clone();
        let mut replicator = Self {
            context: Arc::new(ReplicationContext {
                core,
                config,
                watermarks: WatermarkTable::new(),
                registry: PeerRegistry::new(),
                shutdown: AtomicBool::new(false),
            }),
            local_addr: None,
            threads: Vec::new(),
        };

        if let Some(addr) = listen_addr {
            let listener = TcpListener::bind(&addr).map_err(|e| {
                DriftError::Network(format!("Failed to bind replication listener {}: {}", addr, e))
            })?;
            listener.set_nonblocking(true)?;
            let local_addr = listener.local_addr()?;
            tracing::info!("Replication listening on {}", local_addr);

            let ctx = Arc::clone(&replicator.context);
            let handle = thread::Builder::new()
                .name("driftkv-listener".to_string())
                .spawn(move || accept_loop(ctx, listener))?;
            replicator.threads.push(handle);
            replicator.local_addr = Some(local_addr);
        }

        for endpoint in endpoints {
            let ctx = Arc::clone(&replicator.context);
            let handle = thread::Builder::new()
                .name(format!("driftkv-connect-{}", endpoint))
                .spawn(move || connect_loop(ctx, endpoint))?;
            replicator.threads.push(handle);
        }

        Ok(replicator)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.context.registry.snapshot()
    }

    /// Stop every replication thread and wait for them
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.context.shutdown.store(true, Ordering::SeqCst);
        self.context.registry.shutdown_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Replication thread panicked");
            }
        }
        tracing::info!("Replication stopped");
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Listener
// =============================================================================

fn accept_loop(ctx: Arc<ReplicationContext>, listener: TcpListener) {
    let ctx = &*ctx;
    thread::scope(|scope| {
        while !ctx.is_shutting_down() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!("Dropping connection from {}: {}", addr, e);
                        continue;
                    }
                    let spawned = thread::Builder::new()
                        .name(format!("driftkv-peer-{}", addr))
                        .spawn_scoped(scope, move || serve_inbound(ctx, stream, addr));
                    if let Err(e) = spawned {
                        tracing::warn!("Failed to spawn session for {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    tracing::warn!("Error accepting replication connection: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    });
}

fn serve_inbound(ctx: &ReplicationContext, stream: TcpStream, addr: SocketAddr) {
    let conn = ctx.registry.add(addr.to_string(), true);
    tracing::info!("Accepted replication connection from {}", addr);

    match run_session(ctx, conn, stream) {
        Ok(()) => tracing::info!("Replication connection from {} closed", addr),
        Err(e) if ctx.is_shutting_down() => {
            tracing::debug!("Replication connection from {} closed: {}", addr, e)
        }
        Err(e) => tracing::warn!("Replication connection from {} failed: {}", addr, e),
    }
    ctx.registry.remove(conn);
}

// =============================================================================
// Connector
// =============================================================================

fn connect_loop(ctx: Arc<ReplicationContext>, endpoint: String) {
    let config = &ctx.config;
    let conn = ctx.registry.add(endpoint.clone(), false);
    let mut backoff = config.reconnect_backoff_initial;

    while !ctx.is_shutting_down() {
        ctx.registry.set_state(conn, PeerState::Connecting);
        match connect(&endpoint, config.connect_timeout) {
            Ok(stream) => {
                tracing::info!("Connected to replication peer {}", endpoint);
                backoff = config.reconnect_backoff_initial;
                match run_session(&ctx, conn, stream) {
                    Ok(()) => tracing::info!("Replication connection to {} closed", endpoint),
                    Err(e) if ctx.is_shutting_down() => {
                        tracing::debug!("Replication connection to {} closed: {}", endpoint, e)
                    }
                    Err(e) => tracing::warn!("Replication connection to {} failed: {}", endpoint, e),
                }
            }
            Err(e) => tracing::debug!("Failed to connect to {}: {}", endpoint, e),
        }
        ctx.registry.set_state(conn, PeerState::Disconnected);

        if !config.auto_reconnect {
            break;
        }
        sleep_unless_shutdown(&ctx, backoff);
        backoff = (backoff * 2).min(config.reconnect_backoff_max);
    }
}

fn connect(endpoint: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in endpoint.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => e.into(),
        None => DriftError::Network(format!("{} resolved to no addresses", endpoint)),
    })
}

fn sleep_unless_shutdown(ctx: &ReplicationContext, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !ctx.is_shutting_down() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_STEP.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect(&addr.to_string(), Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_unresolvable_endpoint_fails() {
        assert!(connect("not an address", Duration::from_millis(50)).is_err());
    }
}
