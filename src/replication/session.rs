//! Replication session
//!
//! One session drives one TCP connection to a peer, whichever side opened
//! it. The flow is symmetric:
//!
//! 1. Exchange `HANDSHAKE` (node id + watermarks)
//! 2. Register an outbound link, capture the local clock as `high`
//! 3. Writer: send every entry above the peer's watermarks, then
//!    `BOOTSTRAP_COMPLETE{high}`, then stream the link and heartbeats
//! 4. Reader: apply incoming entries; after the peer's
//!    `BOOTSTRAP_COMPLETE` advance its watermark
//!
//! Any transport or apply failure ends the session; the caller decides
//! whether to reconnect.

use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::iter;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;

use super::hub::LinkHandle;
use super::protocol::{read_message, write_message, Handshake, Message};
use super::replicator::ReplicationContext;
use crate::error::{DriftError, Result};
use crate::store::ReplicatedEntry;

/// Longest the writer waits on its link before re-checking flags
const MAX_POLL: Duration = Duration::from_millis(50);

/// Cap on entries written between two flushes
const MAX_BATCH: usize = 1024;

// =============================================================================
// Peer registry
// =============================================================================

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Bootstrapping,
    SteadyState,
}

/// Snapshot of one replication connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    /// Configured endpoint, or the remote address of an accepted connection
    pub endpoint: String,
    /// Node id learned from the handshake
    pub peer_id: Option<u8>,
    pub state: PeerState,
    /// True if the peer connected to us
    pub inbound: bool,
}

struct PeerRecord {
    status: PeerStatus,
    stream: Option<TcpStream>,
}

/// Status of every connection, plus stream handles for shutdown
#[derive(Default)]
pub(crate) struct PeerRegistry {
    next_id: Mutex<u64>,
    peers: Mutex<BTreeMap<u64, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, endpoint: String, inbound: bool) -> u64 {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let status = PeerStatus {
            endpoint,
            peer_id: None,
            state: PeerState::Disconnected,
            inbound,
        };
        self.peers.lock().insert(id, PeerRecord { status, stream: None });
        id
    }

    pub fn remove(&self, id: u64) {
        self.peers.lock().remove(&id);
    }

    pub fn set_state(&self, id: u64, state: PeerState) {
        if let Some(record) = self.peers.lock().get_mut(&id) {
            record.status.state = state;
        }
    }

    pub fn set_peer_id(&self, id: u64, peer_id: u8) {
        if let Some(record) = self.peers.lock().get_mut(&id) {
            record.status.peer_id = Some(peer_id);
        }
    }

    fn attach_stream(&self, id: u64, stream: TcpStream) {
        if let Some(record) = self.peers.lock().get_mut(&id) {
            record.stream = Some(stream);
        }
    }

    fn detach_stream(&self, id: u64) {
        if let Some(record) = self.peers.lock().get_mut(&id) {
            record.stream = None;
        }
    }

    /// Close every attached socket, unblocking session threads
    pub fn shutdown_all(&self) {
        for record in self.peers.lock().values() {
            if let Some(stream) = &record.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<PeerStatus> {
        self.peers
            .lock()
            .values()
            .map(|record| record.status.clone())
            .collect()
    }
}

// =============================================================================
// Session
// =============================================================================

/// Run one connection until it fails or replication shuts down
pub(crate) fn run_session(ctx: &ReplicationContext, conn: u64, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(ctx.config.heartbeat_timeout))?;
    stream.set_write_timeout(Some(ctx.config.heartbeat_timeout))?;

    ctx.registry.attach_stream(conn, stream.try_clone()?);
    let result = if ctx.is_shutting_down() {
        Ok(())
    } else {
        handshake_and_stream(ctx, conn, &stream)
    };
    ctx.registry.detach_stream(conn);
    let _ = stream.shutdown(Shutdown::Both);
    result
}

fn handshake_and_stream(ctx: &ReplicationContext, conn: u64, stream: &TcpStream) -> Result<()> {
    let buffer = ctx.config.tcp_buffer_size;
    let mut reader = BufReader::with_capacity(buffer, stream.try_clone()?);
    let mut writer = BufWriter::with_capacity(buffer, stream.try_clone()?);
    let node_id = ctx.core.node_id();

    // Step 1: Handshake, both sides send first
    ctx.registry.set_state(conn, PeerState::Handshaking);
    let ours = Handshake {
        node_id,
        watermarks: ctx.watermarks.snapshot(),
    };
    write_message(&mut writer, &Message::Handshake(ours))?;
    writer.flush()?;

    let theirs = match read_message(&mut reader)? {
        Message::Handshake(handshake) => handshake,
        other => {
            return Err(DriftError::Protocol(format!(
                "Expected HANDSHAKE, got {:?}",
                other.message_type()
            )))
        }
    };
    if theirs.node_id == node_id || theirs.node_id == 0 {
        return Err(DriftError::Protocol(format!(
            "Peer announced unusable node id {}",
            theirs.node_id
        )));
    }
    let peer = theirs.node_id;
    ctx.registry.set_peer_id(conn, peer);
    tracing::debug!(
        "Handshake with node {} complete, its watermarks: {:?}",
        peer,
        theirs.watermarks
    );

    // Step 2: Live entries queue up from here on, bootstrap covers the rest
    let link = ctx.core.hub().register(peer, ctx.config.outbound_queue_capacity);
    let high = ctx.core.clock().current();
    ctx.registry.set_state(conn, PeerState::Bootstrapping);

    // Step 3: Full duplex until either half stops
    let progress = Progress::default();
    let failed = AtomicBool::new(false);
    let result = thread::scope(|scope| -> Result<()> {
        let reader_half = thread::Builder::new()
            .name(format!("driftkv-recv-{}", peer))
            .spawn_scoped(scope, || {
                let received = receive_loop(ctx, conn, peer, &mut reader, &progress);
                failed.store(true, Ordering::Release);
                let _ = stream.shutdown(Shutdown::Both);
                received
            })?;

        let sent = send_loop(
            ctx,
            conn,
            peer,
            &theirs.watermarks,
            high,
            &link,
            &mut writer,
            &failed,
            &progress,
        );
        let _ = stream.shutdown(Shutdown::Both);

        let received = reader_half
            .join()
            .unwrap_or_else(|_| Err(DriftError::Network("Reader thread panicked".to_string())));
        sent.and(received)
    });

    ctx.core.hub().unregister(link.id);
    result
}

/// Counts finished bootstrap directions; the second one means steady state
#[derive(Default)]
struct Progress {
    completed: AtomicU8,
}

impl Progress {
    fn mark(&self, ctx: &ReplicationContext, conn: u64) {
        if self.completed.fetch_add(1, Ordering::AcqRel) == 1 {
            ctx.registry.set_state(conn, PeerState::SteadyState);
        }
    }
}

fn receive_loop<R: Read>(
    ctx: &ReplicationContext,
    conn: u64,
    peer: u8,
    reader: &mut R,
    progress: &Progress,
) -> Result<()> {
    let mut bootstrapped = false;
    let mut applied = 0u64;

    while !ctx.is_shutting_down() {
        let message = match read_message(reader) {
            Ok(message) => message,
            Err(DriftError::Io(e)) if is_timeout(&e) => {
                return Err(DriftError::Network(format!(
                    "No traffic from node {} for {:?}",
                    peer, ctx.config.heartbeat_timeout
                )))
            }
            Err(e) => return Err(e),
        };

        match message {
            Message::Entry(entry) => {
                let outcome = ctx.core.apply_remote(&entry, Some(peer))?;
                tracing::trace!(
                    "Entry {:?} from node {}: {:?}",
                    entry.stamp,
                    peer,
                    outcome
                );
                applied += 1;
                // only the peer's own writes arrive in timestamp order
                if bootstrapped && entry.stamp.origin == peer {
                    ctx.watermarks.advance(peer, entry.stamp.timestamp);
                }
            }
            Message::BootstrapComplete { high } => {
                ctx.watermarks.advance(peer, high);
                bootstrapped = true;
                progress.mark(ctx, conn);
                tracing::debug!(
                    "Bootstrap from node {} complete after {} entries, watermark {}",
                    peer,
                    applied,
                    high
                );
            }
            Message::Heartbeat => tracing::trace!("Heartbeat from node {}", peer),
            Message::Handshake(_) => {
                return Err(DriftError::Protocol(
                    "Unexpected HANDSHAKE on an established session".to_string(),
                ))
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn send_loop<W: Write>(
    ctx: &ReplicationContext,
    conn: u64,
    peer: u8,
    watermarks: &BTreeMap<u8, u64>,
    high: u64,
    link: &LinkHandle,
    writer: &mut W,
    failed: &AtomicBool,
    progress: &Progress,
) -> Result<()> {
    // Step 1: Bootstrap, copying under each segment lock and sending outside it
    let mut sent = 0usize;
    for index in 0..ctx.core.segment_count() {
        let entries = ctx.core.bootstrap_segment(index, watermarks)?;
        sent += entries.len();
        for entry in entries {
            write_message(writer, &Message::Entry(entry))?;
        }
        if failed.load(Ordering::Acquire) || ctx.is_shutting_down() {
            return Ok(());
        }
    }
    write_message(writer, &Message::BootstrapComplete { high })?;
    writer.flush()?;
    progress.mark(ctx, conn);
    tracing::debug!("Sent {} bootstrap entries to node {}", sent, peer);

    // Step 2: Steady state
    let interval = ctx.config.heartbeat_interval;
    let poll = interval.min(MAX_POLL);
    let mut last_send = Instant::now();
    loop {
        if failed.load(Ordering::Acquire) || ctx.is_shutting_down() {
            return Ok(());
        }
        if link.is_overflowed() {
            return Err(overflow_error(peer));
        }

        match link.rx.recv_timeout(poll) {
            Ok(entry) => {
                let flushed = forward_batch(link, peer, entry, writer);
                // entries already written go out even when the batch stopped
                writer.flush()?;
                flushed?;
                last_send = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_send.elapsed() >= interval {
                    write_message(writer, &Message::Heartbeat)?;
                    writer.flush()?;
                    last_send = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Write `first` and up to `MAX_BATCH` queued entries behind it
///
/// The overflow flag is checked before every entry. Once a publish has been
/// dropped, nothing queued after it may reach the peer: the peer would
/// advance its watermark past the missing entry.
fn forward_batch<W: Write>(
    link: &LinkHandle,
    peer: u8,
    first: ReplicatedEntry,
    writer: &mut W,
) -> Result<usize> {
    let mut written = 0;
    for entry in iter::once(first).chain(link.rx.try_iter().take(MAX_BATCH)) {
        if link.is_overflowed() {
            return Err(overflow_error(peer));
        }
        write_message(writer, &Message::Entry(entry))?;
        written += 1;
    }
    Ok(written)
}

fn overflow_error(peer: u8) -> DriftError {
    DriftError::Network(format!("Outbound queue to node {} overflowed", peer))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
