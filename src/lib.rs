//! # DriftKV
//!
//! An embedded, off-heap key-value store with:
//! - Segmented hash table living in memory mappings (anonymous or file backed)
//! - Per-segment locking with optional lock timeout
//! - Zero-copy key comparison and hashing through pluggable interops
//! - Asynchronous TCP replication with last-writer-wins conflict resolution
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   DriftMap<K, V>                             │
//! │           (Access Guard + Interop bindings)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     StoreCore                                │
//! │        (hash % segments, logical clock, reclaimer)           │
//! └──────┬──────────────┬──────────────┬────────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//!   ┌─────────┐    ┌─────────┐    ┌─────────┐        ┌──────────────┐
//!   │Segment 0│    │Segment 1│    │Segment N│ ◄───── │  Replicator  │
//!   │ (mmap)  │    │ (mmap)  │    │ (mmap)  │ ─────► │ (TCP peers)  │
//!   └─────────┘    └─────────┘    └─────────┘        └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use driftkv::{Config, DriftMap};
//!
//! let map: DriftMap<String, u64> = DriftMap::open(Config::default())?;
//! map.put(&"answer".to_string(), &42)?;
//! assert_eq!(map.get(&"answer".to_string())?, Some(42));
//! map.close()?;
//! # Ok::<(), driftkv::DriftError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod clock;
pub mod guard;
pub mod interop;
pub mod replication;

mod map;
mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{DriftError, Result};
pub use config::{Config, ReplicationConfig};
pub use map::DriftMap;
pub use replication::{PeerState, PeerStatus};
pub use store::{ApplyOutcome, ReplicatedEntry, Stamp};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of DriftKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
