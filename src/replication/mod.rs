//! Replication Module
//!
//! Asynchronous multi-master replication over TCP with last-writer-wins
//! conflict resolution.
//!
//! ## Responsibilities
//! - Listen for peers and connect to configured endpoints, reconnecting
//!   with exponential backoff
//! - Handshake with per-origin watermarks, then bootstrap the peer with
//!   every entry it has not seen
//! - Stream local and relayed mutations to connected peers
//! - Apply incoming mutations under the target segment's lock
//!
//! ## Connection States
//! ```text
//! Disconnected → Connecting → Handshaking → Bootstrapping → SteadyState
//!       ▲                                                        │
//!       └──────────────── transport error / overflow ────────────┘
//! ```

mod hub;
mod replicator;
mod session;
mod watermark;

pub mod protocol;

pub(crate) use hub::ReplicationHub;
pub(crate) use replicator::Replicator;

pub use session::{PeerState, PeerStatus};
