//! Outbound fan-out
//!
//! Every live peer connection registers a link: a bounded queue that its
//! writer thread drains. Mutations are published into the links while the
//! segment lock is held, so publishing must never block; a full queue marks
//! the link overflowed and its session reconnects and re-bootstraps.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::store::ReplicatedEntry;

struct Link {
    id: u64,
    peer: u8,
    tx: Sender<ReplicatedEntry>,
    overflowed: Arc<AtomicBool>,
}

/// Receiving end of a link, owned by one session
pub(crate) struct LinkHandle {
    pub id: u64,
    pub rx: Receiver<ReplicatedEntry>,
    overflowed: Arc<AtomicBool>,
}

impl LinkHandle {
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

/// Registry of the outbound queues of all connected peers
#[derive(Default)]
pub(crate) struct ReplicationHub {
    links: Mutex<Vec<Link>>,
    active: AtomicUsize,
    next_id: AtomicU64,
}

impl ReplicationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when at least one link is registered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    pub fn register(&self, peer: u8, capacity: usize) -> LinkHandle {
        let (tx, rx) = channel::bounded(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut links = self.links.lock();
        links.push(Link {
            id,
            peer,
            tx,
            overflowed: Arc::clone(&overflowed),
        });
        self.active.store(links.len(), Ordering::Release);

        LinkHandle { id, rx, overflowed }
    }

    pub fn unregister(&self, id: u64) {
        let mut links = self.links.lock();
        links.retain(|link| link.id != id);
        self.active.store(links.len(), Ordering::Release);
    }

    /// Queue `entry` on every link except its origin's and the one it came from
    pub fn publish(&self, entry: &ReplicatedEntry, source: Option<u8>) {
        let links = self.links.lock();
        for link in links.iter() {
            if link.peer == entry.stamp.origin || Some(link.peer) == source {
                continue;
            }
            match link.tx.try_send(entry.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if !link.overflowed.swap(true, Ordering::AcqRel) {
                        tracing::warn!("Outbound queue to node {} overflowed", link.peer);
                    }
                }
                // session already gone; it unregisters on its way out
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}
