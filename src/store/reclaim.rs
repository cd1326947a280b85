//! Delayed tombstone reclamation
//!
//! When replication is enabled, a removed entry stays in its segment as a
//! tombstone for `removed_entry_cleanup_timeout`, so that peers connecting
//! later still learn about the deletion. The reclaimer thread frees those
//! slots once they expire.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use super::entry::Stamp;
use super::table::StoreCore;
use crate::error::{DriftError, Result};

/// How long the reclaimer sleeps when nothing is pending
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Back-off before retrying a task whose segment lock timed out
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// One tombstone awaiting reclamation
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReclaimTask {
    pub segment: usize,
    pub slot: u64,
    pub hash: u64,
    /// Stamp the tombstone had when scheduled; a newer write cancels the task
    pub stamp: Stamp,
    pub due: Instant,
}

/// Scheduled tasks, earliest due first
#[derive(Default)]
struct PendingTasks {
    heap: BinaryHeap<Reverse<ByDue>>,
}

struct ByDue(ReclaimTask);

impl PartialEq for ByDue {
    fn eq(&self, other: &Self) -> bool {
        self.0.due == other.0.due
    }
}

impl Eq for ByDue {}

impl PartialOrd for ByDue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByDue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.due.cmp(&other.0.due)
    }
}

impl PendingTasks {
    fn push(&mut self, task: ReclaimTask) {
        self.heap.push(Reverse(ByDue(task)));
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(ByDue(task))| task.due)
    }

    /// Earliest task if it is due at `now`
    fn pop_expired(&mut self, now: Instant) -> Option<ReclaimTask> {
        if self.next_due()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(ByDue(task))| task)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Background thread freeing expired tombstones
pub(crate) struct Reclaimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn start(core: Arc<StoreCore>, tasks: Receiver<ReclaimTask>) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded(0);
        let handle = thread::Builder::new()
            .name("driftkv-reclaimer".to_string())
            .spawn(move || run(core, tasks, stop_rx))?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it; pending tombstones stay in place
    pub fn shutdown(&mut self) {
        // dropping the sender disconnects the stop channel
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Reclaimer thread panicked");
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(core: Arc<StoreCore>, tasks: Receiver<ReclaimTask>, stop: Receiver<()>) {
    let mut pending = PendingTasks::default();
    let mut reclaimed = 0u64;

    loop {
        let wait = pending
            .next_due()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        crossbeam::select! {
            recv(tasks) -> task => match task {
                Ok(task) => pending.push(task),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
            default(wait) => {}
        }

        let now = Instant::now();
        while let Some(mut task) = pending.pop_expired(now) {
            match core.reclaim(&task) {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(DriftError::LockTimeout { .. }) => {
                    task.due = now + RETRY_DELAY;
                    pending.push(task);
                    break;
                }
                Err(DriftError::Closed) => return,
                Err(e) => tracing::warn!("Failed to reclaim tombstone in segment {}: {}", task.segment, e),
            }
        }
    }

    tracing::debug!(
        "Reclaimer stopped: {} tombstones reclaimed, {} left pending",
        reclaimed,
        pending.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(slot: u64, due: Instant) -> ReclaimTask {
        ReclaimTask {
            segment: 0,
            slot,
            hash: slot,
            stamp: Stamp::new(1, slot),
            due,
        }
    }

    #[test]
    fn test_pending_tasks_pop_in_due_order() {
        let start = Instant::now();
        let mut pending = PendingTasks::default();
        pending.push(task(1, start + Duration::from_secs(60)));
        pending.push(task(2, start));
        // a retried task lands after a later one but must come out first
        pending.push(task(3, start + RETRY_DELAY));

        assert_eq!(pending.next_due(), Some(start));
        let now = start + RETRY_DELAY;
        assert_eq!(pending.pop_expired(now).map(|t| t.slot), Some(2));
        assert_eq!(pending.pop_expired(now).map(|t| t.slot), Some(3));
        assert!(pending.pop_expired(now).is_none());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.next_due(), Some(start + Duration::from_secs(60)));
    }
}
