//! Clock abstraction and the logical clock used for provenance stamps
//!
//! `Clock` gives wall time in milliseconds; `LogicalClock` turns it into
//! strictly increasing timestamps that never fall behind anything observed
//! from a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trait for getting the current wall clock time in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real system clock implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    time_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(time_ms: u64) -> Self {
        Self {
            time_ms: AtomicU64::new(time_ms),
        }
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

/// Hybrid logical clock for this node's origin
pub struct LogicalClock {
    source: Arc<dyn Clock>,
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            last: AtomicU64::new(0),
        }
    }

    /// Next timestamp: strictly greater than every previous or observed one
    pub fn next(&self) -> u64 {
        let now = self.source.now_ms();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Account for a timestamp seen from elsewhere
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Highest timestamp issued or observed so far
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}
