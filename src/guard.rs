//! Access Guard
//!
//! Every public store operation starts with
//! [`AccessGuard::check_on_each_public_operation`]. The arenas behind a
//! handle are unmapped on close, so the check is unconditional: a thread id
//! compare plus one atomic load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use crate::error::{DriftError, Result};

/// Owner-thread confinement and open/closed state of a store handle
#[derive(Debug)]
pub struct AccessGuard {
    owner: ThreadId,
    open: AtomicBool,
}

impl AccessGuard {
    /// Guard owned by the calling thread
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            open: AtomicBool::new(true),
        }
    }

    pub fn check_on_each_public_operation(&self) -> Result<()> {
        self.check_owner_thread()?;
        if !self.is_open() {
            return Err(DriftError::Closed);
        }
        Ok(())
    }

    pub fn check_owner_thread(&self) -> Result<()> {
        let current = thread::current().id();
        if current != self.owner {
            return Err(DriftError::WrongThread {
                owner: self.owner,
                current,
            });
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Flip to closed. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::new()
    }
}
