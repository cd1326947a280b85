//! Segmented table
//!
//! `StoreCore` routes each key to its segment and runs every operation,
//! local or replicated, under that segment's lock. It is shared between the
//! owning handle, the replication sessions and the reclaimer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};

use super::arena::map_segments;
use super::entry::{ApplyOutcome, ReplicatedEntry, Stamp};
use super::layout::Geometry;
use super::reclaim::{ReclaimTask, Reclaimer};
use super::segment::{RecoveredTombstone, Segment, SegmentState};
use super::{KeySource, RawKey, RawValue, ValueSource};
use crate::clock::{Clock, LogicalClock};
use crate::config::Config;
use crate::error::{DriftError, Result};
use crate::replication::ReplicationHub;

/// What happens to a slot once its entry is tombstoned
enum ReclaimPolicy {
    /// Free it right away
    Immediate,
    /// Hand it to the reclaimer, due after `delay`
    Deferred {
        tx: Sender<ReclaimTask>,
        delay: Duration,
    },
}

/// Segment array plus everything operations on it need
pub(crate) struct StoreCore {
    segments: Vec<Segment>,
    node_id: u8,
    lock_timeout: Option<Duration>,
    clock: LogicalClock,
    hub: ReplicationHub,
    reclaim_policy: ReclaimPolicy,
}

impl StoreCore {
    /// Map the arenas and, when recovering a file, rebuild segment state
    ///
    /// Returns the core and the reclaimer thread when tombstones are kept
    /// around for peers.
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<(Arc<Self>, Option<Reclaimer>)> {
        config.validate()?;

        // Step 1: Map one arena per segment
        let geometry = Geometry::from_config(config)?;
        let (arenas, recovered) =
            map_segments(config.segments, geometry, config.persist_path.as_deref())?;

        // Step 2: Build segment state, scanning recovered arenas
        let logical = LogicalClock::new(clock);
        let mut segments = Vec::with_capacity(arenas.len());
        let mut tombstones: Vec<(usize, RecoveredTombstone)> = Vec::new();
        for (index, arena) in arenas.into_iter().enumerate() {
            let state = if recovered {
                let (state, found, max_timestamp) = SegmentState::recover(arena)?;
                logical.observe(max_timestamp);
                tombstones.extend(found.into_iter().map(|t| (index, t)));
                state
            } else {
                SegmentState::new(arena)
            };
            segments.push(Segment::new(index, state));
        }

        // Step 3: Choose the reclamation policy
        let delay = config.removed_entry_cleanup_timeout;
        let (reclaim_policy, tasks) = if config.replication.is_some() && !delay.is_zero() {
            let (tx, rx) = channel::unbounded();
            (ReclaimPolicy::Deferred { tx, delay }, Some(rx))
        } else {
            (ReclaimPolicy::Immediate, None)
        };

        let core = Arc::new(Self {
            segments,
            node_id: config.node_id(),
            lock_timeout: config.lock_timeout,
            clock: logical,
            hub: ReplicationHub::new(),
            reclaim_policy,
        });

        // Step 4: Recovered tombstones restart their countdown
        let recovered_tombstones = tombstones.len();
        for (segment, tombstone) in tombstones {
            let task = ReclaimTask {
                segment,
                slot: tombstone.slot,
                hash: tombstone.hash,
                stamp: tombstone.stamp,
                due: Instant::now(),
            };
            match &core.reclaim_policy {
                ReclaimPolicy::Immediate => {
                    core.reclaim(&task)?;
                }
                ReclaimPolicy::Deferred { tx, delay } => {
                    let _ = tx.send(ReclaimTask {
                        due: task.due + *delay,
                        ..task
                    });
                }
            }
        }

        let reclaimer = tasks
            .map(|rx| Reclaimer::start(Arc::clone(&core), rx))
            .transpose()?;

        tracing::info!(
            "Store opened: node {}, {} segments of {} bytes, {}{}",
            core.node_id,
            core.segments.len(),
            geometry.segment_size(),
            if recovered { "recovered from " } else { "" },
            config
                .persist_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "anonymous memory".to_string()),
        );
        if recovered_tombstones > 0 {
            tracing::debug!("Rescheduled {} recovered tombstones", recovered_tombstones);
        }

        Ok((core, reclaimer))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn hub(&self) -> &ReplicationHub {
        &self.hub
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment_for(&self, hash: u64) -> (usize, &Segment) {
        let index = (hash % self.segments.len() as u64) as usize;
        (index, &self.segments[index])
    }

    // =========================================================================
    // Local operations
    // =========================================================================

    /// Decode the live value stored under `key`
    pub fn get<K, T, D>(&self, key: &K, decode: D) -> Result<Option<T>>
    where
        K: KeySource,
        D: FnOnce(&[u8]) -> Result<T>,
    {
        let (_, segment) = self.segment_for(key.hash());
        let guard = segment.lock(self.lock_timeout)?;
        let state = guard.as_ref().ok_or(DriftError::Closed)?;

        match state.lookup(key) {
            Some(at) => {
                let entry = state.entry(at.slot);
                if entry.is_live() {
                    decode(entry.value).map(Some)
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub fn contains<K: KeySource>(&self, key: &K) -> Result<bool> {
        self.get(key, |_| Ok(())).map(|found| found.is_some())
    }

    /// Store `value` under `key`, returning the previous live value
    pub fn put<K, V, T, D>(&self, key: &K, value: &V, decode_prev: D) -> Result<Option<T>>
    where
        K: KeySource,
        V: ValueSource,
        D: FnOnce(&[u8]) -> Result<T>,
    {
        let (_, segment) = self.segment_for(key.hash());
        let mut guard = segment.lock(self.lock_timeout)?;
        let state = guard.as_mut().ok_or(DriftError::Closed)?;

        let (previous, slot) = match state.lookup(key) {
            Some(at) => {
                let entry = state.entry(at.slot);
                let previous = if entry.is_live() {
                    Some(decode_prev(entry.value)?)
                } else {
                    None
                };
                let stamp = Stamp::new(self.node_id, self.clock.next());
                (previous, state.overwrite(at, Some(value), stamp)?)
            }
            None => {
                let stamp = Stamp::new(self.node_id, self.clock.next());
                (None, state.insert(key, Some(value), stamp)?)
            }
        };

        if self.hub.is_active() {
            self.hub.publish(&state.entry(slot).to_replicated(), None);
        }
        Ok(previous)
    }

    /// Tombstone the live entry under `key`, returning its value
    ///
    /// Absent and already removed keys are left alone and publish nothing.
    pub fn remove<K, T, D>(&self, key: &K, decode_prev: D) -> Result<Option<T>>
    where
        K: KeySource,
        D: FnOnce(&[u8]) -> Result<T>,
    {
        let (index, segment) = self.segment_for(key.hash());
        let mut guard = segment.lock(self.lock_timeout)?;
        let state = guard.as_mut().ok_or(DriftError::Closed)?;

        let Some(at) = state.lookup(key) else {
            return Ok(None);
        };
        let entry = state.entry(at.slot);
        if !entry.is_live() {
            return Ok(None);
        }
        let previous = decode_prev(entry.value)?;

        let stamp = Stamp::new(self.node_id, self.clock.next());
        state.tombstone(at, stamp);
        if self.hub.is_active() {
            self.hub.publish(&state.entry(at.slot).to_replicated(), None);
        }
        self.retire(index, state, key.hash(), at.slot, stamp);
        Ok(Some(previous))
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Apply a mutation from a peer under last-writer-wins
    ///
    /// `source` is the node the entry arrived from; applied entries are
    /// relayed to every other link.
    pub fn apply_remote(&self, entry: &ReplicatedEntry, source: Option<u8>) -> Result<ApplyOutcome> {
        self.clock.observe(entry.stamp.timestamp);

        let key = RawKey::new(&entry.key);
        let value = entry.value.as_deref().map(RawValue);
        let (index, segment) = self.segment_for(key.hash());
        let mut guard = segment.lock(self.lock_timeout)?;
        let state = guard.as_mut().ok_or(DriftError::Closed)?;

        let slot = match state.lookup(&key) {
            Some(at) => {
                let local = state.entry(at.slot).stamp;
                if !entry.stamp.wins_over(&local) {
                    tracing::trace!(
                        "Discarding stale entry {:?}, local stamp {:?}",
                        entry.stamp,
                        local
                    );
                    return Ok(ApplyOutcome::Stale);
                }
                state.overwrite(at, value.as_ref(), entry.stamp)?
            }
            None => state.insert(&key, value.as_ref(), entry.stamp)?,
        };

        if self.hub.is_active() {
            self.hub.publish(entry, source);
        }
        if entry.is_tombstone() {
            self.retire(index, state, key.hash(), slot, entry.stamp);
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Copy every entry a peer has not seen yet out of one segment
    ///
    /// An entry qualifies when its timestamp is above the peer's watermark
    /// for the entry's origin. The peer's own writes are included: it may
    /// have restarted without them, and copies it already holds apply as stale.
    pub fn bootstrap_segment(
        &self,
        index: usize,
        watermarks: &BTreeMap<u8, u64>,
    ) -> Result<Vec<ReplicatedEntry>> {
        let guard = self.segments[index].lock(self.lock_timeout)?;
        let state = guard.as_ref().ok_or(DriftError::Closed)?;

        Ok(state
            .indexed_slots()
            .map(|slot| state.entry(slot))
            .filter(|entry| {
                let seen = watermarks.get(&entry.stamp.origin).copied().unwrap_or(0);
                entry.stamp.timestamp > seen
            })
            .map(|entry| entry.to_replicated())
            .collect())
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    fn retire(&self, index: usize, state: &mut SegmentState, hash: u64, slot: u64, stamp: Stamp) {
        match &self.reclaim_policy {
            ReclaimPolicy::Immediate => {
                if let Some(at) = state.locate_slot(hash, slot) {
                    state.reclaim(at);
                }
            }
            ReclaimPolicy::Deferred { tx, delay } => {
                let task = ReclaimTask {
                    segment: index,
                    slot,
                    hash,
                    stamp,
                    due: Instant::now() + *delay,
                };
                if tx.send(task).is_err() {
                    tracing::debug!("Reclaimer gone, tombstone in segment {} kept", index);
                }
            }
        }
    }

    /// Free a tombstone if it is still the one the task was scheduled for
    pub fn reclaim(&self, task: &ReclaimTask) -> Result<bool> {
        let mut guard = self.segments[task.segment].lock(self.lock_timeout)?;
        let state = guard.as_mut().ok_or(DriftError::Closed)?;

        let Some(at) = state.locate_slot(task.hash, task.slot) else {
            return Ok(false);
        };
        let entry = state.entry(at.slot);
        if entry.is_live() || entry.stamp != task.stamp {
            return Ok(false);
        }
        state.reclaim(at);
        Ok(true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush and unmap every segment; later operations fail with `Closed`
    pub fn release(&self) -> Result<()> {
        let mut first_error = None;
        for segment in &self.segments {
            let mut guard = segment.lock(None)?;
            if let Some(state) = guard.take() {
                if let Err(e) = state.flush() {
                    tracing::warn!("Failed to flush segment: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of indexed entries per segment, tombstones included
    #[cfg(test)]
    pub fn occupancy(&self) -> Result<Vec<u64>> {
        self.segments
            .iter()
            .map(|segment| {
                let guard = segment.lock(self.lock_timeout)?;
                guard
                    .as_ref()
                    .map(SegmentState::occupied)
                    .ok_or(DriftError::Closed)
            })
            .collect()
    }
}
