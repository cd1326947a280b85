//! Typed store handle
//!
//! `DriftMap<K, V>` is what applications hold. It binds the key and value
//! types to their interops, confines use to the opening thread, and owns
//! the background threads of the store.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::guard::AccessGuard;
use crate::interop::{decode, Interoperable};
use crate::replication::{PeerStatus, Replicator};
use crate::store::{ApplyOutcome, Reclaimer, ReplicatedEntry, StoreCore, TypedKey, TypedValue};

/// An off-heap hash map, optionally replicated to peer nodes
///
/// Every operation must be called from the thread that opened the map and
/// fails with [`DriftError::Closed`](crate::DriftError::Closed) after
/// [`close`](Self::close).
pub struct DriftMap<K: Interoperable, V: Interoperable> {
    guard: AccessGuard,
    core: Arc<StoreCore>,
    key_interop: K::Interop,
    value_interop: V::Interop,
    replicator: Mutex<Option<Replicator>>,
    reclaimer: Mutex<Option<Reclaimer>>,
}

impl<K: Interoperable, V: Interoperable> DriftMap<K, V> {
    /// Open a store; the calling thread becomes its owner
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open a store whose timestamps come from `clock`
    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let guard = AccessGuard::new();
        let (core, reclaimer) = StoreCore::open(&config, clock)?;

        let replicator = match config.replication.clone() {
            Some(replication) => match Replicator::start(Arc::clone(&core), replication) {
                Ok(replicator) => Some(replicator),
                Err(e) => {
                    drop(reclaimer);
                    if let Err(release_error) = core.release() {
                        tracing::warn!("Failed to release store after error: {}", release_error);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Self {
            guard,
            core,
            key_interop: K::Interop::default(),
            value_interop: V::Interop::default(),
            replicator: Mutex::new(replicator),
            reclaimer: Mutex::new(reclaimer),
        })
    }

    // =========================================================================
    // Map operations
    // =========================================================================

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.guard.check_on_each_public_operation()?;
        let key = TypedKey::new(key, &self.key_interop);
        self.core.get(&key, |bytes| decode(&self.value_interop, bytes))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.guard.check_on_each_public_operation()?;
        self.core.contains(&TypedKey::new(key, &self.key_interop))
    }

    /// Associate `value` with `key`, returning the previous value
    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.guard.check_on_each_public_operation()?;
        let key = TypedKey::new(key, &self.key_interop);
        let value = TypedValue::new(value, &self.value_interop);
        self.core
            .put(&key, &value, |bytes| decode(&self.value_interop, bytes))
    }

    /// Remove `key`, returning its value if it was present
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.guard.check_on_each_public_operation()?;
        let key = TypedKey::new(key, &self.key_interop);
        self.core
            .remove(&key, |bytes| decode(&self.value_interop, bytes))
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Apply a mutation from another replica as if it had arrived over TCP
    pub fn apply_remote(&self, entry: ReplicatedEntry) -> Result<ApplyOutcome> {
        self.guard.check_on_each_public_operation()?;
        self.core.apply_remote(&entry, None)
    }

    /// Status of every replication connection
    pub fn peers(&self) -> Result<Vec<PeerStatus>> {
        self.guard.check_on_each_public_operation()?;
        Ok(self
            .replicator
            .lock()
            .as_ref()
            .map(Replicator::peers)
            .unwrap_or_default())
    }

    /// Address the replication listener is bound to
    pub fn replication_addr(&self) -> Result<Option<SocketAddr>> {
        self.guard.check_on_each_public_operation()?;
        Ok(self
            .replicator
            .lock()
            .as_ref()
            .and_then(Replicator::local_addr))
    }

    /// Origin id stamped on local writes (0 when not replicated)
    pub fn node_id(&self) -> u8 {
        self.core.node_id()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_open(&self) -> bool {
        self.guard.is_open()
    }

    /// Stop replication and reclamation, flush and unmap the store
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.guard.check_owner_thread()?;
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if !self.guard.close() {
            return Ok(());
        }
        if let Some(mut replicator) = self.replicator.lock().take() {
            replicator.shutdown();
        }
        if let Some(mut reclaimer) = self.reclaimer.lock().take() {
            reclaimer.shutdown();
        }
        self.core.release()?;
        tracing::info!("Store of node {} closed", self.core.node_id());
        Ok(())
    }
}

impl<K: Interoperable, V: Interoperable> Drop for DriftMap<K, V> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Error closing store: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriftError;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_map_is_send_and_sync() {
        assert_send_sync::<DriftMap<String, u64>>();
    }

    #[test]
    fn test_typed_round_trip() {
        let map: DriftMap<String, u64> = DriftMap::open(Config::default()).unwrap();
        assert_eq!(map.put(&"one".to_string(), &1).unwrap(), None);
        assert_eq!(map.put(&"one".to_string(), &11).unwrap(), Some(1));
        assert_eq!(map.get(&"one".to_string()).unwrap(), Some(11));
        assert!(map.contains_key(&"one".to_string()).unwrap());
        assert_eq!(map.remove(&"one".to_string()).unwrap(), Some(11));
        assert!(!map.contains_key(&"one".to_string()).unwrap());
        assert_eq!(map.node_id(), 0);
        assert!(map.peers().unwrap().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let map: DriftMap<u32, u32> = DriftMap::open(Config::default()).unwrap();
        map.close().unwrap();
        map.close().unwrap();
        assert!(!map.is_open());
        assert!(matches!(map.get(&1), Err(DriftError::Closed)));
    }
}
