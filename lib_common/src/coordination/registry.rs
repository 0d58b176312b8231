//! # Key Lock Registry
//!
//! One `tokio::sync::Mutex` per key, created on first use and dropped again
//! once nobody holds or waits for it. Entries carry a holder count; the
//! guard decrements it on drop and removes the entry at zero.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Entries<K> = Arc<Mutex<HashMap<K, (usize, Arc<AsyncMutex<()>>)>>>;

/// Registry of per-key async locks.
pub struct KeyLockRegistry<K> {
    entries: Entries<K>,
}

impl<K> Default for KeyLockRegistry<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> Clone for KeyLockRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K> KeyLockRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`. Access ends when the guard drops.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| (0, Arc::new(AsyncMutex::new(()))));
            entry.0 += 1;
            Arc::clone(&entry.1)
        };

        // Registered before awaiting so a cancelled waiter still releases its count.
        let holder = Holder {
            entries: Arc::clone(&self.entries),
            key,
        };
        let guard = mutex.lock_owned().await;
        log::trace!("Key lock acquired for {:?}", holder.key);
        KeyGuard {
            _holder: holder,
            _guard: guard,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive access to one key of a [`KeyLockRegistry`].
///
/// Fields drop in order: the holder count is released, then the mutex.
pub struct KeyGuard<K>
where
    K: Eq + Hash,
{
    _holder: Holder<K>,
    _guard: OwnedMutexGuard<()>,
}

struct Holder<K>
where
    K: Eq + Hash,
{
    entries: Entries<K>,
    key: K,
}

impl<K> Drop for Holder<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.0 = entry.0.saturating_sub(1);
            if entry.0 == 0 {
                entries.remove(&self.key);
            }
        }
    }
}
