//! Per-key mutual exclusion. Waiters are served in arrival order and a key's entry
//! is dropped once nobody holds or waits for it.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as FairMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<FairMutex<()>>,
    users: usize,
}

#[derive(Default)]
pub struct KeyedLock {
    entries: Arc<Mutex<FxHashMap<String, Entry>>>,
}

/// Counts one holder or waiter of a key; the entry goes away with the last one.
struct Registration {
    key: String,
    entries: Arc<Mutex<FxHashMap<String, Entry>>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.users -= 1;
            if entry.users == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

pub struct KeyedGuard {
    // Released before the registration.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry { lock: Arc::new(FairMutex::new(())), users: 0 });
            entry.users += 1;
            entry.lock.clone()
        };
        // Registered before waiting so a dropped waiter still gives its count back.
        let registration = Registration { key: key.to_string(), entries: self.entries.clone() };
        let guard = lock.lock_owned().await;
        KeyedGuard { _guard: guard, _registration: registration }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
