// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-key mutual exclusion for start/stop workflows.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

type Entry = Arc<tokio::sync::Mutex<()>>;

/// Serializes async critical sections that share a key.
///
/// Calls with different keys never wait on each other. Entries exist only
/// while someone holds or waits for the key.
#[derive(Default)]
pub struct TaskLock {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TaskLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// The result of `f` is returned unchanged. The lock is released when `f`
    /// completes or when the returned future is dropped.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let holder = Holder { lock: self, key, entry: self.acquire_entry(key) };
        let _guard = holder.entry.lock().await;
        f().await
    }

    /// Whether some caller currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.entries.lock().get(key).is_some_and(|entry| entry.try_lock().is_err())
    }

    /// Number of keys with a holder or waiter.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire_entry(&self, key: &str) -> Entry {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(key.to_owned()).or_default())
    }
}

/// Drops the map entry once the last interested caller leaves.
struct Holder<'a> {
    lock: &'a TaskLock,
    key: &'a str,
    entry: Entry,
}

impl Drop for Holder<'_> {
    fn drop(&mut self) {
        let mut entries = self.lock.entries.lock();
        // Clones are only taken under the map lock, so a count of two (map +
        // this holder) means nobody else is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            entries.remove(self.key);
        }
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
