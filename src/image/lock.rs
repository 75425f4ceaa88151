//! Per-key mutual exclusion
//!
//! One coarse mutex guards the set of held keys; waiters park on a condvar
//! until the key they want is released. Different keys never block each
//! other beyond the map update itself.

use crate::error::{FleetError, Result};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Lock table keyed by string
#[derive(Debug, Default)]
pub struct KeyedLock {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Holds a key until dropped
#[derive(Debug)]
pub struct KeyGuard<'a> {
    owner: &'a KeyedLock,
    key: String,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then take it
    pub fn lock(&self, key: &str) -> Result<KeyGuard<'_>> {
        let mut held = self.held.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire key table".to_string()))?;
        while held.contains(key) {
            held = self.released.wait(held)
                .map_err(|_| FleetError::Lock("Failed to wait for key".to_string()))?;
        }
        held.insert(key.to_string());
        Ok(KeyGuard { owner: self, key: key.to_string() })
    }

    /// Take `key` only if nobody holds it
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let mut held = self.held.lock().ok()?;
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard { owner: self, key: key.to_string() })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().map(|h| h.contains(key)).unwrap_or(false)
    }
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = match self.owner.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.key);
        self.owner.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_distinct_keys_do_not_block() {
        let locks = KeyedLock::new();
        let _a = locks.lock("a").unwrap();
        let b = locks.try_lock("b");
        assert!(b.is_some());
        assert!(locks.try_lock("a").is_none());
    }

    #[test]
    fn test_release_on_drop() {
        let locks = KeyedLock::new();
        {
            let guard = locks.lock("img").unwrap();
            assert_eq!(guard.key(), "img");
            assert!(locks.is_locked("img"));
        }
        assert!(!locks.is_locked("img"));
    }

    #[test]
    fn test_waiter_blocks_until_release() {
        let locks = Arc::new(KeyedLock::new());
        let acquired = Arc::new(AtomicBool::new(false));

        let guard = locks.lock("img").unwrap();
        let waiter = {
            let locks = locks.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let _guard = locks.lock("img").unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
