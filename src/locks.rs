//! In-process writer serialization per logical key
//!
//! sled holds the database directory exclusively for this process, so
//! serializing writers per (employee, leave type) pair or per request id
//! is an in-process concern: one named mutex per hot key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct KeyedLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the mutex for `key`. Guards for distinct keys
    /// are independent; nested calls must always acquire in the same order
    /// (request key before ledger pair key) to stay deadlock-free.
    pub fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(key.to_string()).or_default().clone()
        };
        let _held = slot.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn serializes_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    locks.with("bal/e1/annual", || {
                        let seen = counter.load(Ordering::SeqCst);
                        counter.store(seen + 1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }
}
