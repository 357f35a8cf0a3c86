use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crate::error::panic_message;

/// A bounded pool of short-lived worker threads, at most one per key.
///
/// Workers are spawned on demand by [`try_admit`](Self::try_admit) and
/// reaped by [`poll_once`](Self::poll_once)/[`join_all`](Self::join_all).
/// There is no persistent thread-per-key: a worker runs one value then
/// exits, and the dispatch loop re-admits its key later if more work is
/// queued. Thread naming is the caller's responsibility (see
/// [`crate::thread_namer::ThreadNamer`]) so the dispatch thread and every
/// worker thread draw from one shared naming sequence.
pub(crate) struct WorkerPool<K> {
    slots: Mutex<HashMap<K, JoinHandle<()>>>,
    capacity: usize,
}

impl<K> WorkerPool<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Try to admit a worker for `key`, spawning `body` as its thread body
    /// under `name`. Returns `false` without spawning if the pool is at
    /// capacity or a worker for this key is already in flight (the
    /// refinement over the original implementation's pool-size-only check,
    /// required to uphold one-worker-per-key).
    pub(crate) fn try_admit<F>(&self, key: K, name: String, body: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= self.capacity || slots.contains_key(&key) {
            return false;
        }
        let handle = thread::Builder::new()
            .name(name)
            .spawn(body)
            .expect("failed to spawn mqp worker thread");
        slots.insert(key, handle);
        true
    }

    /// Two-phase scan-then-remove: reap exactly one completed worker, if
    /// any, joining it outside the lock to avoid holding `slots` across a
    /// blocking join. Returns `Ok(true)` if a worker was reaped, `Ok(false)`
    /// if none had finished, and `Err` with the captured panic message if
    /// the reaped worker panicked.
    pub(crate) fn poll_once(&self) -> Result<bool, String> {
        let handle = {
            let mut slots = self.slots.lock().unwrap();
            let done_key = slots
                .iter()
                .find(|(_, h)| h.is_finished())
                .map(|(k, _)| k.clone());
            match done_key {
                Some(key) => slots.remove(&key),
                None => None,
            }
        };
        match handle {
            None => Ok(false),
            Some(h) => h.join().map(|_| true).map_err(panic_message),
        }
    }

    /// Join every outstanding worker. Returns the first captured panic
    /// message, if any, after joining the rest.
    pub(crate) fn join_all(&self) -> Result<(), String> {
        let handles: Vec<_> = self.slots.lock().unwrap().drain().collect();
        let mut first_err = None;
        for (_, handle) in handles {
            if let Err(payload) = handle.join() {
                if first_err.is_none() {
                    first_err = Some(panic_message(payload));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn admits_up_to_capacity_then_refuses() {
        let pool: WorkerPool<u32> = WorkerPool::new(1);
        let gate = Arc::new(AtomicBool::new(false));
        let gate2 = gate.clone();
        assert!(pool.try_admit(1, "test-worker-0".to_string(), move || {
            while !gate2.load(Ordering::Acquire) {
                thread::yield_now();
            }
        }));
        assert!(!pool.try_admit(2, "test-worker-1".to_string(), || {}));
        gate.store(true, Ordering::Release);
        pool.join_all().unwrap();
    }

    #[test]
    fn refuses_duplicate_key_even_with_capacity() {
        let pool: WorkerPool<u32> = WorkerPool::new(4);
        assert!(pool.try_admit(1, "test-worker-0".to_string(), || thread::sleep(
            Duration::from_millis(20)
        )));
        assert!(!pool.try_admit(1, "test-worker-1".to_string(), || {}));
        pool.join_all().unwrap();
    }

    #[test]
    fn poll_once_reports_panics() {
        let pool: WorkerPool<u32> = WorkerPool::new(4);
        assert!(pool.try_admit(1, "test-worker-0".to_string(), || panic!("boom")));
        loop {
            match pool.poll_once() {
                Ok(false) => thread::yield_now(),
                Ok(true) => panic!("expected a panic to be captured"),
                Err(msg) => {
                    assert_eq!(msg, "boom");
                    break;
                }
            }
        }
    }
}
