use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::panic_message;
use crate::key_state::KeyState;
use crate::EngineShared;

/// A minimal background-task primitive: runs `func` repeatedly on a
/// dedicated thread until told to stop, capturing any panic instead of
/// letting it tear down the process.
///
/// Mirrors an async task loop that repeatedly invokes a step function
/// until stopped, catching exceptions from that step rather than treating
/// one bad iteration as fatal to the whole loop.
pub(crate) struct DispatchTask {
    handle: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
}

impl DispatchTask {
    pub(crate) fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// A clone of the stop flag, to be read from inside `func`.
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |h| h.is_finished())
    }

    /// Start the task if it isn't already running. No-op otherwise.
    pub(crate) fn start(&self, name: impl Into<String>, mut func: impl FnMut() + Send + 'static) {
        let mut handle_guard = self.handle.lock().unwrap();
        let already_running = handle_guard.as_ref().is_some_and(|h| !h.is_finished());
        if already_running {
            return;
        }
        self.stopping.store(false, Ordering::Release);
        *self.fault.lock().unwrap() = None;
        let stopping = self.stopping.clone();
        let fault = self.fault.clone();
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while !stopping.load(Ordering::Acquire) {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| func())) {
                        *fault.lock().unwrap() = Some(panic_message(payload));
                        return;
                    }
                }
            })
            .expect("failed to spawn mqp dispatch thread");
        *handle_guard = Some(join);
    }

    /// Signal the loop body to stop at its next check. Does not block.
    pub(crate) fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Join the task thread, propagating a captured panic if one occurred.
    pub(crate) fn join(&self) -> Result<(), String> {
        let handle = self.handle.lock().unwrap().take();
        if let Some(h) = handle {
            if let Err(payload) = h.join() {
                return Err(panic_message(payload));
            }
        }
        match self.fault.lock().unwrap().take() {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }
}

fn can_make_progress<K, V>(shared: &EngineShared<K, V>, stopping: &AtomicBool) -> bool
where
    K: Eq + Hash + Clone,
{
    if stopping.load(Ordering::Acquire) {
        return true;
    }
    match shared.registry.data.try_lock() {
        Err(_) => true,
        Ok(data) => data.values().any(KeyState::is_serviceable),
    }
}

/// One iteration of the dispatch loop: steps 2-6 of the dispatch protocol.
/// Called repeatedly by the [`DispatchTask`] thread body until stopped.
pub(crate) fn run_iteration<K, V>(shared: &Arc<EngineShared<K, V>>, stopping: &Arc<AtomicBool>)
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    if stopping.load(Ordering::Acquire) {
        return;
    }

    let keys_guard = shared.registry.keys.lock().unwrap();
    let keys_guard = shared
        .registry
        .wake
        .wait_while(keys_guard, |_| !can_make_progress(shared, stopping))
        .expect("registry lock poisoned");

    if stopping.load(Ordering::Acquire) {
        drop(keys_guard);
        drain_workers(shared);
        return;
    }

    let snapshot: Vec<K> = keys_guard.iter().cloned().collect();
    drop(keys_guard);
    tracing::trace!(snapshot_len = snapshot.len(), "mqp: dispatch snapshot taken");

    for key in snapshot.into_iter().rev() {
        if stopping.load(Ordering::Acquire) {
            break;
        }
        dispatch_one_key(shared, stopping, key);
    }

    if stopping.load(Ordering::Acquire) {
        drain_workers(shared);
    }
}

fn dispatch_one_key<K, V>(shared: &Arc<EngineShared<K, V>>, stopping: &Arc<AtomicBool>, key: K)
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    loop {
        let serviceable = {
            let data = shared.registry.data.lock().unwrap();
            data.get(&key).is_some_and(KeyState::is_serviceable)
        };
        if !serviceable {
            return;
        }

        if try_admit(shared, key.clone()) {
            return;
        }
        tracing::debug!("mqp: pool admission refused, reaping a completed worker before retry");

        match shared.pool.poll_once() {
            Ok(true) => {}
            Ok(false) => thread::yield_now(),
            Err(fault) => record_consumer_fault(shared, fault),
        }

        if stopping.load(Ordering::Acquire) {
            return;
        }
    }
}

fn try_admit<K, V>(shared: &Arc<EngineShared<K, V>>, key: K) -> bool
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    let name = shared.thread_namer.next_name(|id| format!("mqp-worker-{id}"));
    let body_shared = shared.clone();
    let body_key = key.clone();
    shared
        .pool
        .try_admit(key, name, move || worker_body(body_shared, body_key))
}

fn worker_body<K, V>(shared: Arc<EngineShared<K, V>>, key: K)
where
    K: Eq + Hash + Clone,
{
    let (value, consumer) = {
        let mut data = shared.registry.data.lock().unwrap();
        let Some(state) = data.get_mut(&key) else {
            return;
        };
        if !state.is_serviceable() {
            return;
        }
        let value = state.queue.pop_front().expect("serviceable implies a queued value");
        let consumer = state.consumer.clone().expect("serviceable implies a bound consumer");
        (value, consumer)
    };
    consumer.consume(key, value);
}

fn drain_workers<K, V>(shared: &Arc<EngineShared<K, V>>)
where
    K: Eq + Hash + Clone,
{
    if let Err(fault) = shared.pool.join_all() {
        record_consumer_fault(shared, fault);
    }
}

fn record_consumer_fault<K, V>(shared: &EngineShared<K, V>, fault: String) {
    let mut guard = shared.consumer_fault.lock().unwrap();
    if guard.is_none() {
        tracing::warn!(%fault, "mqp: consumer panicked while processing a key");
        *guard = Some(fault);
    }
}
