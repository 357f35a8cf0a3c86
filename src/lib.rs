//! A keyed, multi-queue, publish/consume dispatch engine.
//!
//! [`Engine`] lets producers publish values under arbitrary keys and lets
//! consumers bind to those keys; it guarantees first-in-first-out delivery
//! within a key and runs at most one consumer invocation per key at a time,
//! while keys with distinct consumers are processed concurrently across a
//! bounded worker pool.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use mqp::Engine;
//!
//! let engine: Engine<&str, i32> = Engine::<&str, i32>::builder().pool_size(2).build();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let seen2 = seen.clone();
//! engine.subscribe("orders", Some(Arc::new(move |_key: &str, value: i32| {
//!     seen2.lock().unwrap().push(value);
//! })));
//! engine.enqueue("orders", 1);
//! engine.enqueue("orders", 2);
//! engine.wait_consume_all().unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
//! ```

#![warn(missing_docs)]

mod consumer;
mod dispatch;
mod error;
mod key_state;
mod pool;
mod registry;
mod thread_namer;


use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{available_parallelism, sleep};
use std::time::Duration;

pub use consumer::Consumer;
pub use error::EngineError;

use dispatch::DispatchTask;
use key_state::KeyState;
use pool::WorkerPool;
use registry::Registry;
use thread_namer::ThreadNamer;

/// State shared between the [`Engine`] handle, its background dispatch
/// task and its worker threads.
pub(crate) struct EngineShared<K, V> {
    registry: Registry<K, V>,
    pool: WorkerPool<K>,
    max_queue_capacity: usize,
    consumer_fault: Mutex<Option<String>>,
    thread_namer: ThreadNamer,
}

/// A keyed, multi-queue, publish/consume dispatch engine.
///
/// See the crate-level documentation for the delivery and concurrency
/// guarantees this type provides. Construct one with [`Engine::builder`]
/// or [`Engine::new`] for the defaults.
pub struct Engine<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    shared: Arc<EngineShared<K, V>>,
    dispatch: DispatchTask,
    stopped: AtomicBool,
}

impl<K, V> Engine<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Create an engine with default configuration (pool size equal to
    /// available parallelism, a 1000-item per-key queue capacity).
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building an engine with non-default configuration.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn new_impl(builder: EngineBuilder) -> Self {
        let pool_size = if builder.pool_size == 0 {
            available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            builder.pool_size
        };
        let shared = Arc::new(EngineShared {
            registry: Registry::new(),
            pool: WorkerPool::new(pool_size),
            max_queue_capacity: builder.max_queue_capacity,
            consumer_fault: Mutex::new(None),
            thread_namer: ThreadNamer::new(builder.thread_names),
        });
        Self {
            shared,
            dispatch: DispatchTask::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Bind `consumer` to `key`, or clear the binding if `None`.
    ///
    /// Returns `false` without effect if `key` already has a consumer
    /// bound and `consumer` is `Some` — a key may have at most one bound
    /// consumer at a time. Returns `true` on success, including when
    /// `consumer` is `None` (unbinding always succeeds).
    pub fn subscribe(&self, key: K, consumer: Option<Arc<dyn Consumer<K, V>>>) -> bool {
        match consumer {
            None => {
                self.unsubscribe(&key);
                true
            }
            Some(consumer) => {
                self.shared.registry.get_or_create(&key);
                let mut data = self.shared.registry.data.lock().unwrap();
                let state = data
                    .get_mut(&key)
                    .expect("get_or_create just inserted this key");
                if state.consumer.is_some() {
                    false
                } else {
                    state.consumer = Some(consumer);
                    drop(data);
                    self.shared.registry.wake.notify_one();
                    true
                }
            }
        }
    }

    /// Clear any consumer bound to `key`. No-op if `key` is unknown or
    /// has no bound consumer. Values already queued for `key` are kept;
    /// a later `subscribe` resumes delivery from where the queue stands.
    pub fn unsubscribe(&self, key: &K) {
        let mut data = self.shared.registry.data.lock().unwrap();
        if let Some(state) = data.get_mut(key) {
            state.consumer = None;
        }
    }

    /// Publish `value` under `key`. Returns `false` without enqueuing if
    /// the per-key queue is already at capacity.
    pub fn enqueue(&self, key: K, value: V) -> bool {
        self.shared.registry.get_or_create(&key);
        let pushed = {
            let mut data = self.shared.registry.data.lock().unwrap();
            let state = data
                .get_mut(&key)
                .expect("get_or_create just inserted this key");
            if state.queue.len() < self.shared.max_queue_capacity {
                state.queue.push_back(value);
                true
            } else {
                false
            }
        };
        if pushed {
            self.shared.registry.wake.notify_one();
        }
        pushed
    }

    /// Pop and return the next queued value for `key` without involving a
    /// bound consumer. Returns `None` if `key` is unknown or its queue is
    /// empty.
    pub fn dequeue(&self, key: &K) -> Option<V> {
        let mut data = self.shared.registry.data.lock().unwrap();
        data.get_mut(key).and_then(|state| state.queue.pop_front())
    }

    /// Start the background dispatch task if it is not already running.
    ///
    /// Returns [`EngineError::Stopped`] if the engine has already been
    /// stopped — once stopped, an engine does not resume dispatch.
    pub fn run(&self) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }
        let name = self.shared.thread_namer.next_name(|_id| "mqp-dispatch".to_string());
        let shared = self.shared.clone();
        let stop_flag = self.dispatch.stop_flag();
        self.dispatch
            .start(name, move || dispatch::run_iteration(&shared, &stop_flag));
        Ok(())
    }

    /// Start the dispatch task if needed, then block until every
    /// currently serviceable key has been drained: every key with a
    /// bound consumer has had its queue emptied.
    ///
    /// Values enqueued after this call begins are not guaranteed to be
    /// drained before it returns.
    pub fn wait_consume_all(&self) -> Result<(), EngineError> {
        self.run()?;
        loop {
            self.shared.registry.wake.notify_all();
            let keys = self.shared.registry.keys.lock().unwrap();
            let data = self.shared.registry.data.lock().unwrap();
            let pending = data.values().any(KeyState::is_serviceable);
            drop(data);
            drop(keys);
            if !pending {
                return Ok(());
            }
            sleep(Duration::from_millis(1));
        }
    }

    /// Stop the dispatch task and join every outstanding worker.
    ///
    /// Idempotent: calling `stop` more than once, or calling it on an
    /// engine that was never `run`, is a no-op returning `Ok(())`. After
    /// `stop` returns, the engine is permanently stopped; `run` and
    /// `wait_consume_all` will return [`EngineError::Stopped`].
    pub fn stop(&self) -> Result<(), EngineError> {
        self.dispatch.request_stop();
        self.shared.registry.wake.notify_all();
        let dispatch_result = self.dispatch.join();
        let pool_result = self.shared.pool.join_all();
        self.stopped.store(true, Ordering::Release);

        if let Err(fault) = dispatch_result {
            return Err(EngineError::DispatchFault(fault));
        }
        if let Err(fault) = pool_result {
            return Err(EngineError::ConsumerFault(fault));
        }
        if let Some(fault) = self.shared.consumer_fault.lock().unwrap().take() {
            return Err(EngineError::ConsumerFault(fault));
        }
        Ok(())
    }
}

impl<K, V> Default for Engine<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for Engine<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// A builder for [`Engine`].
pub struct EngineBuilder {
    pool_size: usize,
    max_queue_capacity: usize,
    thread_names: Option<Box<dyn FnMut(usize) -> String + Send>>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            pool_size: 0,
            max_queue_capacity: 1000,
            thread_names: None,
        }
    }

    /// Maximum number of consumer invocations running concurrently. `0`
    /// (the default) resolves to [`std::thread::available_parallelism`].
    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    /// Maximum number of values buffered per key before `enqueue` starts
    /// returning `false`. Defaults to 1000.
    pub fn max_queue_capacity(mut self, capacity: usize) -> Self {
        self.max_queue_capacity = capacity;
        self
    }

    /// Provide a function to assign names to the engine's OS threads,
    /// called with an increasing sequence number drawn from one shared
    /// counter each time a thread is spawned — the dispatch thread first
    /// (when `run` first starts it), then every worker thread after.
    /// Without this, the dispatch thread is named `mqp-dispatch` and each
    /// worker thread `mqp-worker-{n}`.
    pub fn thread_names(mut self, f: impl FnMut(usize) -> String + Send + 'static) -> Self {
        self.thread_names = Some(Box::new(f) as _);
        self
    }

    /// Build the [`Engine`].
    pub fn build<K, V>(self) -> Engine<K, V>
    where
        K: Eq + Hash + Clone + Send + 'static,
        V: Send + 'static,
    {
        Engine::new_impl(self)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_consumer<K: Send + 'static, V: Send + 'static>(
        log: Arc<StdMutex<Vec<(K, V)>>>,
    ) -> Arc<dyn Consumer<K, V>> {
        Arc::new(move |k: K, v: V| log.lock().unwrap().push((k, v)))
    }

    #[test]
    fn delivers_values_in_fifo_order_per_key() {
        let engine: Engine<&str, i32> = Engine::<&str, i32>::builder().pool_size(1).build();
        let log = Arc::new(StdMutex::new(Vec::new()));
        assert!(engine.subscribe("a", Some(recording_consumer(log.clone()))));
        for v in 0..5 {
            assert!(engine.enqueue("a", v));
        }
        engine.wait_consume_all().unwrap();
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec![("a", 0), ("a", 1), ("a", 2), ("a", 3), ("a", 4)]);
    }

    #[test]
    fn enqueue_without_subscriber_buffers_until_dequeued() {
        let engine: Engine<&str, i32> = Engine::new();
        assert!(engine.enqueue("a", 1));
        assert!(engine.enqueue("a", 2));
        assert_eq!(engine.dequeue(&"a"), Some(1));
        assert_eq!(engine.dequeue(&"a"), Some(2));
        assert_eq!(engine.dequeue(&"a"), None);
    }

    #[test]
    fn enqueue_rejects_once_queue_is_full() {
        let engine: Engine<&str, i32> = Engine::<&str, i32>::builder().max_queue_capacity(2).build();
        assert!(engine.enqueue("a", 1));
        assert!(engine.enqueue("a", 2));
        assert!(!engine.enqueue("a", 3));
    }

    #[test]
    fn subscribe_refuses_second_consumer_until_unsubscribed() {
        let engine: Engine<&str, i32> = Engine::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        assert!(engine.subscribe("a", Some(recording_consumer(log.clone()))));
        assert!(!engine.subscribe("a", Some(recording_consumer(log.clone()))));
        engine.unsubscribe(&"a");
        assert!(engine.subscribe("a", Some(recording_consumer(log))));
    }

    #[test]
    fn stop_is_idempotent_and_disables_further_run() {
        let engine: Engine<&str, i32> = Engine::new();
        engine.run().unwrap();
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert!(matches!(engine.run(), Err(EngineError::Stopped)));
    }

    #[test]
    fn distinct_keys_are_processed_concurrently() {
        use std::sync::Barrier;

        let engine: Engine<&str, i32> = Engine::<&str, i32>::builder().pool_size(2).build();
        let barrier = Arc::new(Barrier::new(2));
        let b1 = barrier.clone();
        let b2 = barrier.clone();
        engine.subscribe(
            "a",
            Some(Arc::new(move |_k: &str, _v: i32| {
                b1.wait();
            })),
        );
        engine.subscribe(
            "b",
            Some(Arc::new(move |_k: &str, _v: i32| {
                b2.wait();
            })),
        );
        engine.enqueue("a", 1);
        engine.enqueue("b", 1);
        // Both consumers must reach the barrier for this to return; a pool
        // that could only run one worker at a time would hang here.
        engine.wait_consume_all().unwrap();
    }
}
