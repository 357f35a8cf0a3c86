/// The contract a value consumer bound to a key must satisfy.
///
/// A `Consumer` is invoked from whichever worker thread the engine admits
/// for its key, never from the caller of `subscribe`/`enqueue` and never
/// concurrently with itself for the same key (see the engine's per-key
/// mutual exclusion guarantee).
pub trait Consumer<K, V>: Send + Sync {
    /// Process one value dequeued for `key`.
    fn consume(&self, key: K, value: V);
}

impl<K, V, F> Consumer<K, V> for F
where
    F: Fn(K, V) + Send + Sync,
{
    fn consume(&self, key: K, value: V) {
        self(key, value)
    }
}
