use std::collections::VecDeque;
use std::sync::Arc;

use crate::consumer::Consumer;

/// Per-key state held under the engine's coarse data-state lock: the
/// pending value queue and the currently bound consumer, if any.
pub(crate) struct KeyState<K, V> {
    pub(crate) queue: VecDeque<V>,
    pub(crate) consumer: Option<Arc<dyn Consumer<K, V>>>,
}

impl<K, V> KeyState<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            consumer: None,
        }
    }

    /// A key is serviceable when it has a bound consumer and at least one
    /// queued value — the condition the dispatch loop waits for.
    pub(crate) fn is_serviceable(&self) -> bool {
        self.consumer.is_some() && !self.queue.is_empty()
    }
}
