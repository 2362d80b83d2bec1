use std::sync::Arc;

use parking_lot::Mutex;

/**
    A replaceable, optional frame consumer.

    The host sets and removes the sink from its own thread while the worker
    delivers frames. Delivery holds the slot lock for the duration of the
    callback, so once [`SinkSlot::remove`] returns no further frames reach
    the removed sink. Sinks must therefore not call back into the slot from
    their frame callback.
*/
pub struct SinkSlot<S: ?Sized> {
    sink: Mutex<Option<Arc<S>>>,
}

impl<S: ?Sized> SinkSlot<S> {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Install a sink, returning the one it replaces.
    pub fn set(&self, sink: Arc<S>) -> Option<Arc<S>> {
        self.sink.lock().replace(sink)
    }

    pub fn remove(&self) -> Option<Arc<S>> {
        self.sink.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.sink.lock().is_some()
    }

    /**
        Run `deliver` against the current sink, if any. Returns whether a
        sink was present.
    */
    pub fn deliver(&self, deliver: impl FnOnce(&S)) -> bool {
        let guard = self.sink.lock();
        match guard.as_deref() {
            Some(sink) => {
                deliver(sink);
                true
            }
            None => false,
        }
    }
}

impl<S: ?Sized> Default for SinkSlot<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> std::fmt::Debug for SinkSlot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSlot")
            .field("is_set", &self.is_set())
            .finish()
    }
}
