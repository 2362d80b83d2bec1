/*!
    Observable values and their listener registry.

    A [`Signal`] holds subscriptions keyed by a [`SubscriptionToken`].
    Subscriptions made with [`Signal::bind_weak`] only reference their
    listener weakly: once the listener is dropped, the subscription is
    removed the next time the signal is emitted.
*/

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/**
    Identifies one subscription on a signal.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    owner: Option<Weak<dyn Any + Send + Sync>>,
    callback: Callback<T>,
}

impl<T> Slot<T> {
    fn is_live(&self) -> bool {
        self.owner
            .as_ref()
            .is_none_or(|owner| owner.strong_count() > 0)
    }
}

struct Slots<T> {
    next_id: u64,
    slots: BTreeMap<u64, Slot<T>>,
}

/**
    A set of callbacks invoked with a value on [`Signal::emit`].

    Callbacks run on the emitting thread, in subscription order, after the
    registry lock has been released. A callback may therefore bind or
    unbind subscriptions, including its own; such changes take effect from
    the next emission.
*/
pub struct Signal<T> {
    inner: Mutex<Slots<T>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                next_id: 0,
                slots: BTreeMap::new(),
            }),
        }
    }

    /**
        Subscribe a callback that lives until it is unbound.
    */
    pub fn bind<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    /**
        Subscribe `listener` without keeping it alive.

        The callback receives the listener and the emitted value. When the
        listener has been dropped the subscription expires and is removed
        lazily, at the next emission.
    */
    pub fn bind_weak<L, F>(&self, listener: &Arc<L>, callback: F) -> SubscriptionToken
    where
        T: 'static,
        L: Send + Sync + 'static,
        F: Fn(&L, &T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(listener);
        let owner: Weak<dyn Any + Send + Sync> = weak.clone();
        self.insert(
            Some(owner),
            Arc::new(move |value: &T| {
                if let Some(listener) = weak.upgrade() {
                    callback(&listener, value);
                }
            }),
        )
    }

    /**
        Remove a subscription. Returns false if it was already gone.
    */
    pub fn unbind(&self, token: SubscriptionToken) -> bool {
        self.inner.lock().slots.remove(&token.0).is_some()
    }

    pub fn unbind_all(&self) {
        self.inner.lock().slots.clear();
    }

    /// Number of subscriptions, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
        Invoke every live subscription with `value`, dropping expired ones.
    */
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = {
            let mut inner = self.inner.lock();
            inner.slots.retain(|_, slot| slot.is_live());
            inner
                .slots
                .values()
                .map(|slot| Arc::clone(&slot.callback))
                .collect()
        };
        for callback in callbacks {
            callback(value);
        }
    }

    fn insert(
        &self,
        owner: Option<Weak<dyn Any + Send + Sync>>,
        callback: Callback<T>,
    ) -> SubscriptionToken {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(id, Slot { owner, callback });
        SubscriptionToken(id)
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscriptions", &self.len())
            .finish()
    }
}

/**
    A value that notifies its signal whenever it changes.

    Setting a value equal to the current one does not notify.
*/
pub struct Property<T> {
    value: Mutex<T>,
    changed: Signal<T>,
}

impl<T: Clone + PartialEq> Property<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Signal::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value.lock().clone()
    }

    /**
        Store `value` and notify subscribers if it differs from the current
        value. Returns whether it changed.
    */
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.lock();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.changed.emit(&value);
        true
    }

    pub fn signal(&self) -> &Signal<T> {
        &self.changed
    }

    pub fn disconnect_all(&self) {
        self.changed.unbind_all();
    }
}

impl<T: Clone + PartialEq + Default> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("value", &*self.value.lock())
            .field("changed", &self.changed)
            .finish()
    }
}
