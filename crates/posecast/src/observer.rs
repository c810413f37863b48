//! Listener registry with explicit unsubscribe handles.

use std::sync::{Arc, Mutex, PoisonError, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// A set of listeners invoked synchronously, in registration order, on every
/// [`notify`](Observers::notify).
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Observers<T> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It stays registered until the returned handle's
    /// [`unsubscribe`](Subscription::unsubscribe) is called; dropping the
    /// handle does not remove it.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = reg.next_id;
        reg.next_id += 1;
        reg.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut reg = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    reg.listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Invoke every listener with `value`. Listeners may subscribe or
    /// unsubscribe from inside the callback; such changes apply to the next
    /// notification.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = {
            let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            reg.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(value);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    /// True when nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancellation handle returned by [`Observers::subscribe`].
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the listener. Safe after the registry is gone.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
