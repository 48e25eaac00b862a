use crate::domain::ports::{Observer, ObserverId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

struct Registration {
    id: ObserverId,
    observer: Weak<dyn Observer>,
}

/// Thread-safe set of observers with ordered broadcast.
///
/// The registry only holds weak references: dropping an observer elsewhere
/// unsubscribes it at the next broadcast. Membership changes and broadcasts
/// share one critical section, so a broadcast is never observed half-done.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Registration>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `observer` unless one with the same id is registered.
    pub fn register(&self, observer: &Arc<dyn Observer>) -> bool {
        self.register_with(observer, |_| {})
    }

    /// Registers `observer` and hands it to `catch_up` before any later
    /// broadcast can reach it. `catch_up` runs only for new registrations.
    pub fn register_with(
        &self,
        observer: &Arc<dyn Observer>,
        catch_up: impl FnOnce(&dyn Observer),
    ) -> bool {
        let mut observers = self.lock();
        let id = observer.id();
        if observers.iter().any(|r| r.id == id) {
            return false;
        }
        observers.push(Registration {
            id,
            observer: Arc::downgrade(observer),
        });
        debug!(observer = %id, count = observers.len(), "Observer registered");
        catch_up(observer.as_ref());
        true
    }

    /// Removes the observer with `id`. Ordering among observers is not
    /// preserved.
    pub fn deregister(&self, id: ObserverId) -> bool {
        let mut observers = self.lock();
        match observers.iter().position(|r| r.id == id) {
            Some(index) => {
                observers.swap_remove(index);
                debug!(observer = %id, count = observers.len(), "Observer deregistered");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.lock().iter().any(|r| r.id == id)
    }

    /// Number of registered observers, including ones not yet pruned.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers a rendered state to every observer. Returns the number reached.
    pub fn broadcast_state(&self, rendered: &str) -> usize {
        let mut observers = self.lock();
        Self::dispatch(&mut observers, |o| o.update_state(rendered))
    }

    /// Delivers a rendered balance to every observer. Returns the number reached.
    pub fn broadcast_balance(&self, rendered: &str) -> usize {
        let mut observers = self.lock();
        Self::dispatch(&mut observers, |o| o.update_balance(rendered))
    }

    /// Runs `decide` inside the broadcast section and delivers its state
    /// rendering, if any. Returns whether a broadcast happened.
    ///
    /// `decide` must only take locks that are never held while waiting on
    /// this registry.
    pub fn broadcast_state_with(&self, decide: impl FnOnce() -> Option<String>) -> bool {
        let mut observers = self.lock();
        match decide() {
            Some(rendered) => {
                Self::dispatch(&mut observers, |o| o.update_state(&rendered));
                true
            }
            None => false,
        }
    }

    /// Balance counterpart of [`ObserverRegistry::broadcast_state_with`].
    pub fn broadcast_balance_with(&self, decide: impl FnOnce() -> Option<String>) -> bool {
        let mut observers = self.lock();
        match decide() {
            Some(rendered) => {
                Self::dispatch(&mut observers, |o| o.update_balance(&rendered));
                true
            }
            None => false,
        }
    }

    fn dispatch(observers: &mut Vec<Registration>, deliver: impl Fn(&dyn Observer)) -> usize {
        let mut delivered = 0;
        observers.retain(|registration| match registration.observer.upgrade() {
            Some(observer) => {
                deliver(observer.as_ref());
                delivered += 1;
                true
            }
            None => {
                debug!(observer = %registration.id, "Pruning dropped observer");
                false
            }
        });
        delivered
    }
}
