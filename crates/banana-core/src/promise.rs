//! Single-resolution promises.
//!
//! The engines use these for two jobs: breaking cycles during
//! deserialization (a tuple that is not yet constructible hands its
//! enclosing container a promise instead of a value) and representing
//! results that are not available yet (a send completion, an in-flight
//! sub-object). Continuations run synchronously at the point of
//! resolution, which keeps the engines deterministic — there is no hidden
//! executor.

use std::sync::Arc;

use parking_lot::Mutex;

type Continuation<T> = Box<dyn FnOnce(&T) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Done(T),
}

/// A value that will be produced exactly once.
///
/// Cloning shares the underlying slot. Resolving twice is a logic error
/// and panics in debug builds; release builds ignore the second value.
pub struct Promise<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = matches!(&*self.state.lock(), State::Done(_));
        f.debug_struct("Promise").field("resolved", &ready).finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A fresh, unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State::Pending(Vec::new()))) }
    }

    /// A promise that is already resolved.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self { state: Arc::new(Mutex::new(State::Done(value))) }
    }

    /// Resolve the promise, running all registered continuations in
    /// registration order.
    pub fn resolve(&self, value: T) {
        let continuations = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Done(value.clone());
                    waiters
                }
                State::Done(_) => {
                    debug_assert!(false, "promise resolved twice");
                    return;
                }
            }
        };
        for k in continuations {
            k(&value);
        }
    }

    /// Run `f` with the value: immediately if resolved, otherwise at
    /// resolution time.
    pub fn when_resolved(&self, f: impl FnOnce(&T) + Send + 'static) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Pending(waiters) => waiters.push(Box::new(f)),
            State::Done(value) => {
                let value = value.clone();
                drop(state);
                f(&value);
            }
        }
    }

    /// The value, if already resolved.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        match &*self.state.lock() {
            State::Done(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    /// True once resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(_))
    }

    /// True if this and `other` share the same slot.
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
