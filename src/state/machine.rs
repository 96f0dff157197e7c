//! Table-driven sub-state-machine engine
//!
//! Capture, playback and processing all share this implementation. Each
//! state enum supplies its adjacency table through [`SubState`]; the
//! machine rejects anything outside it before mutating, and notifies its
//! listeners synchronously after a successful transition.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, warn};

use crate::error::TransitionError;
use crate::subscription::{ListenerSet, Subscription};

/// Listener invoked with `(new_state, old_state)`
pub type StateListener<S> = Arc<dyn Fn(S, S) + Send + Sync>;

/// A state enum with a static adjacency table
pub trait SubState:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Machine name used in logs and transition errors
    const MACHINE: &'static str;

    /// State a new (or reset) machine starts in
    const INITIAL: Self;

    /// States reachable from `self` in one step
    fn allowed_transitions(self) -> &'static [Self];

    fn can_transition_to(self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

/// A validated state machine over `S`.
///
/// Cloning yields another handle to the same machine.
pub struct SubStateMachine<S: SubState> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: SubState> {
    state: Mutex<S>,
    listeners: Mutex<ListenerSet<StateListener<S>>>,
    /// Serializes transition + notification so listeners see transitions in order
    transition_lock: ReentrantMutex<()>,
}

impl<S: SubState> SubStateMachine<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(S::INITIAL),
                listeners: Mutex::new(ListenerSet::new()),
                transition_lock: ReentrantMutex::new(()),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> S {
        *self.inner.state.lock()
    }

    pub fn is(&self, state: S) -> bool {
        self.state() == state
    }

    pub fn can_transition_to(&self, next: S) -> bool {
        self.state().can_transition_to(next)
    }

    /// Move to `next`.
    ///
    /// Targeting the current state is a no-op. A target outside the current
    /// state's table fails without changing state or notifying.
    pub fn transition_to(&self, next: S) -> Result<(), TransitionError> {
        let _guard = self.inner.transition_lock.lock();

        let previous = {
            let mut state = self.inner.state.lock();
            let current = *state;
            if current == next {
                debug!(machine = S::MACHINE, state = %current, "already in requested state");
                return Ok(());
            }
            if !current.can_transition_to(next) {
                warn!(
                    machine = S::MACHINE,
                    from = %current,
                    to = %next,
                    "rejected invalid transition"
                );
                return Err(TransitionError {
                    machine: S::MACHINE,
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            *state = next;
            current
        };

        debug!(machine = S::MACHINE, from = %previous, to = %next, "state transition");
        self.notify(next, previous);
        Ok(())
    }

    /// Force the machine back to its initial state, bypassing the table
    pub fn reset(&self) {
        let _guard = self.inner.transition_lock.lock();

        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut *state, S::INITIAL)
        };

        if previous != S::INITIAL {
            debug!(machine = S::MACHINE, from = %previous, "state reset");
            self.notify(S::INITIAL, previous);
        }
    }

    /// Register a listener; listeners run in registration order
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(S, S) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.lock().insert(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().remove(id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Drop every listener
    pub fn dispose(&self) {
        self.inner.listeners.lock().clear();
    }

    fn notify(&self, new: S, old: S) {
        let listeners = self.inner.listeners.lock().snapshot();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(new, old))).is_err() {
                error!(
                    machine = S::MACHINE,
                    from = %old,
                    to = %new,
                    "state listener panicked"
                );
            }
        }
    }
}

impl<S: SubState> Clone for SubStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SubState> Default for SubStateMachine<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SubState> fmt::Debug for SubStateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubStateMachine")
            .field("machine", &S::MACHINE)
            .field("state", &self.state())
            .finish()
    }
}
