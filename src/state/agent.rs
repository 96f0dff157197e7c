//! Derived agent state
//!
//! The agent state is never set by hand during normal operation: it is
//! recomputed from the capture, playback and processing machines every time
//! one of them transitions, and observers are only told when the derived
//! value actually changes. `set_error` and `reset` are the two overrides.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::capture::{CaptureState, CaptureStateMachine};
use super::machine::StateListener;
use super::playback::{PlaybackState, PlaybackStateMachine};
use super::processing::{ProcessingState, ProcessingStateMachine};
use crate::subscription::{ListenerSet, Subscription};

/// High-level status exposed to the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Not initialized, or explicitly reset
    Idle,
    /// Initialized, microphone closed
    Ready,
    /// Capture is active and waiting for speech
    Listening,
    /// Generation in progress
    Thinking,
    /// Synthesized audio is being produced or played
    Speaking,
    Error,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Ready => "ready",
            AgentState::Listening => "listening",
            AgentState::Thinking => "thinking",
            AgentState::Speaking => "speaking",
            AgentState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Precedence: error > speaking > thinking > listening > ready
pub fn derive_agent_state(
    capture: CaptureState,
    playback: PlaybackState,
    processing: ProcessingState,
) -> AgentState {
    if capture == CaptureState::Error
        || playback == PlaybackState::Error
        || processing == ProcessingState::Error
    {
        return AgentState::Error;
    }

    if matches!(
        playback,
        PlaybackState::Buffering | PlaybackState::Playing | PlaybackState::Paused
    ) {
        return AgentState::Speaking;
    }

    if matches!(
        processing,
        ProcessingState::Processing | ProcessingState::Streaming | ProcessingState::Complete
    ) {
        return AgentState::Thinking;
    }

    if capture == CaptureState::Active {
        return AgentState::Listening;
    }

    AgentState::Ready
}

#[derive(Clone)]
struct Sources {
    capture: CaptureStateMachine,
    playback: PlaybackStateMachine,
    processing: ProcessingStateMachine,
}

struct AgentInner {
    state: Mutex<AgentState>,
    listeners: Mutex<ListenerSet<StateListener<AgentState>>>,
    sources: Mutex<Option<Sources>>,
    source_subscriptions: Mutex<Vec<Subscription>>,
    transition_lock: ReentrantMutex<()>,
}

impl AgentInner {
    fn rederive(&self) {
        let _guard = self.transition_lock.lock();
        let Some(sources) = self.sources.lock().clone() else {
            return;
        };
        let derived = derive_agent_state(
            sources.capture.state(),
            sources.playback.state(),
            sources.processing.state(),
        );
        self.apply(derived);
    }

    fn apply(&self, next: AgentState) {
        let _guard = self.transition_lock.lock();
        let previous = {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            std::mem::replace(&mut *state, next)
        };

        info!(from = %previous, to = %next, "agent state change");

        let listeners = self.listeners.lock().snapshot();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(next, previous))).is_err() {
                error!(from = %previous, to = %next, "agent state listener panicked");
            }
        }
    }
}

/// Orchestrates the three sub-machines into one [`AgentState`]
#[derive(Clone)]
pub struct AgentStateMachine {
    inner: Arc<AgentInner>,
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AgentInner {
                state: Mutex::new(AgentState::Idle),
                listeners: Mutex::new(ListenerSet::new()),
                sources: Mutex::new(None),
                source_subscriptions: Mutex::new(Vec::new()),
                transition_lock: ReentrantMutex::new(()),
            }),
        }
    }

    /// Subscribe to the three sub-machines and derive immediately
    pub fn initialize(
        &self,
        capture: &CaptureStateMachine,
        playback: &PlaybackStateMachine,
        processing: &ProcessingStateMachine,
    ) {
        self.detach_sources();

        *self.inner.sources.lock() = Some(Sources {
            capture: capture.clone(),
            playback: playback.clone(),
            processing: processing.clone(),
        });

        let subscriptions = vec![
            capture.on_state_change(rederive_on(Arc::downgrade(&self.inner))),
            playback.on_state_change(rederive_on(Arc::downgrade(&self.inner))),
            processing.on_state_change(rederive_on(Arc::downgrade(&self.inner))),
        ];
        *self.inner.source_subscriptions.lock() = subscriptions;

        debug!("agent state machine wired to sub-machines");
        self.inner.rederive();
    }

    /// Cached derived state
    pub fn state(&self) -> AgentState {
        *self.inner.state.lock()
    }

    pub fn is(&self, state: AgentState) -> bool {
        self.state() == state
    }

    pub fn is_in(&self, states: &[AgentState]) -> bool {
        states.contains(&self.state())
    }

    /// Force `error` regardless of what the sub-machines report
    pub fn set_error(&self) {
        self.inner.apply(AgentState::Error);
    }

    /// Force `idle`; the sub-machines are left untouched
    pub fn reset(&self) {
        self.inner.apply(AgentState::Idle);
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(AgentState, AgentState) + Send + Sync + 'static,
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

    /// Stop deriving and drop every listener
    pub fn dispose(&self) {
        self.detach_sources();
        self.inner.listeners.lock().clear();
    }

    fn detach_sources(&self) {
        let subscriptions = std::mem::take(&mut *self.inner.source_subscriptions.lock());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        *self.inner.sources.lock() = None;
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AgentStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentStateMachine")
            .field("state", &self.state())
            .finish()
    }
}

fn rederive_on<S: 'static>(weak: Weak<AgentInner>) -> impl Fn(S, S) + Send + Sync + 'static {
    move |_, _| {
        if let Some(inner) = weak.upgrade() {
            inner.rederive();
        }
    }
}
