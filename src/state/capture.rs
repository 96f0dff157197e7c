//! Audio-input lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

use super::machine::{SubState, SubStateMachine};
use crate::error::TransitionError;

/// Lifecycle of the microphone / STT input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Starting,
    Active,
    Paused,
    Stopped,
    Error,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Starting => "starting",
            CaptureState::Active => "active",
            CaptureState::Paused => "paused",
            CaptureState::Stopped => "stopped",
            CaptureState::Error => "error",
        };
        f.write_str(name)
    }
}

impl SubState for CaptureState {
    const MACHINE: &'static str = "capture";
    const INITIAL: Self = CaptureState::Idle;

    fn allowed_transitions(self) -> &'static [Self] {
        use CaptureState::*;
        match self {
            Idle => &[Starting, Error],
            Starting => &[Active, Stopped, Idle, Error],
            Active => &[Paused, Stopped, Error],
            Paused => &[Active, Stopped, Error],
            Stopped => &[Idle, Starting, Error],
            Error => &[Idle, Stopped],
        }
    }
}

pub type CaptureStateMachine = SubStateMachine<CaptureState>;

impl SubStateMachine<CaptureState> {
    pub fn set_idle(&self) -> Result<(), TransitionError> {
        self.transition_to(CaptureState::Idle)
    }

    pub fn set_starting(&self) -> Result<(), TransitionError> {
        self.transition_to(CaptureState::Starting)
    }

    pub fn set_active(&self) -> Result<(), TransitionError> {
        self.transition_to(CaptureState::Active)
    }

    pub fn set_paused(&self) -> Result<(), TransitionError> {
        self.transition_to(CaptureState::Paused)
    }

    pub fn set_stopped(&self) -> Result<(), TransitionError> {
        self.transition_to(CaptureState::Stopped)
    }

    pub fn set_error(&self) -> Result<(), TransitionError> {
        self.transition_to(CaptureState::Error)
    }

    /// Whether audio is flowing (or would be, once resumed)
    pub fn is_capturing(&self) -> bool {
        matches!(self.state(), CaptureState::Active | CaptureState::Paused)
    }
}
