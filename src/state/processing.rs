//! Model-generation lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

use super::machine::{SubState, SubStateMachine};
use crate::error::TransitionError;

/// Lifecycle of one LLM generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Idle,
    Processing,
    Streaming,
    Complete,
    Error,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingState::Idle => "idle",
            ProcessingState::Processing => "processing",
            ProcessingState::Streaming => "streaming",
            ProcessingState::Complete => "complete",
            ProcessingState::Error => "error",
        };
        f.write_str(name)
    }
}

impl SubState for ProcessingState {
    const MACHINE: &'static str = "processing";
    const INITIAL: Self = ProcessingState::Idle;

    fn allowed_transitions(self) -> &'static [Self] {
        use ProcessingState::*;
        match self {
            Idle => &[Processing, Error],
            // Processing -> Idle covers a turn abandoned before the first chunk
            Processing => &[Streaming, Complete, Idle, Error],
            Streaming => &[Complete, Error],
            Complete => &[Idle, Error],
            Error => &[Idle],
        }
    }
}

pub type ProcessingStateMachine = SubStateMachine<ProcessingState>;

impl SubStateMachine<ProcessingState> {
    pub fn set_idle(&self) -> Result<(), TransitionError> {
        self.transition_to(ProcessingState::Idle)
    }

    pub fn set_processing(&self) -> Result<(), TransitionError> {
        self.transition_to(ProcessingState::Processing)
    }

    pub fn set_streaming(&self) -> Result<(), TransitionError> {
        self.transition_to(ProcessingState::Streaming)
    }

    pub fn set_complete(&self) -> Result<(), TransitionError> {
        self.transition_to(ProcessingState::Complete)
    }

    pub fn set_error(&self) -> Result<(), TransitionError> {
        self.transition_to(ProcessingState::Error)
    }

    /// Walk any non-error state back to idle through valid steps
    pub fn settle(&self) -> Result<(), TransitionError> {
        match self.state() {
            ProcessingState::Idle | ProcessingState::Error => Ok(()),
            ProcessingState::Streaming => {
                self.set_complete()?;
                self.set_idle()
            }
            ProcessingState::Processing | ProcessingState::Complete => self.set_idle(),
        }
    }
}
