//! Audio-output lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

use super::machine::{SubState, SubStateMachine};
use crate::error::TransitionError;

/// Lifecycle of synthesized audio playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Error,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Error => "error",
        };
        f.write_str(name)
    }
}

impl SubState for PlaybackState {
    const MACHINE: &'static str = "playback";
    const INITIAL: Self = PlaybackState::Idle;

    fn allowed_transitions(self) -> &'static [Self] {
        use PlaybackState::*;
        match self {
            Idle => &[Buffering, Error],
            Buffering => &[Playing, Stopped, Error],
            Playing => &[Paused, Stopped, Error],
            Paused => &[Playing, Stopped, Error],
            Stopped => &[Idle, Buffering, Error],
            Error => &[Idle, Stopped],
        }
    }
}

pub type PlaybackStateMachine = SubStateMachine<PlaybackState>;

impl SubStateMachine<PlaybackState> {
    pub fn set_idle(&self) -> Result<(), TransitionError> {
        self.transition_to(PlaybackState::Idle)
    }

    pub fn set_buffering(&self) -> Result<(), TransitionError> {
        self.transition_to(PlaybackState::Buffering)
    }

    pub fn set_playing(&self) -> Result<(), TransitionError> {
        self.transition_to(PlaybackState::Playing)
    }

    pub fn set_paused(&self) -> Result<(), TransitionError> {
        self.transition_to(PlaybackState::Paused)
    }

    pub fn set_stopped(&self) -> Result<(), TransitionError> {
        self.transition_to(PlaybackState::Stopped)
    }

    pub fn set_error(&self) -> Result<(), TransitionError> {
        self.transition_to(PlaybackState::Error)
    }

    /// Buffering, playing or paused mid-utterance
    pub fn is_audible(&self) -> bool {
        matches!(
            self.state(),
            PlaybackState::Buffering | PlaybackState::Playing | PlaybackState::Paused
        )
    }
}
