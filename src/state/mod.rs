//! State machines for the conversation pipeline
//!
//! Three validated sub-machines track the independently evolving parts of
//! the system:
//! - Capture: the audio-input stream
//! - Playback: synthesized audio output
//! - Processing: model generation
//!
//! `AgentStateMachine` derives one high-level state from those three.

mod agent;
mod capture;
mod machine;
mod playback;
mod processing;

pub use agent::{derive_agent_state, AgentState, AgentStateMachine};
pub use capture::{CaptureState, CaptureStateMachine};
pub use machine::{StateListener, SubState, SubStateMachine};
pub use playback::{PlaybackState, PlaybackStateMachine};
pub use processing::{ProcessingState, ProcessingStateMachine};
