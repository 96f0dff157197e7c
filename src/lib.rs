//! voice-agent: real-time voice conversation pipeline
//!
//! Captures speech through a speech-to-text provider, answers through a
//! language model and speaks the reply through a text-to-speech provider.
//! The [`PipelineCoordinator`] owns:
//! - three validated sub-state-machines (capture, playback, processing)
//! - an [`AgentStateMachine`] deriving one high-level state from them
//! - an [`EventBus`] publishing every step to the host application
//! - a [`TurnTakingPolicy`] deciding whether capture pauses while speaking

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod providers;
pub mod state;
pub mod subscription;
pub mod turn_taking;

pub use config::{AgentConfig, PipelineMode};
pub use coordinator::{CoordinatorBuilder, PipelineCoordinator};
pub use error::{AgentError, ProviderError, Result, TransitionError};
pub use events::{Event, EventBus, EventFilter, EventPayload, EventType};
pub use providers::{LlmProvider, SttProvider, TtsProvider};
pub use state::{AgentState, AgentStateMachine};
pub use subscription::Subscription;
pub use turn_taking::{AutoStrategy, PauseSetting, TurnTakingPolicy};
