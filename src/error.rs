//! Error types for the voice agent core
//!
//! `AgentError` is what callers of the coordinator see. `ProviderError` is
//! what collaborators report back, and `TransitionError` is raised by the
//! sub-state-machines when a setter targets a state outside their table.

use thiserror::Error;

use crate::state::AgentState;

/// Result type alias for coordinator operations
pub type Result<T, E = AgentError> = std::result::Result<T, E>;

/// Errors surfaced by the coordinator and its configuration
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or invalid collaborator/configuration at construction time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator failed during `initialize()`
    #[error("provider `{provider}` failed to initialize: {source}")]
    ProviderInitialization {
        provider: String,
        #[source]
        source: ProviderError,
    },

    /// A collaborator failed to connect or reconnect
    #[error("provider `{provider}` connection failed: {source}")]
    ProviderConnection {
        provider: String,
        #[source]
        source: ProviderError,
    },

    /// Operation not valid in the current agent state
    #[error("cannot {operation} while agent is {state}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },

    /// Operation requires `initialize()` to have completed
    #[error("coordinator is not initialized")]
    NotInitialized,

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// A bounded wait expired
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

/// A sub-machine setter targeted a state that is not adjacent to the current one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {machine} transition: {from} -> {to}")]
pub struct TransitionError {
    pub machine: &'static str,
    pub from: String,
    pub to: String,
}

/// Errors reported by STT, LLM and TTS collaborators
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("capability not supported: {0}")]
    Unsupported(&'static str),

    #[error("provider is not ready")]
    NotReady,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
