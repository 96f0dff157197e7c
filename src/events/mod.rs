//! Events published by the coordinator
//!
//! Every event carries a timestamp and a payload whose `type` is a
//! dot-namespaced name (`agent.stateChange`, `llm.chunk`, ...). Payload
//! shape is fixed per type.

mod bus;

pub use bus::{AsyncListener, EventBus, EventFilter, Listener, DEFAULT_MAX_LISTENERS};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::AudioChunk;
use crate::state::AgentState;

/// Event envelope
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with the current time
    pub fn now(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        Self::now(payload)
    }
}

/// Event payloads, tagged by their dotted type name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// Providers initialized and the state machines are wired
    #[serde(rename = "agent.ready")]
    AgentReady,

    #[serde(rename = "agent.stateChange", rename_all = "camelCase")]
    AgentStateChange {
        state: AgentState,
        previous_state: AgentState,
    },

    #[serde(rename = "agent.error")]
    AgentError { error: String, recoverable: bool },

    #[serde(rename = "transcription.interim")]
    TranscriptionInterim {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    #[serde(rename = "transcription.final")]
    TranscriptionFinal {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    #[serde(rename = "llm.start")]
    LlmStart { prompt: String },

    /// `accumulated` is everything generated so far in this turn
    #[serde(rename = "llm.chunk")]
    LlmChunk { chunk: String, accumulated: String },

    #[serde(rename = "llm.complete")]
    LlmComplete { text: String },

    #[serde(rename = "llm.error")]
    LlmError { error: String, recoverable: bool },

    #[serde(rename = "tts.start")]
    TtsStart { text: String },

    #[serde(rename = "tts.audio")]
    TtsAudio { chunk: AudioChunk },

    #[serde(rename = "tts.metadata")]
    TtsMetadata { metadata: Value },

    #[serde(rename = "tts.complete")]
    TtsComplete,

    #[serde(rename = "tts.error")]
    TtsError { error: String, recoverable: bool },

    #[serde(rename = "audio.capture.start")]
    AudioCaptureStart,

    #[serde(rename = "audio.capture.stop")]
    AudioCaptureStop,
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::AgentReady => EventType::AgentReady,
            EventPayload::AgentStateChange { .. } => EventType::AgentStateChange,
            EventPayload::AgentError { .. } => EventType::AgentError,
            EventPayload::TranscriptionInterim { .. } => EventType::TranscriptionInterim,
            EventPayload::TranscriptionFinal { .. } => EventType::TranscriptionFinal,
            EventPayload::LlmStart { .. } => EventType::LlmStart,
            EventPayload::LlmChunk { .. } => EventType::LlmChunk,
            EventPayload::LlmComplete { .. } => EventType::LlmComplete,
            EventPayload::LlmError { .. } => EventType::LlmError,
            EventPayload::TtsStart { .. } => EventType::TtsStart,
            EventPayload::TtsAudio { .. } => EventType::TtsAudio,
            EventPayload::TtsMetadata { .. } => EventType::TtsMetadata,
            EventPayload::TtsComplete => EventType::TtsComplete,
            EventPayload::TtsError { .. } => EventType::TtsError,
            EventPayload::AudioCaptureStart => EventType::AudioCaptureStart,
            EventPayload::AudioCaptureStop => EventType::AudioCaptureStop,
        }
    }
}

/// Subscription key for [`EventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    AgentReady,
    AgentStateChange,
    AgentError,
    TranscriptionInterim,
    TranscriptionFinal,
    LlmStart,
    LlmChunk,
    LlmComplete,
    LlmError,
    TtsStart,
    TtsAudio,
    TtsMetadata,
    TtsComplete,
    TtsError,
    AudioCaptureStart,
    AudioCaptureStop,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentReady => "agent.ready",
            EventType::AgentStateChange => "agent.stateChange",
            EventType::AgentError => "agent.error",
            EventType::TranscriptionInterim => "transcription.interim",
            EventType::TranscriptionFinal => "transcription.final",
            EventType::LlmStart => "llm.start",
            EventType::LlmChunk => "llm.chunk",
            EventType::LlmComplete => "llm.complete",
            EventType::LlmError => "llm.error",
            EventType::TtsStart => "tts.start",
            EventType::TtsAudio => "tts.audio",
            EventType::TtsMetadata => "tts.metadata",
            EventType::TtsComplete => "tts.complete",
            EventType::TtsError => "tts.error",
            EventType::AudioCaptureStart => "audio.capture.start",
            EventType::AudioCaptureStop => "audio.capture.stop",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
