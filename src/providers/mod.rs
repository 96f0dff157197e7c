//! Collaborator interfaces for STT, LLM and TTS
//!
//! Providers are capability-tagged: each one describes itself with a
//! [`ProviderDescriptor`] and a capability struct, and the coordinator
//! branches on those declarations instead of on concrete types. Operations a
//! provider does not support fall back to [`ProviderError::Unsupported`].

pub mod loopback;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::turn_taking::AudioAccess;

/// Encoded audio as produced or consumed by a provider
pub type AudioChunk = Vec<u8>;

/// Finite, forward-only sequence of generated text chunks
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

pub type TranscriptionCallback = Arc<dyn Fn(TranscriptionResult) + Send + Sync>;
pub type AudioCallback = Arc<dyn Fn(AudioChunk) + Send + Sync>;
pub type MetadataCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Static identity of a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    /// Stable identifier, used for capability lookup and turn-taking pairs
    pub id: String,
    /// Declared audio-access method; overrides the capability table when set
    pub audio_access: Option<AudioAccess>,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio_access: None,
        }
    }

    pub fn with_audio_access(mut self, access: AudioAccess) -> Self {
        self.audio_access = Some(access);
        self
    }
}

/// Who owns the input audio device for an STT provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOwnership {
    /// The provider opens the microphone itself; it is told to start and stop
    SelfManaged,
    /// The host feeds audio through `connect` / `send_audio`
    ExternallyFed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttCapabilities {
    /// `connect` / `send_audio` / `disconnect`
    pub streaming: bool,
    /// `transcribe`
    pub batch: bool,
    pub input: InputOwnership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtsCapabilities {
    /// `connect` / `send_text` / `finalize` / `disconnect`
    pub incremental: bool,
    /// `synthesize`
    pub batch: bool,
}

/// One STT result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TranscriptionResult {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
            metadata: None,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: None,
            metadata: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the in-memory conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Speech-to-text collaborator
#[async_trait]
pub trait SttProvider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    fn capabilities(&self) -> SttCapabilities;

    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn dispose(&self) -> Result<(), ProviderError>;

    fn is_ready(&self) -> bool;

    /// Register the sink for transcription results
    fn on_transcription(&self, callback: TranscriptionCallback);

    async fn connect(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("stt.connect"))
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("stt.disconnect"))
    }

    async fn send_audio(&self, _chunk: &[u8]) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("stt.send_audio"))
    }

    async fn transcribe(&self, _audio: &[u8]) -> Result<TranscriptionResult, ProviderError> {
        Err(ProviderError::Unsupported("stt.transcribe"))
    }

    /// Begin listening on a self-managed input device
    async fn start_listening(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("stt.start_listening"))
    }

    async fn stop_listening(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("stt.stop_listening"))
    }
}

/// Language-model collaborator
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn dispose(&self) -> Result<(), ProviderError>;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TextStream, ProviderError>;

    async fn generate_from_messages(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<TextStream, ProviderError>;
}

/// Text-to-speech collaborator
#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    fn capabilities(&self) -> TtsCapabilities;

    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn dispose(&self) -> Result<(), ProviderError>;

    /// Register the sink for streamed audio
    fn on_audio(&self, callback: AudioCallback);

    /// Register the sink for provider metadata (word timings, marks, ...)
    fn on_metadata(&self, _callback: MetadataCallback) {}

    async fn synthesize(&self, _text: &str) -> Result<AudioChunk, ProviderError> {
        Err(ProviderError::Unsupported("tts.synthesize"))
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("tts.connect"))
    }

    async fn send_text(&self, _chunk: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("tts.send_text"))
    }

    /// Flush any text still buffered on the provider side
    async fn finalize(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("tts.finalize"))
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("tts.disconnect"))
    }
}
