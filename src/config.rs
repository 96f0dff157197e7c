//! Configuration loading and management

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::turn_taking::{default_pause_combinations, AudioAccess, AutoStrategy, PauseSetting, ProviderPair};

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "VOICE_AGENT_CONFIG";

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub mode: PipelineMode,
    pub audio: AudioConfig,
    pub reconnect: ReconnectConfig,
    /// Bound on every STT connect / reconnect
    pub connect_timeout_ms: u64,
    pub logging: LoggingConfig,
    pub turn_taking: TurnTakingConfig,
    pub generation: GenerationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Pipeline,
            audio: AudioConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout_ms: 10_000,
            logging: LoggingConfig::default(),
            turn_taking: TurnTakingConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Separate STT/LLM/TTS collaborators, or one doing all three
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    #[default]
    Pipeline,
    Integrated,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfig {
    pub input: AudioInputConfig,
    pub output: AudioOutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioInputConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioInputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioOutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Buffered bytes at which playback moves from buffering to playing
    pub min_buffer_bytes: usize,
}

impl Default for AudioOutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            min_buffer_bytes: 4_096,
        }
    }
}

/// Bounds the capture-resume recovery loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Linear backoff: the n-th retry waits `backoff_ms * n`
    pub backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl ReconnectConfig {
    /// Total connection attempts, including the first
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub sink: LogSink,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            sink: LogSink::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSink {
    #[default]
    Stderr,
    Stdout,
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnTakingConfig {
    pub pause_capture_on_playback: PauseSetting,
    pub auto_strategy: AutoStrategy,
    pub always_pause_combinations: Vec<ProviderPair>,
    /// Provider id -> audio access, merged over the builtin table
    pub capabilities: HashMap<String, AudioAccess>,
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        Self {
            pause_capture_on_playback: PauseSetting::Auto,
            auto_strategy: AutoStrategy::Conservative,
            always_pause_combinations: default_pause_combinations(),
            capabilities: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationConfig {
    pub system_prompt: Option<String>,
    /// User + assistant messages kept as context (system prompt excluded)
    pub max_history_messages: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_history_messages: 20,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl AgentConfig {
    /// Load from the file named by `VOICE_AGENT_CONFIG`, or use defaults
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| AgentError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.input.sample_rate == 0 || audio.output.sample_rate == 0 {
            return Err(AgentError::Configuration("sample rate must be non-zero".into()));
        }
        if audio.input.channels == 0 || audio.output.channels == 0 {
            return Err(AgentError::Configuration("channel count must be non-zero".into()));
        }
        if self.reconnect.enabled && self.reconnect.max_attempts == 0 {
            return Err(AgentError::Configuration(
                "reconnect.maxAttempts must be at least 1 when reconnect is enabled".into(),
            ));
        }
        Ok(())
    }
}
