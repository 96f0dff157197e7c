//! Turn-taking policy
//!
//! Decides whether capture must pause while synthesized audio plays, so the
//! microphone does not pick up the agent's own voice. The decision is a pure
//! function of configuration, provider identity and (for `detect`) the
//! platform's supported audio constraints; acting on it is the
//! coordinator's job.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::config::TurnTakingConfig;
use crate::providers::ProviderDescriptor;

/// How a provider reaches the audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioAccess {
    /// Owns the microphone itself; cannot share an echo-cancelled stream
    ExclusiveDeviceAccess,
    /// Consumes a host-managed stream that can carry echo cancellation
    ExternallyManagedStream,
    /// Does not touch audio devices
    None,
}

/// `pauseCaptureOnPlayback`: `"auto"`, `true` or `false`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseSetting {
    #[default]
    Auto,
    Always,
    Never,
}

impl Serialize for PauseSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PauseSetting::Auto => serializer.serialize_str("auto"),
            PauseSetting::Always => serializer.serialize_bool(true),
            PauseSetting::Never => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for PauseSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PauseSettingVisitor;

        impl<'de> Visitor<'de> for PauseSettingVisitor {
            type Value = PauseSetting;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(r#""auto", true or false"#)
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<PauseSetting, E> {
                Ok(if value {
                    PauseSetting::Always
                } else {
                    PauseSetting::Never
                })
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<PauseSetting, E> {
                match value {
                    "auto" => Ok(PauseSetting::Auto),
                    "true" => Ok(PauseSetting::Always),
                    "false" => Ok(PauseSetting::Never),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(PauseSettingVisitor)
    }
}

/// Strategy used when the setting is `auto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStrategy {
    /// Pause unless the STT provider is known to use an echo-cancellable stream
    #[default]
    Conservative,
    /// Pause only for listed (STT, TTS) pairs
    Aggressive,
    /// Ask the platform whether echo cancellation is available
    Detect,
}

/// An (STT, TTS) provider pair that must always pause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPair {
    pub stt: String,
    pub tts: String,
}

impl ProviderPair {
    pub fn new(stt: impl Into<String>, tts: impl Into<String>) -> Self {
        Self {
            stt: stt.into(),
            tts: tts.into(),
        }
    }

    fn matches(&self, stt: &ProviderDescriptor, tts: &ProviderDescriptor) -> bool {
        self.stt == stt.id && self.tts == tts.id
    }
}

/// Audio-processing constraints the platform can apply to a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Runtime query for platform audio support
pub trait AudioPlatform: Send + Sync {
    fn supported_constraints(&self) -> SupportedConstraints;
}

/// A platform with a fixed, known set of constraints
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPlatform(pub SupportedConstraints);

impl AudioPlatform for StaticPlatform {
    fn supported_constraints(&self) -> SupportedConstraints {
        self.0
    }
}

/// Provider id -> audio-access method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityTable {
    entries: HashMap<String, AudioAccess>,
}

impl CapabilityTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Known providers
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert("web-speech", AudioAccess::ExclusiveDeviceAccess);
        for id in ["deepgram", "assemblyai", "whisper", "openai-realtime", "gladia", "speechmatics"] {
            table.insert(id, AudioAccess::ExternallyManagedStream);
        }
        for id in ["web-speech-synthesis", "elevenlabs", "openai-tts", "cartesia"] {
            table.insert(id, AudioAccess::None);
        }
        table
    }

    pub fn insert(&mut self, id: impl Into<String>, access: AudioAccess) {
        self.entries.insert(id.into(), access);
    }

    pub fn lookup(&self, id: &str) -> Option<AudioAccess> {
        self.entries.get(id).copied()
    }

    /// Declared access wins over the table
    pub fn resolve(&self, provider: &ProviderDescriptor) -> Option<AudioAccess> {
        provider.audio_access.or_else(|| self.lookup(&provider.id))
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Outcome of [`TurnTakingPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTakingDecision {
    pub pause: bool,
    pub reason: &'static str,
}

impl TurnTakingDecision {
    fn pause(reason: &'static str) -> Self {
        Self { pause: true, reason }
    }

    fn keep(reason: &'static str) -> Self {
        Self {
            pause: false,
            reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnTakingPolicy {
    setting: PauseSetting,
    strategy: AutoStrategy,
    combinations: Vec<ProviderPair>,
    capabilities: CapabilityTable,
}

impl TurnTakingPolicy {
    pub fn new(setting: PauseSetting, strategy: AutoStrategy) -> Self {
        Self {
            setting,
            strategy,
            combinations: default_pause_combinations(),
            capabilities: CapabilityTable::builtin(),
        }
    }

    /// Configured overrides are merged over the builtin capability table
    pub fn from_config(config: &TurnTakingConfig) -> Self {
        let mut capabilities = CapabilityTable::builtin();
        for (id, access) in &config.capabilities {
            capabilities.insert(id.clone(), *access);
        }
        Self {
            setting: config.pause_capture_on_playback,
            strategy: config.auto_strategy,
            combinations: config.always_pause_combinations.clone(),
            capabilities,
        }
    }

    pub fn with_combinations(mut self, combinations: Vec<ProviderPair>) -> Self {
        self.combinations = combinations;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn setting(&self) -> PauseSetting {
        self.setting
    }

    pub fn strategy(&self) -> AutoStrategy {
        self.strategy
    }

    pub fn should_pause(
        &self,
        stt: &ProviderDescriptor,
        tts: &ProviderDescriptor,
        platform: Option<&dyn AudioPlatform>,
    ) -> bool {
        self.decide(stt, tts, platform).pause
    }

    pub fn decide(
        &self,
        stt: &ProviderDescriptor,
        tts: &ProviderDescriptor,
        platform: Option<&dyn AudioPlatform>,
    ) -> TurnTakingDecision {
        match self.setting {
            PauseSetting::Always => return TurnTakingDecision::pause("configured to always pause"),
            PauseSetting::Never => return TurnTakingDecision::keep("configured to never pause"),
            PauseSetting::Auto => {}
        }

        match self.strategy {
            AutoStrategy::Conservative => match self.capabilities.resolve(stt) {
                Some(AudioAccess::ExternallyManagedStream) => {
                    TurnTakingDecision::keep("stt uses an echo-cancellable stream")
                }
                Some(_) => TurnTakingDecision::pause("stt cannot share an echo-cancelled stream"),
                None => TurnTakingDecision::pause("unknown stt provider"),
            },
            AutoStrategy::Aggressive => {
                if self.combinations.iter().any(|pair| pair.matches(stt, tts)) {
                    TurnTakingDecision::pause("provider pair is listed as must-pause")
                } else {
                    TurnTakingDecision::keep("provider pair is not listed")
                }
            }
            AutoStrategy::Detect => {
                let echo_cancellation = platform
                    .map(|p| p.supported_constraints().echo_cancellation)
                    .unwrap_or(false);
                let stt_can_use = matches!(
                    self.capabilities.resolve(stt),
                    Some(AudioAccess::ExternallyManagedStream)
                );
                match (echo_cancellation, stt_can_use) {
                    (true, true) => TurnTakingDecision::keep("platform echo cancellation available"),
                    (false, _) => TurnTakingDecision::pause("platform lacks echo cancellation"),
                    (true, false) => {
                        TurnTakingDecision::pause("stt cannot use platform echo cancellation")
                    }
                }
            }
        }
    }
}

impl Default for TurnTakingPolicy {
    fn default() -> Self {
        Self::new(PauseSetting::Auto, AutoStrategy::Conservative)
    }
}

pub fn default_pause_combinations() -> Vec<ProviderPair> {
    vec![ProviderPair::new("web-speech", "web-speech-synthesis")]
}
