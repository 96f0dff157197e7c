use std::sync::Arc;

use tracing::debug;

use super::{CoordinatorInner, PipelineCoordinator, Providers};
use crate::config::{AgentConfig, PipelineMode};
use crate::error::{AgentError, Result};
use crate::events::EventBus;
use crate::providers::{LlmProvider, SttProvider, TtsProvider};
use crate::turn_taking::{AudioPlatform, TurnTakingPolicy};

/// Assembles a [`PipelineCoordinator`] from a config and its collaborators
pub struct CoordinatorBuilder {
    config: AgentConfig,
    stt: Option<Arc<dyn SttProvider>>,
    llm: Option<Arc<dyn LlmProvider>>,
    tts: Option<Arc<dyn TtsProvider>>,
    integrated: bool,
    platform: Option<Arc<dyn AudioPlatform>>,
    policy: Option<TurnTakingPolicy>,
    bus: Option<EventBus>,
}

impl CoordinatorBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            stt: None,
            llm: None,
            tts: None,
            integrated: false,
            platform: None,
            policy: None,
            bus: None,
        }
    }

    pub fn stt(mut self, stt: Arc<dyn SttProvider>) -> Self {
        self.stt = Some(stt);
        self.integrated = false;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self.integrated = false;
        self
    }

    pub fn tts(mut self, tts: Arc<dyn TtsProvider>) -> Self {
        self.tts = Some(tts);
        self.integrated = false;
        self
    }

    /// Use one collaborator for all three roles
    pub fn integrated<P>(mut self, provider: Arc<P>) -> Self
    where
        P: SttProvider + LlmProvider + TtsProvider + 'static,
    {
        self.stt = Some(provider.clone());
        self.llm = Some(provider.clone());
        self.tts = Some(provider);
        self.integrated = true;
        self
    }

    /// Platform queried by the `detect` turn-taking strategy
    pub fn audio_platform(mut self, platform: Arc<dyn AudioPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Replace the policy derived from `config.turn_taking`
    pub fn policy(mut self, policy: TurnTakingPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Publish on an existing bus instead of a fresh one
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<PipelineCoordinator> {
        self.config.validate()?;

        match (self.config.mode, self.integrated) {
            (PipelineMode::Integrated, false) => {
                return Err(AgentError::Configuration(
                    "integrated mode requires a provider set with `integrated()`".into(),
                ))
            }
            (PipelineMode::Pipeline, true) => {
                return Err(AgentError::Configuration(
                    "an integrated provider requires `mode: integrated`".into(),
                ))
            }
            _ => {}
        }

        let stt = self
            .stt
            .ok_or_else(|| AgentError::Configuration("missing stt provider".into()))?;
        let llm = self
            .llm
            .ok_or_else(|| AgentError::Configuration("missing llm provider".into()))?;
        let tts = self
            .tts
            .ok_or_else(|| AgentError::Configuration("missing tts provider".into()))?;

        let policy = self
            .policy
            .unwrap_or_else(|| TurnTakingPolicy::from_config(&self.config.turn_taking));

        debug!(
            mode = ?self.config.mode,
            stt = %stt.descriptor().id,
            llm = %llm.descriptor().id,
            tts = %tts.descriptor().id,
            "building pipeline coordinator"
        );

        let providers = Providers {
            stt,
            llm,
            tts,
            integrated: self.integrated,
        };

        Ok(PipelineCoordinator {
            inner: Arc::new(CoordinatorInner::new(
                self.config,
                providers,
                policy,
                self.platform,
                self.bus.unwrap_or_default(),
            )),
        })
    }
}
