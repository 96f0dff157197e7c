//! Pipeline coordinator
//!
//! Owns the four state machines and the event bus, drives the STT, LLM and
//! TTS collaborators through one conversation turn at a time, and turns
//! collaborator failures into `*.error` events followed by a bounded
//! recovery of audio capture.
//!
//! Turn shape: awaiting speech, transcribing, generating, synthesizing, then
//! back to awaiting speech. Any step may divert to error.

mod builder;
mod turn;

pub use builder::CoordinatorBuilder;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, ProviderError, Result};
use crate::events::{EventBus, EventPayload};
use crate::providers::{
    AudioChunk, ChatMessage, InputOwnership, LlmProvider, SttProvider, TranscriptionResult,
    TtsProvider,
};
use crate::state::{
    AgentState, AgentStateMachine, CaptureState, CaptureStateMachine, PlaybackState,
    PlaybackStateMachine, ProcessingState, ProcessingStateMachine,
};
use crate::subscription::Subscription;
use crate::turn_taking::{AudioPlatform, TurnTakingPolicy};

struct Providers {
    stt: Arc<dyn SttProvider>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    /// All three roles are the same collaborator
    integrated: bool,
}

struct CoordinatorInner {
    config: AgentConfig,
    providers: Providers,
    policy: TurnTakingPolicy,
    platform: Option<Arc<dyn AudioPlatform>>,
    bus: EventBus,

    capture: CaptureStateMachine,
    playback: PlaybackStateMachine,
    processing: ProcessingStateMachine,
    agent: AgentStateMachine,

    initialized: AtomicBool,
    disposed: AtomicBool,
    history: Mutex<Vec<ChatMessage>>,
    /// Bytes of synthesized audio received in the current turn
    buffered_audio: AtomicUsize,
    tts_connected: AtomicBool,
    /// Held for the length of a turn
    turn_lock: tokio::sync::Mutex<()>,
    /// Bumped by `reset` and `dispose`; a turn from an older epoch stops
    /// at its next await
    epoch: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    agent_events: Mutex<Option<Subscription>>,
}

impl CoordinatorInner {
    fn new(
        config: AgentConfig,
        providers: Providers,
        policy: TurnTakingPolicy,
        platform: Option<Arc<dyn AudioPlatform>>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            providers,
            policy,
            platform,
            bus,
            capture: CaptureStateMachine::new(),
            playback: PlaybackStateMachine::new(),
            processing: ProcessingStateMachine::new(),
            agent: AgentStateMachine::new(),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            buffered_audio: AtomicUsize::new(0),
            tts_connected: AtomicBool::new(false),
            turn_lock: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            agent_events: Mutex::new(None),
        }
    }
}

/// Drives one voice conversation over pluggable STT, LLM and TTS providers.
///
/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct PipelineCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PipelineCoordinator {
    pub fn builder(config: AgentConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    fn from_weak(weak: &Weak<CoordinatorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Bus on which every coordinator event is published
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn agent_state(&self) -> AgentState {
        self.inner.agent.state()
    }

    pub fn capture_state(&self) -> CaptureState {
        self.inner.capture.state()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.inner.playback.state()
    }

    pub fn processing_state(&self) -> ProcessingState {
        self.inner.processing.state()
    }

    /// Subscribe to agent state changes directly, bypassing the bus
    pub fn on_agent_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(AgentState, AgentState) + Send + Sync + 'static,
    {
        self.inner.agent.on_state_change(listener)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Conversation context kept for generation, system prompt excluded
    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Initialize every provider and wire the state machines.
    ///
    /// Provider initialization runs concurrently. A failure is fatal: the
    /// agent is forced to `error`, `agent.error` is published and the error is
    /// returned without retrying.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            debug!("coordinator already initialized");
            return Ok(());
        }
        let inner = &self.inner;

        self.forward_agent_events();

        if let Err(err) = self.initialize_providers().await {
            error!(error = %err, "provider initialization failed");
            inner.agent.set_error();
            inner.bus.emit(EventPayload::AgentError {
                error: err.to_string(),
                recoverable: false,
            });
            return Err(err);
        }

        inner
            .agent
            .initialize(&inner.capture, &inner.playback, &inner.processing);
        self.wire_providers();

        inner.disposed.store(false, Ordering::SeqCst);
        inner.initialized.store(true, Ordering::SeqCst);

        info!(
            stt = %inner.providers.stt.descriptor().id,
            llm = %inner.providers.llm.descriptor().id,
            tts = %inner.providers.tts.descriptor().id,
            integrated = inner.providers.integrated,
            "pipeline coordinator ready"
        );
        inner.bus.emit(EventPayload::AgentReady);
        Ok(())
    }

    async fn initialize_providers(&self) -> Result<()> {
        let providers = &self.inner.providers;
        if providers.integrated {
            return providers
                .stt
                .initialize()
                .await
                .map_err(|source| init_error(providers.stt.descriptor().id, source));
        }

        let (stt, llm, tts) = tokio::join!(
            providers.stt.initialize(),
            providers.llm.initialize(),
            providers.tts.initialize(),
        );
        stt.map_err(|source| init_error(providers.stt.descriptor().id, source))?;
        llm.map_err(|source| init_error(providers.llm.descriptor().id, source))?;
        tts.map_err(|source| init_error(providers.tts.descriptor().id, source))?;
        Ok(())
    }

    fn forward_agent_events(&self) {
        let bus = self.inner.bus.clone();
        let subscription = self.inner.agent.on_state_change(move |state, previous| {
            bus.emit(EventPayload::AgentStateChange {
                state,
                previous_state: previous,
            });
        });
        if let Some(old) = self.inner.agent_events.lock().replace(subscription) {
            old.unsubscribe();
        }
    }

    /// Register provider callbacks and start the transcription intake task
    fn wire_providers(&self) {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);

        // Answerability is judged when the provider delivers, not when the
        // intake gets to the result
        let (tx, mut rx) = mpsc::unbounded_channel::<(TranscriptionResult, bool)>();
        let arrival_weak = weak.clone();
        inner
            .providers
            .stt
            .on_transcription(Arc::new(move |result: TranscriptionResult| {
                let answerable = PipelineCoordinator::from_weak(&arrival_weak)
                    .is_some_and(|coordinator| coordinator.accepts_turn());
                if tx.send((result, answerable)).is_err() {
                    debug!("transcription intake closed, dropping result");
                }
            }));

        let intake_weak = weak.clone();
        let intake = tokio::spawn(async move {
            while let Some((result, answerable)) = rx.recv().await {
                let Some(coordinator) = PipelineCoordinator::from_weak(&intake_weak) else {
                    break;
                };
                if let Err(err) = coordinator.process_transcription(result, answerable).await {
                    warn!(error = %err, "transcription dropped");
                }
            }
            debug!("transcription intake stopped");
        });

        let previous = std::mem::replace(&mut *inner.tasks.lock(), vec![intake]);
        for task in previous {
            task.abort();
        }

        let audio_weak = weak.clone();
        inner.providers.tts.on_audio(Arc::new(move |chunk: AudioChunk| {
            if let Some(coordinator) = PipelineCoordinator::from_weak(&audio_weak) {
                coordinator.accept_audio(chunk);
            }
        }));

        let bus = inner.bus.clone();
        inner
            .providers
            .tts
            .on_metadata(Arc::new(move |metadata: serde_json::Value| {
                bus.emit(EventPayload::TtsMetadata { metadata });
            }));
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(AgentError::NotInitialized)
        }
    }

    /// Open the STT input and move capture to `active`.
    ///
    /// Valid only while the agent is `ready` or `idle`; otherwise nothing is
    /// touched and `InvalidState` is returned.
    pub async fn start_listening(&self) -> Result<()> {
        self.ensure_initialized()?;
        let inner = &self.inner;

        let state = inner.agent.state();
        if !matches!(state, AgentState::Ready | AgentState::Idle) {
            return Err(AgentError::InvalidState {
                operation: "start listening",
                state,
            });
        }

        inner.capture.set_starting()?;

        if let Err(err) = self.open_input_bounded().await {
            error!(error = %err, "failed to start capture");
            if let Err(transition) = inner.capture.set_error() {
                warn!(error = %transition, "capture could not enter error");
            }
            inner.agent.set_error();
            inner.bus.emit(EventPayload::AgentError {
                error: err.to_string(),
                recoverable: true,
            });
            return Err(err);
        }

        inner.capture.set_active()?;
        info!("listening");
        inner.bus.emit(EventPayload::AudioCaptureStart);
        Ok(())
    }

    /// Close the STT input. A no-op unless capture is active or paused.
    pub async fn stop_listening(&self) -> Result<()> {
        self.ensure_initialized()?;
        let inner = &self.inner;

        if !inner.capture.is_capturing() {
            debug!(capture = %inner.capture.state(), "stop listening ignored");
            return Ok(());
        }

        if inner.capture.is(CaptureState::Active) {
            if let Err(err) = self.close_input().await {
                warn!(error = %err, "stt input did not close cleanly");
            }
        }
        inner.capture.set_stopped()?;
        info!("stopped listening");
        inner.bus.emit(EventPayload::AudioCaptureStop);
        Ok(())
    }

    /// Forward captured audio to a streaming STT.
    ///
    /// Returns whether the chunk was sent; audio is dropped unless capture is
    /// `active` and the provider streams.
    pub async fn push_audio(&self, chunk: &[u8]) -> Result<bool> {
        self.ensure_initialized()?;
        let stt = &self.inner.providers.stt;

        if !self.inner.capture.is(CaptureState::Active) || !stt.capabilities().streaming {
            return Ok(false);
        }

        stt.send_audio(chunk)
            .await
            .map_err(|source| AgentError::ProviderConnection {
                provider: stt.descriptor().id,
                source,
            })?;
        Ok(true)
    }

    /// Transcribe a complete clip with a batch STT and feed the result in
    pub async fn transcribe_clip(&self, audio: &[u8]) -> Result<TranscriptionResult> {
        self.ensure_initialized()?;
        let stt = &self.inner.providers.stt;

        let result = stt
            .transcribe(audio)
            .await
            .map_err(|source| AgentError::ProviderConnection {
                provider: stt.descriptor().id,
                source,
            })?;
        self.handle_transcription(result.clone()).await?;
        Ok(result)
    }

    /// Publish a transcription result and, for a non-empty final result
    /// while the agent is `listening` or `error`, run one turn on it.
    ///
    /// A final that arrives while another turn is in progress is published
    /// but never answered, including one the provider delivered mid-turn and
    /// the intake only dequeues after that turn has finished.
    pub async fn handle_transcription(&self, result: TranscriptionResult) -> Result<()> {
        let answerable = self.accepts_turn();
        self.process_transcription(result, answerable).await
    }

    /// Whether a final delivered right now could start a turn
    fn accepts_turn(&self) -> bool {
        let inner = &self.inner;
        matches!(
            inner.agent.state(),
            AgentState::Listening | AgentState::Error
        ) && inner.turn_lock.try_lock().is_ok()
    }

    async fn process_transcription(
        &self,
        result: TranscriptionResult,
        answerable: bool,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let inner = &self.inner;

        let TranscriptionResult {
            text,
            is_final,
            confidence,
            ..
        } = result;

        if !is_final {
            inner
                .bus
                .emit(EventPayload::TranscriptionInterim { text, confidence });
            return Ok(());
        }

        inner.bus.emit(EventPayload::TranscriptionFinal {
            text: text.clone(),
            confidence,
        });

        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if !answerable {
            debug!("final transcription arrived mid-turn, not answered");
            return Ok(());
        }

        let Ok(_turn) = inner.turn_lock.try_lock() else {
            debug!("turn in progress, final transcription not answered");
            return Ok(());
        };

        let state = inner.agent.state();
        if !matches!(state, AgentState::Listening | AgentState::Error) {
            debug!(agent = %state, "final transcription ignored");
            return Ok(());
        }

        self.run_turn(text.to_string()).await;
        Ok(())
    }

    /// Force every state machine back to `idle`, closing the STT input if
    /// open. A turn in flight is abandoned.
    pub async fn reset(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if inner.capture.is(CaptureState::Active) {
            if let Err(err) = self.close_input().await {
                warn!(error = %err, "stt input did not close cleanly");
            }
        }
        inner.capture.reset();
        inner.playback.reset();
        inner.processing.reset();
        inner.agent.reset();
        inner.buffered_audio.store(0, Ordering::SeqCst);
        info!("coordinator reset");
    }

    /// Tear everything down, abandoning any turn in flight. Calling this
    /// again does nothing.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("coordinator already disposed");
            return;
        }
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        if inner.capture.is_capturing() {
            if let Err(err) = self.stop_listening_for_dispose().await {
                warn!(error = %err, "failed to stop listening during dispose");
            }
        }
        if inner.playback.is_audible() {
            if let Err(err) = inner.playback.set_stopped() {
                warn!(error = %err, "failed to stop playback during dispose");
            }
        }
        self.disconnect_tts().await;

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        self.dispose_providers().await;

        if let Some(subscription) = inner.agent_events.lock().take() {
            subscription.unsubscribe();
        }
        inner.bus.remove_all_listeners(None);

        inner.capture.reset();
        inner.playback.reset();
        inner.processing.reset();
        inner.agent.reset();
        inner.capture.dispose();
        inner.playback.dispose();
        inner.processing.dispose();
        inner.agent.dispose();

        inner.history.lock().clear();
        inner.initialized.store(false, Ordering::SeqCst);
        info!("pipeline coordinator disposed");
    }

    async fn stop_listening_for_dispose(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.capture.is(CaptureState::Active) {
            if let Err(err) = self.close_input().await {
                warn!(error = %err, "stt input did not close cleanly");
            }
        }
        inner.capture.set_stopped()?;
        inner.bus.emit(EventPayload::AudioCaptureStop);
        Ok(())
    }

    async fn dispose_providers(&self) {
        let providers = &self.inner.providers;
        if providers.integrated {
            if let Err(err) = providers.stt.dispose().await {
                warn!(error = %err, "provider dispose failed");
            }
            return;
        }

        let (stt, llm, tts) = tokio::join!(
            providers.stt.dispose(),
            providers.llm.dispose(),
            providers.tts.dispose(),
        );
        for (role, result) in [("stt", stt), ("llm", llm), ("tts", tts)] {
            if let Err(err) = result {
                warn!(role, error = %err, "provider dispose failed");
            }
        }
    }

    async fn disconnect_tts(&self) {
        if self.inner.tts_connected.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.inner.providers.tts.disconnect().await {
                warn!(error = %err, "tts disconnect failed");
            }
        }
    }

    /// Synthesized audio from either the batch result or `on_audio`
    fn accept_audio(&self, chunk: AudioChunk) {
        let inner = &self.inner;
        inner.buffered_audio.fetch_add(chunk.len(), Ordering::SeqCst);
        inner.bus.emit(EventPayload::TtsAudio { chunk });
        self.promote_playback(false);
    }

    /// Move playback from `buffering` to `playing` once enough audio is
    /// buffered, or on `flush` once any audio has arrived.
    fn promote_playback(&self, flush: bool) {
        let inner = &self.inner;
        if !inner.playback.is(PlaybackState::Buffering) {
            return;
        }
        let buffered = inner.buffered_audio.load(Ordering::SeqCst);
        let threshold = inner.config.audio.output.min_buffer_bytes;
        if buffered >= threshold || (flush && buffered > 0) {
            debug!(buffered, threshold, "playback started");
            if let Err(err) = inner.playback.set_playing() {
                warn!(error = %err, "failed to start playback");
            }
        }
    }

    async fn open_input(&self) -> std::result::Result<(), ProviderError> {
        let stt = &self.inner.providers.stt;
        let capabilities = stt.capabilities();
        match capabilities.input {
            InputOwnership::SelfManaged => stt.start_listening().await,
            InputOwnership::ExternallyFed if capabilities.streaming => stt.connect().await,
            InputOwnership::ExternallyFed => Ok(()),
        }
    }

    async fn close_input(&self) -> std::result::Result<(), ProviderError> {
        let stt = &self.inner.providers.stt;
        let capabilities = stt.capabilities();
        match capabilities.input {
            InputOwnership::SelfManaged => stt.stop_listening().await,
            InputOwnership::ExternallyFed if capabilities.streaming => stt.disconnect().await,
            InputOwnership::ExternallyFed => Ok(()),
        }
    }

    /// One connection attempt bounded by `connect_timeout_ms`
    async fn open_input_bounded(&self) -> Result<()> {
        let timeout_ms = self.inner.config.connect_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.open_input()).await {
            Ok(result) => result.map_err(|source| AgentError::ProviderConnection {
                provider: self.inner.providers.stt.descriptor().id,
                source,
            }),
            Err(_) => Err(AgentError::Timeout {
                operation: "stt connect",
                timeout_ms,
            }),
        }
    }

    /// Reopen the STT input, retrying with linear backoff
    async fn reopen_input(&self) -> Result<()> {
        let reconnect = &self.inner.config.reconnect;
        let attempts = reconnect.attempts();
        let mut attempt = 1;
        loop {
            match self.open_input_bounded().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "stt input reconnected");
                    }
                    return Ok(());
                }
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    let backoff = reconnect.backoff_ms * u64::from(attempt);
                    warn!(attempt, backoff_ms = backoff, error = %err, "stt reconnect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("agent", &self.agent_state())
            .field("capture", &self.capture_state())
            .field("playback", &self.playback_state())
            .field("processing", &self.processing_state())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn init_error(provider: String, source: ProviderError) -> AgentError {
    AgentError::ProviderInitialization { provider, source }
}
