//! End-to-end coordinator scenarios over the loopback providers

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

use voice_agent::config::{AgentConfig, PipelineMode};
use voice_agent::events::{Event, EventFilter, EventPayload, EventType};
use voice_agent::providers::loopback::{
    CallLog, LoopbackAgent, LoopbackLlm, LoopbackStt, LoopbackTts,
};
use voice_agent::providers::{
    ChatMessage, InputOwnership, ProviderDescriptor, TranscriptionResult,
};
use voice_agent::state::{AgentState, CaptureState, PlaybackState, ProcessingState};
use voice_agent::turn_taking::{
    AudioPlatform, AutoStrategy, PauseSetting, StaticPlatform, SupportedConstraints,
};
use voice_agent::{AgentError, PipelineCoordinator};

struct Harness {
    coordinator: PipelineCoordinator,
    log: CallLog,
    stt: Arc<LoopbackStt>,
    llm: Arc<LoopbackLlm>,
    tts: Arc<LoopbackTts>,
    events: Arc<Mutex<Vec<EventPayload>>>,
}

fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.logging.enabled = false;
    config.reconnect.backoff_ms = 1;
    config
}

/// `stt_id` selects a builtin capability entry, e.g. `web-speech` for an
/// exclusive-device STT
fn harness(config: AgentConfig, stt_id: Option<&str>, incremental: bool) -> Harness {
    let log = CallLog::new();
    let mut stt = LoopbackStt::new(log.clone());
    if let Some(id) = stt_id {
        stt = stt.with_descriptor(ProviderDescriptor::new(id));
    }
    assemble(config, log, stt, incremental, None)
}

fn assemble(
    config: AgentConfig,
    log: CallLog,
    stt: LoopbackStt,
    incremental: bool,
    platform: Option<Arc<dyn AudioPlatform>>,
) -> Harness {
    let stt = Arc::new(stt);
    let llm = Arc::new(LoopbackLlm::new(log.clone()));
    let tts = Arc::new(if incremental {
        LoopbackTts::incremental(log.clone())
    } else {
        LoopbackTts::batch(log.clone())
    });

    let mut builder = PipelineCoordinator::builder(config)
        .stt(stt.clone())
        .llm(llm.clone())
        .tts(tts.clone());
    if let Some(platform) = platform {
        builder = builder.audio_platform(platform);
    }
    let coordinator = builder.build().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _ = coordinator
        .events()
        .on(EventFilter::Any, move |event: &Event| {
            sink.lock().push(event.payload.clone())
        });

    Harness {
        coordinator,
        log,
        stt,
        llm,
        tts,
        events,
    }
}

/// Poll until `condition` holds, letting spawned work run in between
async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

impl Harness {
    async fn listening(config: AgentConfig, stt_id: Option<&str>, incremental: bool) -> Self {
        harness(config, stt_id, incremental).listen().await
    }

    async fn listen(self) -> Self {
        assert_ok!(self.coordinator.initialize().await);
        assert_ok!(self.coordinator.start_listening().await);
        self.clear_events();
        self
    }

    async fn say(&self, text: &str) {
        assert_ok!(
            self.coordinator
                .handle_transcription(TranscriptionResult::final_text(text))
                .await
        );
    }

    fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }

    fn count(&self, event_type: EventType) -> usize {
        self.types().into_iter().filter(|t| *t == event_type).count()
    }

    fn agent_states(&self) -> Vec<AgentState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EventPayload::AgentStateChange { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn accumulated(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EventPayload::LlmChunk { accumulated, .. } => Some(accumulated.clone()),
                _ => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn test_happy_path() {
    let h = harness(test_config(), None, false);

    assert_ok!(h.coordinator.initialize().await);
    assert_eq!(h.coordinator.agent_state(), AgentState::Ready);
    assert_eq!(h.types(), vec![EventType::AgentStateChange, EventType::AgentReady]);

    assert_ok!(h.coordinator.start_listening().await);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Active);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
    assert_eq!(h.log.count("stt.connect"), 1);

    h.say("hello").await;

    assert_eq!(
        h.agent_states(),
        vec![
            AgentState::Ready,
            AgentState::Listening,
            AgentState::Thinking,
            AgentState::Speaking,
            AgentState::Listening,
        ]
    );
    assert_eq!(h.coordinator.processing_state(), ProcessingState::Idle);
    assert_eq!(h.coordinator.playback_state(), PlaybackState::Idle);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Active);

    let types = h.types();
    let position = |t: EventType| types.iter().position(|x| *x == t).unwrap();
    assert!(position(EventType::TranscriptionFinal) < position(EventType::LlmStart));
    assert!(position(EventType::LlmStart) < position(EventType::LlmChunk));
    assert!(position(EventType::LlmChunk) < position(EventType::LlmComplete));
    assert!(position(EventType::LlmComplete) < position(EventType::TtsStart));
    assert!(position(EventType::TtsStart) < position(EventType::TtsAudio));
    assert!(position(EventType::TtsAudio) < position(EventType::TtsComplete));

    assert_eq!(
        h.coordinator.history(),
        vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("You said: hello")
        ]
    );
}

#[tokio::test]
async fn test_accumulated_text_grows_per_chunk() {
    let h = Harness::listening(test_config(), None, false).await;
    h.llm.push_reply(["Hel", "lo "]);

    h.say("greet me").await;

    assert_eq!(h.accumulated(), vec!["Hel".to_string(), "Hello ".to_string()]);
    let complete = h.events.lock().iter().find_map(|e| match e {
        EventPayload::LlmComplete { text } => Some(text.clone()),
        _ => None,
    });
    assert_eq!(complete.as_deref(), Some("Hello "));
}

#[tokio::test]
async fn test_mid_turn_tts_failure() {
    let h = Harness::listening(test_config(), Some("web-speech"), false).await;
    h.tts.fail_synthesis(true);

    h.say("hello").await;

    assert_eq!(h.coordinator.playback_state(), PlaybackState::Error);
    assert_eq!(h.coordinator.agent_state(), AgentState::Error);
    assert_eq!(h.coordinator.processing_state(), ProcessingState::Idle);
    // Capture was paused for playback and came back
    assert_eq!(h.coordinator.capture_state(), CaptureState::Active);
    assert_eq!(h.log.count("stt.disconnect"), 1);
    assert_eq!(h.log.count("stt.connect"), 2);

    let recoverable = h.events.lock().iter().find_map(|e| match e {
        EventPayload::TtsError { recoverable, .. } => Some(*recoverable),
        _ => None,
    });
    assert_eq!(recoverable, Some(true));
    assert_eq!(h.count(EventType::TtsComplete), 0);

    // The agent holds error until something changes it
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.coordinator.agent_state(), AgentState::Error);

    // The next final transcription is still answered
    h.tts.fail_synthesis(false);
    h.say("again").await;
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
    assert_eq!(h.coordinator.playback_state(), PlaybackState::Idle);
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let h = Harness::listening(test_config(), None, false).await;

    let err = h.coordinator.start_listening().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::InvalidState {
            state: AgentState::Listening,
            ..
        }
    ));
    assert_eq!(h.coordinator.capture_state(), CaptureState::Active);
    assert_eq!(h.log.count("stt.connect"), 1);
    assert!(h.events.lock().is_empty());
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let h = Harness::listening(test_config(), None, false).await;

    h.coordinator.dispose().await;
    let calls = h.log.calls();
    assert_eq!(h.log.count("stt.dispose"), 1);
    assert_eq!(h.log.count("llm.dispose"), 1);
    assert_eq!(h.log.count("tts.dispose"), 1);
    assert_eq!(h.log.count("stt.disconnect"), 1);
    assert!(!h.coordinator.is_initialized());
    assert_eq!(h.coordinator.agent_state(), AgentState::Idle);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Idle);
    assert_eq!(h.coordinator.events().listener_count(EventFilter::Any), 0);

    h.coordinator.dispose().await;
    assert_eq!(h.log.calls(), calls);
}

#[tokio::test]
async fn test_initialization_failure_is_fatal() {
    let h = harness(test_config(), None, false);
    h.llm.fail_initialize();

    let err = h.coordinator.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::ProviderInitialization { ref provider, .. } if provider == "loopback-llm"
    ));
    assert_eq!(h.coordinator.agent_state(), AgentState::Error);
    assert!(!h.coordinator.is_initialized());

    let recoverable = h.events.lock().iter().find_map(|e| match e {
        EventPayload::AgentError { recoverable, .. } => Some(*recoverable),
        _ => None,
    });
    assert_eq!(recoverable, Some(false));
    assert_eq!(h.count(EventType::AgentReady), 0);

    assert!(matches!(
        h.coordinator.start_listening().await,
        Err(AgentError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_incremental_tts_streams_during_generation() {
    let mut config = test_config();
    config.audio.output.min_buffer_bytes = 4;
    let h = Harness::listening(config, None, true).await;
    h.llm.push_reply(["Hello ", "world"]);

    h.say("hi").await;

    let calls: Vec<String> = h
        .log
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("tts."))
        .collect();
    assert_eq!(
        calls,
        vec![
            "tts.initialize",
            "tts.connect",
            "tts.send_text",
            "tts.send_text",
            "tts.finalize",
            "tts.disconnect"
        ]
    );
    assert_eq!(h.count(EventType::TtsAudio), 2);
    let metadata: Vec<serde_json::Value> = h
        .events
        .lock()
        .iter()
        .filter_map(|e| match e {
            EventPayload::TtsMetadata { metadata } => Some(metadata.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        metadata,
        vec![serde_json::json!({"chars": 6}), serde_json::json!({"chars": 5})]
    );
    assert!(h.agent_states().contains(&AgentState::Speaking));
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
}

#[tokio::test]
async fn test_conservative_policy_pauses_exclusive_stt() {
    let h = Harness::listening(test_config(), Some("web-speech"), false).await;

    h.say("hello").await;

    assert_eq!(h.log.count("stt.disconnect"), 1);
    assert_eq!(h.log.count("stt.connect"), 2);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Active);
    // Playback stops while capture is still paused
    assert_eq!(
        h.agent_states(),
        vec![
            AgentState::Thinking,
            AgentState::Speaking,
            AgentState::Ready,
            AgentState::Listening,
        ]
    );
}

#[tokio::test]
async fn test_self_managed_input_is_started_and_stopped() {
    let log = CallLog::new();
    let stt = LoopbackStt::new(log.clone())
        .with_descriptor(ProviderDescriptor::new("web-speech"))
        .with_input(InputOwnership::SelfManaged);
    let h = assemble(test_config(), log, stt, false, None).listen().await;
    assert_eq!(h.log.count("stt.start_listening"), 1);

    h.say("hello").await;

    assert_eq!(h.log.count("stt.stop_listening"), 1);
    assert_eq!(h.log.count("stt.start_listening"), 2);
    assert_eq!(h.log.count("stt.connect"), 0);
    assert_eq!(h.log.count("stt.disconnect"), 0);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Active);

    assert_ok!(h.coordinator.stop_listening().await);
    assert_eq!(h.log.count("stt.stop_listening"), 2);
    assert_eq!(h.log.count("stt.disconnect"), 0);
}

#[tokio::test]
async fn test_detect_keeps_capture_open_with_platform_echo_cancellation() {
    let mut config = test_config();
    config.turn_taking.auto_strategy = AutoStrategy::Detect;
    let log = CallLog::new();
    let stt = LoopbackStt::new(log.clone()).with_descriptor(ProviderDescriptor::new("deepgram"));
    let platform = StaticPlatform(SupportedConstraints {
        echo_cancellation: true,
        ..Default::default()
    });
    let h = assemble(config, log, stt, false, Some(Arc::new(platform)))
        .listen()
        .await;

    h.say("hello").await;

    assert_eq!(h.log.count("stt.disconnect"), 0);
    assert_eq!(h.log.count("stt.connect"), 1);
}

#[tokio::test]
async fn test_detect_pauses_without_platform_support() {
    let mut config = test_config();
    config.turn_taking.auto_strategy = AutoStrategy::Detect;
    let h = Harness::listening(config.clone(), Some("deepgram"), false).await;

    h.say("hello").await;
    assert_eq!(h.log.count("stt.disconnect"), 1);

    let log = CallLog::new();
    let stt = LoopbackStt::new(log.clone()).with_descriptor(ProviderDescriptor::new("deepgram"));
    let platform = StaticPlatform(SupportedConstraints::default());
    let h = assemble(config, log, stt, false, Some(Arc::new(platform)))
        .listen()
        .await;

    h.say("hello").await;
    assert_eq!(h.log.count("stt.disconnect"), 1);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
}

#[tokio::test]
async fn test_external_stream_stays_open_during_playback() {
    let h = Harness::listening(test_config(), Some("deepgram"), false).await;

    h.say("hello").await;

    assert_eq!(h.log.count("stt.disconnect"), 0);
    assert_eq!(h.log.count("stt.connect"), 1);
}

#[tokio::test]
async fn test_never_pause_overrides_exclusive_stt() {
    let mut config = test_config();
    config.turn_taking.pause_capture_on_playback = PauseSetting::Never;
    let h = Harness::listening(config, Some("web-speech"), false).await;

    h.say("hello").await;

    assert_eq!(h.log.count("stt.disconnect"), 0);
}

#[tokio::test]
async fn test_start_failure_escalates_and_reset_recovers() {
    let h = harness(test_config(), None, false);
    assert_ok!(h.coordinator.initialize().await);
    h.stt.fail_next_connects(1);

    let err = h.coordinator.start_listening().await.unwrap_err();
    assert!(matches!(err, AgentError::ProviderConnection { .. }));
    assert_eq!(h.coordinator.capture_state(), CaptureState::Error);
    assert_eq!(h.coordinator.agent_state(), AgentState::Error);
    assert!(h.events.lock().iter().any(|e| matches!(
        e,
        EventPayload::AgentError {
            recoverable: true,
            ..
        }
    )));

    // error is not a valid starting point
    assert_err!(h.coordinator.start_listening().await);

    h.coordinator.reset().await;
    assert_eq!(h.coordinator.agent_state(), AgentState::Idle);
    assert_ok!(h.coordinator.start_listening().await);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
}

#[tokio::test]
async fn test_failed_resume_leaves_capture_in_error() {
    let h = Harness::listening(test_config(), Some("web-speech"), false).await;
    h.stt.fail_next_connects(3);

    h.say("hello").await;

    assert_eq!(h.log.count("stt.connect"), 4);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Error);
    assert_eq!(h.coordinator.agent_state(), AgentState::Error);
    assert_eq!(h.count(EventType::TtsComplete), 1);
}

#[tokio::test]
async fn test_generation_failure() {
    let h = Harness::listening(test_config(), None, false).await;
    h.llm.push_reply(["partial ", "reply"]);
    h.llm.fail_after(1);

    h.say("hello").await;

    assert_eq!(h.coordinator.processing_state(), ProcessingState::Error);
    assert_eq!(h.coordinator.agent_state(), AgentState::Error);
    assert_eq!(h.count(EventType::LlmError), 1);
    assert_eq!(h.count(EventType::TtsStart), 0);
    assert!(h.coordinator.history().is_empty());

    h.say("hello again").await;
    assert_eq!(h.coordinator.processing_state(), ProcessingState::Idle);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
    assert_eq!(h.coordinator.history().len(), 2);
}

#[tokio::test]
async fn test_injected_transcription_runs_through_intake() {
    let h = Harness::listening(test_config(), None, false).await;

    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let _ = h
        .coordinator
        .events()
        .once(EventType::TtsComplete, move |_: &Event| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });

    assert!(h.stt.inject(TranscriptionResult::interim("hel")));
    assert!(h.stt.inject(TranscriptionResult::final_text("hello")));

    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("turn did not complete")
        .unwrap();

    assert_eq!(h.count(EventType::TranscriptionInterim), 1);
    assert_eq!(h.count(EventType::TranscriptionFinal), 1);
    assert_eq!(h.count(EventType::LlmComplete), 1);
}

#[tokio::test]
async fn test_dispose_abandons_turn_in_flight() {
    let h = Harness::listening(test_config(), None, false).await;
    let release = h.llm.hold_next_reply();

    let turn = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move {
            coordinator
                .handle_transcription(TranscriptionResult::final_text("hello"))
                .await
        }
    });
    wait_for(|| h.coordinator.processing_state() == ProcessingState::Processing).await;

    h.coordinator.dispose().await;
    let _ = release.send(());
    assert_ok!(turn.await.unwrap());

    assert_eq!(h.coordinator.agent_state(), AgentState::Idle);
    assert_eq!(h.coordinator.processing_state(), ProcessingState::Idle);
    assert_eq!(h.coordinator.playback_state(), PlaybackState::Idle);
    assert_eq!(h.log.count("tts.synthesize"), 0);
    assert!(h.coordinator.history().is_empty());

    assert_ok!(h.coordinator.initialize().await);
    assert_eq!(h.coordinator.agent_state(), AgentState::Ready);
    assert_ok!(h.coordinator.start_listening().await);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);

    h.say("again").await;
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
    assert_eq!(h.coordinator.history().len(), 2);
}

#[tokio::test]
async fn test_reset_abandons_turn_in_flight() {
    let h = Harness::listening(test_config(), None, false).await;
    let release = h.llm.hold_next_reply();

    let turn = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move {
            coordinator
                .handle_transcription(TranscriptionResult::final_text("hello"))
                .await
        }
    });
    wait_for(|| h.coordinator.processing_state() == ProcessingState::Processing).await;

    h.coordinator.reset().await;
    let _ = release.send(());
    assert_ok!(turn.await.unwrap());

    assert_eq!(h.coordinator.agent_state(), AgentState::Idle);
    assert_eq!(h.coordinator.processing_state(), ProcessingState::Idle);
    assert_eq!(h.count(EventType::LlmComplete), 0);
    assert_eq!(h.count(EventType::LlmError), 0);

    assert_ok!(h.coordinator.start_listening().await);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
}

#[tokio::test]
async fn test_final_delivered_mid_turn_is_not_answered() {
    let h = Harness::listening(test_config(), None, false).await;
    let release = h.llm.hold_next_reply();

    assert!(h.stt.inject(TranscriptionResult::final_text("first")));
    wait_for(|| h.coordinator.processing_state() == ProcessingState::Processing).await;

    assert!(h.stt.inject(TranscriptionResult::final_text("second")));
    let _ = release.send(());
    wait_for(|| h.count(EventType::TranscriptionFinal) == 2).await;

    assert_eq!(h.count(EventType::LlmStart), 1);
    assert_eq!(h.log.count("llm.generate_from_messages"), 1);
    assert_eq!(
        h.coordinator.history(),
        vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("You said: first")
        ]
    );
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
}

#[tokio::test]
async fn test_final_ignored_unless_listening() {
    let h = harness(test_config(), None, false);
    assert_ok!(h.coordinator.initialize().await);

    h.say("hello").await;

    assert_eq!(h.count(EventType::TranscriptionFinal), 1);
    assert_eq!(h.count(EventType::LlmStart), 0);
    assert_eq!(h.log.count("llm.generate_from_messages"), 0);
}

#[tokio::test]
async fn test_empty_final_is_not_answered() {
    let h = Harness::listening(test_config(), None, false).await;

    h.say("   ").await;

    assert_eq!(h.count(EventType::LlmStart), 0);
}

#[tokio::test]
async fn test_system_prompt_and_history_reach_llm() {
    let mut config = test_config();
    config.generation.system_prompt = Some("Be brief".into());
    config.generation.max_history_messages = 2;
    let h = Harness::listening(config, None, false).await;

    h.say("one").await;
    h.say("two").await;

    assert_eq!(
        h.llm.last_messages(),
        vec![
            ChatMessage::system("Be brief"),
            ChatMessage::assistant("You said: one"),
            ChatMessage::user("two"),
        ]
    );
    assert_eq!(h.coordinator.history().len(), 2);
}

#[tokio::test]
async fn test_push_audio_only_while_active() {
    let h = harness(test_config(), None, false);
    assert_ok!(h.coordinator.initialize().await);

    assert!(!h.coordinator.push_audio(&[0, 1, 2]).await.unwrap());
    assert_ok!(h.coordinator.start_listening().await);
    assert!(h.coordinator.push_audio(&[0, 1, 2]).await.unwrap());
    assert_eq!(h.log.count("stt.send_audio"), 1);
}

#[tokio::test]
async fn test_transcribe_clip_feeds_a_turn() {
    let h = Harness::listening(test_config(), None, false).await;

    let result = h.coordinator.transcribe_clip(b"hello").await.unwrap();

    assert_eq!(result.text, "hello");
    assert_eq!(h.count(EventType::LlmComplete), 1);
}

#[tokio::test]
async fn test_stop_listening() {
    let h = Harness::listening(test_config(), None, false).await;

    assert_ok!(h.coordinator.stop_listening().await);
    assert_eq!(h.coordinator.capture_state(), CaptureState::Stopped);
    assert_eq!(h.coordinator.agent_state(), AgentState::Ready);
    assert_eq!(h.count(EventType::AudioCaptureStop), 1);
    assert!(!h.stt.is_connected());

    // Second stop is a no-op
    assert_ok!(h.coordinator.stop_listening().await);
    assert_eq!(h.count(EventType::AudioCaptureStop), 1);

    // Stopped capture can start again
    assert_ok!(h.coordinator.start_listening().await);
    assert_eq!(h.coordinator.agent_state(), AgentState::Listening);
}

#[tokio::test]
async fn test_integrated_mode_initializes_once() {
    let config = AgentConfig {
        mode: PipelineMode::Integrated,
        ..test_config()
    };
    let log = CallLog::new();
    let agent = Arc::new(LoopbackAgent::new(log.clone()));
    let coordinator = PipelineCoordinator::builder(config)
        .integrated(agent)
        .build()
        .unwrap();

    assert_ok!(coordinator.initialize().await);
    assert_ok!(coordinator.start_listening().await);
    assert_ok!(
        coordinator
            .handle_transcription(TranscriptionResult::final_text("hello"))
            .await
    );
    assert_eq!(coordinator.agent_state(), AgentState::Listening);

    coordinator.dispose().await;
    assert_eq!(log.count("agent.initialize"), 1);
    assert_eq!(log.count("agent.dispose"), 1);
}
