//! In-process providers
//!
//! The loopback providers do no speech processing at all: the STT side
//! emits whatever text it is handed, the LLM side streams scripted or echoed
//! replies, and the TTS side turns text into bytes. They back the
//! `voice-agent` binary and the coordinator scenarios, and every call they
//! receive is recorded so hosts can inspect the interaction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::{
    AudioCallback, AudioChunk, ChatMessage, GenerateOptions, InputOwnership, LlmProvider,
    MetadataCallback, ProviderDescriptor, Role, SttCapabilities, SttProvider, TextStream,
    TranscriptionCallback, TranscriptionResult, TtsCapabilities, TtsProvider,
};
use crate::error::ProviderError;
use crate::turn_taking::AudioAccess;

/// Ordered record of provider calls, shared between clones
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// STT provider fed by [`inject`](LoopbackStt::inject) or by `transcribe`
pub struct LoopbackStt {
    descriptor: ProviderDescriptor,
    input: InputOwnership,
    log: CallLog,
    ready: AtomicBool,
    connected: AtomicBool,
    fail_initialize: AtomicBool,
    connect_failures: AtomicU32,
    callback: Mutex<Option<TranscriptionCallback>>,
}

impl LoopbackStt {
    pub fn new(log: CallLog) -> Self {
        Self {
            descriptor: ProviderDescriptor::new("loopback-stt")
                .with_audio_access(AudioAccess::ExternallyManagedStream),
            input: InputOwnership::ExternallyFed,
            log,
            ready: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            callback: Mutex::new(None),
        }
    }

    pub fn with_descriptor(mut self, descriptor: ProviderDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_input(mut self, input: InputOwnership) -> Self {
        self.input = input;
        self
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    /// The next `count` connect (or start_listening) calls fail
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Deliver a result through the registered callback
    pub fn inject(&self, result: TranscriptionResult) -> bool {
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    fn open(&self, call: &str) -> Result<(), ProviderError> {
        self.log.record(call);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Connection(format!("{call} refused")));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, call: &str) -> Result<(), ProviderError> {
        self.log.record(call);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SttProvider for LoopbackStt {
    fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor.clone()
    }

    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: true,
            batch: true,
            input: self.input,
        }
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.log.record("stt.initialize");
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(ProviderError::NotReady);
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        self.log.record("stt.dispose");
        self.ready.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.callback.lock().take();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn on_transcription(&self, callback: TranscriptionCallback) {
        *self.callback.lock() = Some(callback);
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        self.open("stt.connect")
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        self.close("stt.disconnect")
    }

    async fn send_audio(&self, chunk: &[u8]) -> Result<(), ProviderError> {
        if !self.is_connected() {
            return Err(ProviderError::Connection("not connected".into()));
        }
        debug!(bytes = chunk.len(), "loopback stt received audio");
        self.log.record("stt.send_audio");
        Ok(())
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<TranscriptionResult, ProviderError> {
        self.log.record("stt.transcribe");
        Ok(TranscriptionResult::final_text(String::from_utf8_lossy(audio)).with_confidence(1.0))
    }

    async fn start_listening(&self) -> Result<(), ProviderError> {
        self.open("stt.start_listening")
    }

    async fn stop_listening(&self) -> Result<(), ProviderError> {
        self.close("stt.stop_listening")
    }
}

/// LLM provider that streams scripted replies, then echoes the user
pub struct LoopbackLlm {
    log: CallLog,
    replies: Mutex<VecDeque<Vec<String>>>,
    /// Yield a stream error after this many chunks
    fail_after: Mutex<Option<usize>>,
    fail_initialize: AtomicBool,
    last_messages: Mutex<Vec<ChatMessage>>,
    held: Mutex<Option<oneshot::Receiver<()>>>,
}

impl LoopbackLlm {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            replies: Mutex::new(VecDeque::new()),
            fail_after: Mutex::new(None),
            fail_initialize: AtomicBool::new(false),
            last_messages: Mutex::new(Vec::new()),
            held: Mutex::new(None),
        }
    }

    /// Queue a reply, streamed chunk by chunk on the next generation
    pub fn push_reply<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replies
            .lock()
            .push_back(chunks.into_iter().map(Into::into).collect());
    }

    pub fn fail_after(&self, chunks: usize) {
        *self.fail_after.lock() = Some(chunks);
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    /// Keep the next generation stream silent until the returned sender
    /// fires or is dropped
    pub fn hold_next_reply(&self) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        *self.held.lock() = Some(held);
        release
    }

    /// Messages passed to the most recent `generate_from_messages`
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages.lock().clone()
    }

    fn reply_stream(&self, prompt: &str) -> TextStream {
        let chunks = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| echo_chunks(prompt));

        let mut items: Vec<Result<String, ProviderError>> = chunks.into_iter().map(Ok).collect();
        if let Some(limit) = self.fail_after.lock().take() {
            items.truncate(limit);
            items.push(Err(ProviderError::Stream("generation interrupted".into())));
        }
        let items = stream::iter(items);
        match self.held.lock().take() {
            Some(held) => stream::once(held)
                .filter_map(|_| future::ready(None))
                .chain(items)
                .boxed(),
            None => items.boxed(),
        }
    }
}

fn echo_chunks(prompt: &str) -> Vec<String> {
    format!("You said: {prompt}")
        .split_inclusive(' ')
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl LlmProvider for LoopbackLlm {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new("loopback-llm")
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.log.record("llm.initialize");
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(ProviderError::NotReady);
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        self.log.record("llm.dispose");
        Ok(())
    }

    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<TextStream, ProviderError> {
        self.log.record("llm.generate");
        Ok(self.reply_stream(prompt))
    }

    async fn generate_from_messages(
        &self,
        messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<TextStream, ProviderError> {
        self.log.record("llm.generate_from_messages");
        *self.last_messages.lock() = messages.to_vec();
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(self.reply_stream(&prompt))
    }
}

/// TTS provider that renders text as its UTF-8 bytes
pub struct LoopbackTts {
    log: CallLog,
    capabilities: TtsCapabilities,
    fail_synthesis: AtomicBool,
    fail_initialize: AtomicBool,
    pending: Mutex<String>,
    audio: Mutex<Option<AudioCallback>>,
    metadata: Mutex<Option<MetadataCallback>>,
}

impl LoopbackTts {
    /// Batch synthesis only
    pub fn batch(log: CallLog) -> Self {
        Self::with_capabilities(
            log,
            TtsCapabilities {
                incremental: false,
                batch: true,
            },
        )
    }

    /// Incremental text submission, audio delivered through `on_audio`
    pub fn incremental(log: CallLog) -> Self {
        Self::with_capabilities(
            log,
            TtsCapabilities {
                incremental: true,
                batch: false,
            },
        )
    }

    fn with_capabilities(log: CallLog, capabilities: TtsCapabilities) -> Self {
        Self {
            log,
            capabilities,
            fail_synthesis: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            pending: Mutex::new(String::new()),
            audio: Mutex::new(None),
            metadata: Mutex::new(None),
        }
    }

    pub fn fail_synthesis(&self, fail: bool) {
        self.fail_synthesis.store(fail, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    fn check_synthesis(&self) -> Result<(), ProviderError> {
        if self.fail_synthesis.load(Ordering::SeqCst) {
            return Err(ProviderError::Synthesis("voice unavailable".into()));
        }
        Ok(())
    }

    fn deliver(&self, text: &str) {
        let audio = self.audio.lock().clone();
        if let Some(audio) = audio {
            audio(text.as_bytes().to_vec());
        }
        let metadata = self.metadata.lock().clone();
        if let Some(metadata) = metadata {
            metadata(serde_json::json!({ "chars": text.chars().count() }));
        }
    }
}

#[async_trait]
impl TtsProvider for LoopbackTts {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new("loopback-tts").with_audio_access(AudioAccess::None)
    }

    fn capabilities(&self) -> TtsCapabilities {
        self.capabilities
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.log.record("tts.initialize");
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(ProviderError::NotReady);
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        self.log.record("tts.dispose");
        self.audio.lock().take();
        self.metadata.lock().take();
        Ok(())
    }

    fn on_audio(&self, callback: AudioCallback) {
        *self.audio.lock() = Some(callback);
    }

    fn on_metadata(&self, callback: MetadataCallback) {
        *self.metadata.lock() = Some(callback);
    }

    async fn synthesize(&self, text: &str) -> Result<AudioChunk, ProviderError> {
        self.log.record("tts.synthesize");
        if !self.capabilities.batch {
            return Err(ProviderError::Unsupported("tts.synthesize"));
        }
        self.check_synthesis()?;
        Ok(text.as_bytes().to_vec())
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        self.log.record("tts.connect");
        self.pending.lock().clear();
        Ok(())
    }

    async fn send_text(&self, chunk: &str) -> Result<(), ProviderError> {
        self.log.record("tts.send_text");
        self.check_synthesis()?;
        let ready = {
            let mut pending = self.pending.lock();
            pending.push_str(chunk);
            // Flush whole words, keep the tail for the next chunk
            match pending.rfind(' ') {
                Some(index) => {
                    let tail = pending.split_off(index + 1);
                    std::mem::replace(&mut *pending, tail)
                }
                None => String::new(),
            }
        };
        if !ready.is_empty() {
            self.deliver(&ready);
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<(), ProviderError> {
        self.log.record("tts.finalize");
        self.check_synthesis()?;
        let rest = std::mem::take(&mut *self.pending.lock());
        if !rest.is_empty() {
            self.deliver(&rest);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        self.log.record("tts.disconnect");
        self.pending.lock().clear();
        Ok(())
    }
}

/// One collaborator covering STT, LLM and TTS, for integrated mode
pub struct LoopbackAgent {
    pub stt: LoopbackStt,
    pub llm: LoopbackLlm,
    pub tts: LoopbackTts,
    log: CallLog,
}

impl LoopbackAgent {
    pub fn new(log: CallLog) -> Self {
        Self {
            stt: LoopbackStt::new(log.clone()),
            llm: LoopbackLlm::new(log.clone()),
            tts: LoopbackTts::batch(log.clone()),
            log,
        }
    }
}

#[async_trait]
impl SttProvider for LoopbackAgent {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new("loopback-agent")
            .with_audio_access(AudioAccess::ExternallyManagedStream)
    }

    fn capabilities(&self) -> SttCapabilities {
        self.stt.capabilities()
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.log.record("agent.initialize");
        SttProvider::initialize(&self.stt).await?;
        LlmProvider::initialize(&self.llm).await?;
        TtsProvider::initialize(&self.tts).await
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        self.log.record("agent.dispose");
        SttProvider::dispose(&self.stt).await?;
        LlmProvider::dispose(&self.llm).await?;
        TtsProvider::dispose(&self.tts).await
    }

    fn is_ready(&self) -> bool {
        self.stt.is_ready()
    }

    fn on_transcription(&self, callback: TranscriptionCallback) {
        self.stt.on_transcription(callback);
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        SttProvider::connect(&self.stt).await
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        SttProvider::disconnect(&self.stt).await
    }

    async fn send_audio(&self, chunk: &[u8]) -> Result<(), ProviderError> {
        self.stt.send_audio(chunk).await
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<TranscriptionResult, ProviderError> {
        self.stt.transcribe(audio).await
    }
}

#[async_trait]
impl LlmProvider for LoopbackAgent {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new("loopback-agent")
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        SttProvider::initialize(self).await
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        SttProvider::dispose(self).await
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TextStream, ProviderError> {
        self.llm.generate(prompt, options).await
    }

    async fn generate_from_messages(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<TextStream, ProviderError> {
        self.llm.generate_from_messages(messages, options).await
    }
}

#[async_trait]
impl TtsProvider for LoopbackAgent {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new("loopback-agent").with_audio_access(AudioAccess::None)
    }

    fn capabilities(&self) -> TtsCapabilities {
        self.tts.capabilities()
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        SttProvider::initialize(self).await
    }

    async fn dispose(&self) -> Result<(), ProviderError> {
        SttProvider::dispose(self).await
    }

    fn on_audio(&self, callback: AudioCallback) {
        self.tts.on_audio(callback);
    }

    fn on_metadata(&self, callback: MetadataCallback) {
        self.tts.on_metadata(callback);
    }

    async fn synthesize(&self, text: &str) -> Result<AudioChunk, ProviderError> {
        self.tts.synthesize(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: TextStream) -> Vec<Result<String, ProviderError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_llm_streams_scripted_then_echo() {
        let llm = LoopbackLlm::new(CallLog::new());
        llm.push_reply(["Hel", "lo "]);

        let first = collect(llm.generate("ignored", &GenerateOptions::default()).await.unwrap()).await;
        let first: Vec<String> = first.into_iter().map(Result::unwrap).collect();
        assert_eq!(first, vec!["Hel", "lo "]);

        let echo = collect(llm.generate("hi there", &GenerateOptions::default()).await.unwrap()).await;
        let echo: String = echo.into_iter().map(Result::unwrap).collect();
        assert_eq!(echo, "You said: hi there");
    }

    #[tokio::test]
    async fn test_llm_held_reply_waits_for_release() {
        let llm = LoopbackLlm::new(CallLog::new());
        llm.push_reply(["late"]);
        let release = llm.hold_next_reply();

        let mut stream = llm.generate("x", &GenerateOptions::default()).await.unwrap();
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(10), stream.next()).await;
        assert!(waiting.is_err());

        release.send(()).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "late");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_llm_fail_after() {
        let llm = LoopbackLlm::new(CallLog::new());
        llm.push_reply(["a ", "b ", "c "]);
        llm.fail_after(1);

        let items = collect(llm.generate("x", &GenerateOptions::default()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProviderError::Stream(_))));
    }

    #[tokio::test]
    async fn test_incremental_tts_flushes_words() {
        let tts = LoopbackTts::incremental(CallLog::new());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        tts.on_audio(Arc::new(move |chunk: AudioChunk| {
            sink.lock().push(String::from_utf8(chunk).unwrap())
        }));

        tts.connect().await.unwrap();
        tts.send_text("Hel").await.unwrap();
        tts.send_text("lo wor").await.unwrap();
        tts.send_text("ld").await.unwrap();
        tts.finalize().await.unwrap();

        assert_eq!(*delivered.lock(), vec!["Hello ", "world"]);
    }

    #[tokio::test]
    async fn test_stt_connect_failures_are_counted() {
        let log = CallLog::new();
        let stt = LoopbackStt::new(log.clone());
        stt.fail_next_connects(1);
        assert!(stt.connect().await.is_err());
        assert!(stt.connect().await.is_ok());
        assert!(stt.is_connected());
        assert_eq!(log.count("stt.connect"), 2);
    }

    #[tokio::test]
    async fn test_integrated_agent_initializes_each_part() {
        let log = CallLog::new();
        let agent = LoopbackAgent::new(log.clone());
        LlmProvider::initialize(&agent).await.unwrap();
        assert_eq!(
            log.calls(),
            vec!["agent.initialize", "stt.initialize", "llm.initialize", "tts.initialize"]
        );
    }
}
