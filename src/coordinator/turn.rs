//! One conversation turn: generate, speak, resume listening

use std::sync::atomic::Ordering;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::PipelineCoordinator;
use crate::error::Result;
use crate::events::EventPayload;
use crate::providers::{ChatMessage, GenerateOptions};
use crate::state::{CaptureState, PlaybackState, ProcessingState};

/// Where a turn broke, which decides the event and the machine that owns it
#[derive(Debug)]
enum TurnFailure {
    Generation(String),
    Synthesis(String),
    /// The coordinator was reset or disposed while the turn was suspended
    Abandoned,
}

fn generation(err: impl ToString) -> TurnFailure {
    TurnFailure::Generation(err.to_string())
}

fn synthesis(err: impl ToString) -> TurnFailure {
    TurnFailure::Synthesis(err.to_string())
}

type TurnResult<T = ()> = std::result::Result<T, TurnFailure>;

impl PipelineCoordinator {
    pub(super) async fn run_turn(&self, text: String) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.prepare_turn();
        info!(chars = text.chars().count(), epoch, "turn started");

        match self.execute_turn(&text, epoch).await {
            Ok(()) => info!("turn complete"),
            Err(TurnFailure::Abandoned) => debug!(epoch, "turn abandoned"),
            Err(failure) => self.recover(failure, epoch).await,
        }
    }

    /// Checked after every await: once the epoch moves on, the machines
    /// belong to whoever reset them and the turn must not touch them.
    fn still_current(&self, epoch: u64) -> TurnResult {
        if self.inner.epoch.load(Ordering::SeqCst) == epoch {
            Ok(())
        } else {
            Err(TurnFailure::Abandoned)
        }
    }

    /// Walk leftovers from the previous turn back to idle
    fn prepare_turn(&self) {
        let inner = &self.inner;

        let processing = match inner.processing.state() {
            ProcessingState::Error => inner.processing.set_idle(),
            _ => inner.processing.settle(),
        };
        if let Err(err) = processing {
            warn!(error = %err, "could not settle processing");
        }

        if matches!(
            inner.playback.state(),
            PlaybackState::Error | PlaybackState::Stopped
        ) {
            if let Err(err) = inner.playback.set_idle() {
                warn!(error = %err, "could not settle playback");
            }
        }

        inner.buffered_audio.store(0, Ordering::SeqCst);
    }

    async fn execute_turn(&self, text: &str, epoch: u64) -> TurnResult {
        let inner = &self.inner;
        let tts = &inner.providers.tts;

        inner.processing.set_processing().map_err(generation)?;
        inner.bus.emit(EventPayload::LlmStart {
            prompt: text.to_string(),
        });

        let messages = self.push_user_message(text);

        let incremental = tts.capabilities().incremental;
        if incremental {
            tts.connect().await.map_err(synthesis)?;
            self.still_current(epoch)?;
            inner.tts_connected.store(true, Ordering::SeqCst);
        }

        let reply = match self.stream_generation(&messages, incremental, epoch).await {
            Ok(reply) => reply,
            Err(failure) => {
                if matches!(failure, TurnFailure::Generation(_)) {
                    self.forget_last_user_message();
                }
                return Err(failure);
            }
        };
        self.still_current(epoch)?;

        inner.processing.set_complete().map_err(generation)?;
        inner.bus.emit(EventPayload::LlmComplete {
            text: reply.clone(),
        });
        self.push_assistant_message(&reply);

        self.speak(&reply, incremental, epoch).await?;
        self.still_current(epoch)?;

        // An empty reply skips synthesis and leaves processing `complete`
        inner.processing.set_idle().map_err(generation)?;
        Ok(())
    }

    /// Consume the generation stream, publishing every chunk with the text
    /// accumulated so far and forwarding it to an incremental TTS
    async fn stream_generation(
        &self,
        messages: &[ChatMessage],
        incremental: bool,
        epoch: u64,
    ) -> TurnResult<String> {
        let inner = &self.inner;
        let generation_config = &inner.config.generation;
        let options = GenerateOptions {
            temperature: generation_config.temperature,
            max_tokens: generation_config.max_tokens,
        };

        let mut stream = inner
            .providers
            .llm
            .generate_from_messages(messages, &options)
            .await
            .map_err(generation)?;

        let mut accumulated = String::new();
        while let Some(item) = stream.next().await {
            self.still_current(epoch)?;
            let chunk = item.map_err(generation)?;
            if chunk.is_empty() {
                continue;
            }
            accumulated.push_str(&chunk);

            if inner.processing.is(ProcessingState::Processing) {
                inner.processing.set_streaming().map_err(generation)?;
            }
            inner.bus.emit(EventPayload::LlmChunk {
                chunk: chunk.clone(),
                accumulated: accumulated.clone(),
            });

            if incremental {
                inner
                    .providers
                    .tts
                    .send_text(&chunk)
                    .await
                    .map_err(synthesis)?;
            }
        }

        debug!(chars = accumulated.chars().count(), "generation finished");
        Ok(accumulated)
    }

    /// Synthesize the reply. Processing returns to `idle` as soon as the
    /// last audio is in, so stopping playback derives `listening` or `ready`
    /// straight from `speaking`.
    async fn speak(&self, text: &str, incremental: bool, epoch: u64) -> TurnResult {
        let inner = &self.inner;
        let tts = &inner.providers.tts;

        if text.trim().is_empty() {
            debug!("empty reply, nothing to synthesize");
            self.disconnect_tts().await;
            return Ok(());
        }

        inner.bus.emit(EventPayload::TtsStart {
            text: text.to_string(),
        });

        let decision = inner.policy.decide(
            &inner.providers.stt.descriptor(),
            &tts.descriptor(),
            inner.platform.as_deref(),
        );
        if decision.pause {
            debug!(reason = decision.reason, "pausing capture for playback");
            self.pause_capture(epoch).await;
            self.still_current(epoch)?;
        } else {
            debug!(reason = decision.reason, "capture stays open during playback");
        }

        inner.playback.set_buffering().map_err(synthesis)?;
        // Incremental audio may have arrived during generation
        self.promote_playback(false);

        if incremental {
            tts.finalize().await.map_err(synthesis)?;
            inner.tts_connected.store(false, Ordering::SeqCst);
            tts.disconnect().await.map_err(synthesis)?;
        } else {
            let audio = tts.synthesize(text).await.map_err(synthesis)?;
            self.still_current(epoch)?;
            self.accept_audio(audio);
        }
        self.still_current(epoch)?;
        self.promote_playback(true);

        inner.processing.set_idle().map_err(synthesis)?;
        inner.playback.set_stopped().map_err(synthesis)?;
        inner.playback.set_idle().map_err(synthesis)?;

        if let Err(err) = self.resume_capture(epoch).await {
            error!(error = %err, "capture did not resume after playback");
        }
        self.still_current(epoch)?;

        inner.bus.emit(EventPayload::TtsComplete);
        Ok(())
    }

    async fn pause_capture(&self, epoch: u64) {
        let capture = &self.inner.capture;
        match capture.state() {
            CaptureState::Active => {
                let closed = self.close_input().await;
                if self.still_current(epoch).is_err() {
                    return;
                }
                let paused = match closed {
                    Ok(()) => capture.set_paused(),
                    Err(err) => {
                        warn!(error = %err, "failed to pause capture");
                        capture.set_error()
                    }
                };
                if let Err(err) = paused {
                    warn!(error = %err, "capture pause transition rejected");
                }
            }
            CaptureState::Error => {
                warn!("capture is in error, skipping pause");
            }
            _ => {}
        }
    }

    /// Bring capture back to `active`: `paused` reconnects, `error` goes
    /// through `idle` and `starting` first. Other states are left alone,
    /// and so is everything once the turn has been abandoned.
    async fn resume_capture(&self, epoch: u64) -> Result<()> {
        let capture = &self.inner.capture;
        match capture.state() {
            CaptureState::Paused => {}
            CaptureState::Error => {
                capture.set_idle()?;
                capture.set_starting()?;
            }
            _ => return Ok(()),
        }

        let reopened = self.reopen_input().await;
        if self.still_current(epoch).is_err() {
            debug!("turn abandoned during capture resume");
            return Ok(());
        }

        match reopened {
            Ok(()) => {
                capture.set_active()?;
                debug!("capture resumed");
                Ok(())
            }
            Err(err) => {
                if let Err(transition) = capture.set_error() {
                    warn!(error = %transition, "capture could not enter error");
                }
                Err(err)
            }
        }
    }

    /// Report the failure, mark the owning machine, try to get capture back,
    /// then force the agent to `error` whatever the outcome
    async fn recover(&self, failure: TurnFailure, epoch: u64) {
        let inner = &self.inner;
        if self.still_current(epoch).is_err() {
            debug!(?failure, "turn abandoned before its failure was handled");
            return;
        }

        let marked = match &failure {
            TurnFailure::Generation(message) => {
                error!(error = %message, "generation failed");
                inner.bus.emit(EventPayload::LlmError {
                    error: message.clone(),
                    recoverable: true,
                });
                inner.processing.set_error()
            }
            TurnFailure::Synthesis(message) => {
                error!(error = %message, "synthesis failed");
                inner.bus.emit(EventPayload::TtsError {
                    error: message.clone(),
                    recoverable: true,
                });
                inner.playback.set_error().and_then(|()| inner.processing.settle())
            }
            TurnFailure::Abandoned => return,
        };
        if let Err(err) = marked {
            warn!(error = %err, "failure state transition rejected");
        }

        self.disconnect_tts().await;
        if self.still_current(epoch).is_err() {
            return;
        }

        if let Err(err) = self.resume_capture(epoch).await {
            error!(error = %err, "capture recovery failed");
        }
        if self.still_current(epoch).is_err() {
            return;
        }

        inner.agent.set_error();
    }

    /// Append the user message and return the full generation context
    fn push_user_message(&self, text: &str) -> Vec<ChatMessage> {
        let generation = &self.inner.config.generation;
        let history = {
            let mut history = self.inner.history.lock();
            history.push(ChatMessage::user(text));
            trim_history(&mut history, generation.max_history_messages);
            history.clone()
        };

        generation
            .system_prompt
            .iter()
            .map(ChatMessage::system)
            .chain(history)
            .collect()
    }

    fn push_assistant_message(&self, text: &str) {
        let max = self.inner.config.generation.max_history_messages;
        let mut history = self.inner.history.lock();
        history.push(ChatMessage::assistant(text));
        trim_history(&mut history, max);
    }

    fn forget_last_user_message(&self) {
        let mut history = self.inner.history.lock();
        if history
            .last()
            .is_some_and(|m| m.role == crate::providers::Role::User)
        {
            history.pop();
        }
    }
}

fn trim_history(history: &mut Vec<ChatMessage>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_history_drops_oldest() {
        let mut history = vec![
            ChatMessage::user("one"),
            ChatMessage::assistant("two"),
            ChatMessage::user("three"),
        ];
        trim_history(&mut history, 2);
        assert_eq!(
            history,
            vec![ChatMessage::assistant("two"), ChatMessage::user("three")]
        );
    }

    #[test]
    fn test_trim_history_within_limit() {
        let mut history = vec![ChatMessage::user("one")];
        trim_history(&mut history, 5);
        assert_eq!(history.len(), 1);
    }
}
