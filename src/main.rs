//! voice-agent: console driver for the voice pipeline
//!
//! Wires the coordinator to the in-process loopback providers:
//! - each line on stdin is taken as a final transcription
//! - replies are printed to stdout, events are logged
//! - SIGINT/SIGTERM or end of input shuts the pipeline down

mod lifecycle;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

use voice_agent::config::{AgentConfig, PipelineMode};
use voice_agent::events::{Event, EventFilter, EventPayload};
use voice_agent::logging;
use voice_agent::providers::loopback::{
    CallLog, LoopbackAgent, LoopbackLlm, LoopbackStt, LoopbackTts,
};
use voice_agent::providers::TranscriptionResult;
use voice_agent::PipelineCoordinator;

use crate::lifecycle::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load().context("failed to load configuration")?;
    logging::init(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?config.mode,
        "voice-agent starting"
    );

    let mut shutdown = ShutdownSignal::new().context("failed to register signal handlers")?;

    let coordinator = build_coordinator(config)?;
    let _events = coordinator.events().on(EventFilter::Any, log_event);

    coordinator.initialize().await?;
    coordinator.start_listening().await?;

    info!("listening on stdin, one utterance per line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let input = async {
        while let Some(line) = lines.next_line().await? {
            if let Err(e) = coordinator
                .handle_transcription(TranscriptionResult::final_text(line))
                .await
            {
                error!(?e, "failed to handle utterance");
            }
        }
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        result = input => {
            match result {
                Ok(()) => info!("end of input"),
                Err(e) => error!(?e, "stdin read failed"),
            }
        }
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    info!("shutting down...");
    coordinator.dispose().await;
    info!("voice-agent stopped");

    Ok(())
}

fn build_coordinator(config: AgentConfig) -> Result<PipelineCoordinator> {
    let log = CallLog::new();
    let builder = PipelineCoordinator::builder(config.clone());

    let builder = match config.mode {
        PipelineMode::Pipeline => builder
            .stt(Arc::new(LoopbackStt::new(log.clone())))
            .llm(Arc::new(LoopbackLlm::new(log.clone())))
            .tts(Arc::new(LoopbackTts::incremental(log))),
        PipelineMode::Integrated => builder.integrated(Arc::new(LoopbackAgent::new(log))),
    };

    Ok(builder.build()?)
}

fn log_event(event: &Event) {
    match &event.payload {
        EventPayload::LlmComplete { text } => println!("{text}"),
        EventPayload::LlmChunk { chunk, .. } => debug!(chunk = %chunk, "llm chunk"),
        EventPayload::TtsAudio { chunk } => debug!(bytes = chunk.len(), "tts audio"),
        EventPayload::AgentStateChange {
            state,
            previous_state,
        } => info!(from = %previous_state, to = %state, "agent state"),
        payload => info!(event = %event.event_type(), ?payload, "event"),
    }
}
