//! Recognition Session: one continuous speech-recognition stream at a time.
//!
//! A [`SpeechRecognizer`] backend produces raw events for a single session and
//! closes its channel once it has stopped. [`RecognitionSession`] wraps that in
//! a generation-tagged event stream, owns the no-speech timeout and reports
//! `Ended` only after every in-flight result has been delivered.

use async_trait::async_trait;
use parley_core::{LoopError, LoopResult, RecognitionFault};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a stopped backend may keep delivering before the session gives up on it.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Something the recognizer observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Voice activity began. Carries no text; resets the no-speech timer.
    SpeechStarted,
    /// Current hypothesis for the utterance in progress. Replaces the previous partial.
    Partial(String),
    /// Authoritative text for a finished utterance.
    Final(String),
    Error(RecognitionFault),
    /// The session is over. Always the last event of a generation.
    Ended,
}

/// A running backend session: its events plus the token that stops it.
///
/// Backends must close `events` once they notice `stop`, after delivering any
/// result that was already in flight.
pub struct RecognitionStream {
    pub events: mpsc::Receiver<RecognitionEvent>,
    pub stop: CancellationToken,
}

/// Speech recognition service.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// False when this platform has no recognition capability at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Begin continuous recognition in `language` (BCP-47, e.g. "en-US").
    async fn start(&self, language: &str) -> LoopResult<RecognitionStream>;
}

/// Recognizer for platforms without speech input.
#[derive(Debug, Default)]
pub struct UnsupportedRecognizer {
    reason: Option<String>,
}

impl UnsupportedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for UnsupportedRecognizer {
    fn is_supported(&self) -> bool {
        false
    }

    async fn start(&self, _language: &str) -> LoopResult<RecognitionStream> {
        Err(LoopError::UnsupportedPlatform(
            self.reason
                .clone()
                .unwrap_or_else(|| "no speech recognition engine available".to_string()),
        ))
    }
}

/// A recognition event tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: RecognitionEvent,
}

struct ActiveRecognition {
    generation: u64,
    stop: CancellationToken,
}

/// Owns the recognizer and at most one live session.
pub struct RecognitionSession {
    recognizer: Arc<dyn SpeechRecognizer>,
    language: String,
    no_speech_timeout: Option<Duration>,
    generation: u64,
    active: Option<ActiveRecognition>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

impl RecognitionSession {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        language: impl Into<String>,
        no_speech_timeout: Option<Duration>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            recognizer,
            language: language.into(),
            no_speech_timeout,
            generation: 0,
            active: None,
            events_tx,
            events_rx,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.recognizer.is_supported()
    }

    /// True from `start` until this session's `Ended` has been read.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Generation of the most recent session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new session, stopping any previous one. Returns its generation.
    ///
    /// Events of older generations are dropped from then on.
    pub async fn start(&mut self) -> LoopResult<u64> {
        if !self.recognizer.is_supported() {
            return Err(LoopError::UnsupportedPlatform(
                "speech recognition is not available on this platform".to_string(),
            ));
        }
        self.stop();

        let stream = self.recognizer.start(&self.language).await?;
        self.generation += 1;
        let generation = self.generation;

        tokio::spawn(forward_events(
            generation,
            stream.events,
            stream.stop.clone(),
            self.no_speech_timeout,
            self.events_tx.clone(),
        ));
        self.active = Some(ActiveRecognition {
            generation,
            stop: stream.stop,
        });
        info!(generation, language = %self.language, "🎤 Recognition started");
        Ok(generation)
    }

    /// Ask the live session to end. Idempotent; results already in flight are still delivered.
    pub fn stop(&mut self) {
        if let Some(active) = &self.active {
            if !active.stop.is_cancelled() {
                debug!(generation = active.generation, "Recognition stop requested");
                active.stop.cancel();
            }
        }
    }

    /// Next event of the current generation. Never resolves while nothing is running.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            let Some(event) = self.events_rx.recv().await else {
                // The session holds a sender itself, so the channel cannot close.
                std::future::pending::<()>().await;
                continue;
            };
            if event.generation != self.generation {
                debug!(
                    generation = event.generation,
                    current = self.generation,
                    "Dropping stale recognition event"
                );
                continue;
            }
            if event.event == RecognitionEvent::Ended {
                self.active = None;
            }
            return event;
        }
    }
}

/// Relays backend events for one generation and appends `Ended`.
async fn forward_events(
    generation: u64,
    mut events: mpsc::Receiver<RecognitionEvent>,
    stop: CancellationToken,
    no_speech_timeout: Option<Duration>,
    tx: mpsc::Sender<SessionEvent>,
) {
    let mut deadline = no_speech_timeout.map(|t| Instant::now() + t);
    let mut draining = false;

    loop {
        if !draining && stop.is_cancelled() {
            draining = true;
            deadline = Some(Instant::now() + DRAIN_GRACE);
        }
        let at = deadline;
        let timer = async move {
            match at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event == RecognitionEvent::Ended {
                    break;
                }
                if !draining {
                    if let RecognitionEvent::SpeechStarted
                    | RecognitionEvent::Partial(_)
                    | RecognitionEvent::Final(_) = event
                    {
                        deadline = no_speech_timeout.map(|t| Instant::now() + t);
                    }
                }
                if tx.send(SessionEvent { generation, event }).await.is_err() {
                    return;
                }
            }
            _ = stop.cancelled(), if !draining => {}
            _ = timer => {
                if draining {
                    warn!(generation, "Recognizer did not finish after stop, abandoning it");
                    break;
                }
                info!(generation, "🤫 No speech detected before timeout");
                let fault = SessionEvent {
                    generation,
                    event: RecognitionEvent::Error(RecognitionFault::NoSpeech),
                };
                if tx.send(fault).await.is_err() {
                    return;
                }
                stop.cancel();
            }
        }
    }

    debug!(generation, "Recognition ended");
    let _ = tx
        .send(SessionEvent {
            generation,
            event: RecognitionEvent::Ended,
        })
        .await;
}
