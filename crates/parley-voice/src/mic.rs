//! Microphone recognizer: CPAL capture → WebRTC VAD → gap turn detection → STT.
//!
//! The CPAL stream and the VAD are not `Send`, so both live on a dedicated
//! capture thread for the whole session. Committed turns are transcribed one
//! at a time on the runtime, which keeps finals in speaking order and lets a
//! turn flushed at `stop` still arrive before the session ends.

use crate::audio::{AudioCapture, AudioConfig, CaptureMessage};
use crate::recognition::{RecognitionEvent, RecognitionStream, SpeechRecognizer};
use crate::stt::SttBackend;
use crate::turn::{AudioTurn, TurnConfig, TurnDetector, TurnEvent};
use crate::vad::{VadConfig, VadDetector};
use async_trait::async_trait;
use parley_core::{LoopError, LoopResult, RecognitionFault};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the capture thread checks for a stop request while the mic is quiet.
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct MicConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub turn: TurnConfig,
}

/// Speech recognizer backed by the default input device.
pub struct MicRecognizer {
    stt: Arc<dyn SttBackend>,
    config: MicConfig,
}

impl MicRecognizer {
    pub fn new(stt: Arc<dyn SttBackend>) -> Self {
        Self::with_config(stt, MicConfig::default())
    }

    pub fn with_config(stt: Arc<dyn SttBackend>, config: MicConfig) -> Self {
        Self { stt, config }
    }
}

#[async_trait]
impl SpeechRecognizer for MicRecognizer {
    async fn start(&self, language: &str) -> LoopResult<RecognitionStream> {
        let (events_tx, events_rx) = mpsc::channel(32);
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        let config = self.config.clone();
        let thread_stop = stop.clone();
        let thread_events = events_tx.clone();
        std::thread::Builder::new()
            .name("parley-mic".to_string())
            .spawn(move || capture_loop(config, thread_stop, turn_tx, thread_events, ready_tx))
            .map_err(|e| LoopError::CaptureFailure(format!("capture thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| LoopError::CaptureFailure("capture thread exited".to_string()))??;

        tokio::spawn(transcribe_turns(
            self.stt.clone(),
            language.to_string(),
            turn_rx,
            events_tx,
        ));
        Ok(RecognitionStream {
            events: events_rx,
            stop,
        })
    }
}

fn capture_loop(
    config: MicConfig,
    stop: CancellationToken,
    turns: mpsc::UnboundedSender<AudioTurn>,
    events: mpsc::Sender<RecognitionEvent>,
    ready: oneshot::Sender<LoopResult<()>>,
) {
    let (tx, rx) = std::sync::mpsc::channel();
    let opened = VadDetector::new(config.vad.clone()).and_then(|vad| {
        let stream = AudioCapture::new(config.audio.clone())?.start(tx)?;
        Ok((vad, stream))
    });
    // The stream must stay alive until this thread returns.
    let (mut vad, _stream) = match opened {
        Ok(opened) => {
            let _ = ready.send(Ok(()));
            opened
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut detector = TurnDetector::new(config.turn);
    info!("👂 Microphone listening");
    loop {
        if stop.is_cancelled() {
            if let Some(turn) = detector.flush() {
                let _ = turns.send(turn);
            }
            break;
        }
        match rx.recv_timeout(STOP_POLL) {
            Ok(CaptureMessage::Frame(frame)) => {
                let speech = match vad.is_speech(&frame) {
                    Ok(speech) => speech,
                    Err(e) => {
                        debug!("Skipping frame: {}", e);
                        continue;
                    }
                };
                match detector.process(speech, &frame, Instant::now()) {
                    Some(TurnEvent::SpeechStarted) => {
                        let _ = events.try_send(RecognitionEvent::SpeechStarted);
                    }
                    Some(TurnEvent::Committed(turn)) => {
                        let _ = turns.send(turn);
                    }
                    None => {}
                }
            }
            Ok(CaptureMessage::DeviceError(message)) => {
                let _ = events.blocking_send(RecognitionEvent::Error(RecognitionFault::Capture(
                    message,
                )));
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("🎤 Microphone released");
}

async fn transcribe_turns(
    stt: Arc<dyn SttBackend>,
    language: String,
    mut turns: mpsc::UnboundedReceiver<AudioTurn>,
    events: mpsc::Sender<RecognitionEvent>,
) {
    while let Some(turn) = turns.recv().await {
        match stt.transcribe(&turn, &language).await {
            Ok(text) if !text.trim().is_empty() => {
                info!("📝 Transcribed {:?} of speech", turn.duration);
                if events.send(RecognitionEvent::Final(text)).await.is_err() {
                    break;
                }
            }
            Ok(_) => debug!("Turn transcribed to nothing"),
            Err(e) => warn!("Transcription failed, dropping turn: {}", e),
        }
    }
}
