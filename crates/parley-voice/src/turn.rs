//! Turn detection for microphone input
//!
//! Implements the "gap" rule: a turn ends once speech has been followed by
//! 800ms of silence. Timestamps are passed in so the detector stays pure.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A completed turn: buffered PCM from speech start until the gap.
#[derive(Debug, Clone)]
pub struct AudioTurn {
    /// PCM samples (f32, -1.0..1.0).
    pub samples: Vec<f32>,
    /// When the turn was committed.
    pub timestamp: DateTime<Utc>,
    /// Speech duration.
    pub duration: Duration,
    pub sample_rate: u32,
}

/// Configuration for turn detection
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Silence after speech before committing a turn (default: 800ms)
    pub silence_gap: Duration,

    /// Shorter speech is treated as noise (default: 200ms)
    pub min_speech: Duration,

    /// A turn this long is committed even without a gap (default: 30s)
    pub max_turn: Duration,

    pub sample_rate: u32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_gap: Duration::from_millis(800),
            min_speech: Duration::from_millis(200),
            max_turn: Duration::from_secs(30),
            sample_rate: 16000,
        }
    }
}

/// What a VAD frame changed.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    SpeechStarted,
    Committed(AudioTurn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    Speaking,
    SilenceDetected,
}

/// Groups VAD frames into turns.
pub struct TurnDetector {
    config: TurnConfig,
    state: TurnState,
    speech_start: Option<Instant>,
    last_speech: Option<Instant>,
    buffer: Vec<f32>,
}

impl TurnDetector {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            speech_start: None,
            last_speech: None,
            buffer: Vec::new(),
        }
    }

    /// Feed one VAD frame observed at `now`.
    pub fn process(&mut self, is_speech: bool, frame: &[f32], now: Instant) -> Option<TurnEvent> {
        match (self.state, is_speech) {
            (TurnState::Idle, true) => {
                debug!("🎤 Speech started");
                self.state = TurnState::Speaking;
                self.speech_start = Some(now);
                self.last_speech = Some(now);
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                Some(TurnEvent::SpeechStarted)
            }
            (TurnState::Speaking, true) | (TurnState::SilenceDetected, true) => {
                self.state = TurnState::Speaking;
                self.last_speech = Some(now);
                self.buffer.extend_from_slice(frame);
                let started = self.speech_start.unwrap_or(now);
                if now.duration_since(started) >= self.config.max_turn {
                    warn!("⏱️ Max turn duration reached, committing");
                    return self.commit().map(TurnEvent::Committed);
                }
                None
            }
            (TurnState::Speaking, false) => {
                self.state = TurnState::SilenceDetected;
                None
            }
            (TurnState::SilenceDetected, false) => {
                let last = self.last_speech?;
                if now.duration_since(last) >= self.config.silence_gap {
                    return self.commit().map(TurnEvent::Committed);
                }
                None
            }
            (TurnState::Idle, false) => None,
        }
    }

    /// Commit whatever speech is buffered (e.g. recognition was stopped mid-turn).
    pub fn flush(&mut self) -> Option<AudioTurn> {
        self.commit()
    }

    pub fn is_idle(&self) -> bool {
        self.state == TurnState::Idle
    }

    fn commit(&mut self) -> Option<AudioTurn> {
        if self.state == TurnState::Idle {
            return None;
        }
        let duration = match (self.speech_start, self.last_speech) {
            (Some(start), Some(last)) => last.duration_since(start),
            _ => Duration::ZERO,
        };
        if duration < self.config.min_speech {
            debug!("⏭️ Speech too short ({:?}), ignoring", duration);
            self.reset();
            return None;
        }
        info!(
            "🎯 Turn committed: {:?} speech, {} samples",
            duration,
            self.buffer.len()
        );
        let turn = AudioTurn {
            samples: std::mem::take(&mut self.buffer),
            timestamp: Utc::now(),
            duration,
            sample_rate: self.config.sample_rate,
        };
        self.reset();
        Some(turn)
    }

    fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.speech_start = None;
        self.last_speech = None;
        self.buffer.clear();
    }
}
