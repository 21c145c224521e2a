//! Playback Controller: speak finished replies and track speaking state.
//!
//! Playback is best-effort: synthesis or device failures are logged and
//! reported as an outcome, never as an error the loop has to handle.

use async_trait::async_trait;
use parley_core::{LoopResult, VoiceProfile};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Synthesized speech ready for a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// Reference stored on the message (`audio_ref`).
    pub id: String,
    /// Encoded audio (WAV/MP3). Empty means nothing to play.
    pub bytes: Vec<u8>,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            bytes,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Speech synthesis service.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> LoopResult<AudioClip>;
}

/// Audio output device.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `clip`, resolving once the audio has finished.
    async fn play(&self, clip: &AudioClip) -> LoopResult<()>;

    /// Halt whatever is playing. Safe to call when idle.
    fn stop(&self);
}

/// Synthesizer that produces no audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSynthesizer;

#[async_trait]
impl SpeechSynthesizer for SilentSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &VoiceProfile) -> LoopResult<AudioClip> {
        Ok(AudioClip::empty())
    }
}

/// Sink that discards audio and finishes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, _clip: &AudioClip) -> LoopResult<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// How a `speak` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
    /// Synthesis or playback failed; already logged.
    Failed(String),
}

/// Completion report for a playback started with [`PlaybackController::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub id: u64,
    pub outcome: PlaybackOutcome,
    pub audio_ref: Option<String>,
}

struct Current {
    id: u64,
    cancel: CancellationToken,
}

/// Owns the audio output and at most one utterance being spoken.
pub struct PlaybackController {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    voice: VoiceProfile,
    next_id: AtomicU64,
    /// Id of the playback in progress, 0 when silent.
    speaking: Arc<AtomicU64>,
    current: Mutex<Option<Current>>,
    events_tx: mpsc::Sender<PlaybackEvent>,
    events_rx: mpsc::Receiver<PlaybackEvent>,
}

impl PlaybackController {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        voice: VoiceProfile,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(16);
        Self {
            synthesizer,
            sink,
            voice,
            next_id: AtomicU64::new(1),
            speaking: Arc::new(AtomicU64::new(0)),
            current: Mutex::new(None),
            events_tx,
            events_rx,
        }
    }

    /// True from `speak`/`start` until completion or `stop`.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst) != 0
    }

    /// Speak `text` and wait for the outcome. Never fails.
    pub async fn speak(&self, text: &str) -> PlaybackOutcome {
        let (id, cancel) = self.begin();
        let (outcome, _) = run_speech(
            self.synthesizer.clone(),
            self.sink.clone(),
            self.voice.clone(),
            text.to_string(),
            cancel,
        )
        .await;
        self.finish(id);
        outcome
    }

    /// Speak `text` in the background. The outcome arrives through [`next_event`](Self::next_event).
    pub fn start(&self, text: &str) -> u64 {
        let (id, cancel) = self.begin();
        let synthesizer = self.synthesizer.clone();
        let sink = self.sink.clone();
        let voice = self.voice.clone();
        let text = text.to_string();
        let speaking = self.speaking.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let (outcome, audio_ref) = run_speech(synthesizer, sink, voice, text, cancel).await;
            let _ = speaking.compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
            let _ = events_tx
                .send(PlaybackEvent {
                    id,
                    outcome,
                    audio_ref,
                })
                .await;
        });
        id
    }

    /// Halt playback now. Idempotent.
    pub fn stop(&self) {
        let current = match self.current.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(current) = current else { return };
        current.cancel.cancel();
        let was_playing = self
            .speaking
            .compare_exchange(current.id, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if was_playing {
            info!(playback = current.id, "🔇 Playback stopped");
            self.sink.stop();
        }
    }

    /// Next completion report. Never resolves while nothing was started.
    pub async fn next_event(&mut self) -> PlaybackEvent {
        match self.events_rx.recv().await {
            Some(event) => event,
            // The controller holds a sender itself.
            None => std::future::pending().await,
        }
    }

    fn begin(&self) -> (u64, CancellationToken) {
        self.stop();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.speaking.store(id, Ordering::SeqCst);
        let current = Current {
            id,
            cancel: cancel.clone(),
        };
        match self.current.lock() {
            Ok(mut guard) => *guard = Some(current),
            Err(poisoned) => *poisoned.into_inner() = Some(current),
        }
        debug!(playback = id, "🔊 Playback started");
        (id, cancel)
    }

    fn finish(&self, id: u64) {
        let _ = self
            .speaking
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
        if let Ok(mut guard) = self.current.lock() {
            if guard.as_ref().map(|c| c.id) == Some(id) {
                *guard = None;
            }
        }
    }
}

async fn run_speech(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    voice: VoiceProfile,
    text: String,
    cancel: CancellationToken,
) -> (PlaybackOutcome, Option<String>) {
    let synthesized = tokio::select! {
        biased;
        _ = cancel.cancelled() => return (PlaybackOutcome::Stopped, None),
        res = synthesizer.synthesize(&text, &voice) => res,
    };
    let clip = match synthesized {
        Ok(clip) => clip,
        Err(e) => {
            warn!("Speech synthesis failed, continuing without audio: {}", e);
            return (PlaybackOutcome::Failed(e.to_string()), None);
        }
    };
    let audio_ref = (!clip.is_empty()).then(|| clip.id.clone());

    let played = tokio::select! {
        biased;
        _ = cancel.cancelled() => return (PlaybackOutcome::Stopped, audio_ref),
        res = sink.play(&clip) => res,
    };
    match played {
        Ok(()) => (PlaybackOutcome::Completed, audio_ref),
        Err(e) => {
            warn!("Playback failed, continuing: {}", e);
            (PlaybackOutcome::Failed(e.to_string()), audio_ref)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::LoopError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct ToneSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for ToneSynthesizer {
        async fn synthesize(&self, text: &str, _voice: &VoiceProfile) -> LoopResult<AudioClip> {
            Ok(AudioClip::new(text.as_bytes().to_vec()))
        }
    }

    #[derive(Default)]
    struct SlowSink {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for SlowSink {
        async fn play(&self, _clip: &AudioClip) -> LoopResult<()> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AudioSink for BrokenSink {
        async fn play(&self, _clip: &AudioClip) -> LoopResult<()> {
            Err(LoopError::PlaybackFailure("no output device".into()))
        }

        fn stop(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn speaking_flag_covers_the_whole_playback() {
        let mut controller = PlaybackController::new(
            Arc::new(ToneSynthesizer),
            Arc::new(SlowSink::default()),
            VoiceProfile::default(),
        );
        assert!(!controller.is_speaking());
        let id = controller.start("Hi there!");
        assert!(controller.is_speaking());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.is_speaking());

        let event = controller.next_event().await;
        assert_eq!(event.id, id);
        assert_eq!(event.outcome, PlaybackOutcome::Completed);
        assert!(event.audio_ref.is_some());
        assert!(!controller.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_immediate_and_idempotent() {
        let sink = Arc::new(SlowSink::default());
        let mut controller =
            PlaybackController::new(Arc::new(ToneSynthesizer), sink.clone(), VoiceProfile::default());

        controller.stop();
        assert_eq!(sink.stops.load(Ordering::SeqCst), 0);

        let id = controller.start("Long answer");
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop();
        assert!(!controller.is_speaking());
        controller.stop();
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);

        let event = controller.next_event().await;
        assert_eq!(event.id, id);
        assert_eq!(event.outcome, PlaybackOutcome::Stopped);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let controller = PlaybackController::new(
            Arc::new(ToneSynthesizer),
            Arc::new(BrokenSink),
            VoiceProfile::default(),
        );
        let outcome = controller.speak("Hello").await;
        assert!(matches!(outcome, PlaybackOutcome::Failed(ref m) if m.contains("no output device")));
        assert!(!controller.is_speaking());
    }

    #[tokio::test]
    async fn silent_synthesis_completes_without_audio() {
        let mut controller = PlaybackController::new(
            Arc::new(SilentSynthesizer),
            Arc::new(NullSink),
            VoiceProfile::default(),
        );
        controller.start("Hello");
        let event = controller.next_event().await;
        assert_eq!(event.outcome, PlaybackOutcome::Completed);
        assert_eq!(event.audio_ref, None);
    }
}
