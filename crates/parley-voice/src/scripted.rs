//! Deterministic adapters driven by timed scripts.
//!
//! Used by the integration tests and the console's offline demo. All timing
//! goes through `tokio::time`, so paused-clock tests run instantly.

use crate::playback::{AudioClip, AudioSink};
use crate::recognition::{RecognitionEvent, RecognitionStream, SpeechRecognizer};
use crate::reply::{ChunkMode, TextGenerator};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parley_core::{GenerationRequest, LoopError, LoopResult, RecognitionFault};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One step of a scripted recognition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Wait(Duration),
    SpeechStarted,
    Partial(String),
    Final(String),
    Fault(RecognitionFault),
    /// Steps after this marker are what was still in flight when `stop` arrived.
    /// They are emitted immediately on stop, waits skipped.
    OnStop,
    /// The backend closes its stream on its own.
    Close,
}

impl ScriptStep {
    pub fn wait_ms(ms: u64) -> Self {
        ScriptStep::Wait(Duration::from_millis(ms))
    }

    pub fn partial(text: &str) -> Self {
        ScriptStep::Partial(text.to_string())
    }

    pub fn final_text(text: &str) -> Self {
        ScriptStep::Final(text.to_string())
    }
}

/// Recognizer that plays one script per `start`. Once a script runs out the
/// session stays open, silent, until stopped.
pub struct ScriptedRecognizer {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    start_failure: Option<RecognitionFault>,
    starts: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            start_failure: None,
            starts: AtomicUsize::new(0),
        }
    }

    /// Every `start` fails as if the microphone could not be opened.
    pub fn failing_start(detail: &str) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            start_failure: Some(RecognitionFault::Capture(detail.to_string())),
            starts: AtomicUsize::new(0),
        }
    }

    /// Number of `start` calls so far, including failed ones.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&self, _language: &str) -> LoopResult<RecognitionStream> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = &self.start_failure {
            return Err(fault.clone().into());
        }
        let script = lock(&self.scripts).pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        tokio::spawn(play_script(script, tx, stop.clone()));
        Ok(RecognitionStream { events: rx, stop })
    }
}

async fn play_script(
    script: Vec<ScriptStep>,
    tx: mpsc::Sender<RecognitionEvent>,
    stop: CancellationToken,
) {
    let tail_at = script.iter().position(|s| *s == ScriptStep::OnStop);
    let (body, tail) = match tail_at {
        Some(i) => (&script[..i], &script[i + 1..]),
        None => (&script[..], &[][..]),
    };

    let mut stopped = false;
    for step in body {
        if stop.is_cancelled() {
            stopped = true;
            break;
        }
        match step {
            ScriptStep::Wait(d) => {
                tokio::select! {
                    _ = stop.cancelled() => {
                        stopped = true;
                        break;
                    }
                    _ = tokio::time::sleep(*d) => {}
                }
            }
            ScriptStep::Close => return,
            ScriptStep::OnStop => {}
            other => {
                if let Some(event) = to_event(other) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    if !stopped {
        stop.cancelled().await;
    }
    for step in tail {
        if let Some(event) = to_event(step) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

fn to_event(step: &ScriptStep) -> Option<RecognitionEvent> {
    match step {
        ScriptStep::SpeechStarted => Some(RecognitionEvent::SpeechStarted),
        ScriptStep::Partial(t) => Some(RecognitionEvent::Partial(t.clone())),
        ScriptStep::Final(t) => Some(RecognitionEvent::Final(t.clone())),
        ScriptStep::Fault(f) => Some(RecognitionEvent::Error(f.clone())),
        ScriptStep::Wait(_) | ScriptStep::OnStop | ScriptStep::Close => None,
    }
}

/// A scripted reply: chunks spaced by `interval`, optionally ending in failure.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub chunks: Vec<String>,
    pub interval: Duration,
    /// The stream fails after the last chunk.
    pub fail_with: Option<String>,
    /// The request itself is refused.
    pub refuse_with: Option<String>,
}

impl ScriptedReply {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            interval: Duration::from_millis(50),
            fail_with: None,
            refuse_with: None,
        }
    }

    pub fn refused(detail: &str) -> Self {
        Self {
            refuse_with: Some(detail.to_string()),
            ..Self::chunks(Vec::<String>::new())
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn then_fail(mut self, detail: &str) -> Self {
        self.fail_with = Some(detail.to_string());
        self
    }
}

/// Generator that answers each request with the next scripted reply.
///
/// Chunks are cumulative unless built with [`ScriptedGenerator::deltas`].
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    mode: ChunkMode,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            mode: ChunkMode::Cumulative,
        }
    }

    pub fn deltas(replies: Vec<ScriptedReply>) -> Self {
        Self {
            mode: ChunkMode::Delta,
            ..Self::new(replies)
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn chunk_mode(&self) -> ChunkMode {
        self.mode
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> LoopResult<BoxStream<'static, LoopResult<String>>> {
        lock(&self.requests).push(request);
        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::chunks(Vec::<String>::new()));
        if let Some(detail) = reply.refuse_with {
            return Err(LoopError::StreamFailure(detail));
        }

        let chunks = async_stream::stream! {
            for chunk in reply.chunks {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(reply.interval) => {}
                }
                yield Ok(chunk);
            }
            if let Some(detail) = reply.fail_with {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(reply.interval) => {}
                }
                yield Err(LoopError::StreamFailure(detail));
            }
        };
        Ok(chunks.boxed())
    }
}

/// Sink that "plays" for a fixed time, or fails.
pub struct ScriptedSink {
    duration: Duration,
    failure: Option<String>,
    plays: AtomicUsize,
    stops: AtomicUsize,
}

impl ScriptedSink {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            failure: None,
            plays: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn failing(detail: &str) -> Self {
        Self {
            failure: Some(detail.to_string()),
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for ScriptedSink {
    async fn play(&self, _clip: &AudioClip) -> LoopResult<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if let Some(detail) = &self.failure {
            return Err(LoopError::PlaybackFailure(detail.clone()));
        }
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tail_is_delivered_on_stop() {
        let recognizer = ScriptedRecognizer::new(vec![vec![
            ScriptStep::partial("how ar"),
            ScriptStep::wait_ms(5_000),
            ScriptStep::partial("never"),
            ScriptStep::OnStop,
            ScriptStep::final_text("how are you"),
        ]]);
        let mut stream = recognizer.start("en-US").await.unwrap();
        assert_eq!(
            stream.events.recv().await,
            Some(RecognitionEvent::Partial("how ar".into()))
        );
        stream.stop.cancel();
        assert_eq!(
            stream.events.recv().await,
            Some(RecognitionEvent::Final("how are you".into()))
        );
        assert_eq!(stream.events.recv().await, None);
        assert_eq!(recognizer.starts(), 1);
    }

    #[tokio::test]
    async fn failing_start_reports_capture_failure() {
        let recognizer = ScriptedRecognizer::failing_start("permission denied");
        let err = recognizer.start("en-US").await.err().unwrap();
        assert!(matches!(err, LoopError::CaptureFailure(_)));
        assert_eq!(recognizer.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn generator_records_requests_and_honours_cancel() {
        let generator = ScriptedGenerator::new(vec![ScriptedReply::chunks(["a", "ab", "abc"])]);
        let cancel = CancellationToken::new();
        let request = GenerationRequest {
            messages: Vec::new(),
            system_prompt: String::new(),
            language: "en-US".into(),
        };
        let mut stream = generator.generate(request, cancel.clone()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        cancel.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(generator.requests().len(), 1);
    }
}
