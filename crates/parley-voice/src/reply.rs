//! Reply Streamer: a text-generation request as an ordered, cancellable chunk sequence.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parley_core::{GenerationRequest, LoopError, LoopResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a generator's raw pieces relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// Each piece continues the previous ones (token deltas).
    Delta,
    /// Each piece is the whole reply so far.
    Cumulative,
}

/// Text generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Delta
    }

    /// Start generating. `cancel` is the abort signal for the underlying request.
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> LoopResult<BoxStream<'static, LoopResult<String>>>;
}

/// One item of a reply sequence.
#[derive(Debug)]
pub enum TextChunk {
    /// The full reply assembled so far. Replaces whatever was rendered before.
    Text(String),
    /// Terminal failure. Nothing follows it.
    Failed(LoopError),
}

/// A single reply in flight. Finite and not restartable.
pub struct ReplyStream {
    id: u64,
    inner: BoxStream<'static, LoopResult<String>>,
    cancel: CancellationToken,
    mode: ChunkMode,
    assembled: String,
    finished: bool,
}

impl ReplyStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next chunk in emission order, or `None` once the reply is complete or cancelled.
    ///
    /// Cancel-safe. A revoked token is checked before each chunk is handed out,
    /// so nothing is emitted after cancellation.
    pub async fn next_chunk(&mut self) -> Option<TextChunk> {
        loop {
            if self.finished {
                return None;
            }
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(reply = self.id, "Reply stream cancelled");
                    self.finished = true;
                    return None;
                }
                item = self.inner.next() => item,
            };
            if self.cancel.is_cancelled() {
                self.finished = true;
                return None;
            }
            match item {
                None => {
                    self.finished = true;
                    return None;
                }
                Some(Ok(piece)) => {
                    match self.mode {
                        ChunkMode::Delta => {
                            if piece.is_empty() {
                                continue;
                            }
                            self.assembled.push_str(&piece);
                        }
                        ChunkMode::Cumulative => self.assembled = piece,
                    }
                    return Some(TextChunk::Text(self.assembled.clone()));
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(TextChunk::Failed(err));
                }
            }
        }
    }
}

/// Issues replies, keeping at most one live per conversation.
pub struct ReplyStreamer {
    generator: Arc<dyn TextGenerator>,
    current: Option<CancellationToken>,
    issued: u64,
}

impl ReplyStreamer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            current: None,
            issued: 0,
        }
    }

    /// Begin a reply for `request`, revoking the previous one first.
    ///
    /// Nothing is sent until the returned stream is first polled.
    pub fn send(&mut self, request: GenerationRequest, cancel: CancellationToken) -> ReplyStream {
        self.cancel();
        self.issued += 1;
        self.current = Some(cancel.clone());

        let generator = self.generator.clone();
        let mode = generator.chunk_mode();
        let token = cancel.clone();
        let inner = stream::once(async move { generator.generate(request, token).await })
            .flat_map(|started| match started {
                Ok(chunks) => chunks,
                Err(err) => stream::once(async move { Err(err) }).boxed(),
            })
            .boxed();

        info!(reply = self.issued, "📨 Reply requested");
        ReplyStream {
            id: self.issued,
            inner,
            cancel,
            mode,
            assembled: String::new(),
            finished: false,
        }
    }

    /// Revoke the live reply, if any. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(token) = self.current.take() {
            if !token.is_cancelled() {
                debug!(reply = self.issued, "Revoking previous reply");
                token.cancel();
            }
        }
    }
}

/// Offline generator that answers by repeating the user, word by word.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    pub word_delay: Duration,
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self {
            word_delay: Duration::from_millis(60),
        }
    }
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> LoopResult<BoxStream<'static, LoopResult<String>>> {
        let heard = request.latest_user_text().unwrap_or_default().to_string();
        let reply = if heard.is_empty() {
            "I did not catch that.".to_string()
        } else {
            format!("You said: {}", heard)
        };
        let delay = self.word_delay;
        let words: Vec<String> = reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();

        let chunks = async_stream::stream! {
            for word in words {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                yield Ok(word);
            }
        };
        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ChatRole, ChatTurn};
    use tokio_test::{assert_pending, assert_ready, task};

    struct FixedGenerator {
        pieces: Vec<LoopResult<String>>,
        mode: ChunkMode,
    }

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        fn chunk_mode(&self) -> ChunkMode {
            self.mode
        }

        async fn generate(
            &self,
            _request: GenerationRequest,
            _cancel: CancellationToken,
        ) -> LoopResult<BoxStream<'static, LoopResult<String>>> {
            let pieces: Vec<LoopResult<String>> = self
                .pieces
                .iter()
                .map(|p| match p {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(LoopError::StreamFailure(e.to_string())),
                })
                .collect();
            Ok(stream::iter(pieces).boxed())
        }
    }

    struct RefusingGenerator;

    #[async_trait]
    impl TextGenerator for RefusingGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
            _cancel: CancellationToken,
        ) -> LoopResult<BoxStream<'static, LoopResult<String>>> {
            Err(LoopError::StreamFailure("503 Service Unavailable".into()))
        }
    }

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest {
            messages: vec![ChatTurn::new(ChatRole::User, text)],
            system_prompt: "Be brief.".into(),
            language: "en-US".into(),
        }
    }

    async fn collect(stream: &mut ReplyStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            match chunk {
                TextChunk::Text(t) => out.push(t),
                TextChunk::Failed(e) => out.push(format!("failed: {e}")),
            }
        }
        out
    }

    #[tokio::test]
    async fn cumulative_chunks_pass_through_in_order() {
        let generator = FixedGenerator {
            pieces: vec![Ok("Hi".into()), Ok("Hi there".into()), Ok("Hi there!".into())],
            mode: ChunkMode::Cumulative,
        };
        let mut streamer = ReplyStreamer::new(Arc::new(generator));
        let mut reply = streamer.send(request("Hello"), CancellationToken::new());
        assert_eq!(collect(&mut reply).await, vec!["Hi", "Hi there", "Hi there!"]);
        assert!(reply.is_finished());
        assert!(reply.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn deltas_are_accumulated() {
        let generator = FixedGenerator {
            pieces: vec![Ok("Hi".into()), Ok("".into()), Ok(" there".into()), Ok("!".into())],
            mode: ChunkMode::Delta,
        };
        let mut streamer = ReplyStreamer::new(Arc::new(generator));
        let mut reply = streamer.send(request("Hello"), CancellationToken::new());
        assert_eq!(collect(&mut reply).await, vec!["Hi", "Hi there", "Hi there!"]);
    }

    #[tokio::test]
    async fn failure_is_terminal() {
        let generator = FixedGenerator {
            pieces: vec![
                Ok("Hi".into()),
                Err(LoopError::StreamFailure("connection reset".into())),
                Ok("never".into()),
            ],
            mode: ChunkMode::Delta,
        };
        let mut streamer = ReplyStreamer::new(Arc::new(generator));
        let mut reply = streamer.send(request("Hello"), CancellationToken::new());
        let chunks = collect(&mut reply).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].contains("connection reset"));
    }

    #[tokio::test]
    async fn refused_request_surfaces_as_failed_chunk() {
        let mut streamer = ReplyStreamer::new(Arc::new(RefusingGenerator));
        let mut reply = streamer.send(request("Hello"), CancellationToken::new());
        match reply.next_chunk().await {
            Some(TextChunk::Failed(LoopError::StreamFailure(detail))) => {
                assert!(detail.contains("503"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(reply.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn new_send_revokes_the_previous_reply() {
        let generator = FixedGenerator {
            pieces: vec![Ok("one".into()), Ok("two".into())],
            mode: ChunkMode::Delta,
        };
        let mut streamer = ReplyStreamer::new(Arc::new(generator));
        let first_token = CancellationToken::new();
        let mut first = streamer.send(request("A"), first_token.clone());
        assert!(matches!(first.next_chunk().await, Some(TextChunk::Text(t)) if t == "one"));

        let mut second = streamer.send(request("B"), CancellationToken::new());
        assert!(first_token.is_cancelled());
        assert!(first.next_chunk().await.is_none());
        assert_eq!(collect(&mut second).await, vec!["one", "onetwo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_stops_at_cancellation() {
        let mut streamer = ReplyStreamer::new(Arc::new(EchoGenerator::default()));
        let cancel = CancellationToken::new();
        let mut reply = streamer.send(request("ping pong"), cancel.clone());

        let mut next = task::spawn(reply.next_chunk());
        assert_pending!(next.poll());
        tokio::time::advance(Duration::from_millis(61)).await;
        assert!(next.is_woken());
        match assert_ready!(next.poll()) {
            Some(TextChunk::Text(t)) => assert_eq!(t, "You "),
            other => panic!("unexpected {other:?}"),
        }
        drop(next);

        cancel.cancel();
        assert!(reply.next_chunk().await.is_none());
    }
}
