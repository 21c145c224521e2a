//! Interaction Loop: the conversation state machine.
//!
//! One task owns the Session State and multiplexes four sources in a single
//! `select!`: user commands, recognition events, reply chunks and playback
//! completions. Every start and stop of the microphone, the reply stream and
//! the speaker goes through here, so the three never overlap.
//!
//! ```text
//!   Idle ──start──▶ Listening ──final──▶ Sending ──chunk──▶ Streaming ──done──▶ Speaking
//!    ▲                  ▲                   ▲                   │                  │
//!    │                  └──── auto-loop ────┼───────────────────┴──────────────────┤
//!    └──────────────────── stop / errors ───┴── newest utterance interrupts ───────┘
//! ```

use crate::playback::{
    AudioSink, NullSink, PlaybackController, PlaybackEvent, PlaybackOutcome, SilentSynthesizer,
    SpeechSynthesizer,
};
use crate::recognition::{
    RecognitionEvent, RecognitionSession, SessionEvent, SpeechRecognizer, UnsupportedRecognizer,
};
use crate::reply::{EchoGenerator, ReplyStream, ReplyStreamer, TextChunk, TextGenerator};
use parley_core::{
    ConversationHistory, LoopConfig, LoopError, LoopResult, Message, MessageStore, Mode,
    RecognitionFault, SessionState, TranscriptBuffer, Utterance,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The external services the loop drives.
#[derive(Clone)]
pub struct Adapters {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Arc<dyn AudioSink>,
}

impl Adapters {
    /// No microphone, echoing replies, no audio.
    pub fn offline() -> Self {
        Self {
            recognizer: Arc::new(UnsupportedRecognizer::new()),
            generator: Arc::new(EchoGenerator::default()),
            synthesizer: Arc::new(SilentSynthesizer),
            sink: Arc::new(NullSink),
        }
    }
}

/// User intents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopCommand {
    /// Typed input. Interrupts anything in flight.
    Submit(String),
    /// Mic button on. Interrupts a reply in flight.
    StartListening,
    /// Mic button off: back to idle, auto-loop off, partial transcript dropped.
    StopListening,
    SetAutoLoop(bool),
    SetSpeechOutput(bool),
    /// Silence the reply being spoken.
    StopSpeaking,
    /// Drop the whole conversation.
    Reset,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Hint,
    Error,
}

/// What front-ends render.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    ModeChanged { from: Mode, to: Mode },
    /// Live transcript of the utterance being spoken. Empty once it is dispatched.
    TranscriptUpdated(String),
    /// A message was created or changed. Carries the full current version.
    MessageUpdated(Message),
    Notice { kind: NoticeKind, text: String },
}

/// Cloneable handle for driving a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    commands: mpsc::Sender<LoopCommand>,
    events: broadcast::Sender<LoopEvent>,
    state: watch::Receiver<SessionState>,
}

impl LoopHandle {
    pub async fn send(&self, command: LoopCommand) -> LoopResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LoopError::ChannelClosed("interaction loop has stopped".to_string()))
    }

    pub async fn submit(&self, text: impl Into<String>) -> LoopResult<()> {
        self.send(LoopCommand::Submit(text.into())).await
    }

    pub async fn start_listening(&self) -> LoopResult<()> {
        self.send(LoopCommand::StartListening).await
    }

    pub async fn stop_listening(&self) -> LoopResult<()> {
        self.send(LoopCommand::StopListening).await
    }

    pub async fn set_auto_loop(&self, on: bool) -> LoopResult<()> {
        self.send(LoopCommand::SetAutoLoop(on)).await
    }

    pub async fn set_speech_output(&self, on: bool) -> LoopResult<()> {
        self.send(LoopCommand::SetSpeechOutput(on)).await
    }

    pub async fn stop_speaking(&self) -> LoopResult<()> {
        self.send(LoopCommand::StopSpeaking).await
    }

    pub async fn reset(&self) -> LoopResult<()> {
        self.send(LoopCommand::Reset).await
    }

    pub async fn shutdown(&self) -> LoopResult<()> {
        self.send(LoopCommand::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    /// Latest Session State snapshot.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

struct ActiveReply {
    stream: ReplyStream,
    /// Created on the first chunk.
    message: Option<Uuid>,
}

struct SpeakingReply {
    playback: u64,
    message: Uuid,
}

pub struct InteractionLoop {
    config: LoopConfig,
    state: SessionState,
    speech_output: bool,
    transcript: TranscriptBuffer,
    history: ConversationHistory,
    messages: Vec<Message>,
    store: Arc<dyn MessageStore>,

    recognition: RecognitionSession,
    replies: ReplyStreamer,
    playback: PlaybackController,

    reply: Option<ActiveReply>,
    speaking: Option<SpeakingReply>,
    /// Recognition generation whose final is being dispatched.
    ending_generation: Option<u64>,
    /// A silent timeout already re-armed listening once.
    no_speech_retried: bool,

    commands: mpsc::Receiver<LoopCommand>,
    events: broadcast::Sender<LoopEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl InteractionLoop {
    pub fn new(
        config: LoopConfig,
        adapters: Adapters,
        store: Arc<dyn MessageStore>,
    ) -> (Self, LoopHandle) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (events, _) = broadcast::channel(256);
        let state = SessionState::new(config.auto_loop);
        let (state_tx, state_rx) = watch::channel(state.clone());

        let recognition = RecognitionSession::new(
            adapters.recognizer,
            config.language.clone(),
            config.no_speech_timeout(),
        );
        let replies = ReplyStreamer::new(adapters.generator);
        let playback =
            PlaybackController::new(adapters.synthesizer, adapters.sink, config.voice.clone());

        let handle = LoopHandle {
            commands: commands_tx,
            events: events.clone(),
            state: state_rx,
        };
        let this = Self {
            speech_output: config.speech_output,
            history: ConversationHistory::new(config.history_limit),
            config,
            state,
            transcript: TranscriptBuffer::new(),
            messages: Vec::new(),
            store,
            recognition,
            replies,
            playback,
            reply: None,
            speaking: None,
            ending_generation: None,
            no_speech_retried: false,
            commands,
            events,
            state_tx,
        };
        (this, handle)
    }

    /// Build and run on the current runtime.
    pub fn spawn(
        config: LoopConfig,
        adapters: Adapters,
        store: Arc<dyn MessageStore>,
    ) -> (LoopHandle, JoinHandle<LoopResult<()>>) {
        let (this, handle) = Self::new(config, adapters, store);
        (handle, tokio::spawn(this.run()))
    }

    /// Run until `Shutdown` or every handle is dropped.
    pub async fn run(mut self) -> LoopResult<()> {
        info!(
            language = %self.config.language,
            auto_loop = self.state.auto_loop,
            speech_output = self.speech_output,
            "🔁 Interaction loop running"
        );
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(LoopCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.recognition.next_event() => self.handle_recognition(event).await,
                chunk = next_reply_chunk(&mut self.reply) => self.handle_chunk(chunk).await,
                event = self.playback.next_event() => self.handle_playback(event).await,
            };
            if let Err(e) = step {
                error!("Interaction loop error, returning to idle: {}", e);
                self.force_idle();
            }
        }
        self.interrupt();
        info!("🛑 Interaction loop stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: LoopCommand) -> LoopResult<()> {
        debug!(?command, mode = %self.state.mode, "Command");
        match command {
            LoopCommand::Submit(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(());
                }
                self.dispatch(Utterance::typed(text))
            }
            LoopCommand::StartListening => self.start_listening().await,
            LoopCommand::StopListening => self.manual_stop(),
            LoopCommand::SetAutoLoop(on) => {
                info!(on, "Auto-loop");
                self.state.auto_loop = on;
                self.publish_state();
                Ok(())
            }
            LoopCommand::SetSpeechOutput(on) => {
                info!(on, "Speech output");
                self.speech_output = on;
                if !on {
                    self.stop_speaking().await
                } else {
                    Ok(())
                }
            }
            LoopCommand::StopSpeaking => self.stop_speaking().await,
            LoopCommand::Reset => self.reset(),
            LoopCommand::Shutdown => Ok(()),
        }
    }

    /// Submit an utterance, superseding anything in flight.
    fn dispatch(&mut self, utterance: Utterance) -> LoopResult<()> {
        self.interrupt();
        // The next listening attempt gets its own silent re-arm.
        self.no_speech_retried = false;
        self.set_mode(Mode::Sending)?;

        let message = Message::from_utterance(&utterance);
        self.history.record(&message);
        self.add_message(message);

        let request = self
            .history
            .request(&self.config.system_prompt, &self.config.language);
        let stream = self.replies.send(request, CancellationToken::new());
        self.reply = Some(ActiveReply {
            stream,
            message: None,
        });
        info!(source = ?utterance.source(), "📨 Utterance submitted");
        Ok(())
    }

    /// Revoke the reply in flight, silence playback and stop listening.
    ///
    /// A partially streamed message is marked done as-is.
    fn interrupt(&mut self) {
        if let Some(active) = self.reply.take() {
            active.stream.cancel_token().cancel();
            self.replies.cancel();
            if let Some(id) = active.message {
                self.finalize_message(id);
            }
            info!("⚡ Reply interrupted");
        }
        self.speaking = None;
        self.playback.stop();
        self.recognition.stop();
        if !self.state.listening_ending {
            self.transcript.clear();
        }
    }

    async fn start_listening(&mut self) -> LoopResult<()> {
        if self.state.is_listening() && !self.state.listening_ending {
            return Ok(());
        }
        if self.state.is_busy() {
            self.interrupt();
            self.state.listening_ending = false;
            self.set_mode(Mode::Idle)?;
        }
        self.no_speech_retried = false;
        self.enter_listening().await
    }

    async fn enter_listening(&mut self) -> LoopResult<()> {
        if !self.state.mode.can_transition(Mode::Listening) {
            self.set_mode(Mode::Idle)?;
        }
        self.transcript.clear();
        self.state.listening_ending = false;
        self.ending_generation = None;
        match self.recognition.start().await {
            Ok(generation) => {
                debug!(generation, "Listening");
                self.set_mode(Mode::Listening)
            }
            Err(err) => self.listening_failed(err),
        }
    }

    fn listening_failed(&mut self, err: LoopError) -> LoopResult<()> {
        error!("🎤 Cannot listen: {}", err);
        self.state.auto_loop = false;
        let notice = err.user_notice();
        if !matches!(err, LoopError::UnsupportedPlatform(_)) {
            self.add_message(Message::error_notice(notice.clone()));
        }
        self.emit(LoopEvent::Notice {
            kind: NoticeKind::Error,
            text: notice,
        });
        self.set_mode(Mode::Idle)
    }

    fn manual_stop(&mut self) -> LoopResult<()> {
        info!("✋ Manual stop");
        self.state.auto_loop = false;
        self.state.listening_ending = false;
        self.ending_generation = None;
        self.interrupt();
        self.transcript.clear();
        self.emit(LoopEvent::TranscriptUpdated(String::new()));
        self.set_mode(Mode::Idle)
    }

    async fn stop_speaking(&mut self) -> LoopResult<()> {
        self.playback.stop();
        if self.state.mode != Mode::Speaking {
            return Ok(());
        }
        self.speaking = None;
        self.rearm_or_idle().await
    }

    fn reset(&mut self) -> LoopResult<()> {
        info!("🧹 Conversation reset");
        self.state.listening_ending = false;
        self.ending_generation = None;
        self.interrupt();
        self.transcript.clear();
        self.messages.clear();
        self.history.clear();
        self.store.clear();
        self.no_speech_retried = false;
        self.set_mode(Mode::Idle)?;
        self.emit(LoopEvent::TranscriptUpdated(String::new()));
        self.emit(LoopEvent::Notice {
            kind: NoticeKind::Info,
            text: "Conversation cleared.".to_string(),
        });
        Ok(())
    }

    async fn handle_recognition(&mut self, event: SessionEvent) -> LoopResult<()> {
        let SessionEvent { generation, event } = event;
        let live = self.state.is_listening() && !self.state.listening_ending;
        match event {
            RecognitionEvent::SpeechStarted => {
                if live {
                    self.no_speech_retried = false;
                }
                Ok(())
            }
            RecognitionEvent::Partial(text) => {
                if !live {
                    return Ok(());
                }
                self.no_speech_retried = false;
                let current = self.transcript.apply_partial(&text).to_string();
                self.state.pending_transcript = current.clone();
                self.publish_state();
                self.emit(LoopEvent::TranscriptUpdated(current));
                Ok(())
            }
            RecognitionEvent::Final(text) => {
                if !live {
                    debug!(generation, "Ignoring final result outside listening");
                    return Ok(());
                }
                let Some(text) = self.transcript.apply_final(&text) else {
                    self.state.pending_transcript.clear();
                    return Ok(());
                };
                info!("🗣️ Final transcript received");
                self.no_speech_retried = false;
                self.state.listening_ending = true;
                self.ending_generation = Some(generation);
                self.recognition.stop();
                self.emit(LoopEvent::TranscriptUpdated(String::new()));
                self.dispatch(Utterance::recognized(text))
            }
            RecognitionEvent::Error(RecognitionFault::NoSpeech) => {
                if !live {
                    return Ok(());
                }
                self.recognition.stop();
                if self.state.auto_loop && !self.no_speech_retried {
                    info!("🔁 No speech detected, listening again");
                    self.no_speech_retried = true;
                    return self.enter_listening().await;
                }
                self.transcript.clear();
                self.emit(LoopEvent::Notice {
                    kind: NoticeKind::Hint,
                    text: LoopError::NoSpeechDetected.user_notice(),
                });
                self.set_mode(Mode::Idle)
            }
            RecognitionEvent::Error(RecognitionFault::Capture(detail)) => {
                if !live {
                    warn!(generation, "Capture fault after hand-off: {}", detail);
                    return Ok(());
                }
                self.recognition.stop();
                let err = LoopError::CaptureFailure(detail);
                error!("🎤 {}", err);
                self.state.auto_loop = false;
                let notice = err.user_notice();
                self.add_message(Message::error_notice(notice.clone()));
                self.emit(LoopEvent::Notice {
                    kind: NoticeKind::Error,
                    text: notice,
                });
                self.transcript.clear();
                self.state.listening_ending = false;
                self.set_mode(Mode::Idle)
            }
            RecognitionEvent::Ended => {
                if self.ending_generation == Some(generation) {
                    self.ending_generation = None;
                    self.state.listening_ending = false;
                    self.publish_state();
                    return Ok(());
                }
                if live {
                    warn!(generation, "Recognition ended on its own");
                    self.transcript.clear();
                    return self.set_mode(Mode::Idle);
                }
                Ok(())
            }
        }
    }

    async fn handle_chunk(&mut self, chunk: Option<TextChunk>) -> LoopResult<()> {
        match chunk {
            Some(TextChunk::Text(text)) => self.apply_reply_text(&text),
            Some(TextChunk::Failed(err)) => self.fail_reply(err),
            None => self.complete_reply().await,
        }
    }

    fn apply_reply_text(&mut self, text: &str) -> LoopResult<()> {
        let existing = match &self.reply {
            Some(active) => active.message,
            None => return Ok(()),
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let message = Message::assistant_streaming();
                let id = message.id;
                if let Some(active) = self.reply.as_mut() {
                    active.message = Some(id);
                }
                // Recognition handed off its final; it no longer overlaps.
                self.state.listening_ending = false;
                self.set_mode(Mode::Streaming)?;
                self.add_message(message);
                id
            }
        };
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return Ok(());
        };
        message.apply_chunk(text)?;
        let snapshot = message.clone();
        debug!(chars = text.len(), "Reply chunk applied");
        self.store.record(&snapshot);
        self.emit(LoopEvent::MessageUpdated(snapshot));
        Ok(())
    }

    fn fail_reply(&mut self, err: LoopError) -> LoopResult<()> {
        warn!("🌊 Reply stream failed: {}", err);
        if let Some(id) = self.reply.take().and_then(|active| active.message) {
            self.finalize_message(id);
        }
        self.replies.cancel();
        let notice = err.user_notice();
        self.add_message(Message::error_notice(notice.clone()));
        self.emit(LoopEvent::Notice {
            kind: NoticeKind::Error,
            text: notice,
        });
        self.state.listening_ending = false;
        self.set_mode(Mode::Idle)
    }

    async fn complete_reply(&mut self) -> LoopResult<()> {
        let Some(active) = self.reply.take() else {
            return Ok(());
        };
        info!(reply = active.stream.id(), "✅ Reply complete");
        self.state.listening_ending = false;

        let Some(id) = active.message else {
            return self.rearm_or_idle().await;
        };
        self.finalize_message(id);
        let text = self
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.text().to_string())
            .unwrap_or_default();

        if self.speech_output && !text.trim().is_empty() {
            let playback = self.playback.start(&text);
            self.speaking = Some(SpeakingReply {
                playback,
                message: id,
            });
            return self.set_mode(Mode::Speaking);
        }
        self.rearm_or_idle().await
    }

    async fn handle_playback(&mut self, event: PlaybackEvent) -> LoopResult<()> {
        if self.speaking.as_ref().map(|s| s.playback) != Some(event.id) {
            debug!(playback = event.id, "Ignoring stale playback report");
            return Ok(());
        }
        let Some(speaking) = self.speaking.take() else {
            return Ok(());
        };
        if let Some(audio_ref) = event.audio_ref {
            self.attach_audio(speaking.message, audio_ref);
        }
        match event.outcome {
            PlaybackOutcome::Failed(detail) => {
                warn!("🔇 Speech output failed, carrying on: {}", detail)
            }
            PlaybackOutcome::Completed => debug!(playback = event.id, "Playback finished"),
            PlaybackOutcome::Stopped => {}
        }
        if self.state.mode == Mode::Speaking {
            self.rearm_or_idle().await
        } else {
            Ok(())
        }
    }

    async fn rearm_or_idle(&mut self) -> LoopResult<()> {
        if self.state.auto_loop {
            self.enter_listening().await
        } else {
            self.set_mode(Mode::Idle)
        }
    }

    fn force_idle(&mut self) {
        self.interrupt();
        self.state.listening_ending = false;
        self.ending_generation = None;
        if let Err(e) = self.set_mode(Mode::Idle) {
            error!("Cannot return to idle: {}", e);
        }
    }

    fn add_message(&mut self, message: Message) {
        self.store.record(&message);
        self.emit(LoopEvent::MessageUpdated(message.clone()));
        self.messages.push(message);
    }

    fn finalize_message(&mut self, id: Uuid) {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return;
        };
        if !message.finish() {
            return;
        }
        let snapshot = message.clone();
        self.history.record(&snapshot);
        self.store.record(&snapshot);
        self.emit(LoopEvent::MessageUpdated(snapshot));
    }

    fn attach_audio(&mut self, id: Uuid, audio_ref: String) {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return;
        };
        if message.attach_audio(audio_ref) {
            let snapshot = message.clone();
            self.store.record(&snapshot);
            self.emit(LoopEvent::MessageUpdated(snapshot));
        }
    }

    fn set_mode(&mut self, to: Mode) -> LoopResult<()> {
        let from = self.state.transition(to)?;
        if from != to || to == Mode::Listening {
            info!("🔄 {} -> {}", from, to);
            self.emit(LoopEvent::ModeChanged { from, to });
        }
        self.publish_state();
        Ok(())
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn emit(&self, event: LoopEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn next_reply_chunk(reply: &mut Option<ActiveReply>) -> Option<TextChunk> {
    match reply {
        Some(active) => active.stream.next_chunk().await,
        None => std::future::pending().await,
    }
}
