//! # parley-voice - the voice interaction loop
//!
//! Listen, send, stream, speak, and listen again. The [`InteractionLoop`]
//! owns the session and drives four adapters through one task:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Interaction Loop                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐         │
//! │  │ Recognition  │→ │  Transcript  │→ │    Reply     │         │
//! │  │   Session    │  │    Buffer    │  │   Streamer   │         │
//! │  └──────────────┘  └──────────────┘  └──────────────┘         │
//! │         ↑                                    ↓                 │
//! │         │            auto-loop       ┌──────────────┐         │
//! │         └────────────────────────────│   Playback   │         │
//! │                                      │  Controller  │         │
//! │                                      └──────────────┘         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backends: OpenAI-compatible HTTP for chat, TTS and STT. With the `device`
//! feature, a cpal microphone with WebRTC VAD and a rodio speaker.

pub mod interaction;
pub mod openrouter;
pub mod playback;
pub mod recognition;
pub mod reply;
pub mod scripted;
pub mod stt;
pub mod tts;
pub mod turn;

#[cfg(feature = "device")]
pub mod audio;
#[cfg(feature = "device")]
pub mod mic;
#[cfg(feature = "device")]
pub mod speaker;
#[cfg(feature = "device")]
pub mod vad;

pub use interaction::{
    Adapters, InteractionLoop, LoopCommand, LoopEvent, LoopHandle, NoticeKind,
};
pub use openrouter::{OpenRouterGenerator, SseDecoder, SseEvent};
pub use playback::{
    AudioClip, AudioSink, NullSink, PlaybackController, PlaybackEvent, PlaybackOutcome,
    SilentSynthesizer, SpeechSynthesizer,
};
pub use recognition::{
    RecognitionEvent, RecognitionSession, RecognitionStream, SessionEvent, SpeechRecognizer,
    UnsupportedRecognizer,
};
pub use reply::{ChunkMode, EchoGenerator, ReplyStream, ReplyStreamer, TextChunk, TextGenerator};
pub use scripted::{ScriptStep, ScriptedGenerator, ScriptedRecognizer, ScriptedReply, ScriptedSink};
pub use stt::{pcm_to_wav, OpenRouterStt, SttBackend};
pub use tts::OpenRouterTts;
pub use turn::{AudioTurn, TurnConfig, TurnDetector, TurnEvent};

#[cfg(feature = "device")]
pub use audio::{AudioCapture, AudioConfig, CaptureMessage};
#[cfg(feature = "device")]
pub use mic::{MicConfig, MicRecognizer};
#[cfg(feature = "device")]
pub use speaker::RodioSink;
#[cfg(feature = "device")]
pub use vad::{VadConfig, VadDetector};
