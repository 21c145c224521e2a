//! Session State: the single record deciding which operation may start next.

use crate::error::{LoopError, LoopResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the loop is doing right now. Exactly one mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Idle,
    Listening,
    Sending,
    Streaming,
    Speaking,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Listening => "listening",
            Mode::Sending => "sending",
            Mode::Streaming => "streaming",
            Mode::Speaking => "speaking",
        }
    }

    /// Whether `self -> to` is a legal edge.
    pub fn can_transition(self, to: Mode) -> bool {
        use Mode::*;
        match (self, to) {
            (_, Idle) => true,
            (Idle, Listening) | (Listening, Listening) => true,
            // Sending is reachable from everywhere: it is also the interrupt target.
            (_, Sending) => true,
            (Sending, Streaming) => true,
            (Streaming, Speaking) | (Streaming, Listening) => true,
            (Speaking, Listening) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per active conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub mode: Mode,
    pub auto_loop: bool,
    pub pending_transcript: String,
    /// Recognition is winding down while its final transcript is dispatched.
    /// The only permitted overlap with `Sending`.
    pub listening_ending: bool,
}

impl SessionState {
    pub fn new(auto_loop: bool) -> Self {
        Self {
            mode: Mode::Idle,
            auto_loop,
            pending_transcript: String::new(),
            listening_ending: false,
        }
    }

    /// Move to `to`, returning the previous mode.
    pub fn transition(&mut self, to: Mode) -> LoopResult<Mode> {
        let from = self.mode;
        if !from.can_transition(to) {
            return Err(LoopError::InvalidTransition { from, to });
        }
        self.mode = to;
        if to != Mode::Listening {
            self.pending_transcript.clear();
        }
        Ok(from)
    }

    pub fn is_listening(&self) -> bool {
        self.mode == Mode::Listening
    }

    pub fn is_streaming(&self) -> bool {
        self.mode == Mode::Streaming
    }

    pub fn is_idle(&self) -> bool {
        self.mode == Mode::Idle
    }

    /// True while a reply is being requested, streamed or spoken.
    pub fn is_busy(&self) -> bool {
        matches!(self.mode, Mode::Sending | Mode::Streaming | Mode::Speaking)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(false)
    }
}
