//! Error types for the conversation loop

use crate::session::Mode;
use thiserror::Error;

/// Result type alias for loop operations
pub type LoopResult<T> = Result<T, LoopError>;

/// Errors that can occur anywhere in the interaction loop
#[derive(Error, Debug)]
pub enum LoopError {
    /// No recognition capability on this platform. Voice input stays disabled.
    #[error("Speech recognition unsupported: {0}")]
    UnsupportedPlatform(String),

    /// Microphone device or permission error. Fatal to the current session.
    #[error("Capture failure: {0}")]
    CaptureFailure(String),

    /// Recognition timed out without hearing anything.
    #[error("No speech detected")]
    NoSpeechDetected,

    /// Text generation failed (network, service status, malformed stream).
    #[error("Reply stream failed: {0}")]
    StreamFailure(String),

    /// Synthesis or playback failed. Always swallowed by the loop.
    #[error("Playback failure: {0}")]
    PlaybackFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: Mode, to: Mode },

    /// A `done` message received another chunk.
    #[error("Message {0} is already finalized")]
    MessageFinalized(uuid::Uuid),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// Only a silent recognition timeout may be retried without the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LoopError::NoSpeechDetected)
    }

    /// Errors after which hands-free mode must not re-arm itself.
    pub fn disables_auto_loop(&self) -> bool {
        matches!(
            self,
            LoopError::UnsupportedPlatform(_) | LoopError::CaptureFailure(_)
        )
    }

    /// Text shown to the user for this error.
    pub fn user_notice(&self) -> String {
        match self {
            LoopError::UnsupportedPlatform(_) => {
                "Voice input is not available on this device.".to_string()
            }
            LoopError::CaptureFailure(detail) => {
                format!("Microphone unavailable ({}). Voice input stopped.", detail)
            }
            LoopError::NoSpeechDetected => {
                "No speech detected. Press the mic button and try again.".to_string()
            }
            LoopError::StreamFailure(detail) => {
                format!("Sorry, the reply could not be completed ({}).", detail)
            }
            other => other.to_string(),
        }
    }
}

/// Recognition error carried inside a recognition event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionFault {
    /// Timed out with no input.
    NoSpeech,
    /// Device or permission failure.
    Capture(String),
}

impl From<RecognitionFault> for LoopError {
    fn from(fault: RecognitionFault) -> Self {
        match fault {
            RecognitionFault::NoSpeech => LoopError::NoSpeechDetected,
            RecognitionFault::Capture(detail) => LoopError::CaptureFailure(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_no_speech_is_recoverable() {
        assert!(LoopError::NoSpeechDetected.is_recoverable());
        assert!(!LoopError::CaptureFailure("denied".into()).is_recoverable());
        assert!(!LoopError::StreamFailure("503".into()).is_recoverable());
    }

    #[test]
    fn capture_and_platform_errors_disable_auto_loop() {
        assert!(LoopError::CaptureFailure("denied".into()).disables_auto_loop());
        assert!(LoopError::UnsupportedPlatform("no engine".into()).disables_auto_loop());
        assert!(!LoopError::NoSpeechDetected.disables_auto_loop());
        assert!(!LoopError::PlaybackFailure("device".into()).disables_auto_loop());
    }

    #[test]
    fn fault_conversion() {
        let err: LoopError = RecognitionFault::Capture("permission denied".into()).into();
        assert!(matches!(err, LoopError::CaptureFailure(ref d) if d == "permission denied"));
        assert!(err.user_notice().contains("permission denied"));
    }
}
