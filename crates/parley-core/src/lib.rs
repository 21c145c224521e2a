//! parley-core: conversation data model shared by the voice loop and its front-ends.
//!
//! Utterances, messages, session state, the transcript buffer, the bounded
//! conversation history, the message store contract, configuration and the
//! error taxonomy. No async runtime here; adapters live in `parley-voice`.

mod config;
mod error;
mod history;
mod model;
mod session;
mod store;
mod transcript;

pub use config::{LlmConfig, LoopConfig, SpeechConfig, VoiceProfile};
pub use error::{LoopError, LoopResult, RecognitionFault};
pub use history::{ChatRole, ChatTurn, ConversationHistory, GenerationRequest};
pub use model::{Message, MessageKind, MessageStatus, Sender, Utterance, UtteranceSource};
pub use session::{Mode, SessionState};
pub use store::{InMemoryMessageStore, MessageStore};
pub use transcript::TranscriptBuffer;
