//! Utterances and messages exchanged in a conversation.

use crate::error::{LoopError, LoopResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an utterance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceSource {
    /// Typed by the user.
    User,
    /// Finalized by speech recognition.
    Recognized,
}

/// One completed unit of user input. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    id: Uuid,
    text: String,
    source: UtteranceSource,
    timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn new(text: impl Into<String>, source: UtteranceSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn typed(text: impl Into<String>) -> Self {
        Self::new(text, UtteranceSource::User)
    }

    pub fn recognized(text: impl Into<String>) -> Self {
        Self::new(text, UtteranceSource::Recognized)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source(&self) -> UtteranceSource {
        self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Done,
}

/// Regular content or a visible error notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Error,
}

/// A rendered conversation entry.
///
/// Assistant replies start out `Streaming` and take each chunk as the full
/// reply so far. They become `Done` exactly once; after that the text and
/// status never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub kind: MessageKind,
    text: String,
    status: MessageStatus,
    audio_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The user's side of an exchange. Already final.
    pub fn from_utterance(utterance: &Utterance) -> Self {
        Self {
            id: utterance.id(),
            sender: Sender::User,
            kind: MessageKind::Text,
            text: utterance.text().to_string(),
            status: MessageStatus::Done,
            audio_ref: None,
            created_at: utterance.timestamp(),
        }
    }

    /// An empty assistant reply waiting for chunks.
    pub fn assistant_streaming() -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: Sender::Assistant,
            kind: MessageKind::Text,
            text: String::new(),
            status: MessageStatus::Streaming,
            audio_ref: None,
            created_at: Utc::now(),
        }
    }

    /// A finished assistant entry reporting a failure to the user.
    pub fn error_notice(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: Sender::Assistant,
            kind: MessageKind::Error,
            text: text.into(),
            status: MessageStatus::Done,
            audio_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn audio_ref(&self) -> Option<&str> {
        self.audio_ref.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    /// Replace the text with the accumulated reply `assembled`.
    pub fn apply_chunk(&mut self, assembled: &str) -> LoopResult<()> {
        if self.status == MessageStatus::Done {
            return Err(LoopError::MessageFinalized(self.id));
        }
        self.text.clear();
        self.text.push_str(assembled);
        Ok(())
    }

    /// Mark the message done. Returns false if it already was.
    pub fn finish(&mut self) -> bool {
        if self.status == MessageStatus::Done {
            return false;
        }
        self.status = MessageStatus::Done;
        true
    }

    /// Link the synthesized audio for this reply. Set at most once.
    pub fn attach_audio(&mut self, audio_ref: impl Into<String>) -> bool {
        if self.audio_ref.is_some() {
            return false;
        }
        self.audio_ref = Some(audio_ref.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_mirrors_utterance() {
        let utterance = Utterance::typed("Hello");
        let message = Message::from_utterance(&utterance);
        assert_eq!(message.id, utterance.id());
        assert_eq!(message.text(), "Hello");
        assert_eq!(message.sender, Sender::User);
        assert_eq!(message.status(), MessageStatus::Done);
    }

    #[test]
    fn chunks_replace_text_until_done() {
        let mut message = Message::assistant_streaming();
        for chunk in ["Hi", "Hi there", "Hi there!"] {
            message.apply_chunk(chunk).unwrap();
        }
        assert_eq!(message.text(), "Hi there!");
        assert!(message.finish());
        assert!(!message.finish());

        let err = message.apply_chunk("Hi there! Late").unwrap_err();
        assert!(matches!(err, LoopError::MessageFinalized(id) if id == message.id));
        assert_eq!(message.text(), "Hi there!");
    }

    #[test]
    fn audio_is_attached_once() {
        let mut message = Message::assistant_streaming();
        message.finish();
        assert!(message.attach_audio("clip-1"));
        assert!(!message.attach_audio("clip-2"));
        assert_eq!(message.audio_ref(), Some("clip-1"));
    }

    #[test]
    fn serializes_status_in_lowercase() {
        let message = Message::error_notice("offline");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["kind"], "error");
        assert_eq!(json["sender"], "assistant");
    }
}
