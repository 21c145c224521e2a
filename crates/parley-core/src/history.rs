//! Conversation context sent along with each utterance.

use crate::model::{Message, MessageKind, Sender};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything the text generation service needs for one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Prior turns followed by the new user utterance.
    pub messages: Vec<ChatTurn>,
    pub system_prompt: String,
    pub language: String,
}

impl GenerationRequest {
    /// The utterance this request answers.
    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|t| t.role == ChatRole::User)
            .map(|t| t.content.as_str())
    }
}

/// Bounded window of finalized turns, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ChatTurn>,
    limit: usize,
}

impl ConversationHistory {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            turns: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    /// Record a finalized message. Error notices and empty replies are skipped.
    pub fn record(&mut self, message: &Message) {
        if message.kind == MessageKind::Error || message.text().trim().is_empty() {
            return;
        }
        let role = match message.sender {
            Sender::User => ChatRole::User,
            Sender::Assistant => ChatRole::Assistant,
        };
        self.push(ChatTurn::new(role, message.text()));
    }

    /// Build the request for a reply to the most recently recorded turn.
    pub fn request(&self, system_prompt: &str, language: &str) -> GenerationRequest {
        GenerationRequest {
            messages: self.turns.iter().cloned().collect(),
            system_prompt: system_prompt.to_string(),
            language: language.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Utterance;

    #[test]
    fn evicts_oldest_turns() {
        let mut history = ConversationHistory::new(3);
        for i in 0..5 {
            history.push(ChatTurn::new(ChatRole::User, format!("turn {i}")));
        }
        let request = history.request("prompt", "en-US");
        let contents: Vec<_> = request.messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[test]
    fn skips_error_notices_and_blank_replies() {
        let mut history = ConversationHistory::new(10);
        history.record(&Message::from_utterance(&Utterance::typed("Hello")));
        history.record(&Message::error_notice("offline"));
        let mut blank = Message::assistant_streaming();
        blank.finish();
        history.record(&blank);
        assert_eq!(history.len(), 1);

        let request = history.request("Be brief.", "fr-FR");
        assert_eq!(request.latest_user_text(), Some("Hello"));
        assert_eq!(request.language, "fr-FR");
        assert_eq!(request.system_prompt, "Be brief.");
    }
}
