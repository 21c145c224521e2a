//! Transcript Buffer: the utterance currently being recognized.

/// Holds the latest partial hypothesis for the current utterance.
///
/// Each partial supersedes the previous one, so the buffer keeps only the
/// newest. A final result is authoritative: it is returned as-is and the
/// buffer starts over.
#[derive(Debug, Clone, Default)]
pub struct TranscriptBuffer {
    partial: String,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a partial result and return the current text.
    pub fn apply_partial(&mut self, text: &str) -> &str {
        self.partial.clear();
        self.partial.push_str(text.trim_start());
        &self.partial
    }

    /// Take a final result. Empty finals yield `None` but still reset.
    pub fn apply_final(&mut self, text: &str) -> Option<String> {
        self.partial.clear();
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }

    pub fn current(&self) -> &str {
        &self.partial
    }

    pub fn is_empty(&self) -> bool {
        self.partial.trim().is_empty()
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_wins_over_partial() {
        let mut buffer = TranscriptBuffer::new();
        assert_eq!(buffer.apply_partial("how"), "how");
        assert_eq!(buffer.apply_partial("how ar"), "how ar");
        assert_eq!(buffer.apply_final("how are you").as_deref(), Some("how are you"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_may_replace_rather_than_extend() {
        let mut buffer = TranscriptBuffer::new();
        buffer.apply_partial("I scream");
        assert_eq!(buffer.apply_partial("ice cream"), "ice cream");
    }

    #[test]
    fn blank_final_resets_without_text() {
        let mut buffer = TranscriptBuffer::new();
        buffer.apply_partial("uh");
        assert_eq!(buffer.apply_final("   "), None);
        assert_eq!(buffer.current(), "");
    }
}
