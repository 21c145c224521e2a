//! Streaming chat completions against an OpenAI-compatible endpoint (OpenRouter by default).

use crate::reply::{ChunkMode, TextGenerator};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parley_core::{GenerationRequest, LlmConfig, LoopError, LoopResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Error(String),
}

/// Incremental `data:` line decoder. Network chunks may split lines (and UTF-8
/// sequences) anywhere, so incomplete tails are kept for the next push.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = decode_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the body has ended without a trailing newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest);
        decode_line(line.trim())
    }
}

fn decode_line(line: &str) -> Option<SseEvent> {
    // Blank separators and ": OPENROUTER PROCESSING" keep-alive comments.
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let json: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return Some(SseEvent::Error(format!("malformed stream event: {}", e))),
    };
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Some(SseEvent::Error(message));
    }
    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Delta(s.to_string()))
}

/// Production text generator: `POST {api_url}/chat/completions` with `stream: true`.
#[derive(Debug, Clone)]
pub struct OpenRouterGenerator {
    pub api_url: String,
    api_key: String,
    pub model: String,
    pub temperature: f32,
    client: reqwest::Client,
}

impl OpenRouterGenerator {
    /// Build from config. Fails when no API key is configured.
    pub fn new(config: &LlmConfig) -> LoopResult<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            LoopError::Config(
                "text generation requires llm.api_key, OPENROUTER_API_KEY or PARLEY_LLM_API_KEY"
                    .to_string(),
            )
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LoopError::Config(e.to_string()))?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            client,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system_instruction(&request.system_prompt, &request.language),
        })];
        for turn in &request.messages {
            messages.push(serde_json::json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
        })
    }
}

fn system_instruction(system_prompt: &str, language: &str) -> String {
    format!(
        "{}\n\nReply in the language identified by \"{}\".",
        system_prompt.trim(),
        language
    )
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Delta
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> LoopResult<BoxStream<'static, LoopResult<String>>> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = self.request_body(&request);
        debug!(model = %self.model, turns = request.messages.len(), "Sending chat request");

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Parley")
            .json(&body)
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(futures::stream::empty().boxed()),
            res = send => res.map_err(|e| LoopError::StreamFailure(format!("Request failed: {}", e)))?,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LoopError::StreamFailure(format!(
                "API error {}: {}",
                status,
                detail.trim()
            )));
        }
        info!(%status, "🌊 Reply stream open");

        let mut bytes = Box::pin(response.bytes_stream());
        let chunks = async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            let mut done = false;
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| LoopError::StreamFailure(format!("Stream error: {}", e)))?;
                for event in decoder.push(&chunk) {
                    match event {
                        SseEvent::Delta(text) => {
                            yield text;
                        }
                        SseEvent::Done => done = true,
                        SseEvent::Error(message) => {
                            Err::<(), _>(LoopError::StreamFailure(message))?;
                        }
                    }
                    if done {
                        break;
                    }
                }
                if done {
                    break;
                }
            }
            if !done {
                match decoder.finish() {
                    Some(SseEvent::Delta(text)) => {
                        yield text;
                    }
                    Some(SseEvent::Error(message)) => {
                        Err::<(), _>(LoopError::StreamFailure(message))?;
                    }
                    _ => {}
                }
            }
        };
        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ChatRole, ChatTurn};

    #[test]
    fn decodes_deltas_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let first = decoder.push(b": OPENROUTER PROCESSING\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: {\"choi");
        assert_eq!(first, vec![SseEvent::Delta("Hi".into())]);

        let second = decoder.push(b"ces\":[{\"delta\":{\"content\":\" there\"}}]}\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(
            second,
            vec![SseEvent::Delta(" there".into()), SseEvent::Done]
        );
    }

    #[test]
    fn keeps_multibyte_characters_intact() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        let split = line.len() - 7; // inside the two-byte 'é'
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(
            decoder.push(&line[split..]),
            vec![SseEvent::Delta("café".into())]
        );
    }

    #[test]
    fn reports_service_errors_and_garbage() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"error\":{\"message\":\"rate limited\"}}\ndata: not json\n");
        assert_eq!(events[0], SseEvent::Error("rate limited".into()));
        assert!(matches!(&events[1], SseEvent::Error(m) if m.starts_with("malformed")));
    }

    #[test]
    fn role_only_deltas_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n");
        assert!(events.is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn body_carries_system_prompt_language_and_history() {
        let config = LlmConfig {
            api_key: Some("test-key".into()),
            ..LlmConfig::default()
        };
        let generator = OpenRouterGenerator::new(&config).unwrap();
        let request = GenerationRequest {
            messages: vec![
                ChatTurn::new(ChatRole::User, "Hello"),
                ChatTurn::new(ChatRole::Assistant, "Hi there!"),
                ChatTurn::new(ChatRole::User, "Bonjour"),
            ],
            system_prompt: "Be brief.".into(),
            language: "fr-FR".into(),
        };
        let body = generator.request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"].as_array().unwrap().len(), 4);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("fr-FR"));
        assert_eq!(body["messages"][3]["content"], "Bonjour");
    }
}
