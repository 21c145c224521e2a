//! Speech-to-Text (STT): turn microphone `AudioTurn`s into text.
//!
//! `MicRecognizer` hands each committed turn to an `SttBackend` and reports the
//! result as a final recognition event.

use crate::turn::AudioTurn;
use async_trait::async_trait;
use parley_core::{LoopError, LoopResult, SpeechConfig};
use std::time::Duration;

/// Backend for converting one turn of PCM into text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe one turn. Returns an empty string when nothing intelligible was said.
    async fn transcribe(&self, turn: &AudioTurn, language: &str) -> LoopResult<String>;
}

/// Encode f32 PCM (mono) as 16-bit WAV for upload.
pub fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Primary subtag of a BCP-47 tag ("en-US" -> "en"), as transcription APIs expect.
fn iso_language(language: &str) -> &str {
    language.split(['-', '_']).next().unwrap_or(language)
}

/// Production STT backend: OpenAI-compatible `/audio/transcriptions`.
#[derive(Debug, Clone)]
pub struct OpenRouterStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// whisper-1, gpt-4o-transcribe, ...
    pub model: String,
    client: reqwest::Client,
}

impl OpenRouterStt {
    pub fn new(config: &SpeechConfig) -> LoopResult<Self> {
        let api_key = config.resolve_stt_key().ok_or_else(|| {
            LoopError::Config(
                "transcription requires speech.api_key, STT_API_KEY or OPENROUTER_API_KEY"
                    .to_string(),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LoopError::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.stt_model.clone(),
            client,
        })
    }
}

#[async_trait]
impl SttBackend for OpenRouterStt {
    async fn transcribe(&self, turn: &AudioTurn, language: &str) -> LoopResult<String> {
        if turn.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(&turn.samples, turn.sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| LoopError::StreamFailure(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", iso_language(language).to_string());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| LoopError::StreamFailure(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LoopError::StreamFailure(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| LoopError::StreamFailure(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}
