//! Speech synthesis over an OpenAI-compatible `/audio/speech` endpoint.

use crate::playback::{AudioClip, SpeechSynthesizer};
use async_trait::async_trait;
use parley_core::{LoopError, LoopResult, SpeechConfig, VoiceProfile};
use std::time::Duration;
use tracing::debug;

/// Production TTS backend (OpenAI, OpenRouter or any compatible service).
#[derive(Debug, Clone)]
pub struct OpenRouterTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    client: reqwest::Client,
}

impl OpenRouterTts {
    pub fn new(config: &SpeechConfig) -> LoopResult<Self> {
        let api_key = config.resolve_tts_key().ok_or_else(|| {
            LoopError::Config(
                "speech synthesis requires speech.api_key, TTS_API_KEY or OPENROUTER_API_KEY"
                    .to_string(),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LoopError::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.tts_model.clone(),
            client,
        })
    }

    fn request_body(&self, text: &str, voice: &VoiceProfile) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice.voice_id(),
            "speed": voice.speed,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenRouterTts {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> LoopResult<AudioClip> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(AudioClip::empty());
        }
        let url = format!("{}/audio/speech", self.base_url);
        debug!(voice = %voice.voice_id(), chars = text.len(), "Synthesizing reply");
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, voice))
            .send()
            .await
            .map_err(|e| LoopError::PlaybackFailure(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LoopError::PlaybackFailure(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| LoopError::PlaybackFailure(e.to_string()))?;
        Ok(AudioClip::new(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_uses_profile_voice_and_speed() {
        let config = SpeechConfig {
            api_key: Some("k".into()),
            ..SpeechConfig::default()
        };
        let tts = OpenRouterTts::new(&config).unwrap();
        let voice = VoiceProfile {
            persona: Some("deep".into()),
            voice: None,
            speed: 1.25,
        };
        let body = tts.request_body("Hi there!", &voice);
        assert_eq!(body["voice"], "onyx");
        assert_eq!(body["model"], "tts-1");
        assert_eq!(body["speed"], 1.25);
    }

    #[tokio::test]
    async fn blank_text_needs_no_request() {
        let config = SpeechConfig {
            api_key: Some("k".into()),
            api_url: "http://127.0.0.1:9".into(),
            ..SpeechConfig::default()
        };
        let tts = OpenRouterTts::new(&config).unwrap();
        let clip = tts.synthesize("   ", &VoiceProfile::default()).await.unwrap();
        assert!(clip.is_empty());
    }
}
