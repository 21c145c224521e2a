//! Conversation configuration.
//!
//! Everything the loop needs to know about the user's preferences is passed in
//! at construction: language, system prompt and voice profile live for one
//! conversation session, not for the process.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_CONFIG | config/parley.toml | Optional TOML file loaded before env overrides. |
//! | PARLEY_LANGUAGE | en-US | Recognition language and reply language hint. |
//! | PARLEY_SYSTEM_PROMPT | (built in) | System prompt for text generation. |
//! | PARLEY_SPEECH_OUTPUT | true | Speak finished replies. |
//! | PARLEY_AUTO_LOOP | false | Re-arm listening after every reply. |
//! | PARLEY_HISTORY_LIMIT | 20 | Prior turns sent as context. |
//! | PARLEY_NO_SPEECH_TIMEOUT_MS | 8000 | Silence before NoSpeechDetected (0 = never). |
//! | PARLEY_VOICE__PERSONA / PARLEY_VOICE__VOICE | - | Voice profile. |
//! | PARLEY_LLM__API_KEY / PARLEY_SPEECH__API_KEY | - | Service keys (env fallbacks below). |

use crate::error::{LoopError, LoopResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/parley.toml";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. \
    Answer in short, natural sentences that sound good when read aloud. \
    Avoid markdown, lists and code blocks.";

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_history_limit() -> usize {
    20
}

fn default_no_speech_timeout_ms() -> u64 {
    8000
}

fn default_speed() -> f32 {
    1.0
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "meta-llama/llama-3.3-70b-instruct".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_speech_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

/// How replies should sound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Character preset (warm, calm, deep, bright, crisp, storyteller). Picks a voice when `voice` is unset.
    #[serde(default)]
    pub persona: Option<String>,
    /// Explicit synthesis voice id (alloy, echo, fable, onyx, nova, shimmer, ...).
    #[serde(default)]
    pub voice: Option<String>,
    /// Playback speed multiplier.
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            persona: None,
            voice: None,
            speed: default_speed(),
        }
    }
}

impl VoiceProfile {
    /// Voice id sent to the synthesis service.
    pub fn voice_id(&self) -> String {
        if let Some(v) = self.voice.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            return v.to_string();
        }
        persona_to_voice(self.persona.as_deref()).to_string()
    }
}

fn persona_to_voice(persona: Option<&str>) -> &'static str {
    let p = match persona {
        Some(p) => p.trim(),
        None => return "shimmer",
    };
    if p.eq_ignore_ascii_case("warm") {
        "shimmer"
    } else if p.eq_ignore_ascii_case("calm") {
        "nova"
    } else if p.eq_ignore_ascii_case("deep") {
        "onyx"
    } else if p.eq_ignore_ascii_case("bright") {
        "echo"
    } else if p.eq_ignore_ascii_case("crisp") {
        "alloy"
    } else if p.eq_ignore_ascii_case("storyteller") {
        "fable"
    } else {
        "shimmer"
    }
}

/// Text generation service (OpenAI-compatible chat completions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    /// Falls back to OPENROUTER_API_KEY, then PARLEY_LLM_API_KEY.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_url(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        non_empty(self.api_key.clone())
            .or_else(|| env_opt_string("OPENROUTER_API_KEY"))
            .or_else(|| env_opt_string("PARLEY_LLM_API_KEY"))
    }
}

/// Speech services (OpenAI-compatible `/audio/speech` and `/audio/transcriptions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_url")]
    pub api_url: String,
    /// Falls back to TTS_API_KEY / STT_API_KEY, then OPENROUTER_API_KEY.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_url: default_speech_url(),
            api_key: None,
            tts_model: default_tts_model(),
            stt_model: default_stt_model(),
        }
    }
}

impl SpeechConfig {
    pub fn resolve_tts_key(&self) -> Option<String> {
        non_empty(self.api_key.clone())
            .or_else(|| env_opt_string("TTS_API_KEY"))
            .or_else(|| env_opt_string("OPENROUTER_API_KEY"))
    }

    pub fn resolve_stt_key(&self) -> Option<String> {
        non_empty(self.api_key.clone())
            .or_else(|| env_opt_string("STT_API_KEY"))
            .or_else(|| env_opt_string("OPENROUTER_API_KEY"))
    }
}

/// Per-conversation configuration handed to the interaction loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub voice: VoiceProfile,
    /// Speak finished replies.
    #[serde(default = "default_true")]
    pub speech_output: bool,
    /// Re-arm listening after each reply (hands-free mode).
    #[serde(default)]
    pub auto_loop: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// 0 disables the no-speech timeout.
    #[serde(default = "default_no_speech_timeout_ms")]
    pub no_speech_timeout_ms: u64,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            system_prompt: default_system_prompt(),
            voice: VoiceProfile::default(),
            speech_output: true,
            auto_loop: false,
            history_limit: default_history_limit(),
            no_speech_timeout_ms: default_no_speech_timeout_ms(),
            llm: LlmConfig::default(),
            speech: SpeechConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Default path for the optional config file.
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `PARLEY_CONFIG` (or `config/parley.toml`) plus `PARLEY_*` env overrides.
    pub fn load() -> LoopResult<Self> {
        let path = std::env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        Self::load_from(&path)
    }

    /// Load from a specific file (skipped when missing) plus env overrides.
    pub fn load_from(path: &Path) -> LoopResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let loaded: LoopConfig = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LoopError::Config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> LoopResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LoopError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> LoopResult<()> {
        if self.language.trim().is_empty() {
            return Err(LoopError::Config("language must not be empty".to_string()));
        }
        if self.history_limit == 0 {
            return Err(LoopError::Config("history_limit must be at least 1".to_string()));
        }
        if !(self.voice.speed > 0.0) {
            return Err(LoopError::Config(format!(
                "voice.speed must be positive, got {}",
                self.voice.speed
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(LoopError::Config(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            )));
        }
        Ok(())
    }

    pub fn no_speech_timeout(&self) -> Option<Duration> {
        match self.no_speech_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_opt_string(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}
