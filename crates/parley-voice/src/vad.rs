//! Voice Activity Detection using WebRTC VAD

use parley_core::{LoopError, LoopResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (8000, 16000, 32000 or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Aggressiveness (0-3, where 3 filters out the most non-speech)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

impl VadConfig {
    fn vad_mode(&self) -> LoopResult<VadMode> {
        match self.mode {
            0 => Ok(VadMode::Quality),
            1 => Ok(VadMode::LowBitrate),
            2 => Ok(VadMode::Aggressive),
            3 => Ok(VadMode::VeryAggressive),
            other => Err(LoopError::Config(format!("VAD mode must be 0-3, got {}", other))),
        }
    }

    fn vad_rate(&self) -> LoopResult<SampleRate> {
        match self.sample_rate {
            8000 => Ok(SampleRate::Rate8kHz),
            16000 => Ok(SampleRate::Rate16kHz),
            32000 => Ok(SampleRate::Rate32kHz),
            48000 => Ok(SampleRate::Rate48kHz),
            other => Err(LoopError::Config(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                other
            ))),
        }
    }
}

/// Voice activity detector over 30ms frames.
pub struct VadDetector {
    vad: Vad,
    frame_size: usize,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> LoopResult<Self> {
        let mode = config.vad_mode()?;
        let rate = config.vad_rate()?;
        // WebRTC VAD accepts 10, 20 or 30ms frames.
        let frame_size = (config.sample_rate as usize * 30) / 1000;

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);

        info!(
            "🎙️ VAD ready ({}Hz, mode {}, {} samples per frame)",
            config.sample_rate, config.mode, frame_size
        );
        Ok(Self { vad, frame_size })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Whether `frame` (exactly `frame_size` samples) contains speech.
    pub fn is_speech(&mut self, frame: &[f32]) -> LoopResult<bool> {
        if frame.len() != self.frame_size {
            return Err(LoopError::CaptureFailure(format!(
                "Expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }
        let pcm: Vec<i16> = frame
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        let speech = self
            .vad
            .is_voice_segment(&pcm)
            .map_err(|_| LoopError::CaptureFailure("VAD rejected frame".to_string()))?;
        debug!("VAD result: {}", if speech { "SPEECH" } else { "SILENCE" });
        Ok(speech)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_30ms() {
        let detector = VadDetector::new(VadConfig::default()).unwrap();
        assert_eq!(detector.frame_size(), 480);
    }

    #[test]
    fn rejects_unsupported_rates_and_modes() {
        let rate = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(VadDetector::new(rate).is_err());
        let mode = VadConfig {
            mode: 7,
            ..Default::default()
        };
        assert!(VadDetector::new(mode).is_err());
    }

    #[test]
    fn silence_is_not_speech() {
        let mut detector = VadDetector::new(VadConfig::default()).unwrap();
        assert!(!detector.is_speech(&[0.0f32; 480]).unwrap());
        assert!(detector.is_speech(&[0.0f32; 100]).is_err());
    }
}
