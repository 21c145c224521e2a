//! Microphone capture using CPAL
//!
//! The capture callback runs on the audio driver's thread; it only slices the
//! incoming samples into fixed-size frames and hands them off.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use parley_core::{LoopError, LoopResult};
use std::sync::mpsc;
use tracing::{info, warn};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Frame size in samples (default: 480 for 30ms at 16kHz)
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 480,
        }
    }
}

/// What the capture callback reports.
#[derive(Debug, Clone)]
pub enum CaptureMessage {
    /// One frame of samples (f32, -1.0..1.0).
    Frame(Vec<f32>),
    /// The device failed (unplugged, permission revoked...).
    DeviceError(String),
}

fn capture_error(err: impl std::fmt::Display) -> LoopError {
    LoopError::CaptureFailure(err.to_string())
}

/// Default input device opened with our stream config.
pub struct AudioCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> LoopResult<Self> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} channels)",
            config.sample_rate, config.channels
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| LoopError::CaptureFailure("No input device available".to_string()))?;

        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        // Fails early when microphone access is denied.
        device.default_input_config().map_err(capture_error)?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start the stream. Frames and device errors go to `tx` until the stream is dropped.
    pub fn start(self, tx: mpsc::Sender<CaptureMessage>) -> LoopResult<Stream> {
        let frame_size = self.config.frame_size;
        let mut frame = Vec::with_capacity(frame_size);
        let frames_tx = tx.clone();

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        frame.push(sample);
                        if frame.len() >= frame_size {
                            let full = std::mem::replace(&mut frame, Vec::with_capacity(frame_size));
                            if frames_tx.send(CaptureMessage::Frame(full)).is_err() {
                                return;
                            }
                        }
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                    let _ = tx.send(CaptureMessage::DeviceError(err.to_string()));
                },
                None,
            )
            .map_err(capture_error)?;

        stream.play().map_err(capture_error)?;
        info!("✅ Audio capture started");
        Ok(stream)
    }

    /// Names of the available input devices.
    pub fn list_input_devices() -> LoopResult<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(capture_error)?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_size, 480);
    }

    #[test]
    #[ignore = "requires an audio input device"]
    fn lists_input_devices() {
        let devices = AudioCapture::list_input_devices().unwrap();
        println!("Available input devices: {:?}", devices);
    }
}
