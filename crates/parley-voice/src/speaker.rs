//! Speaker output through rodio.
//!
//! `rodio::OutputStream` is not `Send`, so a dedicated thread owns the device
//! and takes play/stop commands over a channel.

use crate::playback::{AudioClip, AudioSink};
use async_trait::async_trait;
use parley_core::{LoopError, LoopResult};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::io::Cursor;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const END_POLL: Duration = Duration::from_millis(20);

enum SinkCommand {
    Play {
        bytes: Vec<u8>,
        done: oneshot::Sender<LoopResult<()>>,
    },
    Stop,
}

/// Default output device.
pub struct RodioSink {
    commands: mpsc::Sender<SinkCommand>,
}

impl RodioSink {
    pub fn new() -> LoopResult<Self> {
        let (commands, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name("parley-speaker".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(LoopError::PlaybackFailure(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!("🔊 Speaker ready");
                output_loop(&handle, rx);
            })
            .map_err(|e| LoopError::PlaybackFailure(format!("speaker thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| LoopError::PlaybackFailure("speaker thread exited".to_string()))??;
        Ok(Self { commands })
    }
}

fn output_loop(handle: &OutputStreamHandle, rx: mpsc::Receiver<SinkCommand>) {
    let mut next = rx.recv().ok();
    while let Some(command) = next.take() {
        let SinkCommand::Play { bytes, done } = command else {
            next = rx.recv().ok();
            continue;
        };
        let sink = match start_clip(handle, bytes) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = done.send(Err(e));
                next = rx.recv().ok();
                continue;
            }
        };
        loop {
            match rx.recv_timeout(END_POLL) {
                Ok(SinkCommand::Stop) => {
                    sink.stop();
                    let _ = done.send(Ok(()));
                    debug!("Speaker halted");
                    next = rx.recv().ok();
                    break;
                }
                Ok(play @ SinkCommand::Play { .. }) => {
                    sink.stop();
                    let _ = done.send(Ok(()));
                    next = Some(play);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if sink.empty() {
                        let _ = done.send(Ok(()));
                        next = rx.recv().ok();
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    sink.stop();
                    return;
                }
            }
        }
    }
}

fn start_clip(handle: &OutputStreamHandle, bytes: Vec<u8>) -> LoopResult<Sink> {
    let sink = Sink::try_new(handle).map_err(|e| LoopError::PlaybackFailure(e.to_string()))?;
    let source = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| LoopError::PlaybackFailure(format!("Decode failed: {}", e)))?;
    sink.append(source);
    Ok(sink)
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, clip: &AudioClip) -> LoopResult<()> {
        if clip.is_empty() {
            return Ok(());
        }
        let (done, finished) = oneshot::channel();
        self.commands
            .send(SinkCommand::Play {
                bytes: clip.bytes.clone(),
                done,
            })
            .map_err(|_| LoopError::PlaybackFailure("speaker thread exited".to_string()))?;
        finished
            .await
            .map_err(|_| LoopError::PlaybackFailure("speaker thread exited".to_string()))?
    }

    fn stop(&self) {
        if self.commands.send(SinkCommand::Stop).is_err() {
            warn!("Speaker thread is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires an audio output device"]
    async fn stop_without_playback_is_harmless() {
        let sink = RodioSink::new().unwrap();
        sink.stop();
        sink.stop();
        sink.play(&AudioClip::empty()).await.unwrap();
    }
}
