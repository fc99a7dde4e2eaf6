//! Microphone capture pipeline
//!
//! Owns the exclusive microphone between `acquire()` and `stop()`. Frames are
//! handed out one at a time through [`CapturePipeline::next_frame`] so the
//! conversation loop can forward each to whichever session is current when
//! the frame is produced.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Boundary, Error, Result};
use crate::playback::PlaybackScheduler;

/// Why the microphone could not be acquired
#[derive(Debug, thiserror::Error)]
pub enum MicError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no input device")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

impl From<MicError> for Error {
    fn from(e: MicError) -> Self {
        match e {
            MicError::PermissionDenied => Error::PermissionDenied,
            MicError::NotFound => Error::DeviceNotFound,
            MicError::Other(detail) => Error::Capture(detail),
        }
    }
}

/// An exclusive audio input device
#[async_trait]
pub trait Microphone: Send {
    /// Open the device and start producing mono `f32` frames at 16 kHz.
    async fn acquire(&mut self) -> std::result::Result<mpsc::Receiver<Vec<f32>>, MicError>;

    /// Stop producing frames and let go of the device. Safe to call when
    /// nothing is held.
    fn release(&mut self);
}

pub struct CapturePipeline {
    mic: Box<dyn Microphone>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
}

impl CapturePipeline {
    pub fn new(mic: Box<dyn Microphone>) -> Self {
        Self { mic, frames: None }
    }

    pub fn is_active(&self) -> bool {
        self.frames.is_some()
    }

    /// Everything a talk request does before touching the device: barge-in, then
    /// the offline and idempotency checks. Returns whether the microphone
    /// still has to be acquired.
    pub fn prepare(&mut self, playback: &mut PlaybackScheduler, online: bool) -> Result<bool> {
        if playback.interrupt() {
            info!("Barge-in: stopped agent speech");
        }
        if !online {
            return Err(Error::Connectivity(Boundary::Capture));
        }
        if self.is_active() {
            debug!("Capture already active");
            return Ok(false);
        }
        Ok(true)
    }

    /// Acquire the microphone. On failure nothing stays held.
    pub async fn acquire(&mut self) -> Result<()> {
        match self.mic.acquire().await {
            Ok(frames) => {
                info!("Microphone acquired");
                self.frames = Some(frames);
                Ok(())
            }
            Err(e) => {
                warn!("Microphone acquisition failed: {}", e);
                self.mic.release();
                Err(e.into())
            }
        }
    }

    /// Release the microphone. Returns false when capture was not active.
    pub fn stop(&mut self) -> bool {
        match self.frames.take() {
            Some(_) => {
                self.mic.release();
                info!("Capture stopped");
                true
            }
            None => false,
        }
    }

    /// Next captured frame. Pends forever while inactive; `None` means the
    /// device stopped on its own.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        match self.frames.as_mut() {
            Some(frames) => frames.recv().await,
            None => std::future::pending().await,
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
