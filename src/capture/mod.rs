//! Camera and audio capture sources
//!
//! Source traits plus the concrete inputs: local webcams (nokhwa), network
//! streams (ffmpeg subprocess) and microphones (cpal). Hardware backends are
//! behind the `webcam` and `microphone` features.

pub mod network;
pub mod traits;
pub mod transform;

#[cfg(feature = "microphone")]
pub mod microphone;

#[cfg(feature = "webcam")]
pub mod webcam;

use crate::config::CameraSource;
use crate::utils::ErrorKind;
use thiserror::Error;

pub use network::NetworkSource;
pub use traits::{
    AudioChunk, AudioDeviceInfo, AudioOpener, AudioSource, CameraInfo, Frame, FrameSource, Image,
    SourceOpener,
};
pub use transform::Transform;

/// Errors raised by capture sources
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Unsupported source: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Taxonomy bucket for status reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::SourceUnavailable(_) | CaptureError::Unsupported(_) => {
                ErrorKind::SourceUnavailable
            }
            CaptureError::StreamInterrupted(_) | CaptureError::Io(_) => {
                ErrorKind::StreamInterrupted
            }
        }
    }
}

/// Opens real sources: network URLs always, local devices with the `webcam`
/// feature
#[derive(Debug, Clone, Default)]
pub struct DeviceOpener {
    /// Read timeout handed to network streams
    pub network_timeout_ms: u64,
}

impl DeviceOpener {
    pub fn new() -> Self {
        Self {
            network_timeout_ms: network::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl SourceOpener for DeviceOpener {
    fn open(&self, source: &CameraSource) -> Result<Box<dyn FrameSource>, CaptureError> {
        match source {
            CameraSource::Network { url } => Ok(Box::new(NetworkSource::open(
                url,
                self.network_timeout_ms,
            )?)),
            #[cfg(feature = "webcam")]
            CameraSource::Device { index } => Ok(Box::new(webcam::WebcamSource::open(*index)?)),
            #[cfg(not(feature = "webcam"))]
            CameraSource::Device { index } => Err(CaptureError::Unsupported(format!(
                "device {} (built without the webcam feature)",
                index
            ))),
        }
    }
}

/// Enumerate local cameras
pub fn list_cameras() -> Vec<CameraInfo> {
    #[cfg(feature = "webcam")]
    {
        webcam::list_cameras()
    }
    #[cfg(not(feature = "webcam"))]
    {
        Vec::new()
    }
}

/// Enumerate audio input devices
pub fn list_audio_devices() -> Vec<AudioDeviceInfo> {
    #[cfg(feature = "microphone")]
    {
        microphone::list_input_devices()
    }
    #[cfg(not(feature = "microphone"))]
    {
        Vec::new()
    }
}
