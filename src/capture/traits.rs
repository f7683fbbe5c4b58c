//! Capture trait definitions
//!
//! Source-agnostic types and traits for camera and audio inputs. Concrete
//! sources (webcam, network stream, microphone, test fixtures) implement these.

use super::CaptureError;
use crate::config::CameraSource;
use serde::{Deserialize, Serialize};

/// An RGB24 image as delivered by a source, before transforms
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB, `width * height * 3` bytes
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Solid-colour image
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::new(width, height, pixels)
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// A transformed, timestamped frame owned by the history and the live bus
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub camera_id: String,
    /// Monotonic clock, microseconds
    pub timestamp_us: u64,
    /// Per-camera sequence number, strictly increasing
    pub sequence: u64,
    pub image: Image,
}

/// One fixed-length block of mono samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub timestamp_us: u64,
    /// Normalized to -1.0..=1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1_000_000 / self.sample_rate as u64
    }
}

/// A live camera stream. Created and used on the camera's own worker thread.
pub trait FrameSource {
    /// Block for the next frame. `Ok(None)` means no frame arrived within the
    /// source's own timeout; `Err` means the stream is gone.
    fn read_frame(&mut self) -> Result<Option<Image>, CaptureError>;

    /// Release the underlying device or connection
    fn close(&mut self) {}
}

/// Opens frame sources; shared so the worker can reopen on reconnect
pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &CameraSource) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// A live audio input delivering fixed-size mono chunks
pub trait AudioSource {
    /// Block for the next chunk of exactly the configured size
    fn read_chunk(&mut self) -> Result<Vec<f32>, CaptureError>;

    fn sample_rate(&self) -> u32;
}

/// Opens the audio input on the audio worker's thread
pub trait AudioOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioSource>, CaptureError>;
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    /// Device name, also used as its id
    pub name: String,

    /// Whether this is the default device
    pub is_default: bool,

    /// Default input sample rate
    pub sample_rate: u32,

    pub channels: u16,
}

/// Information about a camera/webcam
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Device index
    pub index: u32,

    /// Device name
    pub name: String,
}
