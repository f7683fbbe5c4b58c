//! Recording system module
//!
//! Turns a trigger into a persisted multi-camera clip:
//! - ClipAssembly freezes each camera's history and collects post-trigger frames
//! - RecordingManager drives one assembly at a time off the trigger queue
//! - ClipWriter encodes per-camera videos and the thumbnail
//! - SessionStore keeps the session folder and its clip metadata

pub mod encoder;
pub mod manager;
pub mod state;
pub mod store;

use thiserror::Error;
use uuid::Uuid;

pub use encoder::{ClipWriter, FfmpegClipWriter};
pub use manager::{ManagerSettings, RecordingManager};
pub use state::{Clip, ClipAssembly, ClipFile, ClipStatus, CollectedClip, RecordingState};
pub use store::SessionStore;

/// Errors from clip encoding and session persistence
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Thumbnail error: {0}")]
    Thumbnail(String),

    #[error("No frames captured for clip")]
    NoFrames,

    #[error("Clip not found: {0}")]
    ClipNotFound(Uuid),
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;
