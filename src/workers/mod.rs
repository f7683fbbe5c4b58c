//! Long-running capture workers
//!
//! Camera and audio workers run on dedicated threads and only block on their
//! own source reads and backoff sleeps. The training recorder is a tokio task
//! fed by trigger events.

pub mod audio;
pub mod backoff;
pub mod camera;
pub mod pacing;
pub mod training;

pub use audio::{AudioHandle, AudioWorker};
pub use backoff::Backoff;
pub use camera::{CameraHandle, CameraWorker};
pub use pacing::{FpsMeter, FramePacer};
pub use training::TrainingRecorder;
