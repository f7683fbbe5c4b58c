//! Clip state management
//!
//! Defines the per-clip state machine, the persisted clip record, and the
//! in-memory assembly that collects each camera's frames for one trigger.

use crate::buffer::within_window;
use crate::capture::Frame;
use crate::events::{TriggerEvent, TriggerSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Where the recording manager is in assembling a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingState {
    /// Waiting for a trigger
    #[default]
    Idle,
    /// Pre-trigger history captured
    PreBufferFrozen,
    /// Collecting post-trigger frames
    Accumulating,
    /// Encoding and persisting
    Finalizing,
}

/// Outcome of clip assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipStatus {
    Complete,
    /// One or more cameras dropped out or delivered nothing
    Partial,
    /// Encoding or persistence failed after retry
    Failed,
}

/// One camera's encoded video within a clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipFile {
    pub camera_id: String,
    #[serde(default)]
    pub label: String,
    pub path: PathBuf,
    pub frame_count: usize,
    pub start_us: u64,
    pub end_us: u64,
}

/// A persisted multi-camera clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: Uuid,
    /// `shot_0001` style base name shared by every file of the clip
    pub name: String,
    pub shot_number: u32,

    pub trigger_id: Uuid,
    pub trigger_timestamp_us: u64,
    pub confidence: f32,
    pub trigger_source: TriggerSource,

    pub files: Vec<ClipFile>,
    pub primary_camera: Option<String>,
    pub thumbnail: Option<PathBuf>,

    /// Earliest frame across all cameras
    pub start_us: u64,
    /// Latest frame across all cameras
    pub end_us: u64,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,

    pub status: ClipStatus,
    #[serde(default)]
    pub partial_cameras: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,

    /// Tombstone set by mark-not-shot; files are gone but the record stays
    #[serde(default)]
    pub marked_not_shot: bool,
}

impl Clip {
    pub fn is_visible(&self) -> bool {
        !self.marked_not_shot && self.status != ClipStatus::Failed
    }

    pub fn file_for(&self, camera_id: &str) -> Option<&ClipFile> {
        self.files.iter().find(|f| f.camera_id == camera_id)
    }

    /// Primary camera file, or the first file
    pub fn primary_file(&self) -> Option<&ClipFile> {
        self.primary_camera
            .as_deref()
            .and_then(|id| self.file_for(id))
            .or_else(|| self.files.first())
    }

    pub fn total_frames(&self) -> usize {
        self.files.iter().map(|f| f.frame_count).sum()
    }
}

/// Frames gathered for one camera
#[derive(Debug, Clone)]
pub struct CameraTake {
    pub camera_id: String,
    pub label: String,
    pub frames: Vec<Arc<Frame>>,
    last_sequence: Option<u64>,
    /// A frame past the deadline arrived, or the camera dropped
    done: bool,
    /// Camera disconnected before the deadline
    dropped: bool,
}

impl CameraTake {
    fn new(camera_id: String, label: String) -> Self {
        Self {
            camera_id,
            label,
            frames: Vec::new(),
            last_sequence: None,
            done: false,
            dropped: false,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.dropped || self.frames.is_empty()
    }
}

/// Collection state for one trigger
#[derive(Debug)]
pub struct ClipAssembly {
    pub trigger: TriggerEvent,
    /// `trigger - pre`, inclusive
    pub window_start_us: u64,
    /// `trigger + post`, inclusive
    pub deadline_us: u64,
    /// Clock reading when the pre-trigger history was captured
    pub frozen_at_us: Option<u64>,
    takes: Vec<CameraTake>,
    state: RecordingState,
}

impl ClipAssembly {
    pub fn new(
        trigger: TriggerEvent,
        pre_trigger_us: u64,
        post_trigger_us: u64,
        cameras: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let window_start_us = trigger.timestamp_us.saturating_sub(pre_trigger_us);
        let deadline_us = trigger.timestamp_us.saturating_add(post_trigger_us);
        Self {
            trigger,
            window_start_us,
            deadline_us,
            frozen_at_us: None,
            takes: cameras
                .into_iter()
                .map(|(id, label)| CameraTake::new(id, label))
                .collect(),
            state: RecordingState::Idle,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn takes(&self) -> &[CameraTake] {
        &self.takes
    }

    /// Seed a camera's take with its history snapshot
    pub fn freeze(&mut self, camera_id: &str, snapshot: &[Arc<Frame>], now_us: u64) {
        self.frozen_at_us.get_or_insert(now_us);
        self.state = RecordingState::PreBufferFrozen;
        let window = within_window(snapshot, self.window_start_us, self.deadline_us, |f| f.timestamp_us);
        for frame in window {
            self.offer_to(camera_id, frame);
        }
    }

    pub fn start_accumulating(&mut self) {
        self.state = RecordingState::Accumulating;
    }

    /// Offer a live frame. Returns true if it was kept.
    pub fn offer(&mut self, frame: Arc<Frame>) -> bool {
        let camera_id = frame.camera_id.clone();
        self.offer_to(&camera_id, frame)
    }

    fn offer_to(&mut self, camera_id: &str, frame: Arc<Frame>) -> bool {
        let (start, deadline) = (self.window_start_us, self.deadline_us);
        let Some(take) = self.takes.iter_mut().find(|t| t.camera_id == camera_id) else {
            return false;
        };
        if take.done {
            return false;
        }
        // Live frames may repeat what the snapshot already holds
        if take.last_sequence.is_some_and(|seq| frame.sequence <= seq) {
            return false;
        }
        take.last_sequence = Some(frame.sequence);

        if frame.timestamp_us > deadline {
            take.done = true;
            return false;
        }
        if frame.timestamp_us < start {
            return false;
        }
        take.frames.push(frame);
        true
    }

    /// A camera stopped streaming; keep what it delivered
    pub fn camera_lost(&mut self, camera_id: &str) {
        if let Some(take) = self.takes.iter_mut().find(|t| t.camera_id == camera_id) {
            if !take.done {
                tracing::warn!("Camera {} dropped during clip assembly", camera_id);
                take.done = true;
                take.dropped = true;
            }
        }
    }

    /// Every camera has delivered past the deadline or dropped
    pub fn all_done(&self) -> bool {
        self.takes.iter().all(|t| t.done)
    }

    /// Stop collecting. Frames are ordered by timestamp per camera.
    pub fn finish(mut self) -> CollectedClip {
        self.state = RecordingState::Finalizing;
        for take in &mut self.takes {
            take.frames.sort_by_key(|f| f.timestamp_us);
        }
        let partial_cameras = self
            .takes
            .iter()
            .filter(|t| t.is_partial())
            .map(|t| t.camera_id.clone())
            .collect();
        CollectedClip {
            trigger: self.trigger,
            window_start_us: self.window_start_us,
            deadline_us: self.deadline_us,
            takes: self.takes,
            partial_cameras,
        }
    }
}

/// Frames ready for encoding
#[derive(Debug, Clone)]
pub struct CollectedClip {
    pub trigger: TriggerEvent,
    pub window_start_us: u64,
    pub deadline_us: u64,
    pub takes: Vec<CameraTake>,
    pub partial_cameras: Vec<String>,
}

impl CollectedClip {
    pub fn is_empty(&self) -> bool {
        self.takes.iter().all(|t| t.frames.is_empty())
    }

    pub fn take(&self, camera_id: &str) -> Option<&CameraTake> {
        self.takes.iter().find(|t| t.camera_id == camera_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Image;

    fn trigger_at(ts: u64) -> TriggerEvent {
        TriggerEvent {
            id: Uuid::new_v4(),
            timestamp_us: ts,
            confidence: 0.8,
            source: TriggerSource::Heuristic,
            features: None,
        }
    }

    fn frame(camera: &str, seq: u64, ts: u64) -> Arc<Frame> {
        Arc::new(Frame {
            camera_id: camera.to_string(),
            timestamp_us: ts,
            sequence: seq,
            image: Image::filled(2, 2, [0, 0, 0]),
        })
    }

    fn assembly() -> ClipAssembly {
        ClipAssembly::new(
            trigger_at(5_000_000),
            1_000_000,
            2_000_000,
            vec![("a".to_string(), "A".to_string()), ("b".to_string(), String::new())],
        )
    }

    #[test]
    fn test_window_bounds() {
        let a = assembly();
        assert_eq!(a.window_start_us, 4_000_000);
        assert_eq!(a.deadline_us, 7_000_000);
        assert_eq!(a.state(), RecordingState::Idle);
    }

    #[test]
    fn test_freeze_drops_frames_before_window() {
        let mut a = assembly();
        let snapshot = vec![
            frame("a", 1, 3_900_000),
            frame("a", 2, 4_000_000),
            frame("a", 3, 4_900_000),
        ];
        a.freeze("a", &snapshot, 5_001_000);
        assert_eq!(a.state(), RecordingState::PreBufferFrozen);
        assert_eq!(a.frozen_at_us, Some(5_001_000));
        assert_eq!(a.takes()[0].frames.len(), 2);
    }

    #[test]
    fn test_live_frames_dedupe_against_snapshot() {
        let mut a = assembly();
        a.freeze("a", &[frame("a", 10, 4_990_000)], 5_000_000);
        a.start_accumulating();
        assert!(!a.offer(frame("a", 10, 4_990_000)));
        assert!(a.offer(frame("a", 11, 5_020_000)));
        assert!(!a.offer(frame("z", 1, 5_020_000)));
        assert_eq!(a.takes()[0].frames.len(), 2);
    }

    #[test]
    fn test_frame_past_deadline_completes_camera() {
        let mut a = assembly();
        a.start_accumulating();
        assert!(a.offer(frame("a", 1, 7_000_000)));
        assert!(!a.offer(frame("a", 2, 7_033_000)));
        assert!(!a.all_done());
        a.offer(frame("b", 1, 7_100_000));
        assert!(a.all_done());

        let clip = a.finish();
        // b never delivered a frame inside the window
        assert_eq!(clip.partial_cameras, vec!["b".to_string()]);
    }

    #[test]
    fn test_lost_camera_is_partial() {
        let mut a = assembly();
        a.start_accumulating();
        a.offer(frame("a", 1, 5_100_000));
        a.offer(frame("b", 1, 5_100_000));
        a.camera_lost("b");
        assert!(!a.offer(frame("b", 2, 5_200_000)));
        a.offer(frame("a", 2, 7_500_000));
        assert!(a.all_done());

        let clip = a.finish();
        assert_eq!(clip.partial_cameras, vec!["b".to_string()]);
        assert_eq!(clip.take("b").unwrap().frames.len(), 1);
    }

    #[test]
    fn test_finish_sorts_by_timestamp() {
        let mut a = assembly();
        a.freeze("a", &[frame("a", 1, 4_500_000)], 5_000_000);
        a.offer(frame("a", 3, 5_500_000));
        // Out-of-order delivery with a higher sequence
        a.offer(frame("a", 4, 5_400_000));
        let clip = a.finish();
        let ts: Vec<u64> = clip.takes[0].frames.iter().map(|f| f.timestamp_us).collect();
        assert_eq!(ts, vec![4_500_000, 5_400_000, 5_500_000]);
    }

    #[test]
    fn test_clip_visibility() {
        let mut clip = Clip {
            id: Uuid::new_v4(),
            name: "shot_0001".to_string(),
            shot_number: 1,
            trigger_id: Uuid::new_v4(),
            trigger_timestamp_us: 0,
            confidence: 1.0,
            trigger_source: TriggerSource::Manual,
            files: vec![],
            primary_camera: None,
            thumbnail: None,
            start_us: 0,
            end_us: 0,
            duration_seconds: 0.0,
            created_at: Utc::now(),
            status: ClipStatus::Complete,
            partial_cameras: vec![],
            error: None,
            marked_not_shot: false,
        };
        assert!(clip.is_visible());
        clip.marked_not_shot = true;
        assert!(!clip.is_visible());
        clip.marked_not_shot = false;
        clip.status = ClipStatus::Failed;
        assert!(!clip.is_visible());
    }
}
