//! Pre-trigger memory for frames and audio

pub mod history;

use crate::capture::{AudioChunk, Frame};
use parking_lot::RwLock;
use std::sync::Arc;

pub use history::History;

/// Per-camera frame history
pub type FrameHistory = History<Frame>;

/// Audio chunk history
pub type AudioHistory = History<AudioChunk>;

/// A running camera's history, as seen by the recording manager
#[derive(Clone)]
pub struct CameraFeed {
    pub camera_id: String,
    pub label: String,
    pub history: Arc<FrameHistory>,
}

/// Histories of every enabled camera, keyed by camera id
#[derive(Default)]
pub struct CameraFeeds {
    feeds: RwLock<Vec<CameraFeed>>,
}

impl CameraFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feed, replacing any feed with the same camera id
    pub fn insert(&self, feed: CameraFeed) {
        let mut feeds = self.feeds.write();
        feeds.retain(|f| f.camera_id != feed.camera_id);
        feeds.push(feed);
    }

    pub fn remove(&self, camera_id: &str) -> bool {
        let mut feeds = self.feeds.write();
        let before = feeds.len();
        feeds.retain(|f| f.camera_id != camera_id);
        feeds.len() != before
    }

    pub fn get(&self, camera_id: &str) -> Option<CameraFeed> {
        self.feeds.read().iter().find(|f| f.camera_id == camera_id).cloned()
    }

    pub fn list(&self) -> Vec<CameraFeed> {
        self.feeds.read().clone()
    }

    pub fn len(&self) -> usize {
        self.feeds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.read().is_empty()
    }
}

/// Items whose timestamp lies in `[start_us, end_us]`
pub fn within_window<T, F>(items: &[Arc<T>], start_us: u64, end_us: u64, timestamp: F) -> Vec<Arc<T>>
where
    F: Fn(&T) -> u64,
{
    items
        .iter()
        .filter(|item| {
            let ts = timestamp(item);
            ts >= start_us && ts <= end_us
        })
        .cloned()
        .collect()
}

/// Concatenate the samples of a chunk snapshot
pub fn concat_samples(chunks: &[Arc<AudioChunk>]) -> Vec<f32> {
    let total = chunks.iter().map(|c| c.samples.len()).sum();
    let mut samples = Vec::with_capacity(total);
    for chunk in chunks {
        samples.extend_from_slice(&chunk.samples);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Image;

    fn frame(ts: u64, seq: u64) -> Frame {
        Frame {
            camera_id: "0".to_string(),
            timestamp_us: ts,
            sequence: seq,
            image: Image::filled(2, 2, [0, 0, 0]),
        }
    }

    #[test]
    fn test_within_window_is_inclusive() {
        let history = FrameHistory::new(10);
        for (i, ts) in [100, 200, 300, 400].iter().enumerate() {
            history.push(frame(*ts, i as u64));
        }
        let kept = within_window(&history.snapshot(), 200, 300, |f| f.timestamp_us);
        let ts: Vec<u64> = kept.iter().map(|f| f.timestamp_us).collect();
        assert_eq!(ts, vec![200, 300]);
    }

    #[test]
    fn test_feeds_replace_by_id() {
        let feeds = CameraFeeds::new();
        let first = Arc::new(FrameHistory::new(3));
        let second = Arc::new(FrameHistory::new(5));
        feeds.insert(CameraFeed {
            camera_id: "0".to_string(),
            label: String::new(),
            history: first,
        });
        feeds.insert(CameraFeed {
            camera_id: "0".to_string(),
            label: "Face on".to_string(),
            history: second,
        });
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds.get("0").unwrap().history.capacity(), 5);
        assert!(feeds.remove("0"));
        assert!(!feeds.remove("0"));
        assert!(feeds.is_empty());
    }

    #[test]
    fn test_concat_samples() {
        let history = AudioHistory::new(4);
        for i in 0..3 {
            history.push(AudioChunk {
                timestamp_us: i,
                samples: vec![i as f32; 2],
                sample_rate: 8_000,
            });
        }
        assert_eq!(concat_samples(&history.snapshot()), vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
    }
}
