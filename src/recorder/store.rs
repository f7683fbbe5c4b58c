//! Session folder and clip metadata
//!
//! One folder per capture session. Every clip gets a shot number that keeps
//! counting from whatever `shot_NNNN*.mp4` files are already in the folder,
//! and its record lives in `clips.json`, rewritten atomically on each change.

use super::state::Clip;
use super::{RecordingError, RecordingResult};
use crate::utils::fs::write_json_atomic;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const CLIPS_FILE: &str = "clips.json";

/// Base name shared by a clip's files
pub fn shot_name(shot: u32) -> String {
    format!("shot_{:04}", shot)
}

/// Shot number from a file name like `shot_0007.mp4` or `shot_0007_cam1.mp4`
fn parse_shot_number(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix("shot_")?.strip_suffix(".mp4")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub struct SessionStore {
    dir: PathBuf,
    clips: Mutex<Vec<Clip>>,
    next_shot: Mutex<u32>,
}

impl SessionStore {
    /// Open or create a session folder
    pub fn open(dir: impl Into<PathBuf>) -> RecordingResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let clips = load_clips(&dir.join(CLIPS_FILE));
        let mut highest = clips.iter().map(|c| c.shot_number).max().unwrap_or(0);
        for entry in std::fs::read_dir(&dir)?.flatten() {
            if let Some(n) = entry.file_name().to_str().and_then(parse_shot_number) {
                highest = highest.max(n);
            }
        }

        tracing::info!(
            "Session folder {:?}: {} clips, next shot {}",
            dir,
            clips.len(),
            highest + 1
        );

        Ok(Self {
            dir,
            clips: Mutex::new(clips),
            next_shot: Mutex::new(highest + 1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claim the next shot number
    pub fn reserve_shot(&self) -> u32 {
        let mut next = self.next_shot.lock();
        let shot = *next;
        *next += 1;
        shot
    }

    /// `shot_NNNN.mp4` for the primary camera, `shot_NNNN_cam<id>.mp4` otherwise
    pub fn video_path(&self, shot: u32, camera_id: &str, primary: bool) -> PathBuf {
        let name = if primary {
            format!("{}.mp4", shot_name(shot))
        } else {
            format!("{}_cam{}.mp4", shot_name(shot), camera_id)
        };
        self.dir.join(name)
    }

    pub fn thumbnail_path(&self, shot: u32) -> PathBuf {
        self.dir.join(format!("{}.png", shot_name(shot)))
    }

    /// Add a clip record. On failure the in-memory list is left unchanged.
    pub fn append(&self, clip: Clip) -> RecordingResult<()> {
        let mut clips = self.clips.lock();
        clips.push(clip);
        if let Err(e) = self.persist(&clips) {
            clips.pop();
            return Err(e);
        }
        Ok(())
    }

    pub fn clips(&self) -> Vec<Clip> {
        self.clips.lock().clone()
    }

    /// Clips not tombstoned and not failed
    pub fn visible_clips(&self) -> Vec<Clip> {
        self.clips
            .lock()
            .iter()
            .filter(|c| c.is_visible())
            .cloned()
            .collect()
    }

    pub fn clip(&self, id: Uuid) -> Option<Clip> {
        self.clips.lock().iter().find(|c| c.id == id).cloned()
    }

    pub fn clip_for_trigger(&self, trigger_id: Uuid) -> Option<Clip> {
        self.clips
            .lock()
            .iter()
            .find(|c| c.trigger_id == trigger_id)
            .cloned()
    }

    pub fn latest_visible(&self) -> Option<Clip> {
        self.clips.lock().iter().rev().find(|c| c.is_visible()).cloned()
    }

    /// Video path for a camera, or the primary file when `camera_id` is None
    pub fn clip_path(&self, id: Uuid, camera_id: Option<&str>) -> Option<PathBuf> {
        let clips = self.clips.lock();
        let clip = clips.iter().find(|c| c.id == id && !c.marked_not_shot)?;
        let file = match camera_id {
            Some(camera_id) => clip.file_for(camera_id),
            None => clip.primary_file(),
        }?;
        Some(file.path.clone())
    }

    /// Remove a clip's files and its record
    pub fn delete(&self, id: Uuid) -> RecordingResult<Clip> {
        let mut clips = self.clips.lock();
        let index = clips
            .iter()
            .position(|c| c.id == id)
            .ok_or(RecordingError::ClipNotFound(id))?;
        let clip = clips.remove(index);
        if let Err(e) = self.persist(&clips) {
            clips.insert(index, clip);
            return Err(e);
        }
        remove_files(&clip);
        tracing::info!("Deleted clip {}", clip.name);
        Ok(clip)
    }

    /// Remove a clip's files but keep its record as a tombstone
    pub fn mark_not_shot(&self, id: Uuid) -> RecordingResult<Clip> {
        let mut clips = self.clips.lock();
        let clip = clips
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(RecordingError::ClipNotFound(id))?;
        if clip.marked_not_shot {
            return Ok(clip.clone());
        }
        clip.marked_not_shot = true;
        let marked = clip.clone();
        if let Err(e) = self.persist(&clips) {
            if let Some(clip) = clips.iter_mut().find(|c| c.id == id) {
                clip.marked_not_shot = false;
            }
            return Err(e);
        }
        remove_files(&marked);
        tracing::info!("Marked {} as not a shot", marked.name);
        Ok(marked)
    }

    fn persist(&self, clips: &[Clip]) -> RecordingResult<()> {
        write_json_atomic(&self.dir.join(CLIPS_FILE), clips)?;
        Ok(())
    }
}

fn load_clips(path: &Path) -> Vec<Clip> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", path, e);
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(clips) => clips,
        Err(e) => {
            tracing::warn!("Corrupt clip metadata, starting fresh: {}", e);
            let _ = std::fs::rename(path, path.with_extension("corrupt"));
            Vec::new()
        }
    }
}

fn remove_files(clip: &Clip) {
    let paths = clip
        .files
        .iter()
        .map(|f| &f.path)
        .chain(clip.thumbnail.iter());
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {:?}: {}", path, e);
            }
        }
    }
}
