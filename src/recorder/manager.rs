//! Recording manager
//!
//! Consumes triggers one at a time. For each trigger it freezes every camera's
//! history, collects live frames until `trigger + post` on the shared clock,
//! then encodes and persists the clip on a blocking thread. The trigger gate
//! is released only after finalization, so audio triggers stay debounced for
//! the whole assembly.

use super::encoder::ClipWriter;
use super::state::{Clip, ClipAssembly, ClipFile, ClipStatus, CollectedClip, RecordingState};
use super::store::{shot_name, SessionStore};
use super::{RecordingError, RecordingResult};
use crate::buffer::CameraFeeds;
use crate::config::CaptureConfig;
use crate::events::{CameraMessage, CameraState, CaptureEvent, EventBus, TriggerEvent, TriggerGate};
use crate::utils::ErrorKind;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Upper bound on a single wait, so the deadline is re-read from the clock
const RECHECK_INTERVAL: Duration = Duration::from_millis(50);

const STATUS_SOURCE: &str = "recorder";

/// Clip geometry taken from the configuration at start
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub pre_trigger_us: u64,
    pub post_trigger_us: u64,
    pub fps: u32,
    pub primary_camera: Option<String>,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
}

impl ManagerSettings {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            pre_trigger_us: config.pre_trigger_us(),
            post_trigger_us: config.post_trigger_us(),
            fps: config.fps,
            primary_camera: config.primary_camera_id(),
            thumbnail_width: config.thumbnail_width,
            thumbnail_height: config.thumbnail_height,
        }
    }
}

pub struct RecordingManager {
    settings: ManagerSettings,
    feeds: Arc<CameraFeeds>,
    store: Arc<SessionStore>,
    writer: Arc<dyn ClipWriter>,
    bus: EventBus,
    gate: Arc<TriggerGate>,
    state: Arc<RwLock<RecordingState>>,
}

impl RecordingManager {
    pub fn new(
        settings: ManagerSettings,
        feeds: Arc<CameraFeeds>,
        store: Arc<SessionStore>,
        writer: Arc<dyn ClipWriter>,
        bus: EventBus,
        gate: Arc<TriggerGate>,
    ) -> Self {
        Self {
            settings,
            feeds,
            store,
            writer,
            bus,
            gate,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
        }
    }

    /// Shared view of the current state
    pub fn state_handle(&self) -> Arc<RwLock<RecordingState>> {
        self.state.clone()
    }

    fn set_state(&self, state: RecordingState) {
        *self.state.write() = state;
    }

    /// Process triggers until shutdown or until every trigger sender is gone
    pub async fn run(
        self,
        mut triggers: mpsc::UnboundedReceiver<TriggerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Recording manager started");
        while !*shutdown.borrow() {
            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => {
                        if self.capture(trigger, &mut triggers, &mut shutdown).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Recording manager stopped");
    }

    /// Assemble and persist one clip. Returns true if shutdown was requested.
    async fn capture(
        &self,
        trigger: TriggerEvent,
        triggers: &mut mpsc::UnboundedReceiver<TriggerEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let feeds = self.feeds.list();
        if feeds.is_empty() {
            tracing::warn!("Trigger {} ignored: no cameras running", trigger.id);
            self.gate.release();
            return false;
        }

        // Subscribe first so no frame falls between the snapshot and the live feed
        let mut frames = self.bus.subscribe_camera();
        let clock = self.bus.clock().clone();

        let mut assembly = ClipAssembly::new(
            trigger,
            self.settings.pre_trigger_us,
            self.settings.post_trigger_us,
            feeds.iter().map(|f| (f.camera_id.clone(), f.label.clone())),
        );
        let frozen_at = clock.now_us();
        for feed in &feeds {
            assembly.freeze(&feed.camera_id, &feed.history.snapshot(), frozen_at);
        }
        self.set_state(assembly.state());
        assembly.start_accumulating();
        self.set_state(assembly.state());

        tracing::info!(
            "Capturing clip for trigger at {}us ({} cameras, window {}..{}us)",
            assembly.trigger.timestamp_us,
            feeds.len(),
            assembly.window_start_us,
            assembly.deadline_us
        );

        let mut stopping = false;
        while !assembly.all_done() {
            let now = clock.now_us();
            if now >= assembly.deadline_us {
                break;
            }
            let wait = Duration::from_micros(assembly.deadline_us - now).min(RECHECK_INTERVAL);

            tokio::select! {
                message = frames.recv() => match message {
                    Ok(message) => absorb(&mut assembly, message),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Recording manager lagged, {} camera messages skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(extra) = triggers.recv() => {
                    tracing::debug!("Ignoring overlapping trigger {}", extra.id);
                }
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown during clip assembly, finalizing collected frames");
                    stopping = true;
                    break;
                }
            }
        }

        // Frames stamped before the deadline may still be queued
        while !assembly.all_done() {
            match frames.try_recv() {
                Ok(message) => absorb(&mut assembly, message),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Recording manager lagged, {} camera messages skipped", skipped);
                }
                Err(_) => break,
            }
        }

        let collected = assembly.finish();
        self.set_state(RecordingState::Finalizing);
        let outcome = self.finalize(collected).await;

        while let Ok(extra) = triggers.try_recv() {
            tracing::debug!("Ignoring overlapping trigger {}", extra.id);
        }
        // Back to Idle before anyone hears about the clip, so a trigger sent
        // on completion starts the next one
        self.gate.release();
        self.set_state(RecordingState::Idle);
        self.bus.publish(outcome);
        stopping
    }

    /// Persist the clip. Returns the completion or failure event to publish.
    async fn finalize(&self, collected: CollectedClip) -> CaptureEvent {
        let trigger_id = collected.trigger.id;
        if collected.is_empty() {
            tracing::warn!("No frames captured for trigger {}", trigger_id);
            self.bus.status(
                STATUS_SOURCE,
                ErrorKind::PartialCapture,
                "No camera delivered frames for the clip",
            );
            return CaptureEvent::ClipFailed {
                trigger_id,
                message: RecordingError::NoFrames.to_string(),
            };
        }

        let shot = self.store.reserve_shot();
        let mut last_error = String::new();
        for attempt in 1..=2 {
            let store = self.store.clone();
            let writer = self.writer.clone();
            let settings = self.settings.clone();
            let clip = collected.clone();
            let result = tokio::task::spawn_blocking(move || {
                write_clip(&store, writer.as_ref(), &settings, &clip, shot)
            })
            .await;

            match result {
                Ok(Ok(clip)) => return self.report(clip),
                Ok(Err(e)) => {
                    tracing::warn!("Saving {} failed (attempt {}): {}", shot_name(shot), attempt, e);
                    last_error = e.to_string();
                }
                Err(e) => {
                    tracing::error!("Clip writer task failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        let failed = failed_clip(&self.settings, &collected, shot, last_error.clone());
        let store = self.store.clone();
        let recorded = tokio::task::spawn_blocking(move || store.append(failed)).await;
        if !matches!(recorded, Ok(Ok(()))) {
            tracing::warn!("Could not record failed clip {}", shot_name(shot));
        }
        self.bus.status(
            STATUS_SOURCE,
            ErrorKind::PersistenceFailure,
            format!("{}: {}", shot_name(shot), last_error),
        );
        CaptureEvent::ClipFailed {
            trigger_id,
            message: last_error,
        }
    }

    fn report(&self, clip: Clip) -> CaptureEvent {
        tracing::info!(
            "Saved {} ({} cameras, {} frames, {:.2}s)",
            clip.name,
            clip.files.len(),
            clip.total_frames(),
            clip.duration_seconds
        );
        if clip.status == ClipStatus::Partial {
            self.bus.status(
                STATUS_SOURCE,
                ErrorKind::PartialCapture,
                format!("{}: incomplete cameras {}", clip.name, clip.partial_cameras.join(", ")),
            );
        }
        CaptureEvent::ClipCompleted(clip)
    }
}

fn absorb(assembly: &mut ClipAssembly, message: CameraMessage) {
    match message {
        CameraMessage::Frame(frame) => {
            assembly.offer(frame);
        }
        CameraMessage::State { camera_id, state } => {
            if matches!(state, CameraState::Disconnected | CameraState::Reconnecting) {
                assembly.camera_lost(&camera_id);
            }
        }
    }
}

/// Camera whose file gets the bare shot name: the configured primary if it
/// delivered frames, else the first camera that did
fn primary_for(settings: &ManagerSettings, collected: &CollectedClip) -> Option<String> {
    settings
        .primary_camera
        .as_deref()
        .and_then(|id| collected.take(id))
        .filter(|t| !t.frames.is_empty())
        .or_else(|| collected.takes.iter().find(|t| !t.frames.is_empty()))
        .map(|t| t.camera_id.clone())
}

/// Encode every camera, write the thumbnail and append the clip record
pub fn write_clip(
    store: &SessionStore,
    writer: &dyn ClipWriter,
    settings: &ManagerSettings,
    collected: &CollectedClip,
    shot: u32,
) -> RecordingResult<Clip> {
    let primary = primary_for(settings, collected).ok_or(RecordingError::NoFrames)?;

    let mut files = Vec::new();
    for take in collected.takes.iter().filter(|t| !t.frames.is_empty()) {
        let path = store.video_path(shot, &take.camera_id, take.camera_id == primary);
        writer.write_video(&path, &take.frames, settings.fps)?;
        files.push(ClipFile {
            camera_id: take.camera_id.clone(),
            label: take.label.clone(),
            path,
            frame_count: take.frames.len(),
            start_us: take.frames.first().map_or(0, |f| f.timestamp_us),
            end_us: take.frames.last().map_or(0, |f| f.timestamp_us),
        });
    }

    let thumbnail = match collected.take(&primary) {
        Some(take) if !take.frames.is_empty() => {
            let frame = &take.frames[take.frames.len() / 3];
            let path = store.thumbnail_path(shot);
            writer.write_thumbnail(
                &path,
                &frame.image,
                settings.thumbnail_width,
                settings.thumbnail_height,
            )?;
            Some(path)
        }
        _ => None,
    };

    let start_us = files.iter().map(|f| f.start_us).min().unwrap_or(collected.window_start_us);
    let end_us = files.iter().map(|f| f.end_us).max().unwrap_or(start_us);
    let frame_period_us = 1_000_000 / settings.fps.max(1) as u64;
    let status = if collected.partial_cameras.is_empty() {
        ClipStatus::Complete
    } else {
        ClipStatus::Partial
    };

    let trigger = &collected.trigger;
    let clip = Clip {
        id: Uuid::new_v4(),
        name: shot_name(shot),
        shot_number: shot,
        trigger_id: trigger.id,
        trigger_timestamp_us: trigger.timestamp_us,
        confidence: trigger.confidence,
        trigger_source: trigger.source,
        files,
        primary_camera: Some(primary),
        thumbnail,
        start_us,
        end_us,
        duration_seconds: (end_us - start_us + frame_period_us) as f64 / 1_000_000.0,
        created_at: Utc::now(),
        status,
        partial_cameras: collected.partial_cameras.clone(),
        error: None,
        marked_not_shot: false,
    };

    store.append(clip.clone())?;
    Ok(clip)
}

fn failed_clip(settings: &ManagerSettings, collected: &CollectedClip, shot: u32, error: String) -> Clip {
    let trigger = &collected.trigger;
    Clip {
        id: Uuid::new_v4(),
        name: shot_name(shot),
        shot_number: shot,
        trigger_id: trigger.id,
        trigger_timestamp_us: trigger.timestamp_us,
        confidence: trigger.confidence,
        trigger_source: trigger.source,
        files: Vec::new(),
        primary_camera: primary_for(settings, collected),
        thumbnail: None,
        start_us: collected.window_start_us,
        end_us: collected.deadline_us,
        duration_seconds: 0.0,
        created_at: Utc::now(),
        status: ClipStatus::Failed,
        partial_cameras: collected.partial_cameras.clone(),
        error: Some(error),
        marked_not_shot: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CameraFeed, FrameHistory};
    use crate::capture::{Frame, Image};
    use crate::events::{TriggerDispatcher, TriggerSource};
    use crate::utils::ManualClock;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Records what would have been encoded
    #[derive(Default)]
    struct MemoryWriter {
        videos: Mutex<Vec<(PathBuf, usize)>>,
        thumbnails: Mutex<Vec<PathBuf>>,
        failures_left: AtomicUsize,
    }

    impl ClipWriter for MemoryWriter {
        fn write_video(&self, path: &Path, frames: &[Arc<Frame>], _fps: u32) -> RecordingResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RecordingError::Encoder("disk full".to_string()));
            }
            self.videos.lock().push((path.to_path_buf(), frames.len()));
            Ok(())
        }

        fn write_thumbnail(&self, path: &Path, _image: &Image, _w: u32, _h: u32) -> RecordingResult<()> {
            self.thumbnails.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            pre_trigger_us: 1_000_000,
            post_trigger_us: 2_000_000,
            fps: 30,
            primary_camera: Some("0".to_string()),
            thumbnail_width: 160,
            thumbnail_height: 90,
        }
    }

    fn frame(camera: &str, seq: u64, ts: u64) -> Arc<Frame> {
        Arc::new(Frame {
            camera_id: camera.to_string(),
            timestamp_us: ts,
            sequence: seq,
            image: Image::filled(4, 4, [seq as u8, 0, 0]),
        })
    }

    fn collected(cameras: &[&str], frames_each: u64) -> CollectedClip {
        let trigger = TriggerEvent {
            id: Uuid::new_v4(),
            timestamp_us: 5_000_000,
            confidence: 0.7,
            source: TriggerSource::Heuristic,
            features: None,
        };
        let mut assembly = ClipAssembly::new(
            trigger,
            1_000_000,
            2_000_000,
            cameras.iter().map(|c| (c.to_string(), String::new())),
        );
        for camera in cameras {
            for i in 0..frames_each {
                assembly.offer(frame(camera, i, 4_000_000 + i * 33_333));
            }
        }
        assembly.finish()
    }

    #[test]
    fn test_write_clip_names_and_thumbnail() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let writer = MemoryWriter::default();
        let clip = write_clip(&store, &writer, &settings(), &collected(&["0", "1"], 90), 1).unwrap();

        let videos = writer.videos.lock().clone();
        assert_eq!(videos.len(), 2);
        assert!(videos[0].0.ends_with("shot_0001.mp4"));
        assert!(videos[1].0.ends_with("shot_0001_cam1.mp4"));
        assert_eq!(videos[0].1, 90);
        assert_eq!(clip.status, ClipStatus::Complete);
        assert_eq!(clip.primary_camera.as_deref(), Some("0"));
        assert!(clip.thumbnail.unwrap().ends_with("shot_0001.png"));
        assert!((clip.duration_seconds - 3.0).abs() < 0.05);
        assert_eq!(store.clips().len(), 1);
    }

    #[test]
    fn test_missing_primary_falls_back() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let writer = MemoryWriter::default();
        let mut input = collected(&["0", "1"], 10);
        input.takes[0].frames.clear();
        input.partial_cameras = vec!["0".to_string()];

        let clip = write_clip(&store, &writer, &settings(), &input, 3).unwrap();
        assert_eq!(clip.primary_camera.as_deref(), Some("1"));
        assert_eq!(clip.status, ClipStatus::Partial);
        assert!(clip.files[0].path.ends_with("shot_0003.mp4"));
    }

    fn manager(
        writer: Arc<MemoryWriter>,
        clock: Arc<ManualClock>,
        dir: &Path,
    ) -> (RecordingManager, TriggerDispatcher, mpsc::UnboundedReceiver<TriggerEvent>, EventBus, Arc<FrameHistory>) {
        let bus = EventBus::new(clock);
        let (dispatcher, rx) = TriggerDispatcher::new(bus.clone(), true);
        let feeds = Arc::new(CameraFeeds::new());
        let history = Arc::new(FrameHistory::new(30));
        feeds.insert(CameraFeed {
            camera_id: "0".to_string(),
            label: String::new(),
            history: history.clone(),
        });
        let store = Arc::new(SessionStore::open(dir).unwrap());
        let manager = RecordingManager::new(settings(), feeds, store, writer, bus.clone(), dispatcher.gate());
        (manager, dispatcher, rx, bus, history)
    }

    #[tokio::test]
    async fn test_retry_once_then_succeed() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(MemoryWriter::default());
        writer.failures_left.store(1, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::starting_at(5_000_000));
        let (manager, dispatcher, rx, bus, history) = manager(writer.clone(), clock.clone(), dir.path());
        for i in 0..30 {
            history.push_shared(frame("0", i, 4_000_000 + i * 33_333));
        }
        let mut events = bus.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(rx, stop_rx));

        dispatcher.fire_manual().unwrap();
        // Deadline already passed on the clock: the clip closes right away
        clock.set_us(8_000_000);

        loop {
            match events.recv().await.unwrap() {
                CaptureEvent::ClipCompleted(clip) => {
                    assert_eq!(clip.files[0].frame_count, 30);
                    break;
                }
                CaptureEvent::ClipFailed { message, .. } => panic!("clip failed: {}", message),
                _ => {}
            }
        }
        assert!(!dispatcher.gate().is_busy());
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_failure_reports_and_releases_gate() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(MemoryWriter::default());
        writer.failures_left.store(2, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::starting_at(9_000_000));
        let (manager, dispatcher, rx, bus, history) = manager(writer, clock.clone(), dir.path());
        history.push_shared(frame("0", 1, 8_500_000));
        let mut events = bus.subscribe();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(manager.run(rx, stop_rx));

        let trigger = dispatcher.fire_manual().unwrap();
        clock.set_us(12_000_000);
        let mut saw_status = false;
        loop {
            match events.recv().await.unwrap() {
                CaptureEvent::Status(s) if s.kind == ErrorKind::PersistenceFailure => saw_status = true,
                CaptureEvent::ClipFailed { trigger_id, .. } => {
                    assert_eq!(trigger_id, trigger.id);
                    break;
                }
                CaptureEvent::ClipCompleted(_) => panic!("clip should have failed"),
                _ => {}
            }
        }
        assert!(saw_status);
        assert!(!dispatcher.gate().is_busy());
    }

    async fn next_completed(events: &mut tokio::sync::broadcast::Receiver<CaptureEvent>) -> Clip {
        loop {
            match events.recv().await.unwrap() {
                CaptureEvent::ClipCompleted(clip) => return clip,
                CaptureEvent::ClipFailed { message, .. } => panic!("clip failed: {}", message),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_idle_and_ungated_when_completion_is_published() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(MemoryWriter::default());
        let clock = Arc::new(ManualClock::starting_at(5_000_000));
        let (manager, dispatcher, rx, bus, history) = manager(writer, clock.clone(), dir.path());
        let state = manager.state_handle();
        for i in 0..30 {
            history.push_shared(frame("0", i, 4_000_000 + i * 33_333));
        }
        let mut events = bus.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(rx, stop_rx));

        let first = dispatcher.fire_manual().unwrap();
        clock.set_us(8_000_000);
        let clip = next_completed(&mut events).await;
        assert_eq!(clip.trigger_id, first.id);
        assert_eq!(*state.read(), RecordingState::Idle);
        assert!(!dispatcher.gate().is_busy());

        // A trigger sent on completion starts the next clip
        for i in 0..30 {
            history.push_shared(frame("0", 100 + i, 7_100_000 + i * 33_333));
        }
        let second = dispatcher.fire_manual().unwrap();
        clock.set_us(11_000_000);
        let clip = next_completed(&mut events).await;
        assert_eq!(clip.trigger_id, second.id);
        assert_eq!(clip.shot_number, 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_queued_before_deadline_are_kept() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(MemoryWriter::default());
        let clock = Arc::new(ManualClock::starting_at(5_000_000));
        let (manager, dispatcher, rx, bus, _history) = manager(writer, clock.clone(), dir.path());
        let state = manager.state_handle();
        let mut events = bus.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(rx, stop_rx));

        dispatcher.fire_manual().unwrap();
        while *state.read() != RecordingState::Accumulating {
            tokio::task::yield_now().await;
        }
        // The deadline passes while ten in-window frames are still queued
        clock.set_us(8_000_000);
        for i in 0..10 {
            bus.publish_frame(frame("0", i, 5_100_000 + i * 33_333));
        }

        let clip = next_completed(&mut events).await;
        assert_eq!(clip.files[0].frame_count, 10);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
