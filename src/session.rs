//! Capture session
//!
//! Wires the workers, classifier, recording manager and stores together for
//! one session folder, and exposes the commands the presentation layer uses.

use crate::buffer::{AudioHistory, CameraFeed, CameraFeeds, FrameHistory};
use crate::capture::{AudioOpener, DeviceOpener, SourceOpener, Transform};
use crate::config::{CameraConfig, CaptureConfig};
use crate::detection::{Classifier, ClassifierMode, Label, TrainingSample, TrainingStore};
use crate::events::{CameraMessage, CameraState, CaptureEvent, EventBus, TriggerDispatcher, TriggerEvent};
use crate::recorder::{
    Clip, ClipWriter, FfmpegClipWriter, ManagerSettings, RecordingError, RecordingManager,
    RecordingState, SessionStore,
};
use crate::utils::{AppError, AppResult, Clock, ErrorKind, MonotonicClock};
use crate::workers::{AudioHandle, AudioWorker, CameraHandle, CameraWorker, TrainingRecorder};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Pluggable inputs and outputs
#[derive(Clone)]
pub struct Backends {
    pub clock: Arc<dyn Clock>,
    pub cameras: Arc<dyn SourceOpener>,
    /// None when built without an audio backend
    pub audio: Option<Arc<dyn AudioOpener>>,
    pub writer: Arc<dyn ClipWriter>,
}

impl Backends {
    /// Real devices, FFmpeg encoding and the monotonic clock
    pub fn system(config: &CaptureConfig) -> Self {
        #[cfg(feature = "microphone")]
        let audio: Option<Arc<dyn AudioOpener>> = Some(Arc::new(crate::capture::microphone::MicrophoneOpener {
            device: config.audio_device.clone(),
            sample_rate: config.audio_sample_rate,
            chunk_size: config.audio_chunk_size,
        }));
        #[cfg(not(feature = "microphone"))]
        let audio: Option<Arc<dyn AudioOpener>> = {
            let _ = config;
            None
        };

        Self {
            clock: Arc::new(MonotonicClock::new()),
            cameras: Arc::new(DeviceOpener::new()),
            audio,
            writer: Arc::new(FfmpegClipWriter::default()),
        }
    }
}

/// A running capture session
pub struct CaptureSession {
    config: CaptureConfig,
    backends: Backends,
    bus: EventBus,
    dispatcher: TriggerDispatcher,
    classifier: Arc<Classifier>,
    training: Arc<TrainingStore>,
    store: Arc<SessionStore>,
    feeds: Arc<CameraFeeds>,
    audio_history: Arc<AudioHistory>,
    cameras: Mutex<HashMap<String, CameraHandle>>,
    camera_configs: Mutex<Vec<CameraConfig>>,
    audio: Mutex<Option<AudioHandle>>,
    recording_state: Arc<RwLock<RecordingState>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureSession {
    /// Open the session folder and start every worker. Must be called inside
    /// a tokio runtime.
    pub async fn start(mut config: CaptureConfig, backends: Backends) -> AppResult<Self> {
        config.validate();
        tracing::info!("Starting capture session in {:?}", config.session_dir);

        let store = Arc::new(SessionStore::open(&config.session_dir)?);
        let training = Arc::new(TrainingStore::new(&config.training_dir));
        let classifier = Arc::new(
            Classifier::new(&config.classifier, config.detection_threshold_percent)
                .with_store(training.clone()),
        );
        {
            let classifier = classifier.clone();
            tokio::task::spawn_blocking(move || classifier.restore())
                .await
                .map_err(|e| AppError::Config(format!("Classifier restore failed: {}", e)))?;
        }

        let bus = EventBus::new(backends.clock.clone());
        let (dispatcher, triggers) = TriggerDispatcher::new(bus.clone(), config.armed);
        let feeds = Arc::new(CameraFeeds::new());
        let audio_history = Arc::new(AudioHistory::new(config.audio_history_capacity()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = RecordingManager::new(
            ManagerSettings::from_config(&config),
            feeds.clone(),
            store.clone(),
            backends.writer.clone(),
            bus.clone(),
            dispatcher.gate(),
        );
        let recording_state = manager.state_handle();
        let recorder = TrainingRecorder::new(
            training.clone(),
            classifier.clone(),
            audio_history.clone(),
            bus.clone(),
        );
        let tasks = vec![
            tokio::spawn(manager.run(triggers, shutdown_rx.clone())),
            tokio::spawn(recorder.run(bus.subscribe(), shutdown_rx)),
        ];

        let session = Self {
            camera_configs: Mutex::new(config.cameras.clone()),
            config,
            backends,
            bus,
            dispatcher,
            classifier,
            training,
            store,
            feeds,
            audio_history,
            cameras: Mutex::new(HashMap::new()),
            audio: Mutex::new(None),
            recording_state,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        };

        let cameras = session.camera_configs.lock().clone();
        for camera in cameras.iter().filter(|c| c.enabled) {
            if let Err(e) = session.spawn_camera(camera) {
                tracing::error!("Failed to start camera {}: {}", camera.id, e);
                session
                    .bus
                    .status(format!("camera:{}", camera.id), ErrorKind::SourceUnavailable, e.to_string());
            }
        }
        session.spawn_audio();

        tracing::info!(
            "Capture session started: {} cameras, classifier {:?}, armed={}",
            session.feeds.len(),
            session.classifier.mode(),
            session.dispatcher.is_armed()
        );
        Ok(session)
    }

    /// Stop everything. An in-progress clip is finalized with the frames
    /// collected so far before the workers are torn down.
    pub async fn stop(self) {
        tracing::info!("Stopping capture session");
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Session task failed: {}", e);
            }
        }

        let cameras: Vec<CameraHandle> = self.cameras.lock().drain().map(|(_, h)| h).collect();
        let audio = self.audio.lock().take();
        let joined = tokio::task::spawn_blocking(move || {
            for mut camera in cameras {
                camera.shutdown();
            }
            if let Some(mut audio) = audio {
                audio.shutdown();
            }
        })
        .await;
        if joined.is_err() {
            tracing::error!("Worker shutdown panicked");
        }
        tracing::info!("Capture session stopped");
    }

    fn spawn_camera(&self, camera: &CameraConfig) -> AppResult<()> {
        let capacity = self.config.frame_history_capacity();
        // Keep the history object across restarts; stale frames from the old
        // source are dropped by the reallocation
        let history = match self.feeds.get(&camera.id) {
            Some(feed) => {
                feed.history.reallocate(capacity);
                feed.history
            }
            None => Arc::new(FrameHistory::new(capacity)),
        };

        let worker = CameraWorker::new(
            camera.clone(),
            self.backends.cameras.clone(),
            history.clone(),
            self.bus.clone(),
            self.config.reconnect.clone(),
            self.config.fps,
        );
        let handle = worker.spawn()?;
        self.feeds.insert(CameraFeed {
            camera_id: camera.id.clone(),
            label: camera.display_label().to_string(),
            history,
        });
        self.cameras.lock().insert(camera.id.clone(), handle);
        Ok(())
    }

    async fn stop_camera(&self, camera_id: &str) -> bool {
        let handle = self.cameras.lock().remove(camera_id);
        match handle {
            Some(mut handle) => {
                let _ = tokio::task::spawn_blocking(move || handle.shutdown()).await;
                true
            }
            None => false,
        }
    }

    fn spawn_audio(&self) {
        let Some(opener) = self.backends.audio.clone() else {
            tracing::warn!("No audio backend, automatic detection disabled");
            self.bus.status(
                "audio",
                ErrorKind::SourceUnavailable,
                "Built without an audio input backend",
            );
            return;
        };
        let worker = AudioWorker::new(
            opener,
            self.audio_history.clone(),
            self.classifier.clone(),
            self.dispatcher.clone(),
            self.bus.clone(),
        );
        match worker.spawn() {
            Ok(handle) => *self.audio.lock() = Some(handle),
            Err(e) => {
                tracing::error!("Failed to start audio worker: {}", e);
                self.bus.status("audio", ErrorKind::SourceUnavailable, e.to_string());
            }
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn session_dir(&self) -> PathBuf {
        self.store.dir().to_path_buf()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_camera(&self) -> broadcast::Receiver<CameraMessage> {
        self.bus.subscribe_camera()
    }

    pub fn is_armed(&self) -> bool {
        self.dispatcher.is_armed()
    }

    pub fn set_armed(&self, armed: bool) {
        self.dispatcher.set_armed(armed);
    }

    /// Fire a trigger now, regardless of arming
    pub fn manual_trigger(&self) -> Option<TriggerEvent> {
        self.dispatcher.fire_manual()
    }

    pub fn recording_state(&self) -> RecordingState {
        *self.recording_state.read()
    }

    pub fn classifier_mode(&self) -> ClassifierMode {
        self.classifier.mode()
    }

    /// (shots, not shots) among the labeled samples
    pub fn training_counts(&self) -> (usize, usize) {
        self.classifier.label_counts()
    }

    /// Sensitivity slider, 1-100%
    pub fn set_detection_threshold(&self, percent: f32) {
        self.classifier.set_threshold_percent(percent.clamp(1.0, 100.0));
    }

    pub fn clips(&self) -> Vec<Clip> {
        self.store.clips()
    }

    pub fn visible_clips(&self) -> Vec<Clip> {
        self.store.visible_clips()
    }

    pub fn clip_path(&self, clip_id: Uuid, camera_id: Option<&str>) -> Option<PathBuf> {
        self.store.clip_path(clip_id, camera_id)
    }

    /// Relabel the latest training sample as a false positive and remove the
    /// clip its trigger produced. Buffers and workers are untouched.
    pub async fn mark_not_shot(&self) -> AppResult<Option<Clip>> {
        let Some(sample) = self.classifier.relabel_latest(Label::NotShot) else {
            return Ok(None);
        };
        self.save_relabel(&sample).await;

        let target = sample
            .trigger_id
            .and_then(|id| self.store.clip_for_trigger(id))
            .filter(|c| c.is_visible());
        let marked = match target {
            Some(clip) => Some(self.tombstone(clip.id).await?),
            None => None,
        };

        self.classifier.maybe_retrain();
        Ok(marked)
    }

    /// Mark one clip as a false positive, relabeling the sample its trigger
    /// recorded
    pub async fn mark_clip_not_shot(&self, clip_id: Uuid) -> AppResult<Clip> {
        let clip = self
            .store
            .clip(clip_id)
            .ok_or(RecordingError::ClipNotFound(clip_id))?;
        match self.classifier.relabel_trigger(clip.trigger_id, Label::NotShot) {
            Some(sample) => self.save_relabel(&sample).await,
            None => tracing::debug!("{} has no training sample", clip.name),
        }
        let marked = self.tombstone(clip_id).await?;
        self.classifier.maybe_retrain();
        Ok(marked)
    }

    async fn save_relabel(&self, sample: &TrainingSample) {
        let training = self.training.clone();
        let relabeled = sample.clone();
        match tokio::task::spawn_blocking(move || training.relabel(&relabeled)).await {
            Ok(Ok(())) => tracing::info!("Relabeled {} as {:?}", sample.id, sample.label),
            Ok(Err(e)) => tracing::warn!("Failed to relabel {}: {}", sample.id, e),
            Err(e) => tracing::error!("Relabel task failed: {}", e),
        }
    }

    async fn tombstone(&self, clip_id: Uuid) -> AppResult<Clip> {
        let store = self.store.clone();
        let marked = tokio::task::spawn_blocking(move || store.mark_not_shot(clip_id))
            .await
            .map_err(|e| AppError::Config(format!("Mark task failed: {}", e)))??;
        self.bus.publish(CaptureEvent::ClipRemoved { clip_id });
        Ok(marked)
    }

    /// Remove a clip's files and record
    pub async fn delete_clip(&self, clip_id: Uuid) -> AppResult<Clip> {
        let store = self.store.clone();
        let clip = tokio::task::spawn_blocking(move || store.delete(clip_id))
            .await
            .map_err(|e| AppError::Config(format!("Delete task failed: {}", e)))??;
        self.bus.publish(CaptureEvent::ClipRemoved { clip_id });
        Ok(clip)
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.camera_configs.lock().iter().map(|c| c.id.clone()).collect()
    }

    pub fn camera_state(&self, camera_id: &str) -> Option<CameraState> {
        self.cameras.lock().get(camera_id).map(|h| h.state())
    }

    /// Update a camera's transform without restarting its stream
    pub fn set_camera_transform(&self, camera_id: &str, transform: Transform) -> AppResult<()> {
        let transform = transform.normalized();
        let mut configs = self.camera_configs.lock();
        let camera = configs
            .iter_mut()
            .find(|c| c.id == camera_id)
            .ok_or_else(|| AppError::Config(format!("Unknown camera {}", camera_id)))?;
        camera.transform = transform;
        if let Some(handle) = self.cameras.lock().get(camera_id) {
            handle.set_transform(transform);
        }
        Ok(())
    }

    /// Tear down and rebuild a camera worker, e.g. after switching its source
    pub async fn restart_camera(&self, camera: CameraConfig) -> AppResult<()> {
        let mut camera = camera;
        camera.transform = camera.transform.normalized();
        self.stop_camera(&camera.id).await;
        {
            let mut configs = self.camera_configs.lock();
            match configs.iter_mut().find(|c| c.id == camera.id) {
                Some(existing) => *existing = camera.clone(),
                None => configs.push(camera.clone()),
            }
        }
        if camera.enabled {
            tracing::info!("Restarting camera {} on {}", camera.id, camera.source);
            self.spawn_camera(&camera)?;
        } else {
            self.feeds.remove(&camera.id);
        }
        Ok(())
    }

    /// Stop a camera and leave it out of future clips
    pub async fn disable_camera(&self, camera_id: &str) -> AppResult<()> {
        {
            let mut configs = self.camera_configs.lock();
            let camera = configs
                .iter_mut()
                .find(|c| c.id == camera_id)
                .ok_or_else(|| AppError::Config(format!("Unknown camera {}", camera_id)))?;
            camera.enabled = false;
        }
        self.feeds.remove(camera_id);
        if self.stop_camera(camera_id).await {
            tracing::info!("Camera {} disabled", camera_id);
        }
        Ok(())
    }

    pub fn audio_running(&self) -> bool {
        self.audio.lock().as_ref().is_some_and(|h| h.is_running())
    }

    /// Reopen the audio input if it is not running. Returns whether audio is
    /// running afterwards.
    pub async fn refresh_audio(&self) -> bool {
        if self.audio_running() {
            return true;
        }
        let old = self.audio.lock().take();
        if let Some(mut old) = old {
            let _ = tokio::task::spawn_blocking(move || old.shutdown()).await;
        }
        self.audio_history.clear();
        tracing::info!("Refreshing audio input");
        self.spawn_audio();
        self.audio.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioSource, CaptureError, Frame, FrameSource, Image};
    use crate::config::{CameraSource, ReconnectConfig};
    use crate::detection::features::signals;
    use crate::events::TriggerSource;
    use crate::recorder::{ClipStatus, RecordingResult};
    use crate::utils::ManualClock;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::broadcast::error::RecvError;

    const RATE: u32 = 44_100;
    const CHUNK: usize = 1_024;
    const FRAME_US: u64 = 33_333;

    /// Moves the shared clock forward in 1ms steps until dropped
    struct ClockDriver {
        running: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl ClockDriver {
        fn start(clock: Arc<ManualClock>) -> Self {
            let running = Arc::new(AtomicBool::new(true));
            let flag = running.clone();
            let thread = std::thread::spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    clock.advance(Duration::from_millis(1));
                    std::thread::sleep(Duration::from_micros(250));
                }
            });
            Self {
                running,
                thread: Some(thread),
            }
        }
    }

    impl Drop for ClockDriver {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn wait_until(clock: &ManualClock, due_us: u64, patience: Duration) -> bool {
        let started = Instant::now();
        while clock.now_us() < due_us {
            if started.elapsed() > patience {
                return false;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        true
    }

    /// 30 fps camera that optionally dies at a fixed time
    struct SyntheticCamera {
        clock: Arc<ManualClock>,
        next_due_us: u64,
        fail_at_us: Option<u64>,
    }

    impl FrameSource for SyntheticCamera {
        fn read_frame(&mut self) -> Result<Option<Image>, CaptureError> {
            if self.fail_at_us.is_some_and(|fail| self.next_due_us >= fail) {
                return Err(CaptureError::StreamInterrupted("camera unplugged".to_string()));
            }
            if !wait_until(&self.clock, self.next_due_us, Duration::from_millis(20)) {
                return Ok(None);
            }
            self.next_due_us += FRAME_US;
            Ok(Some(Image::filled(8, 6, [40, 120, 40])))
        }
    }

    struct SyntheticCameras {
        clock: Arc<ManualClock>,
        fail_at_us: HashMap<u32, u64>,
    }

    impl SourceOpener for SyntheticCameras {
        fn open(&self, source: &CameraSource) -> Result<Box<dyn FrameSource>, CaptureError> {
            let CameraSource::Device { index } = source else {
                return Err(CaptureError::SourceUnavailable(source.to_string()));
            };
            let fail_at_us = self.fail_at_us.get(index).copied();
            if fail_at_us.is_some_and(|fail| self.clock.now_us() >= fail) {
                return Err(CaptureError::SourceUnavailable(format!("device {} gone", index)));
            }
            Ok(Box::new(SyntheticCamera {
                clock: self.clock.clone(),
                next_due_us: self.clock.now_us() + FRAME_US,
                fail_at_us,
            }))
        }
    }

    /// Quiet room with impacts in the chunks covering the given times
    struct SyntheticAudio {
        clock: Arc<ManualClock>,
        index: u64,
        impacts: Vec<u64>,
    }

    fn chunk_at(time_us: u64) -> u64 {
        time_us * RATE as u64 / (CHUNK as u64 * 1_000_000)
    }

    impl AudioSource for SyntheticAudio {
        fn read_chunk(&mut self) -> Result<Vec<f32>, CaptureError> {
            let due = (self.index + 1) * CHUNK as u64 * 1_000_000 / RATE as u64;
            if !wait_until(&self.clock, due, Duration::from_secs(10)) {
                return Err(CaptureError::StreamInterrupted("clock stalled".to_string()));
            }
            let index = self.index;
            self.index += 1;
            if self.impacts.contains(&index) {
                Ok(signals::impact(CHUNK, RATE))
            } else {
                Ok(signals::hum(CHUNK, RATE).iter().map(|s| s * 0.01).collect())
            }
        }

        fn sample_rate(&self) -> u32 {
            RATE
        }
    }

    struct SyntheticMicrophone {
        clock: Arc<ManualClock>,
        impacts: Vec<u64>,
    }

    impl AudioOpener for SyntheticMicrophone {
        fn open(&self) -> Result<Box<dyn AudioSource>, CaptureError> {
            Ok(Box::new(SyntheticAudio {
                clock: self.clock.clone(),
                index: 0,
                impacts: self.impacts.clone(),
            }))
        }
    }

    /// Writes a stub file per video so deletes have something to remove
    struct StubWriter;

    impl ClipWriter for StubWriter {
        fn write_video(&self, path: &Path, frames: &[Arc<Frame>], _fps: u32) -> RecordingResult<()> {
            std::fs::write(path, format!("{} frames", frames.len()))?;
            Ok(())
        }

        fn write_thumbnail(&self, path: &Path, _image: &Image, _width: u32, _height: u32) -> RecordingResult<()> {
            std::fs::write(path, b"thumbnail")?;
            Ok(())
        }
    }

    struct Rig {
        session: CaptureSession,
        clock: Arc<ManualClock>,
        events: broadcast::Receiver<CaptureEvent>,
        driver: ClockDriver,
        dir: TempDir,
    }

    impl Rig {
        async fn start(cameras: &[(u32, Option<u64>)], impacts_us: &[u64], armed: bool) -> Self {
            let dir = tempdir().unwrap();
            let clock = Arc::new(ManualClock::new());

            let mut config = CaptureConfig {
                session_dir: dir.path().join("session"),
                training_dir: dir.path().join("training"),
                primary_camera: Some("1".to_string()),
                armed,
                reconnect: ReconnectConfig {
                    max_attempts: Some(0),
                    max_empty_reads: u32::MAX,
                    ..ReconnectConfig::default()
                },
                ..CaptureConfig::default()
            };
            config.cameras = cameras
                .iter()
                .map(|(index, _)| CameraConfig::new(index.to_string(), CameraSource::Device { index: *index }))
                .collect();

            let backends = Backends {
                clock: clock.clone(),
                cameras: Arc::new(SyntheticCameras {
                    clock: clock.clone(),
                    fail_at_us: cameras
                        .iter()
                        .filter_map(|(index, fail)| fail.map(|f| (*index, f)))
                        .collect(),
                }),
                audio: Some(Arc::new(SyntheticMicrophone {
                    clock: clock.clone(),
                    impacts: impacts_us.iter().map(|t| chunk_at(*t)).collect(),
                })),
                writer: Arc::new(StubWriter),
            };

            let session = CaptureSession::start(config, backends).await.unwrap();
            let events = session.subscribe();
            let driver = ClockDriver::start(clock.clone());
            Self {
                session,
                clock,
                events,
                driver,
                dir,
            }
        }

        /// Next completed clip, with every trigger seen on the way
        async fn next_clip(&mut self) -> (Clip, Vec<TriggerEvent>) {
            let mut triggers = Vec::new();
            let clip = tokio::time::timeout(Duration::from_secs(60), async {
                loop {
                    match self.events.recv().await {
                        Ok(CaptureEvent::ClipCompleted(clip)) => return clip,
                        Ok(CaptureEvent::Trigger(trigger)) => triggers.push(trigger),
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => panic!("event bus closed"),
                    }
                }
            })
            .await
            .expect("clip completed in time");
            (clip, triggers)
        }

        async fn wait_for_clock(&self, time_us: u64) {
            let deadline = Instant::now() + Duration::from_secs(60);
            while self.clock.now_us() < time_us && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn stop(self) -> TempDir {
            self.session.stop().await;
            drop(self.driver);
            self.dir
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_impact_produces_clip_around_trigger() {
        let mut rig = Rig::start(&[(1, None)], &[5_000_000], true).await;
        let (clip, triggers) = rig.next_clip().await;

        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].source, TriggerSource::Heuristic);
        assert_eq!(clip.trigger_id, triggers[0].id);
        assert_eq!(clip.name, "shot_0001");
        assert_eq!(clip.status, ClipStatus::Complete);

        let trigger_us = clip.trigger_timestamp_us;
        let file = clip.primary_file().unwrap();
        assert!((85..=95).contains(&file.frame_count), "got {} frames", file.frame_count);
        assert!(file.start_us >= trigger_us - 1_000_000);
        assert!(file.end_us <= trigger_us + 2_000_000);
        assert!(file.path.ends_with("shot_0001.mp4"));
        assert!(file.path.exists());
        assert!(clip.thumbnail.as_ref().is_some_and(|t| t.exists()));

        assert_eq!(rig.session.visible_clips().len(), 1);
        assert_eq!(rig.session.clip_path(clip.id, None), Some(file.path.clone()));
        assert_eq!(rig.session.recording_state(), RecordingState::Idle);
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_lost_mid_clip_is_partial() {
        let mut rig = Rig::start(&[(1, None), (2, Some(5_500_000))], &[5_000_000], true).await;
        let (clip, _) = rig.next_clip().await;

        assert_eq!(clip.status, ClipStatus::Partial);
        assert_eq!(clip.partial_cameras, vec!["2".to_string()]);

        let main = clip.file_for("1").unwrap();
        assert!((85..=95).contains(&main.frame_count), "got {} frames", main.frame_count);
        let lost = clip.file_for("2").unwrap();
        assert!((35..=50).contains(&lost.frame_count), "got {} frames", lost.frame_count);
        assert!(lost.path.ends_with("shot_0001_cam2.mp4"));
        assert_eq!(rig.session.camera_state("2"), Some(CameraState::Disconnected));
        assert_eq!(rig.session.camera_state("1"), Some(CameraState::Streaming));
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_triggers_during_clip_are_debounced() {
        let mut rig = Rig::start(&[(1, None)], &[5_000_000, 5_100_000], true).await;
        let (clip, mut triggers) = rig.next_clip().await;
        rig.wait_for_clock(8_500_000).await;
        while let Ok(event) = rig.events.try_recv() {
            if let CaptureEvent::Trigger(trigger) = event {
                triggers.push(trigger);
            }
        }

        assert_eq!(triggers.len(), 1);
        assert_eq!(clip.shot_number, 1);
        assert_eq!(rig.session.clips().len(), 1);
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mark_not_shot_relabels_and_hides_clip() {
        let mut rig = Rig::start(&[(1, None)], &[5_000_000], true).await;
        let (clip, _) = rig.next_clip().await;

        let deadline = Instant::now() + Duration::from_secs(10);
        while rig.session.training_counts() != (1, 0) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.session.training_counts(), (1, 0));

        let marked = rig.session.mark_not_shot().await.unwrap().unwrap();
        assert_eq!(marked.id, clip.id);
        assert!(marked.marked_not_shot);
        assert!(!clip.primary_file().unwrap().path.exists());
        assert!(rig.session.visible_clips().is_empty());
        assert_eq!(rig.session.clips().len(), 1);
        assert_eq!(rig.session.training_counts(), (0, 1));

        // Nothing left to mark
        assert!(rig.session.mark_not_shot().await.unwrap().is_none());
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mark_not_shot_only_touches_its_own_clip() {
        let mut rig = Rig::start(&[(1, None)], &[5_000_000, 10_000_000], true).await;
        let (first, _) = rig.next_clip().await;
        let (second, _) = rig.next_clip().await;
        assert_eq!(first.name, "shot_0001");
        assert_eq!(second.name, "shot_0002");

        let deadline = Instant::now() + Duration::from_secs(10);
        while rig.session.training_counts() != (2, 0) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.session.training_counts(), (2, 0));

        let marked = rig.session.mark_not_shot().await.unwrap().unwrap();
        assert_eq!(marked.id, second.id);
        assert_eq!(rig.session.training_counts(), (1, 1));

        // The latest sample's clip is already gone, the earlier shot stays
        assert!(rig.session.mark_not_shot().await.unwrap().is_none());
        assert!(first.primary_file().unwrap().path.exists());
        assert_eq!(rig.session.visible_clips().len(), 1);
        assert_eq!(rig.session.training_counts(), (1, 1));

        let marked = rig.session.mark_clip_not_shot(first.id).await.unwrap();
        assert_eq!(marked.id, first.id);
        assert!(marked.marked_not_shot);
        assert!(!first.primary_file().unwrap().path.exists());
        assert!(rig.session.visible_clips().is_empty());
        assert_eq!(rig.session.training_counts(), (0, 2));

        assert!(rig.session.mark_clip_not_shot(Uuid::new_v4()).await.is_err());
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_on_completion_starts_next_clip() {
        let mut rig = Rig::start(&[(1, None)], &[5_000_000], true).await;
        let (first, _) = rig.next_clip().await;
        let fired = rig.session.manual_trigger().expect("trigger accepted once idle");

        let (second, _) = rig.next_clip().await;
        assert_eq!(second.trigger_id, fired.id);
        assert_eq!(second.trigger_source, TriggerSource::Manual);
        assert_eq!(second.shot_number, first.shot_number + 1);
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_trigger_while_disarmed() {
        let mut rig = Rig::start(&[(1, None)], &[2_000_000], false).await;
        rig.wait_for_clock(3_000_000).await;
        assert!(!rig.session.is_armed());
        let fired = rig.session.manual_trigger().unwrap();

        let (clip, triggers) = rig.next_clip().await;
        assert_eq!(triggers.len(), 1);
        assert_eq!(clip.trigger_id, fired.id);
        assert_eq!(clip.trigger_source, TriggerSource::Manual);
        assert_eq!(clip.status, ClipStatus::Complete);
        assert_eq!(rig.session.training_counts(), (0, 0));
        rig.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_finalizes_clip_in_progress() {
        let rig = Rig::start(&[(1, None)], &[], true).await;
        rig.wait_for_clock(3_000_000).await;
        rig.session.manual_trigger().unwrap();
        rig.wait_for_clock(3_200_000).await;
        let dir = rig.stop().await;

        let store = SessionStore::open(dir.path().join("session")).unwrap();
        let clips = store.clips();
        assert_eq!(clips.len(), 1);
        let frames = clips[0].primary_file().unwrap().frame_count;
        assert!(frames > 25 && frames < 85, "got {} frames", frames);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_controls() {
        let rig = Rig::start(&[(1, None), (2, None)], &[], true).await;

        let rotated = Transform {
            rotation: 450,
            ..Transform::default()
        };
        rig.session.set_camera_transform("1", rotated).unwrap();
        assert!(rig.session.set_camera_transform("9", rotated).is_err());

        rig.session.disable_camera("2").await.unwrap();
        assert_eq!(rig.session.camera_state("2"), None);
        assert_eq!(rig.session.feeds.len(), 1);

        let mut camera = CameraConfig::new("2", CameraSource::Device { index: 2 });
        camera.label = "Down the line".to_string();
        rig.session.restart_camera(camera).await.unwrap();
        assert_eq!(rig.session.feeds.len(), 2);
        assert_eq!(rig.session.feeds.get("2").unwrap().label, "Down the line");

        rig.session.set_detection_threshold(250.0);
        assert!(rig.session.audio_running());
        assert!(rig.session.refresh_audio().await);
        rig.stop().await;
    }
}
