//! Camera worker
//!
//! One thread per camera. Opens the source, applies the live transform to
//! each frame, pushes it into the camera's history and publishes it on the
//! camera channel. Read failures lead to reconnection with exponential backoff
//! for as long as the worker is running.

use super::backoff::Backoff;
use super::pacing::{FpsMeter, FramePacer};
use crate::buffer::FrameHistory;
use crate::capture::{CaptureError, Frame, FrameSource, SourceOpener, Transform};
use crate::config::{CameraConfig, ReconnectConfig};
use crate::events::{CameraState, CaptureEvent, EventBus};
use crate::utils::StopSignal;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;

const FPS_REPORT_INTERVAL_US: u64 = 5_000_000;

/// Everything a camera worker needs, fixed at spawn
pub struct CameraWorker {
    camera: CameraConfig,
    opener: Arc<dyn SourceOpener>,
    history: Arc<FrameHistory>,
    transform: Arc<RwLock<Transform>>,
    state: Arc<RwLock<CameraState>>,
    bus: EventBus,
    reconnect: ReconnectConfig,
    fps: u32,
}

/// Running camera worker
pub struct CameraHandle {
    camera_id: String,
    history: Arc<FrameHistory>,
    transform: Arc<RwLock<Transform>>,
    state: Arc<RwLock<CameraState>>,
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl CameraHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn history(&self) -> Arc<FrameHistory> {
        self.history.clone()
    }

    pub fn state(&self) -> CameraState {
        *self.state.read()
    }

    pub fn transform(&self) -> Transform {
        *self.transform.read()
    }

    /// Takes effect from the next frame
    pub fn set_transform(&self, transform: Transform) {
        *self.transform.write() = transform.normalized();
        tracing::debug!("Camera {} transform updated: {:?}", self.camera_id, transform);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the worker and wait for it to release its source
    pub fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Camera worker {} panicked", self.camera_id);
            }
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// How a streaming session ended
enum StreamEnd {
    Stopped,
    Interrupted(CaptureError),
}

impl CameraWorker {
    pub fn new(
        camera: CameraConfig,
        opener: Arc<dyn SourceOpener>,
        history: Arc<FrameHistory>,
        bus: EventBus,
        reconnect: ReconnectConfig,
        fps: u32,
    ) -> Self {
        let transform = Arc::new(RwLock::new(camera.transform.normalized()));
        Self {
            camera,
            opener,
            history,
            transform,
            state: Arc::new(RwLock::new(CameraState::Disconnected)),
            bus,
            reconnect,
            fps,
        }
    }

    /// Start the worker thread
    pub fn spawn(self) -> std::io::Result<CameraHandle> {
        let stop = Arc::new(StopSignal::new());
        let handle_stop = stop.clone();
        let camera_id = self.camera.id.clone();
        let history = self.history.clone();
        let transform = self.transform.clone();
        let state = self.state.clone();

        let thread = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || self.run(&stop))?;

        Ok(CameraHandle {
            camera_id,
            history,
            transform,
            state,
            stop: handle_stop,
            thread: Some(thread),
        })
    }

    fn status_source(&self) -> String {
        format!("camera:{}", self.camera.id)
    }

    fn set_state(&self, state: CameraState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!("Camera {}: {:?} -> {:?}", self.camera.id, previous, state);
            self.bus.publish_camera_state(&self.camera.id, state);
        }
    }

    fn run(self, stop: &StopSignal) {
        let clock = self.bus.clock().clone();
        let mut backoff = Backoff::from_config(&self.reconnect);
        let mut sequence = 0u64;

        tracing::info!(
            "Camera worker {} ({}) starting on {}",
            self.camera.id,
            self.camera.display_label(),
            self.camera.source
        );
        self.set_state(CameraState::Connecting);

        while !stop.is_stopped() {
            match self.opener.open(&self.camera.source) {
                Ok(mut source) => {
                    backoff.reset();
                    self.set_state(CameraState::Streaming);
                    tracing::info!("Camera {} streaming", self.camera.id);

                    let end = self.stream(source.as_mut(), &mut sequence, stop);
                    source.close();
                    match end {
                        StreamEnd::Stopped => break,
                        StreamEnd::Interrupted(e) => {
                            tracing::warn!("Camera {} stream interrupted: {}", self.camera.id, e);
                            self.bus.status(self.status_source(), e.kind(), e.to_string());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to open camera {}: {}", self.camera.id, e);
                    self.bus.status(self.status_source(), e.kind(), e.to_string());
                }
            }

            if let Some(max) = self.reconnect.max_attempts {
                if backoff.attempts() >= max {
                    tracing::error!(
                        "Giving up on camera {} after {} reconnect attempts",
                        self.camera.id,
                        max
                    );
                    break;
                }
            }

            self.set_state(CameraState::Reconnecting);
            let delay = backoff.next_delay();
            tracing::info!(
                "Reconnecting camera {} in {:?} (attempt {})",
                self.camera.id,
                delay,
                backoff.attempts()
            );
            if clock.sleep(delay, stop) {
                break;
            }
        }

        self.set_state(CameraState::Disconnected);
        tracing::info!("Camera worker {} stopped", self.camera.id);
    }

    fn stream(&self, source: &mut dyn FrameSource, sequence: &mut u64, stop: &StopSignal) -> StreamEnd {
        let clock = self.bus.clock().clone();
        let mut pacer = FramePacer::new(self.fps);
        let mut meter = FpsMeter::new(FPS_REPORT_INTERVAL_US);
        let mut empty_reads = 0u32;
        let mut first = true;

        loop {
            if stop.is_stopped() {
                return StreamEnd::Stopped;
            }

            let image = match source.read_frame() {
                Ok(Some(image)) => image,
                Ok(None) => {
                    empty_reads += 1;
                    if empty_reads > self.reconnect.max_empty_reads {
                        return StreamEnd::Interrupted(CaptureError::StreamInterrupted(format!(
                            "no frame in {} consecutive reads",
                            empty_reads
                        )));
                    }
                    continue;
                }
                Err(e) => return StreamEnd::Interrupted(e),
            };
            empty_reads = 0;

            let timestamp_us = clock.now_us();
            if !pacer.admit(timestamp_us) {
                continue;
            }

            let transform = *self.transform.read();
            let image = transform.apply(image);
            if first {
                tracing::info!(
                    "Camera {} first frame: {}x{}",
                    self.camera.id,
                    image.width,
                    image.height
                );
                first = false;
            }

            *sequence += 1;
            let frame = self.history.push(Frame {
                camera_id: self.camera.id.clone(),
                timestamp_us,
                sequence: *sequence,
                image,
            });
            self.bus.publish_frame(frame);

            if let Some(fps) = meter.tick(timestamp_us) {
                tracing::debug!("Camera {}: {:.1} fps", self.camera.id, fps);
                self.bus.publish(CaptureEvent::CameraFps {
                    camera_id: self.camera.id.clone(),
                    fps,
                });
            }
        }
    }
}
