//! Event bus between workers and the presentation layer
//!
//! Two broadcast channels: a high-rate camera channel carrying live frames
//! and camera state, and a low-rate channel for classification results,
//! triggers, clip notifications and status reports. Triggers reach the
//! recording manager through a dedicated mpsc queue guarded by `TriggerGate`.

use crate::capture::Frame;
use crate::detection::{ClassificationResult, ClassifierMode, FeatureVector};
use crate::recorder::Clip;
use crate::utils::{Clock, ErrorKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
const FRAME_CAPACITY: usize = 512;

/// What raised a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerSource {
    Heuristic,
    Learned,
    Manual,
}

impl From<ClassifierMode> for TriggerSource {
    fn from(mode: ClassifierMode) -> Self {
        match mode {
            ClassifierMode::Heuristic => TriggerSource::Heuristic,
            ClassifierMode::Learned => TriggerSource::Learned,
        }
    }
}

/// One detected (or injected) impact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub id: Uuid,
    pub timestamp_us: u64,
    pub confidence: f32,
    pub source: TriggerSource,
    /// Absent for manual triggers
    pub features: Option<FeatureVector>,
}

/// Camera worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CameraState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

/// Traffic on the camera channel
#[derive(Debug, Clone)]
pub enum CameraMessage {
    Frame(Arc<Frame>),
    State { camera_id: String, state: CameraState },
}

/// A recoverable failure, reported instead of propagated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Component that reported it, e.g. `camera:dtl` or `audio`
    pub source: String,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp_us: u64,
}

/// Traffic on the event channel
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Classification(ClassificationResult),
    Trigger(TriggerEvent),
    ClipCompleted(Clip),
    ClipFailed { trigger_id: Uuid, message: String },
    ClipRemoved { clip_id: Uuid },
    CameraFps { camera_id: String, fps: f64 },
    ArmedChanged(bool),
    Status(StatusEvent),
}

/// Sender halves of both broadcast channels
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<CaptureEvent>,
    camera: broadcast::Sender<CameraMessage>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (camera, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            events,
            camera,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_camera(&self) -> broadcast::Receiver<CameraMessage> {
        self.camera.subscribe()
    }

    /// Publishing never fails; an event with no subscriber is dropped
    pub fn publish(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }

    pub fn publish_frame(&self, frame: Arc<Frame>) {
        let _ = self.camera.send(CameraMessage::Frame(frame));
    }

    pub fn publish_camera_state(&self, camera_id: &str, state: CameraState) {
        let _ = self.camera.send(CameraMessage::State {
            camera_id: camera_id.to_string(),
            state,
        });
    }

    /// Report a recoverable failure
    pub fn status(&self, source: impl Into<String>, kind: ErrorKind, message: impl Into<String>) {
        let event = StatusEvent {
            source: source.into(),
            kind,
            message: message.into(),
            timestamp_us: self.clock.now_us(),
        };
        tracing::debug!("Status [{}] {}: {}", event.source, kind.code(), event.message);
        self.publish(CaptureEvent::Status(event));
    }
}

/// Debounce latch: held from trigger until the clip is finalized
#[derive(Debug, Default)]
pub struct TriggerGate {
    busy: AtomicBool,
}

impl TriggerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the caller now owns the gate
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Single entry point for audio-detected and manual triggers
#[derive(Clone)]
pub struct TriggerDispatcher {
    tx: mpsc::UnboundedSender<TriggerEvent>,
    gate: Arc<TriggerGate>,
    armed: Arc<AtomicBool>,
    bus: EventBus,
}

impl TriggerDispatcher {
    pub fn new(bus: EventBus, armed: bool) -> (Self, mpsc::UnboundedReceiver<TriggerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            gate: Arc::new(TriggerGate::new()),
            armed: Arc::new(AtomicBool::new(armed)),
            bus,
        };
        (dispatcher, rx)
    }

    pub fn gate(&self) -> Arc<TriggerGate> {
        self.gate.clone()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn set_armed(&self, armed: bool) {
        if self.armed.swap(armed, Ordering::SeqCst) != armed {
            tracing::info!("Audio trigger {}", if armed { "armed" } else { "disarmed" });
            self.bus.publish(CaptureEvent::ArmedChanged(armed));
        }
    }

    /// Fire for a classification result if armed and no clip is in progress
    pub fn fire_detected(&self, result: &ClassificationResult) -> Option<TriggerEvent> {
        if !result.triggered || !self.is_armed() || !self.gate.try_acquire() {
            return None;
        }
        let event = TriggerEvent {
            id: Uuid::new_v4(),
            timestamp_us: result.timestamp_us,
            confidence: result.confidence,
            source: result.mode.into(),
            features: Some(result.features),
        };
        tracing::info!(
            "Audio trigger: confidence={:.2}, mode={:?}",
            event.confidence,
            result.mode
        );
        self.dispatch(event)
    }

    /// Inject a trigger regardless of arming. While a clip is in progress the
    /// recording manager discards it as overlapping.
    pub fn fire_manual(&self) -> Option<TriggerEvent> {
        let _ = self.gate.try_acquire();
        let event = TriggerEvent {
            id: Uuid::new_v4(),
            timestamp_us: self.bus.clock().now_us(),
            confidence: 1.0,
            source: TriggerSource::Manual,
            features: None,
        };
        tracing::info!("Manual trigger");
        self.dispatch(event)
    }

    fn dispatch(&self, event: TriggerEvent) -> Option<TriggerEvent> {
        if self.tx.send(event.clone()).is_err() {
            tracing::warn!("Recording manager gone, dropping trigger");
            self.gate.release();
            return None;
        }
        self.bus.publish(CaptureEvent::Trigger(event.clone()));
        Some(event)
    }
}
