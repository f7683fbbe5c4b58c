//! Audio worker
//!
//! Owns the input stream on its own thread. Each chunk goes into the audio
//! history, through feature extraction and the classifier, and out as a
//! classification event; a triggering result is handed to the dispatcher,
//! which applies arming and debounce. A device failure ends the worker and is
//! reported; the rest of the session keeps running.

use crate::buffer::AudioHistory;
use crate::capture::{AudioChunk, AudioOpener};
use crate::detection::{Classifier, FeatureExtractor};
use crate::events::{CaptureEvent, EventBus, TriggerDispatcher};
use crate::utils::{ErrorKind, StopSignal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const STATUS_SOURCE: &str = "audio";

pub struct AudioWorker {
    opener: Arc<dyn AudioOpener>,
    history: Arc<AudioHistory>,
    classifier: Arc<Classifier>,
    dispatcher: TriggerDispatcher,
    bus: EventBus,
}

/// Running audio worker
pub struct AudioHandle {
    stop: Arc<StopSignal>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioHandle {
    /// False once the stream has failed or the worker was stopped
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Audio worker panicked");
            }
        }
    }
}

impl Drop for AudioHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

impl AudioWorker {
    pub fn new(
        opener: Arc<dyn AudioOpener>,
        history: Arc<AudioHistory>,
        classifier: Arc<Classifier>,
        dispatcher: TriggerDispatcher,
        bus: EventBus,
    ) -> Self {
        Self {
            opener,
            history,
            classifier,
            dispatcher,
            bus,
        }
    }

    pub fn spawn(self) -> std::io::Result<AudioHandle> {
        let stop = Arc::new(StopSignal::new());
        let running = Arc::new(AtomicBool::new(true));
        let (thread_stop, thread_running) = (stop.clone(), running.clone());

        let thread = std::thread::Builder::new()
            .name("audio-worker".to_string())
            .spawn(move || {
                self.run(&thread_stop);
                thread_running.store(false, Ordering::SeqCst);
            })?;

        Ok(AudioHandle {
            stop,
            running,
            thread: Some(thread),
        })
    }

    fn run(self, stop: &StopSignal) {
        // The stream lives and dies on this thread
        let mut source = match self.opener.open() {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Audio input unavailable, detection disabled: {}", e);
                self.bus.status(STATUS_SOURCE, e.kind(), e.to_string());
                return;
            }
        };
        let sample_rate = source.sample_rate();
        let mut extractor = FeatureExtractor::new(sample_rate);
        let clock = self.bus.clock().clone();

        tracing::info!(
            "Audio worker started at {} Hz (mode: {:?}, threshold {:.2})",
            sample_rate,
            self.classifier.mode(),
            self.classifier.threshold()
        );

        while !stop.is_stopped() {
            let samples = match source.read_chunk() {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!("Audio stream failed, detection disabled: {}", e);
                    self.bus.status(STATUS_SOURCE, e.kind(), e.to_string());
                    break;
                }
            };

            let timestamp_us = clock.now_us();
            let chunk = self.history.push(AudioChunk {
                timestamp_us,
                samples,
                sample_rate,
            });

            let features = extractor.extract(&chunk.samples);
            let result = self.classifier.classify(&features, timestamp_us);
            if let Some(message) = self.classifier.take_degraded() {
                self.bus
                    .status(STATUS_SOURCE, ErrorKind::ClassificationDegraded, message);
            }

            self.dispatcher.fire_detected(&result);
            self.bus.publish(CaptureEvent::Classification(result));
        }

        tracing::info!("Audio worker stopped");
    }
}
