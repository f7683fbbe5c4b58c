//! Training sample capture
//!
//! Listens for audio-detected triggers and saves each as a positive sample:
//! features plus the audio history leading up to it. New samples may make a
//! retrain due, which runs off the audio thread.

use crate::buffer::{concat_samples, AudioHistory};
use crate::detection::{Classifier, TrainingStore};
use crate::events::{CaptureEvent, EventBus, TriggerEvent, TriggerSource};
use crate::utils::ErrorKind;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

pub struct TrainingRecorder {
    store: Arc<TrainingStore>,
    classifier: Arc<Classifier>,
    history: Arc<AudioHistory>,
    bus: EventBus,
}

impl TrainingRecorder {
    pub fn new(
        store: Arc<TrainingStore>,
        classifier: Arc<Classifier>,
        history: Arc<AudioHistory>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            classifier,
            history,
            bus,
        }
    }

    pub async fn run(
        self,
        mut events: broadcast::Receiver<CaptureEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while !*shutdown.borrow() {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(CaptureEvent::Trigger(trigger)) if trigger.source != TriggerSource::Manual => {
                        self.record(trigger).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Training recorder lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn record(&self, trigger: TriggerEvent) {
        let Some(features) = trigger.features else {
            return;
        };
        let chunks = self.history.snapshot();
        let sample_rate = chunks.last().map_or(0, |c| c.sample_rate);
        let audio = concat_samples(&chunks);
        let threshold = self.classifier.threshold();

        let store = self.store.clone();
        let saved = tokio::task::spawn_blocking(move || {
            store.save_trigger(
                Some(trigger.id),
                features,
                trigger.confidence,
                threshold,
                &audio,
                sample_rate,
            )
        })
        .await;

        match saved {
            Ok(Ok(sample)) => {
                tracing::debug!("Recorded training sample {}", sample.id);
                self.classifier.add_sample(sample);
                self.classifier.maybe_retrain();
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to save training sample: {}", e);
                self.bus.status(
                    "training",
                    ErrorKind::PersistenceFailure,
                    format!("Training sample not saved: {}", e),
                );
            }
            Err(e) => tracing::error!("Training sample task failed: {}", e),
        }
    }
}
