//! Dual-mode impact classifier
//!
//! Starts in heuristic mode. Once enough labeled samples of both kinds exist
//! a forest is trained off the audio thread and swapped in; from then on the
//! classifier stays learned and retrains as new labels arrive. Readers clone
//! the current `Arc<LearnedModel>` under a short read lock, so a retrain can
//! never expose a half-built model.

use super::features::FeatureVector;
use super::forest::{ForestParams, LearnedModel};
use super::heuristic::HeuristicConfig;
use super::training::{Label, TrainingSample, TrainingStore};
use super::DetectionError;
use crate::config::{effective_threshold, ClassifierConfig};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

/// Which scorer produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassifierMode {
    Heuristic,
    Learned,
}

/// Outcome for one audio chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub timestamp_us: u64,
    /// Model output before thresholding, 0..=1
    pub confidence: f32,
    /// `confidence >= threshold`
    pub triggered: bool,
    pub mode: ClassifierMode,
    pub features: FeatureVector,
    /// Meter level, min(1, rms × 10)
    pub level: f32,
}

/// Impact classifier shared by the audio worker and the training path
pub struct Classifier {
    heuristic: HeuristicConfig,
    forest: ForestParams,
    decision_threshold: f32,
    /// Capability flag: whether learned mode may ever be entered
    learned_enabled: bool,
    retrain_threshold: usize,
    retrain_interval: usize,

    /// Effective threshold as f32 bits
    threshold: AtomicU32,
    /// Set once learned mode has been entered; never cleared
    learned: AtomicBool,
    model: RwLock<Option<Arc<LearnedModel>>>,

    samples: Mutex<Vec<TrainingSample>>,
    labels_since_train: AtomicUsize,
    retraining: AtomicBool,
    degraded: Mutex<Option<String>>,
    degraded_reported: AtomicBool,

    store: Option<Arc<TrainingStore>>,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig, threshold_percent: f32) -> Self {
        let threshold = effective_threshold(config.decision_threshold, threshold_percent);
        Self {
            heuristic: config.heuristic.clone(),
            forest: config.forest.clone(),
            decision_threshold: config.decision_threshold,
            learned_enabled: config.learned_mode,
            retrain_threshold: config.retrain_threshold,
            retrain_interval: config.retrain_interval.max(1),
            threshold: AtomicU32::new(threshold.to_bits()),
            learned: AtomicBool::new(false),
            model: RwLock::new(None),
            samples: Mutex::new(Vec::new()),
            labels_since_train: AtomicUsize::new(0),
            retraining: AtomicBool::new(false),
            degraded: Mutex::new(None),
            degraded_reported: AtomicBool::new(false),
            store: None,
        }
    }

    /// Persist trained models to this store
    pub fn with_store(mut self, store: Arc<TrainingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Seed the classifier from disk: previously labeled samples and, if it was
    /// trained on enough of them, the saved model.
    pub fn restore(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        match store.load_samples() {
            Ok(samples) => {
                tracing::info!("Loaded {} training samples", samples.len());
                *self.samples.lock() = samples;
            }
            Err(e) => tracing::warn!("Failed to read training samples: {}", e),
        }

        if !self.learned_enabled {
            return;
        }
        match store.load_model() {
            Ok(Some(model)) if model.n_samples >= self.retrain_threshold => {
                tracing::info!("Loaded learned audio classifier ({} samples)", model.n_samples);
                self.install(model);
            }
            Ok(Some(model)) => {
                tracing::info!(
                    "Ignoring saved classifier trained on {} samples (need {})",
                    model.n_samples,
                    self.retrain_threshold
                );
            }
            Ok(None) => {}
            Err(e) => {
                // A model existed but cannot be used; stay learned and score heuristically
                self.learned.store(true, Ordering::SeqCst);
                self.flag_degraded(format!("Saved classifier unusable: {}", e));
            }
        }
    }

    pub fn mode(&self) -> ClassifierMode {
        if self.learned.load(Ordering::SeqCst) {
            ClassifierMode::Learned
        } else {
            ClassifierMode::Heuristic
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.read().is_some()
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold.load(Ordering::Relaxed))
    }

    /// Apply the sensitivity slider (1-100%)
    pub fn set_threshold_percent(&self, percent: f32) {
        let threshold = effective_threshold(self.decision_threshold, percent);
        self.threshold.store(threshold.to_bits(), Ordering::Relaxed);
        tracing::debug!("Detection threshold {}% -> {:.3}", percent, threshold);
    }

    /// Score one chunk's features. Never fails or blocks on training.
    pub fn classify(&self, features: &FeatureVector, timestamp_us: u64) -> ClassificationResult {
        let (confidence, mode) = self.score(features);
        ClassificationResult {
            timestamp_us,
            confidence,
            triggered: confidence >= self.threshold(),
            mode,
            features: *features,
            level: features.level(),
        }
    }

    fn score(&self, features: &FeatureVector) -> (f32, ClassifierMode) {
        if self.learned.load(Ordering::SeqCst) {
            let model = self.model.read().clone();
            match model {
                Some(model) => return (model.confidence(features), ClassifierMode::Learned),
                None => self.flag_degraded("No trained model available".to_string()),
            }
        }
        (self.heuristic.score(features), ClassifierMode::Heuristic)
    }

    fn flag_degraded(&self, message: String) {
        if !self.degraded_reported.swap(true, Ordering::SeqCst) {
            tracing::warn!("Classification degraded: {}", message);
            *self.degraded.lock() = Some(message);
        }
    }

    /// The pending degraded-mode report, handed out once
    pub fn take_degraded(&self) -> Option<String> {
        self.degraded.lock().take()
    }

    fn install(&self, model: LearnedModel) {
        *self.model.write() = Some(Arc::new(model));
        self.learned.store(true, Ordering::SeqCst);
        self.degraded_reported.store(false, Ordering::SeqCst);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// (shots, not shots)
    pub fn label_counts(&self) -> (usize, usize) {
        let samples = self.samples.lock();
        let shots = samples.iter().filter(|s| s.label.is_shot()).count();
        (shots, samples.len() - shots)
    }

    /// Record a labeled sample. Returns true if a retrain is now due.
    pub fn add_sample(&self, sample: TrainingSample) -> bool {
        self.samples.lock().push(sample);
        self.labels_since_train.fetch_add(1, Ordering::SeqCst);
        self.retrain_due()
    }

    /// Relabel the most recent sample. Returns the updated sample.
    pub fn relabel_latest(&self, label: Label) -> Option<TrainingSample> {
        let mut samples = self.samples.lock();
        let latest = samples.last_mut()?;
        if latest.label != label {
            latest.label = label;
            self.labels_since_train.fetch_add(1, Ordering::SeqCst);
        }
        Some(latest.clone())
    }

    /// Relabel the sample recorded for `trigger_id`, if there is one
    pub fn relabel_trigger(&self, trigger_id: Uuid, label: Label) -> Option<TrainingSample> {
        let mut samples = self.samples.lock();
        let sample = samples
            .iter_mut()
            .rev()
            .find(|s| s.trigger_id == Some(trigger_id))?;
        if sample.label != label {
            sample.label = label;
            self.labels_since_train.fetch_add(1, Ordering::SeqCst);
        }
        Some(sample.clone())
    }

    pub fn retrain_due(&self) -> bool {
        if !self.learned_enabled {
            return false;
        }
        let (shots, not_shots) = self.label_counts();
        if shots + not_shots < self.retrain_threshold || shots == 0 || not_shots == 0 {
            return false;
        }
        !self.has_model() || self.labels_since_train.load(Ordering::SeqCst) >= self.retrain_interval
    }

    /// Train on the current samples and swap the model in. `Ok(false)` when
    /// there is not yet enough data.
    pub fn retrain(&self) -> Result<bool, DetectionError> {
        if !self.learned_enabled {
            return Err(DetectionError::LearnedModeDisabled);
        }

        let (data, seen): (Vec<(FeatureVector, bool)>, usize) = {
            let samples = self.samples.lock();
            let data = samples.iter().map(|s| (s.features, s.label.is_shot())).collect();
            (data, self.labels_since_train.load(Ordering::SeqCst))
        };

        if data.len() < self.retrain_threshold {
            tracing::info!(
                "Not enough training samples ({}/{}), staying in {:?} mode",
                data.len(),
                self.retrain_threshold,
                self.mode()
            );
            return Ok(false);
        }
        let model = match LearnedModel::train(&data, &self.forest) {
            Ok(model) => model,
            Err(DetectionError::SingleClass) => {
                tracing::info!("Need both shot and not-shot samples to train");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save_model(&model) {
                tracing::warn!("Failed to save classifier: {}", e);
            }
        }

        let n = model.n_samples;
        self.install(model);
        // Labels that arrived during training still count toward the next run
        let _ = self
            .labels_since_train
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(seen)));
        tracing::info!("Audio classifier retrained with {} samples (mode: learned)", n);
        Ok(true)
    }

    /// Retrain on a background thread. Returns None if a retrain is already
    /// running or the thread could not be started.
    pub fn spawn_retrain(self: &Arc<Self>) -> Option<JoinHandle<Result<bool, DetectionError>>> {
        if self.retraining.swap(true, Ordering::SeqCst) {
            return None;
        }
        let classifier = self.clone();
        let spawned = std::thread::Builder::new()
            .name("classifier-retrain".to_string())
            .spawn(move || {
                let result = classifier.retrain();
                if let Err(e) = &result {
                    tracing::warn!("Classifier retrain failed: {}", e);
                }
                classifier.retraining.store(false, Ordering::SeqCst);
                result
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to start retrain thread: {}", e);
                self.retraining.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Retrain in the background if due
    pub fn maybe_retrain(self: &Arc<Self>) -> Option<JoinHandle<Result<bool, DetectionError>>> {
        if self.retrain_due() {
            self.spawn_retrain()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::forest::tests::labeled;
    use tempfile::tempdir;

    fn sample(features: FeatureVector, shot: bool) -> TrainingSample {
        let label = if shot { Label::Shot } else { Label::NotShot };
        TrainingSample::new(features, label, 0.5, 0.45)
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            forest: ForestParams {
                n_trees: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_silence_is_zero_confidence() {
        let classifier = Classifier::new(&config(), 30.0);
        let result = classifier.classify(&FeatureVector::default(), 7);
        assert_eq!(result.confidence, 0.0);
        assert!(!result.triggered);
        assert_eq!(result.mode, ClassifierMode::Heuristic);
        assert_eq!(result.timestamp_us, 7);
    }

    #[test]
    fn test_deterministic_in_both_modes() {
        let classifier = Arc::new(Classifier::new(&config(), 30.0));
        let probe = labeled(1)[0].0;
        let a = classifier.classify(&probe, 0);
        assert_eq!(a, classifier.classify(&probe, 0));

        for (features, shot) in labeled(5) {
            classifier.add_sample(sample(features, shot));
        }
        assert!(classifier.retrain().unwrap());
        let b = classifier.classify(&probe, 0);
        assert_eq!(b.mode, ClassifierMode::Learned);
        assert_eq!(b, classifier.classify(&probe, 0));
    }

    #[test]
    fn test_stays_heuristic_below_threshold() {
        let classifier = Arc::new(Classifier::new(&config(), 30.0));
        for (features, shot) in labeled(4).into_iter().take(9) {
            assert!(!classifier.add_sample(sample(features, shot)));
        }
        assert_eq!(classifier.sample_count(), 8);
        assert!(!classifier.retrain().unwrap());
        assert_eq!(classifier.mode(), ClassifierMode::Heuristic);
    }

    #[test]
    fn test_single_class_stays_heuristic() {
        let classifier = Classifier::new(&config(), 30.0);
        for (features, _) in labeled(6) {
            assert!(!classifier.add_sample(sample(features, true)));
        }
        assert!(!classifier.retrain().unwrap());
        assert_eq!(classifier.mode(), ClassifierMode::Heuristic);
    }

    #[test]
    fn test_transition_to_learned_in_background() {
        let classifier = Arc::new(Classifier::new(&config(), 30.0));
        let mut due = false;
        for (features, shot) in labeled(5) {
            due = classifier.add_sample(sample(features, shot));
        }
        assert!(due);
        let handle = classifier.maybe_retrain().unwrap();
        assert!(handle.join().unwrap().unwrap());
        assert_eq!(classifier.mode(), ClassifierMode::Learned);
        assert!(!classifier.retrain_due());
    }

    #[test]
    fn test_learned_without_model_falls_back_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TrainingStore::new(dir.path()));
        std::fs::write(store.model_path(), "{ corrupt").unwrap();

        let classifier = Classifier::new(&config(), 30.0).with_store(store);
        classifier.restore();
        assert_eq!(classifier.mode(), ClassifierMode::Learned);

        let result = classifier.classify(&labeled(1)[0].0, 0);
        assert_eq!(result.mode, ClassifierMode::Heuristic);
        assert!(classifier.take_degraded().is_some());
        classifier.classify(&labeled(1)[0].0, 0);
        assert!(classifier.take_degraded().is_none());
    }

    #[test]
    fn test_restore_respects_sample_threshold() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TrainingStore::new(dir.path()));
        let small = LearnedModel::train(&labeled(2), &ForestParams::default()).unwrap();
        store.save_model(&small).unwrap();

        let classifier = Classifier::new(&config(), 30.0).with_store(store.clone());
        classifier.restore();
        assert_eq!(classifier.mode(), ClassifierMode::Heuristic);

        let big = LearnedModel::train(&labeled(5), &ForestParams::default()).unwrap();
        store.save_model(&big).unwrap();
        let classifier = Classifier::new(&config(), 30.0).with_store(store);
        classifier.restore();
        assert_eq!(classifier.mode(), ClassifierMode::Learned);
    }

    #[test]
    fn test_threshold_scales_trigger_not_confidence() {
        let classifier = Classifier::new(&config(), 30.0);
        let features = FeatureVector {
            rms: 0.1,
            peak: 0.6,
            crest_factor: 5.0,
            zcr: 0.1,
            spectral_centroid: 2_000.0,
            impact_ratio: 0.2,
            rise_time: 200.0,
            ..Default::default()
        };
        // 0.15 + 0.15 + 0.10 + 0.15
        let at_default = classifier.classify(&features, 0);
        assert!((at_default.confidence - 0.55).abs() < 1e-6);
        assert!(at_default.triggered);

        classifier.set_threshold_percent(60.0);
        let strict = classifier.classify(&features, 0);
        assert_eq!(strict.confidence, at_default.confidence);
        assert!(!strict.triggered);
    }

    #[test]
    fn test_relabel_latest_counts_as_new_label() {
        let classifier = Classifier::new(&config(), 30.0);
        assert!(classifier.relabel_latest(Label::NotShot).is_none());
        classifier.add_sample(sample(FeatureVector::default(), true));
        let updated = classifier.relabel_latest(Label::NotShot).unwrap();
        assert_eq!(updated.label, Label::NotShot);
        assert_eq!(classifier.label_counts(), (0, 1));
    }

    #[test]
    fn test_relabel_by_trigger_leaves_other_samples() {
        let classifier = Classifier::new(&config(), 30.0);
        let mut first = sample(FeatureVector::default(), true);
        first.trigger_id = Some(Uuid::new_v4());
        let mut second = sample(FeatureVector::default(), true);
        second.trigger_id = Some(Uuid::new_v4());
        let target = first.trigger_id.unwrap();
        classifier.add_sample(first);
        classifier.add_sample(second);

        let updated = classifier.relabel_trigger(target, Label::NotShot).unwrap();
        assert_eq!(updated.trigger_id, Some(target));
        assert_eq!(classifier.label_counts(), (1, 1));
        assert!(classifier.relabel_trigger(Uuid::new_v4(), Label::NotShot).is_none());
    }

    #[test]
    fn test_disabled_learned_mode_never_retrains() {
        let classifier = Classifier::new(
            &ClassifierConfig {
                learned_mode: false,
                ..config()
            },
            30.0,
        );
        for (features, shot) in labeled(10) {
            assert!(!classifier.add_sample(sample(features, shot)));
        }
        assert!(matches!(classifier.retrain(), Err(DetectionError::LearnedModeDisabled)));
    }
}
