//! Labeled training samples on disk
//!
//! Layout of the training directory:
//!   trigger_<ms>_meta.json     features, confidence, label, threshold
//!   trigger_<ms>_shot.wav      audio leading up to a positive trigger
//!   trigger_<ms>_not_shot.wav  same, after the user marked it not a shot
//!   audio_classifier.json      last trained model

use super::features::FeatureVector;
use super::forest::LearnedModel;
use super::DetectionError;
use crate::utils::fs::write_json_atomic;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MODEL_FILE: &str = "audio_classifier.json";

const META_SUFFIX: &str = "_meta.json";
const SHOT_SUFFIX: &str = "_shot.wav";
const NOT_SHOT_SUFFIX: &str = "_not_shot.wav";

/// Sample label, stored as 1 (shot) / 0 (not shot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Shot,
    NotShot,
}

impl Label {
    pub fn is_shot(&self) -> bool {
        matches!(self, Label::Shot)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(if self.is_shot() { 1 } else { 0 })
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Label::Shot),
            0 => Ok(Label::NotShot),
            other => Err(serde::de::Error::custom(format!("invalid label {}", other))),
        }
    }
}

/// One labeled feature vector
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    /// File stem, `trigger_<ms>`
    pub id: String,
    pub features: FeatureVector,
    pub label: Label,
    /// Wall clock, milliseconds since the epoch
    pub timestamp_ms: i64,
    pub confidence: f32,
    pub threshold: f32,
    /// Trigger that produced the sample, linking it to its clip
    pub trigger_id: Option<Uuid>,
}

impl TrainingSample {
    pub fn new(features: FeatureVector, label: Label, confidence: f32, threshold: f32) -> Self {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("trigger_{}", timestamp_ms),
            features,
            label,
            timestamp_ms,
            confidence,
            threshold,
            trigger_id: None,
        }
    }
}

/// On-disk shape of `trigger_<ms>_meta.json`
#[derive(Debug, Serialize, Deserialize)]
struct SampleMeta {
    timestamp: i64,
    #[serde(default)]
    confidence: f32,
    features: FeatureVector,
    #[serde(default)]
    label: Option<Label>,
    #[serde(default)]
    threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trigger_id: Option<Uuid>,
}

/// Training directory access
#[derive(Debug, Clone)]
pub struct TrainingStore {
    dir: PathBuf,
}

impl TrainingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, META_SUFFIX))
    }

    fn wav_path(&self, id: &str, label: Label) -> PathBuf {
        let suffix = if label.is_shot() { SHOT_SUFFIX } else { NOT_SHOT_SUFFIX };
        self.dir.join(format!("{}{}", id, suffix))
    }

    /// Persist a positive sample with the audio that led up to it
    pub fn save_trigger(
        &self,
        trigger_id: Option<Uuid>,
        features: FeatureVector,
        confidence: f32,
        threshold: f32,
        audio: &[f32],
        sample_rate: u32,
    ) -> Result<TrainingSample, DetectionError> {
        std::fs::create_dir_all(&self.dir)?;

        let mut sample = TrainingSample::new(features, Label::Shot, confidence, threshold);
        sample.trigger_id = trigger_id;
        // Two triggers in the same millisecond get distinct names
        while self.meta_path(&sample.id).exists() {
            sample.timestamp_ms += 1;
            sample.id = format!("trigger_{}", sample.timestamp_ms);
        }

        if !audio.is_empty() {
            write_wav(&self.wav_path(&sample.id, sample.label), audio, sample_rate)?;
        }
        self.write_meta(&sample)?;

        tracing::debug!("Saved training sample {}", sample.id);
        Ok(sample)
    }

    fn write_meta(&self, sample: &TrainingSample) -> Result<(), DetectionError> {
        let meta = SampleMeta {
            timestamp: sample.timestamp_ms,
            confidence: sample.confidence,
            features: sample.features,
            label: Some(sample.label),
            threshold: sample.threshold,
            trigger_id: sample.trigger_id,
        };
        write_json_atomic(&self.meta_path(&sample.id), &meta)?;
        Ok(())
    }

    /// Rewrite a sample's label, renaming its audio to match
    pub fn relabel(&self, sample: &TrainingSample) -> Result<(), DetectionError> {
        let other = if sample.label.is_shot() {
            Label::NotShot
        } else {
            Label::Shot
        };
        let from = self.wav_path(&sample.id, other);
        if from.exists() {
            std::fs::rename(&from, self.wav_path(&sample.id, sample.label))?;
        }
        self.write_meta(sample)
    }

    /// Every readable sample, oldest first. Unreadable files are skipped.
    pub fn load_samples(&self) -> Result<Vec<TrainingSample>, DetectionError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut samples = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name
                .strip_suffix(META_SUFFIX)
                .filter(|id| id.starts_with("trigger_"))
            else {
                continue;
            };

            match self.read_sample(id, &path) {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => tracing::debug!("Skipping unlabeled sample {}", id),
                Err(e) => tracing::warn!("Skipping unreadable sample {}: {}", id, e),
            }
        }

        samples.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms).then(a.id.cmp(&b.id)));
        Ok(samples)
    }

    fn read_sample(&self, id: &str, path: &Path) -> Result<Option<TrainingSample>, DetectionError> {
        let meta: SampleMeta = serde_json::from_str(&std::fs::read_to_string(path)?)?;

        // Older metadata may lack a label; the audio file name carries it
        let label = match meta.label {
            Some(label) => label,
            None if self.wav_path(id, Label::Shot).exists() => Label::Shot,
            None if self.wav_path(id, Label::NotShot).exists() => Label::NotShot,
            None => return Ok(None),
        };

        Ok(Some(TrainingSample {
            id: id.to_string(),
            features: meta.features,
            label,
            timestamp_ms: meta.timestamp,
            confidence: meta.confidence,
            threshold: meta.threshold,
            trigger_id: meta.trigger_id,
        }))
    }

    pub fn save_model(&self, model: &LearnedModel) -> Result<(), DetectionError> {
        write_json_atomic(&self.model_path(), model)?;
        Ok(())
    }

    /// `Ok(None)` when no model has been saved yet
    pub fn load_model(&self) -> Result<Option<LearnedModel>, DetectionError> {
        let path = self.model_path();
        if !path.exists() {
            return Ok(None);
        }
        let model = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        Ok(Some(model))
    }
}

/// 16-bit mono PCM
fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), DetectionError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::forest::tests::labeled;
    use crate::detection::ForestParams;
    use tempfile::tempdir;

    fn features() -> FeatureVector {
        FeatureVector {
            crest_factor: 7.0,
            impact_ratio: 0.4,
            ..Default::default()
        }
    }

    #[test]
    fn test_save_and_load_sample() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        let sample = store
            .save_trigger(Some(Uuid::new_v4()), features(), 0.8, 0.45, &[0.0, 0.5, -0.5], 44_100)
            .unwrap();
        assert_eq!(sample.label, Label::Shot);
        assert!(dir.path().join(format!("{}_shot.wav", sample.id)).exists());

        let reader = hound::WavReader::open(dir.path().join(format!("{}_shot.wav", sample.id))).unwrap();
        assert_eq!(reader.spec().sample_rate, 44_100);
        assert_eq!(reader.len(), 3);

        let loaded = store.load_samples().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], sample);
    }

    #[test]
    fn test_same_millisecond_triggers_get_distinct_ids() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());
        let a = store.save_trigger(None, features(), 0.8, 0.45, &[], 44_100).unwrap();
        let b = store.save_trigger(None, features(), 0.8, 0.45, &[], 44_100).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.load_samples().unwrap().len(), 2);
    }

    #[test]
    fn test_relabel_renames_audio() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());
        let mut sample = store.save_trigger(None, features(), 0.8, 0.45, &[0.1; 16], 8_000).unwrap();

        sample.label = Label::NotShot;
        store.relabel(&sample).unwrap();

        assert!(!dir.path().join(format!("{}_shot.wav", sample.id)).exists());
        assert!(dir.path().join(format!("{}_not_shot.wav", sample.id)).exists());
        assert_eq!(store.load_samples().unwrap()[0].label, Label::NotShot);
    }

    #[test]
    fn test_label_inferred_from_wav_name() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("trigger_100_meta.json"),
            r#"{"timestamp": 100, "features": {"rms": 0.1, "peak": 0.2, "crest_factor": 2.0, "zcr": 0.1,
                "spectral_centroid": 100.0, "spectral_rolloff": 200.0, "energy_0_500": 0.9,
                "energy_500_2k": 0.1, "energy_2k_6k": 0.0, "energy_6k_plus": 0.0,
                "impact_ratio": 0.0, "rise_time": 300.0}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("trigger_100_not_shot.wav"), b"").unwrap();
        std::fs::write(dir.path().join("trigger_200_meta.json"), "garbage").unwrap();

        let samples = TrainingStore::new(dir.path()).load_samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, Label::NotShot);
        assert_eq!(samples[0].id, "trigger_100");
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path().join("nope"));
        assert!(store.load_samples().unwrap().is_empty());
        assert!(store.load_model().unwrap().is_none());
    }

    #[test]
    fn test_model_round_trip() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());
        let model = LearnedModel::train(&labeled(5), &ForestParams::default()).unwrap();
        store.save_model(&model).unwrap();
        assert_eq!(store.load_model().unwrap().unwrap().n_samples, 10);
    }

    #[test]
    fn test_label_serializes_as_int() {
        assert_eq!(serde_json::to_string(&Label::Shot).unwrap(), "1");
        assert_eq!(serde_json::from_str::<Label>("0").unwrap(), Label::NotShot);
        assert!(serde_json::from_str::<Label>("7").is_err());
    }
}
