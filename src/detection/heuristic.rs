//! Rule-based impact scoring
//!
//! Each feature contributes the score of the first tier it satisfies; the sum
//! is reduced by a penalty for low-frequency dominated sounds (voices,
//! footsteps, wind) and clamped to 0..=1. All tiers are configuration.

use super::features::FeatureVector;
use serde::{Deserialize, Serialize};

/// Score awarded when a feature passes a threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub threshold: f32,
    pub score: f32,
}

impl Tier {
    pub const fn new(threshold: f32, score: f32) -> Self {
        Self { threshold, score }
    }
}

/// Score awarded when a feature lies strictly inside a range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub low: f32,
    pub high: f32,
    pub score: f32,
}

impl Band {
    pub const fn new(low: f32, high: f32, score: f32) -> Self {
        Self { low, high, score }
    }

    fn contains(&self, value: f32) -> bool {
        value > self.low && value < self.high
    }
}

/// Heuristic coefficients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeuristicConfig {
    /// Awarded when crest factor exceeds the threshold, highest tier first
    pub crest_factor: Vec<Tier>,
    /// Awarded when the 2-6 kHz energy ratio exceeds the threshold
    pub impact_ratio: Vec<Tier>,
    /// Awarded when rise time (samples) is below the threshold
    pub rise_time: Vec<Tier>,
    pub zero_crossing: Vec<Band>,
    /// First matching band wins
    pub spectral_centroid: Vec<Band>,
    /// Penalty applies above this 0-500 Hz energy fraction
    pub low_band_energy_limit: f32,
    /// Penalty also applies to audible sounds centred below this frequency
    pub low_centroid_hz: f32,
    pub low_frequency_penalty: f32,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            crest_factor: vec![Tier::new(6.0, 0.25), Tier::new(4.0, 0.15), Tier::new(3.0, 0.05)],
            impact_ratio: vec![Tier::new(0.3, 0.25), Tier::new(0.15, 0.15), Tier::new(0.08, 0.05)],
            rise_time: vec![Tier::new(30.0, 0.20), Tier::new(80.0, 0.10), Tier::new(150.0, 0.05)],
            zero_crossing: vec![Band::new(0.05, 0.35, 0.10)],
            spectral_centroid: vec![Band::new(1_500.0, 5_000.0, 0.15), Band::new(800.0, 7_000.0, 0.05)],
            low_band_energy_limit: 0.7,
            low_centroid_hz: 400.0,
            low_frequency_penalty: 0.15,
        }
    }
}

fn above(tiers: &[Tier], value: f32) -> f32 {
    tiers
        .iter()
        .find(|t| value > t.threshold)
        .map_or(0.0, |t| t.score)
}

fn below(tiers: &[Tier], value: f32) -> f32 {
    tiers
        .iter()
        .find(|t| value < t.threshold)
        .map_or(0.0, |t| t.score)
}

fn within(bands: &[Band], value: f32) -> f32 {
    bands
        .iter()
        .find(|b| b.contains(value))
        .map_or(0.0, |b| b.score)
}

impl HeuristicConfig {
    /// Confidence in 0..=1. Silent input scores 0.
    pub fn score(&self, f: &FeatureVector) -> f32 {
        if f.is_silent() || !f.to_array().iter().all(|v| v.is_finite()) {
            return 0.0;
        }

        let mut score = above(&self.crest_factor, f.crest_factor)
            + above(&self.impact_ratio, f.impact_ratio)
            + below(&self.rise_time, f.rise_time)
            + within(&self.zero_crossing, f.zcr)
            + within(&self.spectral_centroid, f.spectral_centroid);

        let low_centroid = f.spectral_centroid > 0.0 && f.spectral_centroid < self.low_centroid_hz;
        if f.energy_0_500 > self.low_band_energy_limit || low_centroid {
            score -= self.low_frequency_penalty;
        }

        score.clamp(0.0, 1.0)
    }
}
