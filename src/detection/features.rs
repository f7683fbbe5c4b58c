//! Audio feature extraction
//!
//! Turns one chunk of mono samples into a fixed 12-dimensional descriptor of
//! how impulsive and how bright the sound is.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const FEATURE_COUNT: usize = 12;

/// Feature names in vector order
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "rms",
    "peak",
    "crest_factor",
    "zcr",
    "spectral_centroid",
    "spectral_rolloff",
    "energy_0_500",
    "energy_500_2k",
    "energy_2k_6k",
    "energy_6k_plus",
    "impact_ratio",
    "rise_time",
];

/// Fraction of spectral energy below the rolloff frequency
const ROLLOFF_FRACTION: f64 = 0.85;

/// Fraction of peak amplitude that ends the rise
const RISE_FRACTION: f64 = 0.9;

/// Descriptor of one audio chunk
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub rms: f32,
    pub peak: f32,
    /// peak / rms
    pub crest_factor: f32,
    /// Sign changes per sample
    pub zcr: f32,
    /// Hz
    pub spectral_centroid: f32,
    /// Hz below which 85% of the energy lies
    pub spectral_rolloff: f32,
    /// Band energies as fractions of total energy
    pub energy_0_500: f32,
    pub energy_500_2k: f32,
    pub energy_2k_6k: f32,
    pub energy_6k_plus: f32,
    /// 2-6 kHz energy / total energy
    pub impact_ratio: f32,
    /// Samples from chunk start to 90% of peak, saturated at the chunk length
    pub rise_time: f32,
}

impl FeatureVector {
    pub fn to_array(&self) -> [f32; FEATURE_COUNT] {
        [
            self.rms,
            self.peak,
            self.crest_factor,
            self.zcr,
            self.spectral_centroid,
            self.spectral_rolloff,
            self.energy_0_500,
            self.energy_500_2k,
            self.energy_2k_6k,
            self.energy_6k_plus,
            self.impact_ratio,
            self.rise_time,
        ]
    }

    pub fn from_array(v: [f32; FEATURE_COUNT]) -> Self {
        Self {
            rms: v[0],
            peak: v[1],
            crest_factor: v[2],
            zcr: v[3],
            spectral_centroid: v[4],
            spectral_rolloff: v[5],
            energy_0_500: v[6],
            energy_500_2k: v[7],
            energy_2k_6k: v[8],
            energy_6k_plus: v[9],
            impact_ratio: v[10],
            rise_time: v[11],
        }
    }

    /// Meter level shown to the user
    pub fn level(&self) -> f32 {
        (self.rms * 10.0).min(1.0)
    }

    pub fn is_silent(&self) -> bool {
        self.peak <= f32::EPSILON
    }
}

/// Extracts features for one sample rate. Owned by the audio worker; the FFT
/// plan is cached per chunk length.
pub struct FeatureExtractor {
    sample_rate: u32,
    planner: FftPlanner<f64>,
    plan: Option<(usize, Arc<dyn Fft<f64>>)>,
}

impl FeatureExtractor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            planner: FftPlanner::new(),
            plan: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn plan_for(&mut self, n: usize) -> Arc<dyn Fft<f64>> {
        match &self.plan {
            Some((len, fft)) if *len == n => fft.clone(),
            _ => {
                let fft = self.planner.plan_fft_forward(n);
                self.plan = Some((n, fft.clone()));
                fft
            }
        }
    }

    pub fn extract(&mut self, samples: &[f32]) -> FeatureVector {
        let n = samples.len();
        if n == 0 {
            return FeatureVector::default();
        }
        let x: Vec<f64> = samples.iter().map(|&s| s as f64).collect();

        let rms = (x.iter().map(|s| s * s).sum::<f64>() / n as f64).sqrt();
        let peak = x.iter().fold(0.0f64, |m, s| m.max(s.abs()));
        let crest_factor = if rms > 1e-10 { peak / rms } else { 0.0 };

        let crossings = x.windows(2).filter(|w| sign(w[0]) != sign(w[1])).count();
        let zcr = crossings as f64 / n as f64;

        let rise_time = if peak > 1e-10 {
            let target = peak * RISE_FRACTION;
            x.iter().position(|s| s.abs() >= target).unwrap_or(n)
        } else {
            n
        };

        // Magnitude spectrum of the real input, bins 0..=n/2
        let fft = self.plan_for(n);
        let mut buffer: Vec<Complex<f64>> = x.iter().map(|&re| Complex { re, im: 0.0 }).collect();
        fft.process(&mut buffer);
        let bins = n / 2 + 1;
        let bin_hz = self.sample_rate as f64 / n as f64;
        let magnitudes: Vec<f64> = buffer[..bins].iter().map(|c| c.norm()).collect();
        let energies: Vec<f64> = magnitudes.iter().map(|m| m * m).collect();

        let total_energy = energies.iter().sum::<f64>().max(1e-20);
        let magnitude_sum: f64 = magnitudes.iter().sum();

        let spectral_centroid = if magnitude_sum > 1e-10 {
            magnitudes
                .iter()
                .enumerate()
                .map(|(k, m)| k as f64 * bin_hz * m)
                .sum::<f64>()
                / magnitude_sum
        } else {
            0.0
        };

        let energy_sum: f64 = energies.iter().sum();
        let spectral_rolloff = if energy_sum > 0.0 {
            let target = ROLLOFF_FRACTION * energy_sum;
            let mut cumulative = 0.0;
            let mut index = bins - 1;
            for (k, e) in energies.iter().enumerate() {
                cumulative += e;
                if cumulative >= target {
                    index = k;
                    break;
                }
            }
            index as f64 * bin_hz
        } else {
            0.0
        };

        let nyquist = self.sample_rate as f64 / 2.0;
        let band = |low: f64, high: f64| -> f64 {
            energies
                .iter()
                .enumerate()
                .filter(|(k, _)| {
                    let f = *k as f64 * bin_hz;
                    f >= low && f < high
                })
                .map(|(_, e)| e)
                .sum::<f64>()
                / total_energy
        };
        let energy_0_500 = band(0.0, 500.0);
        let energy_500_2k = band(500.0, 2_000.0);
        let energy_2k_6k = band(2_000.0, 6_000.0);
        let energy_6k_plus = band(6_000.0, nyquist);

        FeatureVector {
            rms: rms as f32,
            peak: peak as f32,
            crest_factor: crest_factor as f32,
            zcr: zcr as f32,
            spectral_centroid: spectral_centroid as f32,
            spectral_rolloff: spectral_rolloff as f32,
            energy_0_500: energy_0_500 as f32,
            energy_500_2k: energy_500_2k as f32,
            energy_2k_6k: energy_2k_6k as f32,
            energy_6k_plus: energy_6k_plus as f32,
            impact_ratio: energy_2k_6k as f32,
            rise_time: rise_time as f32,
        }
    }
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}
