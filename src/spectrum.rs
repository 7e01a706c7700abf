use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

use crate::config::SpectrumFit;
use crate::error::{MorphError, Result};

/// Magnitudes of one epoch's power spectrum, lowest bin first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSpectrumSample {
    pub magnitudes: Vec<f32>,
}

impl PowerSpectrumSample {
    pub fn new(magnitudes: Vec<f32>) -> Self {
        Self { magnitudes }
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }
}

/// One named channel as delivered by the signal pipeline on each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpectrum {
    pub channel: String,
    pub magnitudes: Vec<f32>,
    #[serde(default)]
    pub freqs: Vec<f32>,
}

impl ChannelSpectrum {
    /// The frequency labels are for display only and are dropped here.
    pub fn into_sample(self) -> PowerSpectrumSample {
        PowerSpectrumSample::new(self.magnitudes)
    }
}

/// Map a sample onto `dim` values according to `policy`.
pub fn fit(sample: &PowerSpectrumSample, dim: usize, policy: SpectrumFit) -> Result<Vec<f32>> {
    match policy {
        SpectrumFit::Exact => {
            if sample.len() != dim {
                return Err(MorphError::DimensionMismatch {
                    expected: dim,
                    actual: sample.len(),
                });
            }
            Ok(sample.magnitudes.clone())
        }
        SpectrumFit::TruncateOrPad => {
            let mut values: Vec<f32> = sample.magnitudes.iter().take(dim).copied().collect();
            values.resize(dim, 0.0);
            Ok(values)
        }
    }
}

/// (x - mean) / std / damping, with the population std of `values` itself.
///
/// Moments are accumulated in f64 so large but valid magnitudes do not
/// overflow. A flat or non-finite spectrum has no usable std and is rejected
/// rather than allowed to put NaNs into the live latent.
pub fn standardize(values: &[f32], damping: f32) -> Result<Vec<f32>> {
    if values.is_empty() {
        return Err(MorphError::DegenerateSample { std: 0.0 });
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / n;
    let std = var.sqrt();
    if !(std.is_finite() && std > 0.0) {
        return Err(MorphError::DegenerateSample { std: std as f32 });
    }
    let scale = std * f64::from(damping);
    Ok(values
        .iter()
        .map(|&v| ((f64::from(v) - mean) / scale) as f32)
        .collect())
}

/// Plausible EEG-like spectra for running without a headset: a 1/f floor,
/// a slowly breathing alpha peak near 10 Hz, and multiplicative jitter.
pub struct SyntheticSpectrum {
    bins: usize,
    bin_hz: f32,
    tick: u64,
    rng: StdRng,
}

impl SyntheticSpectrum {
    /// `sample_rate` in Hz; bins cover 0..Nyquist.
    pub fn new(bins: usize, sample_rate: f32, seed: u64) -> Self {
        Self {
            bins,
            bin_hz: sample_rate / 2.0 / bins.max(1) as f32,
            tick: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn freqs(&self) -> Vec<f32> {
        (0..self.bins).map(|i| i as f32 * self.bin_hz).collect()
    }

    pub fn next_sample(&mut self) -> PowerSpectrumSample {
        self.tick += 1;
        // ~0.1 Hz alpha modulation at a 100 ms epoch interval.
        let alpha_gain = 1.0 + 0.8 * (self.tick as f32 * TAU / 100.0).sin();
        let magnitudes = (0..self.bins)
            .map(|i| {
                let f = i as f32 * self.bin_hz;
                let floor = 20.0 / (1.0 + f);
                let alpha = alpha_gain * 6.0 * (-(f - 10.0).powi(2) / 8.0).exp();
                let jitter = self.rng.gen_range(0.7f32..1.3);
                (floor + alpha) * jitter
            })
            .collect();
        PowerSpectrumSample::new(magnitudes)
    }

    pub fn next_channel(&mut self, channel: &str) -> ChannelSpectrum {
        let sample = self.next_sample();
        ChannelSpectrum {
            channel: channel.to_string(),
            magnitudes: sample.magnitudes,
            freqs: self.freqs(),
        }
    }
}
