use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use std::sync::Arc;

use crate::error::{MorphError, Result};
use crate::generator::ModelHandle;
use crate::imaging::ImageTensor;
use crate::latent::LatentVector;

/// Idle-mode animation: each latent coordinate oscillates as
/// `z_i(t) = sin(t * freq_i + shift_i)` with `shift ~ N(0, 1)` and
/// `freq ~ N(0, 0.1)` drawn once per animation.
pub struct LatentAnimator {
    handle: Arc<ModelHandle>,
    shift: Vec<f32>,
    freq: Vec<f32>,
    frame: usize,
    frames: usize,
}

impl LatentAnimator {
    pub fn new(handle: Arc<ModelHandle>, rng: &mut impl Rng) -> Result<Self> {
        let dim = handle.latent_dim();
        let frames = handle.profile().animate_frames;
        let freq_dist = Normal::new(0.0f32, 0.1)
            .map_err(|e| MorphError::InvalidSettings(e.to_string()))?;
        let shift = (0..dim).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        let freq = (0..dim).map(|_| freq_dist.sample(rng)).collect();
        Ok(Self {
            handle,
            shift,
            freq,
            frame: 0,
            frames,
        })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Latent for frame `t` (frames are numbered from 1).
    pub fn latent_at(&self, t: usize) -> LatentVector {
        let t = t as f32;
        LatentVector::new(
            self.shift
                .iter()
                .zip(&self.freq)
                .map(|(s, f)| (t * f + s).sin())
                .collect(),
        )
    }

    /// Next frame, or `None` once the profile's frame count is reached.
    pub fn next_frame(&mut self) -> Option<Result<ImageTensor>> {
        if self.frame >= self.frames {
            return None;
        }
        self.frame += 1;
        Some(self.handle.generate(&self.latent_at(self.frame)))
    }
}
