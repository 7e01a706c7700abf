// Spectrum-driven random walk of the live latent vector.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::debug;

use crate::config::{PerturbationSettings, SpectrumFit};
use crate::error::{MorphError, Result};
use crate::generator::ModelHandle;
use crate::imaging::ImageTensor;
use crate::latent::LatentVector;
use crate::projector::ProjectionBank;
use crate::spectrum::{fit, standardize, PowerSpectrumSample};

/// Which way the standardized spectrum is applied on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Add,
    Subtract,
}

impl Direction {
    fn sign(self) -> f32 {
        match self {
            Self::Add => 1.0,
            Self::Subtract => -1.0,
        }
    }
}

/// Owns the live latent vector.
///
/// Every mutation goes through `&mut self`, so reseeds and perturbations are
/// mutually exclusive by construction; share it behind a single task or a lock.
///
/// Callers are expected to space `perturb_and_render` calls at least
/// `morph_delay_ms` apart. Timing is not tracked here.
pub struct LatentPerturber {
    handle: Arc<ModelHandle>,
    live: LatentVector,
    fit: SpectrumFit,
    rng: StdRng,
}

impl LatentPerturber {
    /// Starts from a random live vector.
    pub fn new(handle: Arc<ModelHandle>, fit: SpectrumFit, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let live = LatentVector::random(handle.latent_dim(), &mut rng);
        Self {
            handle,
            live,
            fit,
            rng,
        }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    pub fn live(&self) -> &LatentVector {
        &self.live
    }

    /// Replace the live vector with a fresh N(0, 1) draw.
    pub fn reseed_random(&mut self, dimension: usize) -> Result<()> {
        if dimension != self.handle.latent_dim() {
            return Err(MorphError::DimensionMismatch {
                expected: self.handle.latent_dim(),
                actual: dimension,
            });
        }
        self.live = LatentVector::random(dimension, &mut self.rng);
        debug!(dimension, "live latent reseeded at random");
        Ok(())
    }

    /// Take ownership of `latent` as the new live vector.
    pub fn reseed(&mut self, latent: LatentVector) -> Result<()> {
        latent.ensure_dim(self.handle.latent_dim())?;
        if !latent.is_finite() {
            return Err(MorphError::InvalidSettings(
                "seed latent contains non-finite values".to_string(),
            ));
        }
        self.live = latent;
        Ok(())
    }

    /// Seed from the averaged projection results. `NotReady` until at least
    /// one projection slot has completed.
    pub fn reseed_from_projection(&mut self, bank: &ProjectionBank) -> Result<()> {
        let seed = bank.seed()?;
        self.reseed(seed)?;
        debug!(norm = self.live.norm(), "live latent reseeded from projection");
        Ok(())
    }

    /// Normalized perturbation for `sample`: fitted to D, standardized by its
    /// own mean and population std, divided by the damping.
    pub fn perturbation(
        &self,
        sample: &PowerSpectrumSample,
        settings: &PerturbationSettings,
    ) -> Result<Vec<f32>> {
        settings.validate()?;
        let values = fit(sample, self.handle.latent_dim(), self.fit)?;
        standardize(&values, settings.damping_of_change)
    }

    /// One tick: flip a fair coin, move the live vector by +/- the
    /// perturbation, render it.
    pub fn perturb_and_render(
        &mut self,
        sample: &PowerSpectrumSample,
        settings: &PerturbationSettings,
    ) -> Result<ImageTensor> {
        let direction = if self.rng.gen_bool(0.5) {
            Direction::Add
        } else {
            Direction::Subtract
        };
        self.perturb_towards(sample, settings, direction)
    }

    /// `perturb_and_render` with the coin outcome fixed.
    ///
    /// The candidate is validated and rendered before it replaces the live
    /// vector; on any error the previous live vector is kept.
    pub fn perturb_towards(
        &mut self,
        sample: &PowerSpectrumSample,
        settings: &PerturbationSettings,
        direction: Direction,
    ) -> Result<ImageTensor> {
        let delta = self.perturbation(sample, settings)?;
        let sign = direction.sign();
        let candidate = LatentVector::new(
            self.live
                .as_slice()
                .iter()
                .zip(&delta)
                .map(|(z, d)| z + sign * d)
                .collect(),
        );
        if !candidate.is_finite() {
            return Err(MorphError::DegenerateSample { std: f32::NAN });
        }

        let frame = self.handle.generate(&candidate)?;
        self.live = candidate;
        debug!(?direction, norm = self.live.norm(), "live latent perturbed");
        Ok(frame)
    }

    pub fn render_live(&self) -> Result<ImageTensor> {
        self.handle.generate(&self.live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::testing::dense_handle;
    use approx::assert_abs_diff_eq;

    fn settings(damping: f32) -> PerturbationSettings {
        PerturbationSettings {
            damping_of_change: damping,
            morph_delay_ms: 0,
        }
    }

    #[test]
    fn test_four_bin_scenario() -> Result<()> {
        let handle = dense_handle(4, 2, 1, 1)?;
        let mut perturber = LatentPerturber::new(handle, SpectrumFit::Exact, Some(3));
        perturber.reseed(LatentVector::new(vec![0.0; 4]))?;

        let sample = PowerSpectrumSample::new(vec![0.0, 2.0, 4.0, 6.0]);
        perturber.perturb_towards(&sample, &settings(10.0), Direction::Add)?;

        let expected = [-1.342, -0.447, 0.447, 1.342].map(|v| v / 10.0);
        for (got, want) in perturber.live().as_slice().iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_opposite_coins_move_symmetrically() -> Result<()> {
        let handle = dense_handle(16, 2, 1, 1)?;
        let start = LatentVector::random(16, &mut StdRng::seed_from_u64(8));
        let sample = PowerSpectrumSample::new((0..16).map(|i| (i * i) as f32).collect());
        let s = settings(5.0);

        let mut up = LatentPerturber::new(handle.clone(), SpectrumFit::Exact, Some(1));
        up.reseed(start.clone())?;
        up.perturb_towards(&sample, &s, Direction::Add)?;

        let mut down = LatentPerturber::new(handle, SpectrumFit::Exact, Some(1));
        down.reseed(start.clone())?;
        down.perturb_towards(&sample, &s, Direction::Subtract)?;

        for ((a, b), z) in up
            .live()
            .as_slice()
            .iter()
            .zip(down.live().as_slice())
            .zip(start.as_slice())
        {
            assert_abs_diff_eq!(a - z, -(b - z), epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_flat_sample_rejected_and_state_kept() -> Result<()> {
        let handle = dense_handle(128, 2, 1, 1)?;
        let mut perturber = LatentPerturber::new(handle, SpectrumFit::Exact, Some(2));
        let before = perturber.live().clone();

        let flat = PowerSpectrumSample::new(vec![1.0; 128]);
        let err = perturber.perturb_and_render(&flat, &settings(10.0)).unwrap_err();
        assert!(matches!(err, MorphError::DegenerateSample { .. }));
        assert_eq!(perturber.live(), &before);
        assert!(perturber.live().is_finite());

        // The next good sample still goes through.
        let good = PowerSpectrumSample::new((0..128).map(|i| i as f32).collect());
        perturber.perturb_and_render(&good, &settings(10.0))?;
        assert_ne!(perturber.live(), &before);
        Ok(())
    }

    #[test]
    fn test_wrong_length_sample_rejected_under_exact_fit() -> Result<()> {
        let handle = dense_handle(8, 2, 1, 1)?;
        let mut perturber = LatentPerturber::new(handle, SpectrumFit::Exact, Some(2));
        let before = perturber.live().clone();
        let short = PowerSpectrumSample::new(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            perturber.perturb_and_render(&short, &settings(10.0)),
            Err(MorphError::DimensionMismatch { .. })
        ));
        assert_eq!(perturber.live(), &before);
        Ok(())
    }

    #[test]
    fn test_truncate_or_pad_accepts_other_lengths() -> Result<()> {
        let handle = dense_handle(8, 2, 1, 1)?;
        let mut perturber = LatentPerturber::new(handle, SpectrumFit::TruncateOrPad, Some(2));
        let long = PowerSpectrumSample::new((0..32).map(|i| i as f32).collect());
        let frame = perturber.perturb_and_render(&long, &settings(10.0))?;
        assert_eq!(frame.side(), 2);
        Ok(())
    }

    #[test]
    fn test_coin_is_seedable() -> Result<()> {
        let handle = dense_handle(8, 2, 1, 1)?;
        let sample = PowerSpectrumSample::new((0..8).map(|i| i as f32).collect());
        let mut a = LatentPerturber::new(handle.clone(), SpectrumFit::Exact, Some(21));
        let mut b = LatentPerturber::new(handle, SpectrumFit::Exact, Some(21));
        for _ in 0..10 {
            a.perturb_and_render(&sample, &settings(10.0))?;
            b.perturb_and_render(&sample, &settings(10.0))?;
        }
        assert_eq!(a.live(), b.live());
        Ok(())
    }

    #[test]
    fn test_walk_stays_bounded_over_long_runs() -> Result<()> {
        // The fair coin keeps the walk from marching off in one direction.
        let handle = dense_handle(16, 2, 1, 1)?;
        let mut perturber = LatentPerturber::new(handle, SpectrumFit::Exact, Some(5));
        let sample = PowerSpectrumSample::new((0..16).map(|i| (i % 5) as f32).collect());
        for _ in 0..2000 {
            perturber.perturb_and_render(&sample, &settings(10.0))?;
        }
        assert!(perturber.live().is_finite());
        // A one-way drift would reach 2000 * ||delta|| = 800.
        assert!(perturber.live().norm() < 100.0);
        Ok(())
    }

    #[test]
    fn test_reseed_paths() -> Result<()> {
        let handle = dense_handle(4, 2, 1, 1)?;
        let mut perturber = LatentPerturber::new(handle, SpectrumFit::Exact, Some(2));

        let bank = ProjectionBank::new(2);
        assert!(matches!(
            perturber.reseed_from_projection(&bank),
            Err(MorphError::NotReady)
        ));

        let mut bank = ProjectionBank::new(2);
        bank.store(0, LatentVector::new(vec![1.0, 1.0, 1.0, 1.0]))?;
        bank.store(1, LatentVector::new(vec![3.0, 3.0, 3.0, 3.0]))?;
        perturber.reseed_from_projection(&bank)?;
        assert_eq!(perturber.live(), &LatentVector::new(vec![2.0; 4]));

        assert!(perturber.reseed_random(5).is_err());
        perturber.reseed_random(4)?;
        assert_ne!(perturber.live(), &LatentVector::new(vec![2.0; 4]));
        assert!(perturber.render_live().is_ok());
        Ok(())
    }
}
