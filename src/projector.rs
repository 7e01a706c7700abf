// Gradient-descent projection of a target photo into the generator's latent space.
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, info};

use crate::aggregator::aggregate;
use crate::config::ProjectionSettings;
use crate::error::{MorphError, Result};
use crate::generator::ModelHandle;
use crate::imaging::{ImageTensor, PixelRange};
use crate::latent::LatentVector;

/// Loss recorded for one optimizer step (0-based), measured before the update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionStep {
    pub step: usize,
    pub loss: f32,
}

/// A frame emitted while projecting. `step` counts completed steps.
#[derive(Debug, Clone)]
pub struct ProjectionProgress {
    pub slot: usize,
    pub step: usize,
    pub loss: f32,
    pub frame: ImageTensor,
}

/// State of a single projection: its own z and its own Adam moments.
/// Nothing here is shared between runs.
pub struct ProjectionRun {
    handle: Arc<ModelHandle>,
    target: Tensor,
    z: Var,
    initial: LatentVector,
    optimizer: AdamW,
    steps_taken: usize,
    sqrt_dim: f64,
}

impl ProjectionRun {
    /// `target` must be at the generator's display size. It is rescaled to
    /// unit range once here; every loss evaluation compares in unit range.
    pub fn new(
        handle: Arc<ModelHandle>,
        target: &ImageTensor,
        learning_rate: f64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if target.side() != handle.display_size() {
            return Err(MorphError::InvalidSettings(format!(
                "target is {}px, generator displays {}px",
                target.side(),
                handle.display_size()
            )));
        }
        let target = target
            .to_unit()?
            .into_tensor()
            .to_device(handle.device())?
            .detach();

        let dim = handle.latent_dim();
        let initial = LatentVector::random(dim, rng);
        let z = Var::from_tensor(&initial.to_tensor(handle.device())?)?;

        let params = ParamsAdamW {
            lr: learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            // Plain Adam.
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(vec![z.clone()], params)?;

        Ok(Self {
            handle,
            target,
            z,
            initial,
            optimizer,
            steps_taken: 0,
            sqrt_dim: (dim as f64).sqrt(),
        })
    }

    /// mean|G(z) - target| + | ||z|| - sqrt(D) |
    ///
    /// The norm term keeps z near the shell where a D-dim standard normal lives.
    pub fn loss(&self) -> Result<Tensor> {
        let z = self.z.as_tensor();
        let pred = self.handle.render(z)?;
        let reconstruction = (pred - &self.target)?.abs()?.mean_all()?;
        let norm = z.sqr()?.sum_all()?.sqrt()?;
        let regularization = (norm - self.sqrt_dim)?.abs()?;
        Ok((reconstruction + regularization)?)
    }

    /// One Adam update of z. Generator weights are plain tensors, so only z
    /// receives a gradient.
    pub fn step(&mut self) -> Result<ProjectionStep> {
        let loss = self.loss()?;
        let value = loss.to_scalar::<f32>()?;
        self.optimizer.backward_step(&loss)?;
        let step = self.steps_taken;
        self.steps_taken += 1;
        Ok(ProjectionStep { step, loss: value })
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// The random draw this run started from.
    pub fn initial(&self) -> &LatentVector {
        &self.initial
    }

    pub fn latent(&self) -> Result<LatentVector> {
        LatentVector::from_tensor(self.z.as_tensor())
    }

    /// Render the current z for display. Off the tape; does not touch the
    /// optimization trajectory.
    pub fn render_current(&self) -> Result<ImageTensor> {
        let z = self.z.as_tensor().detach();
        ImageTensor::new(self.handle.render(&z)?, PixelRange::Unit)
    }
}

/// Runs projections against one generator.
#[derive(Clone)]
pub struct LatentProjector {
    handle: Arc<ModelHandle>,
}

impl LatentProjector {
    pub fn new(handle: Arc<ModelHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    /// Deterministic per-slot RNG when a base seed is configured.
    pub fn rng_for_slot(settings: &ProjectionSettings, slot: usize) -> StdRng {
        match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(slot as u64)),
            None => StdRng::from_entropy(),
        }
    }

    /// Run exactly `training_steps` Adam steps and return the final z.
    ///
    /// Each step (and its frame, when one is due) runs on tokio's blocking
    /// pool, so runtime workers stay free for the websocket and the engine.
    /// Dropping the future abandons the run after the step in flight. A frame
    /// is emitted every `steps_per_image` completed steps and after the last
    /// one. With zero steps the initial draw is returned and nothing is
    /// rendered.
    pub async fn project<F>(
        &self,
        slot: usize,
        target: &ImageTensor,
        settings: &ProjectionSettings,
        rng: &mut StdRng,
        mut on_progress: F,
    ) -> Result<LatentVector>
    where
        F: FnMut(ProjectionProgress) + Send,
    {
        settings.validate()?;
        let mut run = ProjectionRun::new(self.handle.clone(), target, settings.learning_rate, rng)?;
        info!(
            slot,
            steps = settings.training_steps,
            lr = settings.learning_rate,
            "projection started"
        );

        let per_image = settings.steps_per_image;
        let total = settings.training_steps;
        let mut last_loss = None;
        for _ in 0..total {
            let (returned, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = advance(&mut run, per_image, total);
                (run, outcome)
            })
            .await
            .map_err(|e| MorphError::InvalidSettings(format!("projection step aborted: {e}")))?;
            run = returned;

            let (ProjectionStep { step, loss }, frame) = outcome?;
            let done = step + 1;
            debug!(slot, step = done, loss, "projection step");
            last_loss = Some(loss);

            if let Some(frame) = frame {
                on_progress(ProjectionProgress {
                    slot,
                    step: done,
                    loss,
                    frame,
                });
            }
        }

        info!(slot, final_loss = ?last_loss, "projection finished");
        run.latent()
    }
}

/// One step, plus the frame when the completed count hits the cadence or the end.
fn advance(
    run: &mut ProjectionRun,
    per_image: usize,
    total: usize,
) -> Result<(ProjectionStep, Option<ImageTensor>)> {
    let step = run.step()?;
    let done = step.step + 1;
    let frame = if done % per_image == 0 || done == total {
        Some(run.render_current()?)
    } else {
        None
    };
    Ok((step, frame))
}

/// Results of the parallel projection slots of one session.
#[derive(Debug, Clone, Default)]
pub struct ProjectionBank {
    slots: Vec<Option<LatentVector>>,
}

impl ProjectionBank {
    pub fn new(num_projections: usize) -> Self {
        Self {
            slots: vec![None; num_projections],
        }
    }

    /// Forget all results and size for a new session.
    pub fn reset(&mut self, num_projections: usize) {
        self.slots = vec![None; num_projections];
    }

    pub fn store(&mut self, slot: usize, latent: LatentVector) -> Result<()> {
        let cell = self.slots.get_mut(slot).ok_or_else(|| {
            MorphError::InvalidSettings(format!("projection slot {slot} out of range"))
        })?;
        *cell = Some(latent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn completed(&self) -> Vec<LatentVector> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(Option::is_some)
    }

    /// Average over every slot of the session. `NotReady` until all slots
    /// have reported.
    pub fn seed(&self) -> Result<LatentVector> {
        if !self.is_complete() {
            return Err(MorphError::NotReady);
        }
        aggregate(&self.completed(), self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::testing::dense_handle;

    fn byte_target(handle: &ModelHandle, z0: &LatentVector) -> Result<ImageTensor> {
        let unit = handle.generate(z0)?;
        ImageTensor::new(unit.tensor().affine(255.0, 0.0)?, PixelRange::Byte)
    }

    fn settings(steps: usize, per_image: usize) -> ProjectionSettings {
        ProjectionSettings {
            learning_rate: 0.05,
            training_steps: steps,
            steps_per_image: per_image,
            num_projections: 1,
            seed: Some(17),
        }
    }

    #[tokio::test]
    async fn test_zero_steps_returns_initial_draw() -> Result<()> {
        let handle = dense_handle(16, 4, 2, 1)?;
        let target = byte_target(&handle, &LatentVector::new(vec![0.3; 16]))?;
        let projector = LatentProjector::new(handle);
        let s = settings(0, 5);

        let mut frames = 0;
        let mut rng = LatentProjector::rng_for_slot(&s, 0);
        let z = projector.project(0, &target, &s, &mut rng, |_| frames += 1).await?;

        let expected = LatentVector::random(16, &mut LatentProjector::rng_for_slot(&s, 0));
        assert_eq!(z, expected);
        assert_eq!(frames, 0);
        Ok(())
    }

    #[test]
    fn test_loss_drops_on_reachable_target() -> Result<()> {
        let handle = dense_handle(32, 4, 2, 3)?;
        let z0 = LatentVector::random(32, &mut StdRng::seed_from_u64(100));
        let target = byte_target(&handle, &z0)?;

        let mut rng = StdRng::seed_from_u64(4);
        let mut run = ProjectionRun::new(handle, &target, 0.05, &mut rng)?;
        let losses: Vec<f32> = (0..150)
            .map(|_| run.step().map(|s| s.loss))
            .collect::<Result<_>>()?;

        let first = losses[0];
        let last = *losses.last().unwrap();
        assert!(last.is_finite());
        assert!(last < first, "loss went from {first} to {last}");
        assert_eq!(run.steps_taken(), 150);
        Ok(())
    }

    #[tokio::test]
    async fn test_frame_cadence() -> Result<()> {
        let handle = dense_handle(8, 4, 1, 2)?;
        let target = byte_target(&handle, &LatentVector::new(vec![0.5; 8]))?;
        let projector = LatentProjector::new(handle);

        let s = settings(10, 4);
        let mut steps = Vec::new();
        let mut rng = LatentProjector::rng_for_slot(&s, 0);
        projector
            .project(0, &target, &s, &mut rng, |p| steps.push(p.step))
            .await?;
        assert_eq!(steps, vec![4, 8, 10]);

        // Cadence longer than the run: only the final frame.
        let s = settings(10, 20);
        let mut steps = Vec::new();
        let mut rng = LatentProjector::rng_for_slot(&s, 0);
        projector
            .project(0, &target, &s, &mut rng, |p| steps.push(p.step))
            .await?;
        assert_eq!(steps, vec![10]);
        Ok(())
    }

    #[tokio::test]
    async fn test_runtime_stays_responsive_during_projection() -> Result<()> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let handle = dense_handle(8, 4, 1, 2)?;
        let target = byte_target(&handle, &LatentVector::new(vec![0.5; 8]))?;
        let projector = LatentProjector::new(handle);
        let s = settings(12, 1);

        // A sibling task on the same single-threaded runtime.
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let sibling = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        });

        let mut seen = Vec::new();
        let mut rng = LatentProjector::rng_for_slot(&s, 0);
        projector
            .project(0, &target, &s, &mut rng, |_| seen.push(ticks.load(Ordering::SeqCst)))
            .await?;
        sibling.abort();

        assert_eq!(seen.len(), 12);
        assert!(seen.windows(2).all(|w| w[1] > w[0]), "sibling starved: {seen:?}");
        Ok(())
    }

    #[test]
    fn test_runs_do_not_share_state() -> Result<()> {
        let handle = dense_handle(8, 4, 1, 2)?;
        let target = byte_target(&handle, &LatentVector::new(vec![0.5; 8]))?;

        let mut solo = ProjectionRun::new(handle.clone(), &target, 0.05, &mut StdRng::seed_from_u64(1))?;
        for _ in 0..5 {
            solo.step()?;
        }

        // Same seed, but interleaved with another run.
        let mut a = ProjectionRun::new(handle.clone(), &target, 0.05, &mut StdRng::seed_from_u64(1))?;
        let mut b = ProjectionRun::new(handle, &target, 0.05, &mut StdRng::seed_from_u64(2))?;
        assert_ne!(a.initial(), b.initial());
        for _ in 0..5 {
            a.step()?;
            b.step()?;
        }
        assert_eq!(a.latent()?, solo.latent()?);
        Ok(())
    }

    #[test]
    fn test_target_size_must_match_display() -> Result<()> {
        let handle = dense_handle(8, 4, 2, 2)?;
        let small = ImageTensor::new(
            Tensor::zeros((4, 4, 3), candle_core::DType::F32, handle.device())?,
            PixelRange::Byte,
        )?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(ProjectionRun::new(handle, &small, 0.05, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn test_bank_seed() -> Result<()> {
        let mut bank = ProjectionBank::new(2);
        assert!(matches!(bank.seed(), Err(MorphError::NotReady)));

        // Half a session is not a seed.
        bank.store(0, LatentVector::new(vec![2.0, 4.0]))?;
        assert!(!bank.is_complete());
        assert!(matches!(bank.seed(), Err(MorphError::NotReady)));

        bank.store(1, LatentVector::new(vec![0.0, 2.0]))?;
        assert!(bank.is_complete());
        assert_eq!(bank.seed()?, LatentVector::new(vec![1.0, 3.0]));

        assert!(bank.store(2, LatentVector::new(vec![0.0, 0.0])).is_err());
        bank.reset(3);
        assert!(matches!(bank.seed(), Err(MorphError::NotReady)));
        Ok(())
    }
}
