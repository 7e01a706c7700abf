// Single-writer actor around the live latent and the projection bank.
//
// Commands arrive over mpsc, spectra over a watch channel (only the newest
// sample matters), frames leave on a broadcast channel.
use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::animate::LatentAnimator;
use crate::config::{InstallationConfig, PerturbationSettings, ProjectionSettings};
use crate::error::{MorphError, Result};
use crate::generator::ModelHandle;
use crate::imaging::ImageTensor;
use crate::latent::LatentVector;
use crate::perturber::LatentPerturber;
use crate::projector::{LatentProjector, ProjectionBank};
use crate::spectrum::PowerSpectrumSample;

#[derive(Debug)]
pub enum MorphCommand {
    ReseedRandom,
    ReseedFromProjection,
    /// Start a new projection session, abandoning any running one.
    Project { target: ImageTensor },
    CancelProjection,
    SetPerturbation(PerturbationSettings),
    SetProjection(ProjectionSettings),
    Animate,
    GenerateRandom,
    Shutdown,
}

/// A square RGB frame, PNG-encoded and base64-wrapped for JSON transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedFrame {
    pub size: usize,
    pub png: String,
}

impl RenderedFrame {
    pub fn from_image(image: &ImageTensor) -> Result<Self> {
        let rgb = image.to_rgb_image()?;
        let mut bytes = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(Self {
            size: image.side(),
            png: general_purpose::STANDARD.encode(bytes),
        })
    }

    pub fn to_image(&self) -> Result<RgbImage> {
        let bytes = general_purpose::STANDARD
            .decode(&self.png)
            .map_err(|e| MorphError::MalformedFrame(e.to_string()))?;
        let rgb = image::load_from_memory_with_format(&bytes, ImageFormat::Png)?.to_rgb8();
        if rgb.width() as usize != self.size || rgb.height() as usize != self.size {
            return Err(MorphError::MalformedFrame(format!(
                "expected {0}x{0}, decoded {1}x{2}",
                self.size,
                rgb.width(),
                rgb.height()
            )));
        }
        Ok(rgb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedSource {
    Random,
    Projection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MorphUpdate {
    ProjectionFrame {
        slot: usize,
        step: usize,
        loss: f32,
        frame: RenderedFrame,
    },
    ProjectionComplete {
        slot: usize,
        completed: usize,
        total: usize,
    },
    MorphFrame {
        tick: u64,
        frame: RenderedFrame,
    },
    AnimationFrame {
        index: usize,
        frame: RenderedFrame,
    },
    Generated {
        frame: RenderedFrame,
    },
    Seeded {
        source: SeedSource,
        frame: RenderedFrame,
    },
    Rejected {
        reason: String,
    },
}

struct SlotResult {
    session: u64,
    slot: usize,
    outcome: Result<LatentVector>,
}

/// The host side of a running engine.
pub struct EngineHandle {
    commands: mpsc::Sender<MorphCommand>,
    samples: watch::Sender<Option<PowerSpectrumSample>>,
    updates: broadcast::Sender<MorphUpdate>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn send(&self, command: MorphCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MorphError::InvalidSettings("morph engine has stopped".to_string()))
    }

    pub fn commands(&self) -> mpsc::Sender<MorphCommand> {
        self.commands.clone()
    }

    /// Replace the pending sample. Older unprocessed samples are superseded.
    pub fn push_sample(&self, sample: PowerSpectrumSample) {
        self.samples.send_replace(Some(sample));
    }

    pub fn samples(&self) -> watch::Sender<Option<PowerSpectrumSample>> {
        self.samples.clone()
    }

    pub fn updates(&self) -> broadcast::Sender<MorphUpdate> {
        self.updates.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MorphUpdate> {
        self.updates.subscribe()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(MorphCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

pub struct MorphEngine {
    handle: Arc<ModelHandle>,
    perturber: LatentPerturber,
    projector: LatentProjector,
    bank: ProjectionBank,
    projection: ProjectionSettings,
    perturbation: PerturbationSettings,
    commands: mpsc::Receiver<MorphCommand>,
    samples: watch::Receiver<Option<PowerSpectrumSample>>,
    samples_open: bool,
    updates: broadcast::Sender<MorphUpdate>,
    results_tx: mpsc::Sender<SlotResult>,
    results_rx: mpsc::Receiver<SlotResult>,
    runs: Vec<JoinHandle<()>>,
    session: u64,
    tick: u64,
    last_morph: Option<Instant>,
    rng: StdRng,
}

impl MorphEngine {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(handle: Arc<ModelHandle>, config: &InstallationConfig) -> EngineHandle {
        let (engine, commands, samples) = Self::new(handle, config);
        let updates = engine.updates.clone();
        let task = tokio::spawn(engine.run());
        EngineHandle {
            commands,
            samples,
            updates,
            task,
        }
    }

    fn new(
        handle: Arc<ModelHandle>,
        config: &InstallationConfig,
    ) -> (
        Self,
        mpsc::Sender<MorphCommand>,
        watch::Sender<Option<PowerSpectrumSample>>,
    ) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (samples_tx, samples) = watch::channel(None);
        let (updates, _) = broadcast::channel(64);
        let (results_tx, results_rx) = mpsc::channel(16);

        let seed = config.projection.seed;
        let engine = Self {
            perturber: LatentPerturber::new(handle.clone(), config.spectrum.fit, seed),
            projector: LatentProjector::new(handle.clone()),
            bank: ProjectionBank::new(config.projection.num_projections),
            projection: config.projection.clone(),
            perturbation: config.perturbation.clone(),
            handle,
            commands,
            samples,
            samples_open: true,
            updates,
            results_tx,
            results_rx,
            runs: Vec::new(),
            session: 0,
            tick: 0,
            last_morph: None,
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
        };
        (engine, commands_tx, samples_tx)
    }

    async fn run(mut self) {
        info!(model_id = %self.handle.profile().model_id, "morph engine started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(MorphCommand::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(result) = self.results_rx.recv() => self.on_projection_result(result),
                changed = self.samples.changed(), if self.samples_open => {
                    if changed.is_err() {
                        debug!("spectrum feed closed");
                        self.samples_open = false;
                    } else {
                        self.on_sample().await;
                    }
                }
            }
        }
        self.cancel_projection();
        info!("morph engine stopped");
    }

    async fn on_command(&mut self, command: MorphCommand) {
        debug!(?command, "engine command");
        let outcome = match command {
            MorphCommand::ReseedRandom => self
                .perturber
                .reseed_random(self.handle.latent_dim())
                .and_then(|_| self.publish_seeded(SeedSource::Random)),
            MorphCommand::ReseedFromProjection => self
                .perturber
                .reseed_from_projection(&self.bank)
                .and_then(|_| self.publish_seeded(SeedSource::Projection)),
            MorphCommand::Project { target } => self.start_projection(target),
            MorphCommand::CancelProjection => {
                self.cancel_projection();
                Ok(())
            }
            MorphCommand::SetPerturbation(settings) => settings.validate().map(|_| {
                info!(?settings, "perturbation settings updated");
                self.perturbation = settings;
            }),
            MorphCommand::SetProjection(settings) => settings.validate().map(|_| {
                info!(?settings, "projection settings updated");
                self.projection = settings;
            }),
            MorphCommand::Animate => self.animate().await,
            MorphCommand::GenerateRandom => self.generate_random(),
            MorphCommand::Shutdown => Ok(()),
        };
        if let Err(e) = outcome {
            self.reject(e);
        }
    }

    fn start_projection(&mut self, target: ImageTensor) -> Result<()> {
        self.projection.validate()?;
        self.cancel_projection();
        self.bank.reset(self.projection.num_projections);
        let session = self.session;
        info!(
            session,
            slots = self.projection.num_projections,
            "projection session started"
        );

        for slot in 0..self.projection.num_projections {
            let projector = self.projector.clone();
            let target = target.clone();
            let settings = self.projection.clone();
            let updates = self.updates.clone();
            let results = self.results_tx.clone();

            self.runs.push(tokio::spawn(async move {
                let mut rng = LatentProjector::rng_for_slot(&settings, slot);
                let outcome = projector
                    .project(slot, &target, &settings, &mut rng, |progress| {
                        match RenderedFrame::from_image(&progress.frame) {
                            Ok(frame) => {
                                let _ = updates.send(MorphUpdate::ProjectionFrame {
                                    slot: progress.slot,
                                    step: progress.step,
                                    loss: progress.loss,
                                    frame,
                                });
                            }
                            Err(e) => debug!(slot, error = %e, "dropping projection frame"),
                        }
                    })
                    .await;
                let _ = results
                    .send(SlotResult {
                        session,
                        slot,
                        outcome,
                    })
                    .await;
            }));
        }
        Ok(())
    }

    /// Abort running slots. Their results, if already in flight, belong to a
    /// stale session and are ignored.
    fn cancel_projection(&mut self) {
        if !self.runs.is_empty() {
            debug!(session = self.session, "abandoning projection runs");
        }
        for run in self.runs.drain(..) {
            run.abort();
        }
        self.session += 1;
    }

    fn on_projection_result(&mut self, result: SlotResult) {
        if result.session != self.session {
            debug!(slot = result.slot, "ignoring result from abandoned session");
            return;
        }
        let stored = result
            .outcome
            .and_then(|latent| self.bank.store(result.slot, latent));
        match stored {
            Ok(()) => {
                let completed = self.bank.completed().len();
                let total = self.bank.len();
                info!(slot = result.slot, completed, total, "projection slot complete");
                let _ = self.updates.send(MorphUpdate::ProjectionComplete {
                    slot: result.slot,
                    completed,
                    total,
                });
            }
            Err(e) => self.reject(e),
        }
    }

    async fn on_sample(&mut self) {
        if let Some(last) = self.last_morph {
            let due = last + Duration::from_millis(self.perturbation.morph_delay_ms);
            tokio::time::sleep_until(due).await;
        }
        // Whatever arrived while waiting supersedes what woke us.
        let Some(sample) = self.samples.borrow_and_update().clone() else {
            return;
        };
        self.last_morph = Some(Instant::now());
        self.tick += 1;

        let frame = self
            .perturber
            .perturb_and_render(&sample, &self.perturbation)
            .and_then(|image| RenderedFrame::from_image(&image));
        match frame {
            Ok(frame) => {
                let _ = self.updates.send(MorphUpdate::MorphFrame {
                    tick: self.tick,
                    frame,
                });
            }
            Err(e) => {
                warn!(tick = self.tick, error = %e, "spectrum sample skipped");
                self.reject(e);
            }
        }
    }

    async fn animate(&mut self) -> Result<()> {
        let mut animator = LatentAnimator::new(self.handle.clone(), &mut self.rng)?;
        let mut index = 0;
        while let Some(frame) = animator.next_frame() {
            index += 1;
            let frame = RenderedFrame::from_image(&frame?)?;
            let _ = self.updates.send(MorphUpdate::AnimationFrame { index, frame });
            tokio::task::yield_now().await;
        }
        info!(frames = index, "animation finished");
        Ok(())
    }

    fn generate_random(&mut self) -> Result<()> {
        let z = LatentVector::random(self.handle.latent_dim(), &mut self.rng);
        let frame = RenderedFrame::from_image(&self.handle.generate(&z)?)?;
        let _ = self.updates.send(MorphUpdate::Generated { frame });
        Ok(())
    }

    fn publish_seeded(&self, source: SeedSource) -> Result<()> {
        let frame = RenderedFrame::from_image(&self.perturber.render_live()?)?;
        info!(?source, "live latent seeded");
        let _ = self.updates.send(MorphUpdate::Seeded { source, frame });
        Ok(())
    }

    fn reject(&self, error: MorphError) {
        if !error.is_recoverable() {
            warn!(error = %error, "engine request failed");
        }
        let _ = self.updates.send(MorphUpdate::Rejected {
            reason: error.to_string(),
        });
    }
}
