use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use ganmorph::aggregator::aggregate;
use ganmorph::animate::LatentAnimator;
use ganmorph::server::{self, ServerState};
use ganmorph::spectrum::SyntheticSpectrum;
use ganmorph::{
    GeneratorAdapter, ImageTensor, InstallationConfig, LatentProjector, LatentVector, MorphEngine,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Muse headsets sample at 256 Hz; the spectrum pipeline emits every 100 ms.
const SYNTHETIC_SAMPLE_RATE: f32 = 256.0;
const SYNTHETIC_EPOCH: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Installation config (TOML). Defaults apply when the file is absent.
    #[arg(long, default_value = "ganmorph.toml")]
    config: PathBuf,

    /// Override the configured model id.
    #[arg(long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the live morph engine behind the websocket server.
    Serve {
        #[arg(long)]
        port: Option<u16>,

        /// Drive the morph from generated EEG-like spectra instead of a headset.
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Project a photo into latent space, writing progress frames and the seed.
    Project {
        #[arg(long)]
        target: PathBuf,

        #[arg(long, default_value = "projection")]
        out_dir: PathBuf,
    },
    /// Render one random face.
    Generate {
        #[arg(long, default_value = "generated.png")]
        out: PathBuf,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Render the idle sine-wave animation as numbered frames.
    Animate {
        #[arg(long, default_value = "animation")]
        out_dir: PathBuf,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = InstallationConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(model) = &args.model {
        config.model = model.clone();
        config.validate()?;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args.command, config))
}

async fn run(command: Command, config: InstallationConfig) -> Result<()> {
    let adapter = Arc::new(GeneratorAdapter::from_config(&config)?);
    let handle = adapter
        .load_async(&config.model)
        .await
        .with_context(|| format!("failed to load model {}", config.model))?;

    match command {
        Command::Serve { port, synthetic } => serve(config, handle, port, synthetic).await,
        Command::Project { target, out_dir } => {
            project(&config, handle, &target, &out_dir).await
        }
        Command::Generate { out, seed } => {
            let z = LatentVector::random(handle.latent_dim(), &mut rng(seed));
            handle.generate(&z)?.save_png(&out)?;
            info!(path = %out.display(), "wrote face");
            Ok(())
        }
        Command::Animate { out_dir, seed } => {
            std::fs::create_dir_all(&out_dir)?;
            let mut animator = LatentAnimator::new(handle, &mut rng(seed))?;
            let mut index = 0;
            while let Some(frame) = animator.next_frame() {
                index += 1;
                frame?.save_png(out_dir.join(format!("frame_{index:04}.png")))?;
            }
            info!(frames = index, dir = %out_dir.display(), "wrote animation");
            Ok(())
        }
    }
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

async fn serve(
    config: InstallationConfig,
    handle: Arc<ganmorph::ModelHandle>,
    port: Option<u16>,
    synthetic: bool,
) -> Result<()> {
    let engine = MorphEngine::spawn(handle.clone(), &config);
    let state = ServerState::new(&engine, handle.clone(), config.spectrum.channel.clone());

    if synthetic {
        // Sized to the latent so the default exact fit accepts every sample.
        let mut source = SyntheticSpectrum::new(handle.latent_dim(), SYNTHETIC_SAMPLE_RATE, 0);
        let feed = state.clone();
        let channel = config.spectrum.channel.clone();
        info!(%channel, "synthetic spectrum feed enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNTHETIC_EPOCH);
            loop {
                ticker.tick().await;
                let message = server::ControlMessage::Spectrum(source.next_channel(&channel));
                if let Err(e) = feed.dispatch(message).await {
                    warn!(error = %e, "synthetic feed stopped");
                    break;
                }
            }
        });
    } else if config.spectrum.bins != handle.latent_dim() {
        warn!(
            bins = config.spectrum.bins,
            latent_dim = handle.latent_dim(),
            fit = ?config.spectrum.fit,
            "spectrum bins differ from the latent dimension"
        );
    }

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid server host {}", config.server.host))?;
    let addr = SocketAddr::new(host, port.unwrap_or(config.server.port));

    tokio::select! {
        served = server::serve(addr, state) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    engine.shutdown().await;
    Ok(())
}

async fn project(
    config: &InstallationConfig,
    handle: Arc<ganmorph::ModelHandle>,
    target_path: &Path,
    out_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let target = ImageTensor::load_target(target_path, handle.display_size(), handle.device())
        .with_context(|| format!("failed to read target {}", target_path.display()))?;
    let projector = LatentProjector::new(handle.clone());
    let settings = &config.projection;
    let target = &target;

    let runs = (0..settings.num_projections).map(|slot| {
        let projector = projector.clone();
        async move {
            let mut rng = LatentProjector::rng_for_slot(settings, slot);
            let mut frames = Vec::new();
            let latent = projector
                .project(slot, target, settings, &mut rng, |progress| {
                    info!(slot, step = progress.step, loss = progress.loss, "projection frame");
                    frames.push(progress);
                })
                .await?;
            for progress in frames {
                let path = out_dir.join(format!("slot{}_step{:04}.png", progress.slot, progress.step));
                progress.frame.save_png(path)?;
            }
            ganmorph::Result::Ok(latent)
        }
    });
    let results = try_join_all(runs).await?;

    let seed = aggregate(&results, results.len())?;
    let seed_path = out_dir.join("seed.json");
    std::fs::write(&seed_path, serde_json::to_string_pretty(&seed)?)?;
    handle.generate(&seed)?.save_png(out_dir.join("seed.png"))?;
    info!(path = %seed_path.display(), norm = seed.norm(), "wrote averaged seed");
    Ok(())
}
