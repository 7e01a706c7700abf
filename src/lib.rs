pub mod aggregator;
pub mod animate;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod imaging;
pub mod latent;
pub mod perturber;
pub mod projector;
pub mod server;
pub mod spectrum;

// Re-exports
pub use config::InstallationConfig;
pub use engine::{EngineHandle, MorphCommand, MorphEngine, MorphUpdate};
pub use error::{MorphError, Result};
pub use generator::{GeneratorAdapter, ModelHandle};
pub use imaging::ImageTensor;
pub use latent::LatentVector;
pub use perturber::LatentPerturber;
pub use projector::{LatentProjector, ProjectionBank};
pub use spectrum::PowerSpectrumSample;
