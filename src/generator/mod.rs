// Frozen generator networks and the adapter that turns latents into display frames.
pub mod dcgan;
pub mod dense;
pub mod resnet;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{GeneratorArch, InstallationConfig, ModelProfile};
use crate::error::{MorphError, Result};
use crate::imaging::{enlarge, ImageTensor, PixelRange};
use crate::latent::LatentVector;

pub use dcgan::DcganGenerator;
pub use dense::DenseGenerator;
pub use resnet::ResnetGenerator;

/// A frozen latent -> image network.
pub trait Generator: Send + Sync {
    fn latent_dim(&self) -> usize;
    fn native_size(&self) -> usize;
    /// `z`: (B, D). Returns (B, 3, S, S) in [-1, 1].
    fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor>;
}

pub fn build_generator(profile: &ModelProfile, vb: VarBuilder) -> candle_core::Result<Box<dyn Generator>> {
    let d = profile.latent_dim;
    let s = profile.native_size;
    Ok(match profile.arch {
        GeneratorArch::Dcgan { base_channels } => {
            Box::new(DcganGenerator::new(vb, d, s, base_channels)?)
        }
        GeneratorArch::Resnet { channels } => Box::new(ResnetGenerator::new(vb, d, s, channels)?),
        GeneratorArch::Dense => Box::new(DenseGenerator::new(vb, d, s)?),
    })
}

/// `Device::Cpu` unless a GPU was asked for and is present.
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if use_gpu {
        Ok(Device::cuda_if_available(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// A loaded generator plus the profile it was loaded for. Immutable.
pub struct ModelHandle {
    profile: ModelProfile,
    generator: Box<dyn Generator>,
    device: Device,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.profile.model_id)
            .field("device", &self.device)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(profile: ModelProfile, generator: Box<dyn Generator>, device: Device) -> Result<Self> {
        profile.validate()?;
        if generator.latent_dim() != profile.latent_dim {
            return Err(MorphError::DimensionMismatch {
                expected: profile.latent_dim,
                actual: generator.latent_dim(),
            });
        }
        if generator.native_size() != profile.native_size {
            return Err(MorphError::InvalidSettings(format!(
                "{}: generator renders {}px, profile says {}px",
                profile.model_id,
                generator.native_size(),
                profile.native_size
            )));
        }
        Ok(Self {
            profile,
            generator,
            device,
        })
    }

    /// Memory-map the profile's safetensors weights and build the network.
    pub fn open(profile: &ModelProfile, device: &Device) -> Result<Self> {
        let load_err = |reason: String| MorphError::ModelLoad {
            model_id: profile.model_id.clone(),
            reason,
        };
        profile.validate()?;
        if !profile.weights.exists() {
            return Err(load_err(format!("weights not found at {:?}", profile.weights)));
        }
        // SAFETY: the weight file is opened read-only and never written while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&profile.weights], DType::F32, device)
                .map_err(|e| load_err(e.to_string()))?
        };
        let generator = build_generator(profile, vb).map_err(|e| load_err(e.to_string()))?;
        Self::new(profile.clone(), generator, device.clone())
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    pub fn latent_dim(&self) -> usize {
        self.profile.latent_dim
    }

    pub fn display_size(&self) -> usize {
        self.profile.display_size()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Latent (1, D) -> unit-range (H, W, 3) at display size.
    ///
    /// Stays on the autograd tape: the projector differentiates through it.
    pub fn render(&self, z: &Tensor) -> Result<Tensor> {
        let (_, d) = z.dims2()?;
        if d != self.latent_dim() {
            return Err(MorphError::DimensionMismatch {
                expected: self.latent_dim(),
                actual: d,
            });
        }
        let raw = self.generator.forward(z)?;
        // [-1, 1] -> [0, 1], CHW -> HWC
        let image = raw.squeeze(0)?.permute((1, 2, 0))?.affine(0.5, 0.5)?;
        enlarge(&image, self.profile.upscale_multiplier)
    }

    pub fn generate(&self, latent: &LatentVector) -> Result<ImageTensor> {
        latent.ensure_dim(self.latent_dim())?;
        let z = latent.to_tensor(&self.device)?;
        ImageTensor::new(self.render(&z)?, PixelRange::Unit)
    }
}

/// Owns the profile catalog and caches one handle per model id.
pub struct GeneratorAdapter {
    profiles: Vec<ModelProfile>,
    device: Device,
    cache: Mutex<HashMap<String, Arc<ModelHandle>>>,
}

impl GeneratorAdapter {
    pub fn new(profiles: Vec<ModelProfile>, device: Device) -> Self {
        Self {
            profiles,
            device,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &InstallationConfig) -> Result<Self> {
        let device = select_device(config.device.use_gpu)?;
        Ok(Self::new(config.models.clone(), device))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn profiles(&self) -> &[ModelProfile] {
        &self.profiles
    }

    /// Idempotent: a second call for the same id returns the cached handle.
    pub fn load(&self, model_id: &str) -> Result<Arc<ModelHandle>> {
        // Held across the load so concurrent callers wait for one fetch.
        let mut cache = self.cache.lock();
        if let Some(handle) = cache.get(model_id) {
            debug!(model_id, "model cache hit");
            return Ok(handle.clone());
        }

        let profile = self
            .profiles
            .iter()
            .find(|p| p.model_id == model_id)
            .ok_or_else(|| MorphError::ModelLoad {
                model_id: model_id.to_string(),
                reason: "no such profile".to_string(),
            })?;

        info!(model_id, description = %profile.description, "loading generator");
        let handle = Arc::new(ModelHandle::open(profile, &self.device)?);
        cache.insert(model_id.to_string(), handle.clone());
        info!(model_id, "generator ready");
        Ok(handle)
    }

    /// `load` on tokio's blocking pool.
    pub async fn load_async(self: &Arc<Self>, model_id: &str) -> Result<Arc<ModelHandle>> {
        let adapter = self.clone();
        let id = model_id.to_string();
        tokio::task::spawn_blocking(move || adapter.load(&id))
            .await
            .map_err(|e| MorphError::ModelLoad {
                model_id: model_id.to_string(),
                reason: e.to_string(),
            })?
    }

    pub fn is_cached(&self, model_id: &str) -> bool {
        self.cache.lock().contains_key(model_id)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generate_is_unit_range_at_display_size() -> Result<()> {
        let handle = dense_handle(16, 4, 3, 11)?;
        let z = LatentVector::random(16, &mut StdRng::seed_from_u64(5));
        let image = handle.generate(&z)?;
        assert_eq!(image.side(), 12);
        assert_eq!(image.range(), PixelRange::Unit);
        let values = image.tensor().flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn test_generate_is_deterministic() -> Result<()> {
        let handle = dense_handle(16, 4, 1, 11)?;
        let z = LatentVector::random(16, &mut StdRng::seed_from_u64(5));
        let a = handle.generate(&z)?.tensor().flatten_all()?.to_vec1::<f32>()?;
        let b = handle.generate(&z)?.tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_generate_rejects_wrong_dimension() -> Result<()> {
        let handle = dense_handle(16, 4, 1, 11)?;
        let z = LatentVector::new(vec![0.0; 8]);
        assert!(matches!(
            handle.generate(&z),
            Err(MorphError::DimensionMismatch {
                expected: 16,
                actual: 8
            })
        ));
        Ok(())
    }

    #[test]
    fn test_render_applies_half_shift() -> Result<()> {
        // Zero weights and bias give tanh(0) = 0, which must map to 0.5.
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let generator = DenseGenerator::new(vb, 4, 2)?;
        let handle = ModelHandle::new(dense_profile(4, 2, 2), Box::new(generator), device)?;
        let image = handle.generate(&LatentVector::new(vec![1.0, 2.0, 3.0, 4.0]))?;
        let values = image.tensor().flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (*v - 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_load_is_cached() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("dense.safetensors");
        let tensors = DenseGenerator::init_tensors(8, 4, &mut StdRng::seed_from_u64(2), &Device::Cpu)?;
        candle_core::safetensors::save(&tensors, &weights)?;

        let mut profile = dense_profile(8, 4, 2);
        profile.weights = weights;
        let adapter = GeneratorAdapter::new(vec![profile], Device::Cpu);

        assert!(!adapter.is_cached("dense-test"));
        let first = adapter.load("dense-test")?;
        let second = adapter.load("dense-test")?;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(adapter.is_cached("dense-test"));
        assert_eq!(first.display_size(), 8);
        Ok(())
    }

    #[test]
    fn test_load_missing_weights_is_model_load_error() {
        let adapter = GeneratorAdapter::new(vec![dense_profile(8, 4, 1)], Device::Cpu);
        assert!(matches!(
            adapter.load("dense-test"),
            Err(MorphError::ModelLoad { .. })
        ));
        assert!(matches!(
            adapter.load("no-such-model"),
            Err(MorphError::ModelLoad { .. })
        ));
    }

    #[test]
    fn test_load_malformed_weights_is_model_load_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("broken.safetensors");
        std::fs::write(&weights, b"not a safetensors file")?;
        let mut profile = dense_profile(8, 4, 1);
        profile.weights = weights;
        let adapter = GeneratorAdapter::new(vec![profile], Device::Cpu);
        assert!(matches!(
            adapter.load("dense-test"),
            Err(MorphError::ModelLoad { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_async_shares_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("dense.safetensors");
        let tensors = DenseGenerator::init_tensors(8, 4, &mut StdRng::seed_from_u64(2), &Device::Cpu)?;
        candle_core::safetensors::save(&tensors, &weights)?;
        let mut profile = dense_profile(8, 4, 1);
        profile.weights = weights;

        let adapter = Arc::new(GeneratorAdapter::new(vec![profile], Device::Cpu));
        let a = adapter.load_async("dense-test").await?;
        let b = adapter.load("dense-test")?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }
}
