use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use rand::Rng;
use rand_distr::StandardNormal;
use std::collections::HashMap;

use super::Generator;

/// One fully-connected decoder: z -> tanh(W z + b) reshaped to (1, 3, S, S).
///
/// Small enough to project against in milliseconds, which makes it the
/// generator of choice for low-resolution installs and for tests.
#[derive(Debug, Clone)]
pub struct DenseGenerator {
    fc: Linear,
    latent_dim: usize,
    native_size: usize,
}

impl DenseGenerator {
    pub fn new(vb: VarBuilder, latent_dim: usize, native_size: usize) -> candle_core::Result<Self> {
        let fc = linear(latent_dim, 3 * native_size * native_size, vb.pp("fc"))?;
        Ok(Self {
            fc,
            latent_dim,
            native_size,
        })
    }

    /// Untrained weights, N(0, 1/D), drawn from `rng`. Keys match `new`.
    pub fn init_tensors(
        latent_dim: usize,
        native_size: usize,
        rng: &mut impl Rng,
        device: &Device,
    ) -> candle_core::Result<HashMap<String, Tensor>> {
        let out_dim = 3 * native_size * native_size;
        let std = 1.0 / (latent_dim as f32).sqrt();
        let weight: Vec<f32> = (0..out_dim * latent_dim)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * std)
            .collect();

        let mut tensors = HashMap::new();
        tensors.insert(
            "fc.weight".to_string(),
            Tensor::from_vec(weight, (out_dim, latent_dim), device)?,
        );
        tensors.insert(
            "fc.bias".to_string(),
            Tensor::zeros((out_dim,), DType::F32, device)?,
        );
        Ok(tensors)
    }
}

impl Generator for DenseGenerator {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn native_size(&self) -> usize {
        self.native_size
    }

    fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        let batch = z.dim(0)?;
        let s = self.native_size;
        self.fc.forward(z)?.tanh()?.reshape((batch, 3, s, s))
    }
}
