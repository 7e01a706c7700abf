use candle_core::{Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{MorphError, Result};

/// A 1xD point in the generator's latent space.
///
/// Held by exactly one engine at a time: the projector while it optimizes,
/// then the perturber once it is handed over as a seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentVector {
    values: Vec<f32>,
}

impl LatentVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Fresh N(0, 1) draw.
    pub fn random(dim: usize, rng: &mut impl Rng) -> Self {
        let values = (0..dim).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        Self { values }
    }

    /// Accepts (D,) or (1, D).
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { values })
    }

    /// Shape (1, D), as the generators expect.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.values, (1, self.values.len()), device)?)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.values
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn ensure_dim(&self, expected: usize) -> Result<()> {
        if self.dim() != expected {
            return Err(MorphError::DimensionMismatch {
                expected,
                actual: self.dim(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_is_seedable() {
        let a = LatentVector::random(128, &mut StdRng::seed_from_u64(7));
        let b = LatentVector::random(128, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.dim(), 128);
    }

    #[test]
    fn test_random_norm_near_sqrt_dim() {
        // ||z|| of a D-dim standard normal concentrates around sqrt(D).
        let z = LatentVector::random(4096, &mut StdRng::seed_from_u64(1));
        let expected = (4096f32).sqrt();
        assert!((z.norm() - expected).abs() < 0.05 * expected);
    }

    #[test]
    fn test_tensor_round_trip_shape() -> Result<()> {
        let z = LatentVector::new(vec![1.0, -2.0, 3.5]);
        let t = z.to_tensor(&Device::Cpu)?;
        assert_eq!(t.dims(), &[1, 3]);
        assert_eq!(LatentVector::from_tensor(&t)?, z);
        Ok(())
    }

    #[test]
    fn test_ensure_dim() {
        let z = LatentVector::new(vec![0.0; 4]);
        assert!(z.ensure_dim(4).is_ok());
        assert!(matches!(
            z.ensure_dim(128),
            Err(MorphError::DimensionMismatch {
                expected: 128,
                actual: 4
            })
        ));
    }
}
