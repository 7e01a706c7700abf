use crate::error::{MorphError, Result};
use crate::latent::LatentVector;

/// Element-wise sum of `results` divided by `count`.
///
/// `count` is taken as given rather than derived from `results`, so a caller
/// that launched N runs can divide by N.
pub fn aggregate(results: &[LatentVector], count: usize) -> Result<LatentVector> {
    let first = results.first().ok_or(MorphError::EmptyAggregation)?;
    if count == 0 {
        return Err(MorphError::EmptyAggregation);
    }

    let dim = first.dim();
    let mut sum = vec![0.0f32; dim];
    for latent in results {
        latent.ensure_dim(dim)?;
        for (acc, v) in sum.iter_mut().zip(latent.as_slice()) {
            *acc += v;
        }
    }

    let n = count as f32;
    Ok(LatentVector::new(sum.into_iter().map(|v| v / n).collect()))
}
