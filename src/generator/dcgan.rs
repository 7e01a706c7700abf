use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv_transpose2d, linear, BatchNorm, ConvTranspose2d, ConvTranspose2dConfig,
    Linear, VarBuilder,
};

use super::Generator;

const STEM_SIZE: usize = 4;
const MIN_CHANNELS: usize = 16;

/// DCGAN generator as trained on CelebA-HQ:
/// Linear(D -> 4*4*C) -> BN -> ReLU, then one stride-2 transposed conv per
/// doubling of resolution (BN + ReLU between), tanh on the last one.
///
/// Weight keys: `l0`, `bn0`, `dc{i}`, `bn{i}` for i in 1..=blocks.
pub struct DcganGenerator {
    l0: Linear,
    bn0: BatchNorm,
    deconvs: Vec<ConvTranspose2d>,
    norms: Vec<BatchNorm>,
    base_channels: usize,
    latent_dim: usize,
    native_size: usize,
}

impl DcganGenerator {
    pub fn new(
        vb: VarBuilder,
        latent_dim: usize,
        native_size: usize,
        base_channels: usize,
    ) -> candle_core::Result<Self> {
        let blocks = upsample_blocks(native_size)?;
        let l0 = linear(
            latent_dim,
            STEM_SIZE * STEM_SIZE * base_channels,
            vb.pp("l0"),
        )?;
        let bn0 = batch_norm(base_channels, 1e-5, vb.pp("bn0"))?;

        let cfg = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let mut deconvs = Vec::with_capacity(blocks);
        let mut norms = Vec::with_capacity(blocks - 1);
        let mut c_in = base_channels;
        for i in 1..=blocks {
            let last = i == blocks;
            let c_out = if last { 3 } else { (c_in / 2).max(MIN_CHANNELS) };
            deconvs.push(conv_transpose2d(c_in, c_out, 4, cfg, vb.pp(format!("dc{i}")))?);
            if !last {
                norms.push(batch_norm(c_out, 1e-5, vb.pp(format!("bn{i}")))?);
            }
            c_in = c_out;
        }

        Ok(Self {
            l0,
            bn0,
            deconvs,
            norms,
            base_channels,
            latent_dim,
            native_size,
        })
    }
}

impl Generator for DcganGenerator {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn native_size(&self) -> usize {
        self.native_size
    }

    fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        let batch = z.dim(0)?;
        let mut h = self
            .l0
            .forward(z)?
            .reshape((batch, self.base_channels, STEM_SIZE, STEM_SIZE))?;
        // Inference statistics only; the generator is frozen.
        h = self.bn0.forward_t(&h, false)?.relu()?;

        for (i, deconv) in self.deconvs.iter().enumerate() {
            h = deconv.forward(&h)?;
            match self.norms.get(i) {
                Some(bn) => h = bn.forward_t(&h, false)?.relu()?,
                None => h = h.tanh()?,
            }
        }
        Ok(h)
    }
}

/// Number of 2x upsampling steps from the 4x4 stem to `native_size`.
pub(crate) fn upsample_blocks(native_size: usize) -> candle_core::Result<usize> {
    if native_size < 2 * STEM_SIZE || !native_size.is_power_of_two() {
        candle_core::bail!("native size {native_size} is not a power of two >= 8")
    }
    Ok((native_size / STEM_SIZE).trailing_zeros() as usize)
}
