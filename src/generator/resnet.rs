use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{batch_norm, conv2d, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};

use super::dcgan::upsample_blocks;
use super::Generator;
use crate::imaging::repeat_spatial;

const STEM_SIZE: usize = 4;
const MIN_CHANNELS: usize = 16;

/// Pre-activation residual block that doubles the spatial resolution.
struct UpBlock {
    bn1: BatchNorm,
    c1: Conv2d,
    bn2: BatchNorm,
    c2: Conv2d,
    c_sc: Conv2d,
}

impl UpBlock {
    fn new(c_in: usize, c_out: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            bn1: batch_norm(c_in, 1e-5, vb.pp("b1"))?,
            c1: conv2d(c_in, c_out, 3, same, vb.pp("c1"))?,
            bn2: batch_norm(c_out, 1e-5, vb.pp("b2"))?,
            c2: conv2d(c_out, c_out, 3, same, vb.pp("c2"))?,
            c_sc: conv2d(c_in, c_out, 1, Default::default(), vb.pp("c_sc"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.bn1.forward_t(x, false)?.relu()?;
        let h = self.c1.forward(&repeat_spatial(&h, 2)?)?;
        let h = self.bn2.forward_t(&h, false)?.relu()?;
        let h = self.c2.forward(&h)?;
        let shortcut = self.c_sc.forward(&repeat_spatial(x, 2)?)?;
        h + shortcut
    }
}

/// ResNet generator (SNGAN layout): Linear(D -> 4*4*C), one `UpBlock` per
/// doubling, then BN -> ReLU -> 3x3 conv to RGB -> tanh.
///
/// Weight keys: `l1`, `block{i}.{b1,c1,b2,c2,c_sc}`, `b_out`, `l_out`.
pub struct ResnetGenerator {
    l1: Linear,
    blocks: Vec<UpBlock>,
    b_out: BatchNorm,
    l_out: Conv2d,
    channels: usize,
    latent_dim: usize,
    native_size: usize,
}

impl ResnetGenerator {
    pub fn new(
        vb: VarBuilder,
        latent_dim: usize,
        native_size: usize,
        channels: usize,
    ) -> candle_core::Result<Self> {
        let n_blocks = upsample_blocks(native_size)?;
        let l1 = linear(latent_dim, STEM_SIZE * STEM_SIZE * channels, vb.pp("l1"))?;

        let mut blocks = Vec::with_capacity(n_blocks);
        let mut c_in = channels;
        for i in 1..=n_blocks {
            // First block keeps the width, later ones halve it.
            let c_out = if i == 1 { c_in } else { (c_in / 2).max(MIN_CHANNELS) };
            blocks.push(UpBlock::new(c_in, c_out, vb.pp(format!("block{i}")))?);
            c_in = c_out;
        }

        let b_out = batch_norm(c_in, 1e-5, vb.pp("b_out"))?;
        let l_out = conv2d(
            c_in,
            3,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("l_out"),
        )?;

        Ok(Self {
            l1,
            blocks,
            b_out,
            l_out,
            channels,
            latent_dim,
            native_size,
        })
    }
}

impl Generator for ResnetGenerator {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn native_size(&self) -> usize {
        self.native_size
    }

    fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        let batch = z.dim(0)?;
        let mut h = self
            .l1
            .forward(z)?
            .reshape((batch, self.channels, STEM_SIZE, STEM_SIZE))?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let h = self.b_out.forward_t(&h, false)?.relu()?;
        self.l_out.forward(&h)?.tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_resnet_forward_shape() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let gen = ResnetGenerator::new(vb, 16, 16, 32)?;

        let z = Tensor::randn(0f32, 1.0, (1, 16), &device)?;
        let out = gen.forward(&z)?;
        assert_eq!(out.dims(), &[1, 3, 16, 16]);
        Ok(())
    }
}
