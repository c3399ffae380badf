//! EfficientNet-B3 trunk with torchvision parameter names.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use super::{global_avg_pool, ConvBn};

const WIDTH_MULT: f64 = 1.2;
const DEPTH_MULT: f64 = 1.4;

/// Base B0 stage table: (expand ratio, kernel, stride, in, out, layers).
const STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 32, 16, 1),
    (6, 3, 2, 16, 24, 2),
    (6, 5, 2, 24, 40, 2),
    (6, 3, 2, 40, 80, 3),
    (6, 5, 1, 80, 112, 3),
    (6, 5, 2, 112, 192, 4),
    (6, 3, 1, 192, 320, 1),
];

/// Round to the nearest multiple of 8 without dropping more than 10%.
fn make_divisible(v: f64) -> usize {
    const DIVISOR: usize = 8;
    let rounded = ((v + DIVISOR as f64 / 2.0) as usize / DIVISOR * DIVISOR).max(DIVISOR);
    if (rounded as f64) < 0.9 * v {
        rounded + DIVISOR
    } else {
        rounded
    }
}

fn scale_width(channels: usize) -> usize {
    make_divisible(channels as f64 * WIDTH_MULT)
}

fn scale_depth(layers: usize) -> usize {
    (layers as f64 * DEPTH_MULT).ceil() as usize
}

#[derive(Debug, Clone)]
struct SqueezeExcitation {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcitation {
    fn new(channels: usize, squeeze: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig::default();
        Ok(Self {
            fc1: candle_nn::conv2d(channels, squeeze, 1, cfg, vb.pp("fc1"))?,
            fc2: candle_nn::conv2d(squeeze, channels, 1, cfg, vb.pp("fc2"))?,
        })
    }
}

impl Module for SqueezeExcitation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let scale = xs.mean_keepdim(2)?.mean_keepdim(3)?;
        let scale = candle_nn::ops::silu(&scale.apply(&self.fc1)?)?;
        let scale = candle_nn::ops::sigmoid(&scale.apply(&self.fc2)?)?;
        xs.broadcast_mul(&scale)
    }
}

/// Inverted residual block: optional 1x1 expansion, depthwise conv,
/// squeeze-excitation, 1x1 projection.
#[derive(Debug, Clone)]
struct MBConv {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    se: SqueezeExcitation,
    project: ConvBn,
    residual: bool,
}

impl MBConv {
    fn new(
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        in_channels: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("block");
        let expanded = make_divisible((in_channels * expand_ratio) as f64);
        let mut idx = 0;

        let expand = if expanded != in_channels {
            let layer = ConvBn::sequential(in_channels, expanded, 1, 1, 1, vb.pp(idx))?;
            idx += 1;
            Some(layer)
        } else {
            None
        };
        let depthwise = ConvBn::sequential(expanded, expanded, kernel, stride, expanded, vb.pp(idx))?;
        let se = SqueezeExcitation::new(expanded, (in_channels / 4).max(1), vb.pp(idx + 1))?;
        let project = ConvBn::sequential(expanded, out_channels, 1, 1, 1, vb.pp(idx + 2))?;

        Ok(Self {
            expand,
            depthwise,
            se,
            project,
            residual: stride == 1 && in_channels == out_channels,
        })
    }
}

impl Module for MBConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        if let Some(expand) = &self.expand {
            h = candle_nn::ops::silu(&expand.forward(&h)?)?;
        }
        let h = candle_nn::ops::silu(&self.depthwise.forward(&h)?)?;
        let h = self.project.forward(&h.apply(&self.se)?)?;
        if self.residual {
            h + xs
        } else {
            Ok(h)
        }
    }
}

/// EfficientNet-B3 feature extractor: `(B, 3, H, W) -> (B, 1536)`.
#[derive(Debug, Clone)]
pub struct EfficientNetB3 {
    stem: ConvBn,
    blocks: Vec<MBConv>,
    head: ConvBn,
}

impl EfficientNetB3 {
    pub const FEATURE_DIM: usize = 1536;

    /// Parameters live under `<vb>.features.*`.
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        let stem_out = scale_width(STAGES[0].3);
        let stem = ConvBn::sequential(3, stem_out, 3, 2, 1, vb.pp(0))?;

        let mut blocks = Vec::new();
        let mut last_out = stem_out;
        for (stage, &(expand, kernel, stride, in_c, out_c, layers)) in STAGES.iter().enumerate() {
            let stage_vb = vb.pp(stage + 1);
            let out_c = scale_width(out_c);
            let mut in_c = scale_width(in_c);
            for i in 0..scale_depth(layers) {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MBConv::new(expand, kernel, stride, in_c, out_c, stage_vb.pp(i))?);
                in_c = out_c;
            }
            last_out = out_c;
        }

        let head = ConvBn::sequential(
            last_out,
            4 * last_out,
            1,
            1,
            1,
            vb.pp(STAGES.len() + 1),
        )?;

        Ok(Self { stem, blocks, head })
    }
}

impl Module for EfficientNetB3 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = candle_nn::ops::silu(&self.stem.forward(xs)?)?;
        for block in &self.blocks {
            h = h.apply(block)?;
        }
        let h = candle_nn::ops::silu(&self.head.forward(&h)?)?;
        global_avg_pool(&h)
    }
}
