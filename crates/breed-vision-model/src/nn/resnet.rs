//! ResNet-50 trunk (torchvision v1.5: stride on the 3x3 conv).

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::{global_avg_pool, ConvBn};

const LAYERS: [(usize, usize, usize); 4] = [
    // (blocks, width, stride of first block)
    (3, 64, 1),
    (4, 128, 2),
    (6, 256, 2),
    (3, 512, 2),
];
const EXPANSION: usize = 4;

#[derive(Debug, Clone)]
struct Bottleneck {
    reduce: ConvBn,
    spatial: ConvBn,
    expand: ConvBn,
    downsample: Option<ConvBn>,
}

impl Bottleneck {
    fn new(in_channels: usize, width: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let out_channels = width * EXPANSION;
        let downsample = if stride != 1 || in_channels != out_channels {
            Some(ConvBn::sequential(
                in_channels,
                out_channels,
                1,
                stride,
                1,
                vb.pp("downsample"),
            )?)
        } else {
            None
        };
        Ok(Self {
            reduce: ConvBn::new(in_channels, width, 1, 1, 1, vb.pp("conv1"), vb.pp("bn1"))?,
            spatial: ConvBn::new(width, width, 3, stride, 1, vb.pp("conv2"), vb.pp("bn2"))?,
            expand: ConvBn::new(width, out_channels, 1, 1, 1, vb.pp("conv3"), vb.pp("bn3"))?,
            downsample,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some(ds) => ds.forward(xs)?,
            None => xs.clone(),
        };
        let h = self.reduce.forward(xs)?.relu()?;
        let h = self.spatial.forward(&h)?.relu()?;
        let h = self.expand.forward(&h)?;
        (h + identity)?.relu()
    }
}

/// ResNet-50 feature extractor: `(B, 3, H, W) -> (B, 2048)`.
#[derive(Debug, Clone)]
pub struct ResNet50 {
    stem: ConvBn,
    blocks: Vec<Bottleneck>,
}

impl ResNet50 {
    pub const FEATURE_DIM: usize = 2048;

    pub fn new(vb: VarBuilder) -> Result<Self> {
        let stem = ConvBn::new(3, 64, 7, 2, 1, vb.pp("conv1"), vb.pp("bn1"))?;
        let mut blocks = Vec::new();
        let mut in_channels = 64;
        for (i, &(count, width, stride)) in LAYERS.iter().enumerate() {
            let layer_vb = vb.pp(format!("layer{}", i + 1));
            for b in 0..count {
                let stride = if b == 0 { stride } else { 1 };
                blocks.push(Bottleneck::new(in_channels, width, stride, layer_vb.pp(b))?);
                in_channels = width * EXPANSION;
            }
        }
        Ok(Self { stem, blocks })
    }
}

impl Module for ResNet50 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.stem.forward(xs)?.relu()?;
        // 3x3/2 max pool with padding 1; edge replication is equivalent to
        // -inf padding for a max.
        let mut h = h
            .pad_with_same(2, 1, 1)?
            .pad_with_same(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for block in &self.blocks {
            h = h.apply(block)?;
        }
        global_avg_pool(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_parameter_layout_and_forward() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = ResNet50::new(vb.pp("backbone")).unwrap();

        {
            let vars = varmap.data().lock().unwrap();
            let shape = |name: &str| vars[name].dims().to_vec();
            assert_eq!(shape("backbone.conv1.weight"), vec![64, 3, 7, 7]);
            assert_eq!(shape("backbone.layer1.0.downsample.0.weight"), vec![256, 64, 1, 1]);
            assert_eq!(shape("backbone.layer2.0.conv2.weight"), vec![128, 128, 3, 3]);
            assert_eq!(shape("backbone.layer4.2.conv3.weight"), vec![2048, 512, 1, 1]);
            assert_eq!(shape("backbone.layer4.2.bn3.running_mean"), vec![2048]);
            assert!(!vars.contains_key("backbone.layer1.1.downsample.0.weight"));
            assert!(!vars.contains_key("backbone.fc.weight"));
        }

        let x = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[1, ResNet50::FEATURE_DIM]);
    }

    #[test]
    fn test_stem_pooling_output_size() {
        // padded 3x3/2 pool halves the resolution
        let x = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let pooled = x
            .pad_with_same(2, 1, 1)
            .unwrap()
            .pad_with_same(3, 1, 1)
            .unwrap()
            .max_pool2d_with_stride(3, 2)
            .unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 16, 16]);
    }
}
