//! Network definitions.
//!
//! Parameter names follow the layout the training side saves, so a
//! checkpoint's weights mapping lines up with the [`candle_nn::VarMap`] a
//! network is built against:
//!
//! - `backbone.*` - torchvision EfficientNet-B3 or ResNet-50 trunk
//! - `classifier.*` - four-layer MLP head
//! - `vit.*` / `classifier.*` - Vision Transformer of a pretrained directory

pub mod efficientnet;
pub mod head;
pub mod resnet;
pub mod vit;

mod classifier;

pub use classifier::BreedClassifierNet;
pub use efficientnet::EfficientNetB3;
pub use head::ClassifierHead;
pub use resnet::ResNet50;
pub use vit::{ViTConfig, ViTForImageClassification};

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

/// Epsilon shared by every torchvision batch-norm layer.
pub(crate) const BN_EPS: f64 = 1e-5;

/// Bias-free convolution followed by batch norm, stored as `<prefix>.0` and
/// `<prefix>.1` (torchvision `Conv2dNormActivation`) or under explicit names.
#[derive(Debug, Clone)]
pub(crate) struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: (kernel - 1) / 2,
            stride,
            groups,
            ..Default::default()
        };
        let conv = candle_nn::conv2d_no_bias(in_channels, out_channels, kernel, cfg, conv_vb)?;
        let bn = candle_nn::batch_norm(out_channels, BN_EPS, bn_vb)?;
        Ok(Self { conv, bn })
    }

    /// `Conv2dNormActivation` layout: conv at `.0`, norm at `.1`.
    pub(crate) fn sequential(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::new(
            in_channels,
            out_channels,
            kernel,
            stride,
            groups,
            vb.pp("0"),
            vb.pp("1"),
        )
    }

    /// Inference-mode forward: batch norm uses running statistics.
    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, false)
    }
}

/// Global average pool over the spatial dims: `(B, C, H, W) -> (B, C)`.
pub(crate) fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    xs.mean((2, 3))
}
