use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::{ClassifierHead, EfficientNetB3, ResNet50};
use crate::arch::Backbone;

#[derive(Debug, Clone)]
enum Trunk {
    EfficientNet(EfficientNetB3),
    ResNet(ResNet50),
}

/// Backbone + MLP head, the network a training checkpoint describes.
///
/// Parameters are named `backbone.*` and `classifier.*`.
#[derive(Debug, Clone)]
pub struct BreedClassifierNet {
    trunk: Trunk,
    head: ClassifierHead,
}

impl BreedClassifierNet {
    pub fn new(backbone: Backbone, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let trunk = match backbone {
            Backbone::EfficientNetB3 => Trunk::EfficientNet(EfficientNetB3::new(vb.pp("backbone"))?),
            Backbone::ResNet50 => Trunk::ResNet(ResNet50::new(vb.pp("backbone"))?),
        };
        let head = ClassifierHead::new(backbone.feature_dim(), num_classes, vb.pp("classifier"))?;
        Ok(Self { trunk, head })
    }
}

impl Module for BreedClassifierNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let features = match &self.trunk {
            Trunk::EfficientNet(net) => net.forward(xs)?,
            Trunk::ResNet(net) => net.forward(xs)?,
        };
        let features = if features.rank() > 2 {
            features.flatten_from(1)?
        } else {
            features
        };
        self.head.forward(&features)
    }
}
