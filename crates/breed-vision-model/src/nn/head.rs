//! MLP classification head placed on top of the pooled backbone features.

use candle_core::{Module, Result, Tensor};
use candle_nn::{BatchNorm, Linear, VarBuilder};

use super::BN_EPS;

/// Hidden widths of the three Linear/BatchNorm/ReLU/Dropout stages.
pub const HIDDEN_DIMS: [usize; 3] = [1024, 512, 256];

/// Sequential indices: each stage spans four slots (linear, bn, relu,
/// dropout), so linears sit at 0/4/8 and norms at 1/5/9; the output linear
/// is at 12. Dropout is the identity at inference and has no parameters.
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    stages: Vec<(Linear, BatchNorm)>,
    output: Linear,
}

impl ClassifierHead {
    pub fn new(in_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(HIDDEN_DIMS.len());
        let mut dim = in_dim;
        for (i, &hidden) in HIDDEN_DIMS.iter().enumerate() {
            let linear = candle_nn::linear(dim, hidden, vb.pp(4 * i))?;
            let bn = candle_nn::batch_norm(hidden, BN_EPS, vb.pp(4 * i + 1))?;
            stages.push((linear, bn));
            dim = hidden;
        }
        let output = candle_nn::linear(dim, num_classes, vb.pp(4 * HIDDEN_DIMS.len()))?;
        Ok(Self { stages, output })
    }
}

impl Module for ClassifierHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for (linear, bn) in &self.stages {
            h = h.apply(linear)?.apply_t(bn, false)?.relu()?;
        }
        h.apply(&self.output)
    }
}
