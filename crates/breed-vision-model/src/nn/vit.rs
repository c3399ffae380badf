//! Vision Transformer for image classification, laid out like a Hugging Face
//! `ViTForImageClassification` checkpoint directory.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use crate::error::{ModelError, ModelResult};

/// Subset of `config.json` needed to build the network.
#[derive(Debug, Clone, Deserialize)]
pub struct ViTConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default)]
    pub id2label: HashMap<String, String>,
    #[serde(default)]
    pub num_labels: Option<usize>,
}

fn default_hidden_size() -> usize {
    768
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_hidden_act() -> String {
    "gelu".to_string()
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}
fn default_image_size() -> usize {
    224
}
fn default_patch_size() -> usize {
    16
}
fn default_num_channels() -> usize {
    3
}
fn default_qkv_bias() -> bool {
    true
}

impl ViTConfig {
    /// Parse `config.json` and check the dimensions are consistent.
    pub fn from_file(path: &Path) -> ModelResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ModelError::config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        tracing::info!(
            "Loaded ViT config: hidden_size={}, layers={}, heads={}, image_size={}, labels={}",
            config.hidden_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.image_size,
            config.label_count()
        );
        Ok(config)
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(ModelError::config(format!(
                "image_size {} is not divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        activation(&self.hidden_act)?;
        if self.label_count() == 0 {
            return Err(ModelError::config(
                "config.json defines no labels (id2label and num_labels are both empty)",
            ));
        }
        Ok(())
    }

    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }

    /// Output dimension: one past the highest `id2label` index, or `num_labels`.
    pub fn label_count(&self) -> usize {
        let from_map = self
            .id2label
            .keys()
            .filter_map(|k| k.parse::<usize>().ok())
            .max()
            .map_or(0, |max| max + 1);
        from_map.max(self.num_labels.unwrap_or(0))
    }

    /// Labels ordered by index; gaps in `id2label` get the index as label.
    pub fn labels(&self) -> Vec<String> {
        (0..self.label_count())
            .map(|i| {
                self.id2label
                    .get(&i.to_string())
                    .cloned()
                    .unwrap_or_else(|| i.to_string())
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Activation {
    GeluErf,
    GeluTanh,
    Relu,
    Silu,
}

fn activation(name: &str) -> ModelResult<Activation> {
    match name {
        "gelu" => Ok(Activation::GeluErf),
        "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Activation::GeluTanh),
        "relu" => Ok(Activation::Relu),
        "silu" | "swish" => Ok(Activation::Silu),
        other => Err(ModelError::config(format!(
            "unsupported hidden_act '{}'",
            other
        ))),
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::GeluErf => xs.gelu_erf(),
            Self::GeluTanh => xs.gelu(),
            Self::Relu => xs.relu(),
            Self::Silu => candle_nn::ops::silu(xs),
        }
    }
}

#[derive(Debug, Clone)]
struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let inner = vb.pp("attention");
        let linear = |name: &str| {
            if config.qkv_bias {
                candle_nn::linear(h, h, inner.pp(name))
            } else {
                candle_nn::linear_no_bias(h, h, inner.pp(name))
            }
        };
        Ok(Self {
            query: linear("query")?,
            key: linear("key")?,
            value: linear("value")?,
            output: candle_nn::linear(h, h, vb.pp("output").pp("dense"))?,
            num_heads: config.num_attention_heads,
            head_dim: h / config.num_attention_heads,
        })
    }

    fn heads(&self, xs: &Tensor, b: usize, n: usize) -> Result<Tensor> {
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for SelfAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, hidden) = xs.dims3()?;
        let q = self.heads(&xs.apply(&self.query)?, b, n)?;
        let k = self.heads(&xs.apply(&self.key)?, b, n)?;
        let v = self.heads(&xs.apply(&self.value)?, b, n)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, hidden))?;
        context.apply(&self.output)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    layernorm_before: LayerNorm,
    attention: SelfAttention,
    layernorm_after: LayerNorm,
    intermediate: Linear,
    output: Linear,
    act: Activation,
}

impl EncoderLayer {
    fn new(config: &ViTConfig, act: Activation, vb: VarBuilder) -> Result<Self> {
        let (h, eps) = (config.hidden_size, config.layer_norm_eps);
        Ok(Self {
            layernorm_before: candle_nn::layer_norm(h, eps, vb.pp("layernorm_before"))?,
            attention: SelfAttention::new(config, vb.pp("attention"))?,
            layernorm_after: candle_nn::layer_norm(h, eps, vb.pp("layernorm_after"))?,
            intermediate: candle_nn::linear(
                h,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: candle_nn::linear(config.intermediate_size, h, vb.pp("output").pp("dense"))?,
            act,
        })
    }
}

impl Module for EncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = (xs.apply(&self.layernorm_before)?.apply(&self.attention)? + xs)?;
        let mlp = h
            .apply(&self.layernorm_after)?
            .apply(&self.intermediate)?
            .apply(&self.act)?
            .apply(&self.output)?;
        mlp + h
    }
}

/// `(B, C, S, S) -> (B, num_labels)` logits, read off the CLS token.
#[derive(Debug, Clone)]
pub struct ViTForImageClassification {
    cls_token: Tensor,
    position_embeddings: Tensor,
    patch_projection: Conv2d,
    layers: Vec<EncoderLayer>,
    layernorm: LayerNorm,
    classifier: Linear,
    hidden_size: usize,
}

impl ViTForImageClassification {
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> ModelResult<Self> {
        let act = activation(&config.hidden_act)?;
        Ok(Self::build(config, act, vb)?)
    }

    fn build(config: &ViTConfig, act: Activation, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let vit = vb.pp("vit");
        let embeddings = vit.pp("embeddings");
        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };

        let cls_token = embeddings.get_with_hints((1, 1, h), "cls_token", init)?;
        let position_embeddings = embeddings.get_with_hints(
            (1, config.num_patches() + 1, h),
            "position_embeddings",
            init,
        )?;
        let patch_projection = candle_nn::conv2d(
            config.num_channels,
            h,
            config.patch_size,
            Conv2dConfig {
                stride: config.patch_size,
                ..Default::default()
            },
            embeddings.pp("patch_embeddings").pp("projection"),
        )?;

        let encoder = vit.pp("encoder").pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::new(config, act, encoder.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            cls_token,
            position_embeddings,
            patch_projection,
            layers,
            layernorm: candle_nn::layer_norm(h, config.layer_norm_eps, vit.pp("layernorm"))?,
            classifier: candle_nn::linear(h, config.label_count(), vb.pp("classifier"))?,
            hidden_size: h,
        })
    }
}

impl Module for ViTForImageClassification {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let b = xs.dim(0)?;
        let patches = xs
            .apply(&self.patch_projection)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let cls = self.cls_token.expand((b, 1, self.hidden_size))?;
        let mut h = Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&self.position_embeddings)?;
        for layer in &self.layers {
            h = h.apply(layer)?;
        }
        let h = h.apply(&self.layernorm)?;
        h.i((.., 0))?.apply(&self.classifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> ViTConfig {
        serde_json::from_str(
            r#"{
                "hidden_size": 8,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "intermediate_size": 16,
                "image_size": 32,
                "patch_size": 16,
                "id2label": {"0": "Gir", "1": "Sahiwal", "2": "Ongole"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults_and_labels() {
        let config: ViTConfig =
            serde_json::from_str(r#"{"id2label": {"1": "b", "0": "a", "3": "d"}}"#).unwrap();
        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_patches(), 196);
        assert_eq!(config.hidden_act, "gelu");
        assert_eq!(config.labels(), vec!["a", "b", "2", "d"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = tiny_config();
        config.num_attention_heads = 3;
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.hidden_act = "mish".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("mish"));

        let mut config = tiny_config();
        config.id2label.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parameter_names_and_forward() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ViTForImageClassification::new(&config, vb).unwrap();

        {
            let vars = varmap.data().lock().unwrap();
            let shape = |name: &str| vars[name].dims().to_vec();
            assert_eq!(shape("vit.embeddings.cls_token"), vec![1, 1, 8]);
            assert_eq!(shape("vit.embeddings.position_embeddings"), vec![1, 5, 8]);
            assert_eq!(
                shape("vit.embeddings.patch_embeddings.projection.weight"),
                vec![8, 3, 16, 16]
            );
            assert_eq!(
                shape("vit.encoder.layer.1.attention.attention.query.weight"),
                vec![8, 8]
            );
            assert_eq!(
                shape("vit.encoder.layer.0.attention.output.dense.bias"),
                vec![8]
            );
            assert_eq!(shape("vit.encoder.layer.0.intermediate.dense.weight"), vec![16, 8]);
            assert_eq!(shape("vit.encoder.layer.0.output.dense.weight"), vec![8, 16]);
            assert_eq!(shape("vit.layernorm.weight"), vec![8]);
            assert_eq!(shape("classifier.weight"), vec![3, 8]);
        }

        let x = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
    }
}
