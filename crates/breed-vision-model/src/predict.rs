//! Softmax + top-K ranking of classifier logits.

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::labels::ClassRegistry;

/// One ranked class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLabel {
    pub label: String,
    pub confidence: f32,
}

/// Result of classifying one image.
///
/// `label`/`confidence` are the most probable class; `alternatives` hold the
/// next K-1 classes in descending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    pub alternatives: Vec<ScoredLabel>,
}

impl Prediction {
    /// Primary entry followed by the alternatives.
    pub fn ranked(&self) -> impl Iterator<Item = (&str, f32)> {
        std::iter::once((self.label.as_str(), self.confidence)).chain(
            self.alternatives
                .iter()
                .map(|alt| (alt.label.as_str(), alt.confidence)),
        )
    }
}

/// Softmax over the class dimension of `(1, C)` or `(C,)` logits.
pub fn probabilities(logits: &Tensor) -> ModelResult<Vec<f32>> {
    let logits = match logits.rank() {
        1 => logits.clone(),
        2 if logits.dim(0)? == 1 => logits.squeeze(0)?,
        _ => {
            return Err(ModelError::Inference {
                message: format!("expected logits of shape (1, C), got {:?}", logits.dims()),
            })
        }
    };
    let probs = candle_nn::ops::softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    Ok(probs.to_vec1::<f32>()?)
}

/// Rank `probs` and keep the best `k` (at least one, at most the class count).
pub fn top_k(probs: &[f32], k: usize, registry: &ClassRegistry) -> ModelResult<Prediction> {
    if probs.is_empty() {
        return Err(ModelError::Inference {
            message: "model produced no class scores".to_string(),
        });
    }
    let k = k.clamp(1, probs.len());

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut ranked = order.into_iter().take(k).map(|i| ScoredLabel {
        label: registry.label_for(i),
        confidence: probs[i],
    });
    let primary = ranked.next().ok_or_else(|| ModelError::Inference {
        message: "ranking produced no entries".to_string(),
    })?;

    Ok(Prediction {
        label: primary.label,
        confidence: primary.confidence,
        alternatives: ranked.collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::ClassSource;
    use candle_core::Device;

    fn registry(names: &[&str]) -> ClassRegistry {
        ClassRegistry::new(
            names.iter().map(|s| s.to_string()).collect(),
            ClassSource::Metadata,
        )
        .unwrap()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let logits = Tensor::new(&[[1.0f32, 2.0, 3.0, -1.0]], &Device::Cpu).unwrap();
        let probs = probabilities(&logits).unwrap();
        assert_eq!(probs.len(), 4);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probs[2] > probs[1] && probs[1] > probs[0] && probs[0] > probs[3]);
    }

    #[test]
    fn test_batched_logits_rejected() {
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            probabilities(&logits),
            Err(ModelError::Inference { .. })
        ));
    }

    #[test]
    fn test_top_k_order_and_split() {
        let reg = registry(&["Gir", "Sahiwal", "Ongole", "Kankrej"]);
        let p = top_k(&[0.1, 0.6, 0.05, 0.25], 3, &reg).unwrap();
        assert_eq!(p.label, "Sahiwal");
        assert_eq!(p.confidence, 0.6);
        let alts: Vec<_> = p.alternatives.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(alts, vec!["Kankrej", "Gir"]);
        assert_eq!(p.ranked().count(), 3);
    }

    #[test]
    fn test_k_is_bounded_by_class_count() {
        let reg = registry(&["a", "b"]);
        let p = top_k(&[0.3, 0.7], 10, &reg).unwrap();
        assert_eq!(p.alternatives.len(), 1);

        let p = top_k(&[0.3, 0.7], 0, &reg).unwrap();
        assert_eq!(p.label, "b");
        assert!(p.alternatives.is_empty());
    }

    #[test]
    fn test_index_beyond_registry_uses_decimal_label() {
        let reg = registry(&["a"]);
        let p = top_k(&[0.1, 0.2, 0.7], 2, &reg).unwrap();
        assert_eq!(p.label, "2");
        assert_eq!(p.alternatives[0].label, "1");
    }

    #[test]
    fn test_empty_scores_error() {
        let reg = registry(&["a"]);
        assert!(top_k(&[], 3, &reg).is_err());
    }
}
