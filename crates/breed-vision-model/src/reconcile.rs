//! Copying checkpoint tensors into a freshly built network.
//!
//! The network is built against a [`VarMap`], so every live parameter is a
//! named [`Var`] that can be overwritten in place. Three policies exist:
//!
//! | Mode | Missing keys | Unexpected keys | Shape mismatch |
//! |------|--------------|-----------------|----------------|
//! | `Tolerant` | ignored | ignored | error, nothing applied |
//! | `ShapeFiltered` | ignored | ignored | skipped |
//! | `Complete` | error | ignored | error |

use std::collections::HashMap;

use candle_core::Var;
use candle_nn::VarMap;
use serde::Serialize;

use crate::checkpoint::StateDict;
use crate::error::{ModelError, ModelResult, ShapeMismatchEntry};

/// Which policy produced a [`LoadReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Tolerant,
    ShapeFiltered,
    Complete,
}

/// Outcome of a weight load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub mode: LoadMode,
    /// Tensors copied into the network.
    pub applied: usize,
    /// Live parameters the checkpoint had no tensor for.
    pub missing: Vec<String>,
    /// Checkpoint tensors with no live parameter.
    pub unexpected: Vec<String>,
    /// Shared names whose shapes disagree.
    pub mismatched: Vec<ShapeMismatchEntry>,
}

impl LoadReport {
    /// True when some live parameter kept its initial value.
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty() || !self.mismatched.is_empty()
    }
}

/// Names sorted into buckets, before anything is written.
struct KeyPlan {
    matched: Vec<String>,
    missing: Vec<String>,
    unexpected: Vec<String>,
    mismatched: Vec<ShapeMismatchEntry>,
}

fn plan(vars: &HashMap<String, Var>, weights: &StateDict) -> KeyPlan {
    let mut matched = Vec::new();
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();

    for (name, var) in vars {
        match weights.get(name) {
            None => missing.push(name.clone()),
            Some(tensor) if tensor.dims() != var.dims() => mismatched.push(ShapeMismatchEntry {
                name: name.clone(),
                expected: var.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            }),
            Some(_) => matched.push(name.clone()),
        }
    }
    let mut unexpected: Vec<String> = weights
        .keys()
        .filter(|name| !vars.contains_key(*name))
        .cloned()
        .collect();

    matched.sort();
    missing.sort();
    unexpected.sort();
    mismatched.sort_by(|a, b| a.name.cmp(&b.name));

    KeyPlan {
        matched,
        missing,
        unexpected,
        mismatched,
    }
}

fn apply(vars: &HashMap<String, Var>, weights: &StateDict, names: &[String]) -> ModelResult<usize> {
    let mut applied = 0;
    for name in names {
        if let (Some(var), Some(src)) = (vars.get(name), weights.get(name)) {
            let src = src.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&src)?;
            applied += 1;
        }
    }
    Ok(applied)
}

fn with_vars<T>(
    varmap: &VarMap,
    f: impl FnOnce(&HashMap<String, Var>) -> ModelResult<T>,
) -> ModelResult<T> {
    let vars = varmap.data().lock().map_err(|_| ModelError::Inference {
        message: "parameter store lock poisoned".to_string(),
    })?;
    f(&vars)
}

/// Apply every shared key; fail without writing anything on a shape mismatch.
pub fn load_tolerant(varmap: &VarMap, weights: &StateDict) -> ModelResult<LoadReport> {
    with_vars(varmap, |vars| {
        let plan = plan(vars, weights);
        if !plan.mismatched.is_empty() {
            return Err(ModelError::ShapeMismatch {
                mismatches: plan.mismatched,
            });
        }
        let applied = apply(vars, weights, &plan.matched)?;
        Ok(LoadReport {
            mode: LoadMode::Tolerant,
            applied,
            missing: plan.missing,
            unexpected: plan.unexpected,
            mismatched: Vec::new(),
        })
    })
}

/// Apply only shared keys with identical shapes. Everything else keeps its
/// initial value.
pub fn load_shape_filtered(varmap: &VarMap, weights: &StateDict) -> ModelResult<LoadReport> {
    with_vars(varmap, |vars| {
        let plan = plan(vars, weights);
        let applied = apply(vars, weights, &plan.matched)?;
        Ok(LoadReport {
            mode: LoadMode::ShapeFiltered,
            applied,
            missing: plan.missing,
            unexpected: plan.unexpected,
            mismatched: plan.mismatched,
        })
    })
}

/// Every live parameter must be present with the right shape.
pub fn load_complete(varmap: &VarMap, weights: &StateDict) -> ModelResult<LoadReport> {
    with_vars(varmap, |vars| {
        let plan = plan(vars, weights);
        if !plan.mismatched.is_empty() {
            return Err(ModelError::ShapeMismatch {
                mismatches: plan.mismatched,
            });
        }
        if !plan.missing.is_empty() {
            return Err(ModelError::config(format!(
                "pretrained weights are missing {} parameter(s): {}",
                plan.missing.len(),
                plan.missing.join(", ")
            )));
        }
        let applied = apply(vars, weights, &plan.matched)?;
        Ok(LoadReport {
            mode: LoadMode::Complete,
            applied,
            missing: Vec::new(),
            unexpected: plan.unexpected,
            mismatched: Vec::new(),
        })
    })
}

/// Tolerant load, falling back to the shape-filtered load on a mismatch.
///
/// Never fails on name or shape disagreement; the skipped parameters are
/// logged and listed in the report.
pub fn reconcile(varmap: &VarMap, weights: &StateDict) -> ModelResult<LoadReport> {
    let report = match load_tolerant(varmap, weights) {
        Ok(report) => report,
        Err(ModelError::ShapeMismatch { mismatches }) => {
            tracing::warn!(
                "Tolerant load failed on {} shape mismatch(es); retrying with shape filtering",
                mismatches.len()
            );
            load_shape_filtered(varmap, weights)?
        }
        Err(e) => return Err(e),
    };

    log_report(&report);
    Ok(report)
}

pub(crate) fn log_report(report: &LoadReport) {
    tracing::info!(
        "Weights loaded ({:?}): {} applied, {} missing, {} unexpected, {} mismatched",
        report.mode,
        report.applied,
        report.missing.len(),
        report.unexpected.len(),
        report.mismatched.len()
    );
    if !report.missing.is_empty() {
        tracing::warn!(
            "Parameters left at their initial values: {}",
            report.missing.join(", ")
        );
    }
    for m in &report.mismatched {
        tracing::warn!(
            "Skipped {}: checkpoint shape {:?}, network shape {:?}",
            m.name,
            m.actual,
            m.expected
        );
    }
    if !report.unexpected.is_empty() {
        tracing::debug!("Ignored checkpoint tensors: {}", report.unexpected.join(", "));
    }
}
