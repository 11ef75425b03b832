//! Weight loading shared by every network in the crate.
//!
//! Checkpoints arrive either as safetensors or as PyTorch pickles. Both are
//! read into a flat `name -> Tensor` map, weight-normalised parameters are
//! folded into plain `weight` tensors, and the map is handed to a
//! [`VarBuilder`] so that layers can be built with the usual candle-nn
//! constructors.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::Path;

use crate::error::VcError;

pub type WeightMap = HashMap<String, Tensor>;

/// Load every tensor in `path`.
///
/// `key` selects a nested state dict inside a pickle checkpoint
/// (`"weight"` for voice models, `"model"` for fairseq encoders) and is
/// ignored for safetensors.
pub fn load_weights(path: &Path, key: Option<&str>, device: &Device) -> Result<WeightMap> {
    if !path.exists() {
        return Err(VcError::missing("checkpoint", path.display().to_string()).into());
    }

    let weights = if is_safetensors(path) {
        candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read safetensors {}", path.display()))?
    } else {
        let tensors = candle_core::pickle::read_all_with_key(path, key)
            .with_context(|| format!("failed to read pickle checkpoint {}", path.display()))?;
        tensors
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(device)?)))
            .collect::<Result<WeightMap>>()?
    };

    tracing::debug!(
        path = %path.display(),
        tensors = weights.len(),
        "loaded checkpoint"
    );
    Ok(weights)
}

pub fn is_safetensors(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("safetensors"))
}

/// Filter weights by prefix, removing the prefix from keys.
pub fn filter_weights(weights: &WeightMap, prefix: &str) -> WeightMap {
    weights
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .map(|stripped| (stripped.to_string(), v.clone()))
        })
        .collect()
}

/// Replace every `weight_g`/`weight_v` pair with the equivalent `weight`.
///
/// `w = g * v / ||v||`, where the norm runs over every axis on which `g`
/// has size one. This covers both the default `dim=0` parametrisation and
/// the `dim=2` one used by positional convolutions. Returns the number of
/// folded parameters.
pub fn fold_weight_norm(weights: &mut WeightMap) -> Result<usize> {
    let prefixes: Vec<String> = weights
        .keys()
        .filter_map(|k| k.strip_suffix(".weight_v").map(str::to_string))
        .filter(|p| weights.contains_key(&format!("{p}.weight_g")))
        .collect();

    for prefix in &prefixes {
        let v_key = format!("{prefix}.weight_v");
        let g_key = format!("{prefix}.weight_g");
        let (Some(v), Some(g)) = (weights.remove(&v_key), weights.remove(&g_key)) else {
            continue;
        };
        let weight = fold_pair(&g, &v).with_context(|| format!("failed to fold {prefix}"))?;
        weights.insert(format!("{prefix}.weight"), weight);
    }

    Ok(prefixes.len())
}

fn fold_pair(g: &Tensor, v: &Tensor) -> Result<Tensor> {
    let v32 = v.to_dtype(DType::F32)?;
    let g32 = g.to_dtype(DType::F32)?;
    anyhow::ensure!(
        g32.rank() == v32.rank(),
        "weight_g rank {} does not match weight_v rank {}",
        g32.rank(),
        v32.rank()
    );

    let mut sq = v32.sqr()?;
    for axis in 0..v32.rank() {
        if g32.dim(axis)? == 1 && v32.dim(axis)? != 1 {
            sq = sq.sum_keepdim(axis)?;
        }
    }
    let norm = sq.sqrt()?;
    let weight = v32.broadcast_mul(&g32.broadcast_div(&norm)?)?;
    Ok(weight.to_dtype(v.dtype())?)
}

/// Wrap a weight map in a [`VarBuilder`] that casts to `dtype` on access.
pub fn var_builder(weights: WeightMap, dtype: DType, device: &Device) -> VarBuilder<'static> {
    VarBuilder::from_tensors(weights, dtype, device)
}

/// Load, fold and wrap in one call.
pub fn load_var_builder(
    path: &Path,
    key: Option<&str>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let mut weights = load_weights(path, key, device)?;
    fold_weight_norm(&mut weights)?;
    Ok(var_builder(weights, dtype, device))
}
