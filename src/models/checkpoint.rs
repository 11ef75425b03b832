//! Voice model checkpoints.
//!
//! A voice model is either a PyTorch zip pickle holding a dict with
//! `weight`, `config`, `f0` and `version` entries, or a safetensors file
//! whose header metadata carries the same three fields (`config` as a JSON
//! list). A missing `f0` means a pitch model and a missing `version` means
//! v1, unless the weights say otherwise; a disagreement is logged.

use anyhow::{Context, Result};
use candle_core::pickle::{Object, Stack};
use candle_core::Device;
use serde_json::Value;
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::config::{ModelVersion, SynthesizerConfig, SynthesizerVariant};
use super::weights::{fold_weight_norm, is_safetensors, load_weights, WeightMap};
use crate::error::VcError;

const DEFAULT_USES_PITCH: bool = true;
const DEFAULT_VERSION: ModelVersion = ModelVersion::V1;

/// Metadata stored next to the weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointMeta {
    pub config: Option<Vec<Value>>,
    pub uses_pitch: Option<bool>,
    pub version: Option<ModelVersion>,
    pub info: Option<String>,
}

/// A loaded voice model: weights plus the variant they belong to.
pub struct VoiceCheckpoint {
    pub path: PathBuf,
    pub config: SynthesizerConfig,
    pub variant: SynthesizerVariant,
    pub weights: WeightMap,
    pub info: Option<String>,
}

impl VoiceCheckpoint {
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(VcError::missing("voice model", path.display().to_string()).into());
        }

        let meta = if is_safetensors(path) {
            read_safetensors_meta(path)?
        } else {
            read_pickle_meta(path)?
        };
        let mut weights = load_weights(path, Some("weight"), device)?;
        let folded = fold_weight_norm(&mut weights)?;

        let checkpoint = Self::from_parts(path, meta, weights)?;
        tracing::info!(
            model = %path.display(),
            variant = %checkpoint.variant,
            sample_rate = checkpoint.config.sample_rate,
            speakers = checkpoint.n_speakers(),
            folded,
            "loaded voice model"
        );
        Ok(checkpoint)
    }

    /// Assemble from already-read metadata and weights.
    pub fn from_parts(path: &Path, meta: CheckpointMeta, weights: WeightMap) -> Result<Self> {
        let values = meta.config.ok_or_else(|| {
            VcError::config(format!("{} carries no model config", path.display()))
        })?;
        let mut config = SynthesizerConfig::from_values(&values)
            .with_context(|| format!("invalid config in {}", path.display()))?;

        // The embedding table is authoritative for the speaker count
        if let Some(emb) = weights.get("emb_g.weight") {
            config.spk_embed_dim = emb.dim(0)?;
        }

        let has_encoder = weights.keys().any(|k| k.starts_with("enc_p."));
        let uses_pitch = match meta.uses_pitch {
            Some(flag) => flag,
            None => {
                let inferred = has_encoder.then(|| weights.contains_key("enc_p.emb_pitch.weight"));
                missing_field(path, "f0", inferred, DEFAULT_USES_PITCH)
            }
        };
        let version = match meta.version {
            Some(v) => v,
            None => missing_field(path, "version", infer_version(&weights)?, DEFAULT_VERSION),
        };

        Ok(Self {
            path: path.to_path_buf(),
            config,
            variant: SynthesizerVariant::new(version, uses_pitch),
            weights,
            info: meta.info,
        })
    }

    pub fn n_speakers(&self) -> usize {
        self.config.spk_embed_dim
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

/// Default for a field the metadata lacks, unless the weights disagree.
fn missing_field<T: PartialEq + fmt::Debug>(path: &Path, field: &str, inferred: Option<T>, default: T) -> T {
    match inferred {
        Some(value) if value != default => {
            tracing::warn!(
                model = %path.display(),
                field,
                ?default,
                weights = ?value,
                "checkpoint metadata lacks a field and the weights contradict its default; following the weights"
            );
            value
        }
        Some(value) => value,
        None => default,
    }
}

/// Feature width from the phone projection, `[hidden, 256 | 768]`.
fn infer_version(weights: &WeightMap) -> Result<Option<ModelVersion>> {
    match weights.get("enc_p.emb_phone.weight") {
        Some(w) if w.dim(1)? == 768 => Ok(Some(ModelVersion::V2)),
        Some(w) if w.dim(1)? == 256 => Ok(Some(ModelVersion::V1)),
        Some(w) => Err(VcError::config(format!(
            "phone projection expects {} features, which matches no model version",
            w.dim(1)?
        ))
        .into()),
        None => Ok(None),
    }
}

fn read_safetensors_meta(path: &Path) -> Result<CheckpointMeta> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (_, header) = safetensors::SafeTensors::read_metadata(&bytes)
        .map_err(|e| anyhow::anyhow!("invalid safetensors header in {}: {e}", path.display()))?;
    let Some(map) = header.metadata() else {
        return Ok(CheckpointMeta::default());
    };

    let config = map
        .get("config")
        .map(|s| serde_json::from_str::<Vec<Value>>(s))
        .transpose()
        .context("config metadata is not a JSON list")?;
    let uses_pitch = map.get("f0").map(|s| parse_flag(s)).transpose()?;
    let version = map.get("version").map(|s| ModelVersion::parse(s)).transpose()?;

    Ok(CheckpointMeta {
        config,
        uses_pitch,
        version,
        info: map.get("info").cloned(),
    })
}

fn parse_flag(s: &str) -> Result<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(VcError::config(format!("unreadable f0 flag '{other}'")).into()),
    }
}

fn read_pickle_meta(path: &Path) -> Result<CheckpointMeta> {
    let file = std::fs::File::open(path)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("{} is not a zip checkpoint", path.display()))?;
    let pkl_name = zip
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .with_context(|| format!("no data.pkl in {}", path.display()))?;

    let entry = zip.by_name(&pkl_name)?;
    let mut reader = BufReader::new(entry);
    let mut stack = Stack::empty();
    stack.read_loop(&mut reader)?;
    let root = stack.finalize()?;

    let Object::Dict(entries) = root else {
        return Err(VcError::config(format!(
            "{} does not hold a checkpoint dict",
            path.display()
        ))
        .into());
    };

    let mut meta = CheckpointMeta::default();
    for (key, value) in entries {
        let Object::Unicode(key) = key else { continue };
        match key.as_str() {
            "config" => {
                meta.config = match pickle_to_json(value) {
                    Some(Value::Array(values)) => Some(values),
                    _ => return Err(VcError::config("checkpoint config is not a list").into()),
                }
            }
            "f0" => {
                meta.uses_pitch = match value {
                    Object::Int(v) => Some(v != 0),
                    Object::Bool(b) => Some(b),
                    _ => None,
                }
            }
            "version" => {
                if let Object::Unicode(v) = value {
                    meta.version = Some(ModelVersion::parse(&v)?);
                }
            }
            "info" => {
                if let Object::Unicode(v) = value {
                    meta.info = Some(v);
                }
            }
            _ => {}
        }
    }
    Ok(meta)
}

/// Plain pickle values to JSON. Tensors and class instances yield `None`.
fn pickle_to_json(obj: Object) -> Option<Value> {
    match obj {
        Object::Int(i) => Some(Value::from(i)),
        Object::Float(f) => serde_json::Number::from_f64(f).map(Value::Number),
        Object::Bool(b) => Some(Value::Bool(b)),
        Object::Unicode(s) => Some(Value::String(s)),
        Object::None => Some(Value::Null),
        Object::List(items) | Object::Tuple(items) => items
            .into_iter()
            .map(pickle_to_json)
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        _ => None,
    }
}
