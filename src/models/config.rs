//! Voice model configuration
//!
//! A voice checkpoint stores its hyper-parameters as a positional list
//! (the constructor arguments of the synthesis network). Both checkpoint
//! formats carry that list, so it is parsed once from JSON values here.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VcError;

/// Generation of the content features a voice model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVersion {
    /// 256-dim features from the projected 9th encoder layer
    #[default]
    V1,
    /// 768-dim features from the 12th encoder layer
    V2,
}

impl ModelVersion {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(VcError::config(format!(
                "unknown model version '{other}' (expected v1 or v2)"
            ))
            .into()),
        }
    }

    /// Width of the content features this version consumes.
    pub fn feature_dim(&self) -> usize {
        match self {
            Self::V1 => 256,
            Self::V2 => 768,
        }
    }

    /// Encoder layer whose output is used.
    pub fn output_layer(&self) -> usize {
        match self {
            Self::V1 => 9,
            Self::V2 => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four synthesis network shapes.
///
/// Picked once when a checkpoint is loaded and dispatched on for every
/// chunk afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynthesizerVariant {
    V1Pitch,
    V1NoPitch,
    V2Pitch,
    V2NoPitch,
}

impl SynthesizerVariant {
    pub fn new(version: ModelVersion, uses_pitch: bool) -> Self {
        match (version, uses_pitch) {
            (ModelVersion::V1, true) => Self::V1Pitch,
            (ModelVersion::V1, false) => Self::V1NoPitch,
            (ModelVersion::V2, true) => Self::V2Pitch,
            (ModelVersion::V2, false) => Self::V2NoPitch,
        }
    }

    pub fn version(&self) -> ModelVersion {
        match self {
            Self::V1Pitch | Self::V1NoPitch => ModelVersion::V1,
            Self::V2Pitch | Self::V2NoPitch => ModelVersion::V2,
        }
    }

    pub fn uses_pitch(&self) -> bool {
        matches!(self, Self::V1Pitch | Self::V2Pitch)
    }

    pub fn feature_dim(&self) -> usize {
        self.version().feature_dim()
    }
}

impl std::fmt::Display for SynthesizerVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pitch = if self.uses_pitch() { "f0" } else { "nof0" };
        write!(f, "{}-{}", self.version(), pitch)
    }
}

/// Residual block flavour of the waveform generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResBlockKind {
    /// Two convolutions per dilation
    One,
    /// One convolution per dilation
    Two,
}

/// Hyper-parameters of the synthesis network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    pub spec_channels: usize,
    pub segment_size: usize,
    pub inter_channels: usize,
    pub hidden_channels: usize,
    pub filter_channels: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub kernel_size: usize,
    pub p_dropout: f64,
    pub resblock: ResBlockKind,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub upsample_rates: Vec<usize>,
    pub upsample_initial_channel: usize,
    pub upsample_kernel_sizes: Vec<usize>,
    /// Rows of the speaker embedding table
    pub spk_embed_dim: usize,
    pub gin_channels: usize,
    /// Output sample rate in Hz
    pub sample_rate: u32,
}

const CONFIG_LEN: usize = 18;

impl SynthesizerConfig {
    /// Parse the positional constructor list stored in a checkpoint.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        if values.len() != CONFIG_LEN {
            return Err(VcError::config(format!(
                "voice model config has {} entries, expected {CONFIG_LEN}",
                values.len()
            ))
            .into());
        }

        let resblock = match &values[9] {
            Value::String(s) if s == "1" => ResBlockKind::One,
            Value::String(s) if s == "2" => ResBlockKind::Two,
            Value::Number(n) if n.as_u64() == Some(1) => ResBlockKind::One,
            Value::Number(n) if n.as_u64() == Some(2) => ResBlockKind::Two,
            other => bail!(VcError::config(format!("unknown resblock type {other}"))),
        };

        let config = Self {
            spec_channels: as_usize(&values[0], "spec_channels")?,
            segment_size: as_usize(&values[1], "segment_size")?,
            inter_channels: as_usize(&values[2], "inter_channels")?,
            hidden_channels: as_usize(&values[3], "hidden_channels")?,
            filter_channels: as_usize(&values[4], "filter_channels")?,
            n_heads: as_usize(&values[5], "n_heads")?,
            n_layers: as_usize(&values[6], "n_layers")?,
            kernel_size: as_usize(&values[7], "kernel_size")?,
            p_dropout: values[8].as_f64().unwrap_or(0.0),
            resblock,
            resblock_kernel_sizes: as_usize_list(&values[10], "resblock_kernel_sizes")?,
            resblock_dilation_sizes: values[11]
                .as_array()
                .context("resblock_dilation_sizes is not a list")?
                .iter()
                .map(|v| as_usize_list(v, "resblock_dilation_sizes"))
                .collect::<Result<_>>()?,
            upsample_rates: as_usize_list(&values[12], "upsample_rates")?,
            upsample_initial_channel: as_usize(&values[13], "upsample_initial_channel")?,
            upsample_kernel_sizes: as_usize_list(&values[14], "upsample_kernel_sizes")?,
            spk_embed_dim: as_usize(&values[15], "spk_embed_dim")?,
            gin_channels: as_usize(&values[16], "gin_channels")?,
            sample_rate: parse_sample_rate(&values[17])?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON array string such as the one stored in safetensors metadata.
    pub fn from_json(s: &str) -> Result<Self> {
        let values: Vec<Value> =
            serde_json::from_str(s).context("voice model config is not a JSON list")?;
        Self::from_values(&values)
    }

    pub fn to_values(&self) -> Vec<Value> {
        use serde_json::json;
        vec![
            json!(self.spec_channels),
            json!(self.segment_size),
            json!(self.inter_channels),
            json!(self.hidden_channels),
            json!(self.filter_channels),
            json!(self.n_heads),
            json!(self.n_layers),
            json!(self.kernel_size),
            json!(self.p_dropout),
            json!(match self.resblock {
                ResBlockKind::One => "1",
                ResBlockKind::Two => "2",
            }),
            json!(self.resblock_kernel_sizes),
            json!(self.resblock_dilation_sizes),
            json!(self.upsample_rates),
            json!(self.upsample_initial_channel),
            json!(self.upsample_kernel_sizes),
            json!(self.spk_embed_dim),
            json!(self.gin_channels),
            json!(self.sample_rate),
        ]
    }

    /// Output samples per 10 ms feature frame.
    pub fn hop_length(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    fn validate(&self) -> Result<()> {
        let bad = |msg: String| -> Result<()> { Err(VcError::config(msg).into()) };
        if self.upsample_rates.is_empty()
            || self.upsample_rates.len() != self.upsample_kernel_sizes.len()
        {
            return bad(format!(
                "upsample rates {:?} and kernel sizes {:?} do not pair up",
                self.upsample_rates, self.upsample_kernel_sizes
            ));
        }
        if self.resblock_kernel_sizes.len() != self.resblock_dilation_sizes.len() {
            return bad("resblock kernel and dilation lists differ in length".into());
        }
        if self.n_heads == 0 || self.hidden_channels % self.n_heads != 0 {
            return bad(format!(
                "hidden size {} is not divisible by {} heads",
                self.hidden_channels, self.n_heads
            ));
        }
        let hop = self.hop_length() as u64;
        if hop * 100 != self.sample_rate as u64 {
            return bad(format!(
                "upsampling factor {hop} does not give 10 ms frames at {} Hz",
                self.sample_rate
            ));
        }
        Ok(())
    }
}

impl Default for SynthesizerConfig {
    /// The 40 kHz layout.
    fn default() -> Self {
        Self {
            spec_channels: 1025,
            segment_size: 32,
            inter_channels: 192,
            hidden_channels: 192,
            filter_channels: 768,
            n_heads: 2,
            n_layers: 6,
            kernel_size: 3,
            p_dropout: 0.0,
            resblock: ResBlockKind::One,
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5]; 3],
            upsample_rates: vec![10, 10, 2, 2],
            upsample_initial_channel: 512,
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            spk_embed_dim: 109,
            gin_channels: 256,
            sample_rate: 40000,
        }
    }
}

fn as_usize(v: &Value, name: &str) -> Result<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| VcError::config(format!("config entry {name} is not an integer: {v}")).into())
}

fn as_usize_list(v: &Value, name: &str) -> Result<Vec<usize>> {
    v.as_array()
        .ok_or_else(|| anyhow::Error::from(VcError::config(format!("config entry {name} is not a list"))))?
        .iter()
        .map(|x| as_usize(x, name))
        .collect()
}

/// Accepts `40000` as well as the `"40k"` shorthand.
pub fn parse_sample_rate(v: &Value) -> Result<u32> {
    if let Some(n) = v.as_u64() {
        return Ok(n as u32);
    }
    if let Some(s) = v.as_str() {
        let s = s.trim().to_lowercase();
        let parsed = match s.strip_suffix('k') {
            Some(k) => k.parse::<u32>().ok().map(|k| k * 1000),
            None => s.parse::<u32>().ok(),
        };
        if let Some(sr) = parsed {
            return Ok(sr);
        }
    }
    Err(VcError::config(format!("unreadable sample rate {v}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v2_48k() -> Vec<Value> {
        vec![
            json!(1025),
            json!(32),
            json!(192),
            json!(192),
            json!(768),
            json!(2),
            json!(6),
            json!(3),
            json!(0),
            json!("1"),
            json!([3, 7, 11]),
            json!([[1, 3, 5], [1, 3, 5], [1, 3, 5]]),
            json!([12, 10, 2, 2]),
            json!(512),
            json!([24, 20, 4, 4]),
            json!(109),
            json!(256),
            json!(48000),
        ]
    }

    #[test]
    fn test_parse_positional_config() {
        let config = SynthesizerConfig::from_values(&v2_48k()).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.hop_length(), 480);
        assert_eq!(config.resblock, ResBlockKind::One);
        assert_eq!(config.resblock_dilation_sizes[2], vec![1, 3, 5]);
    }

    #[test]
    fn test_values_roundtrip_through_json() {
        let config = SynthesizerConfig::default();
        let text = serde_json::to_string(&config.to_values()).unwrap();
        assert_eq!(SynthesizerConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_wrong_length_is_config_error() {
        let mut values = v2_48k();
        values.pop();
        let err = SynthesizerConfig::from_values(&values).unwrap_err();
        assert_eq!(
            VcError::classify(&err),
            Some(crate::error::ErrorKind::Configuration)
        );
    }

    #[test]
    fn test_hop_must_match_rate() {
        let mut values = v2_48k();
        values[17] = json!(40000);
        assert!(SynthesizerConfig::from_values(&values).is_err());
    }

    #[test]
    fn test_sample_rate_shorthand() {
        assert_eq!(parse_sample_rate(&json!("32k")).unwrap(), 32000);
        assert_eq!(parse_sample_rate(&json!(40000)).unwrap(), 40000);
        assert!(parse_sample_rate(&json!("fast")).is_err());
    }

    #[test]
    fn test_variant_table() {
        let v = SynthesizerVariant::new(ModelVersion::V2, false);
        assert_eq!(v, SynthesizerVariant::V2NoPitch);
        assert_eq!(v.feature_dim(), 768);
        assert!(!v.uses_pitch());
        assert_eq!(v.to_string(), "v2-nof0");
        assert!(ModelVersion::parse("v3").is_err());
    }
}
