//! Conversion parameters, requests and the `settings.json` batch file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::resolve::{discover_audio, discover_models, expand_selection, MODEL_EXTENSIONS};
use crate::audio::ANALYSIS_SAMPLE_RATE;
use crate::error::VcError;
use crate::pitch::{PitchMethod, MAX_SHIFT};

/// Seed used when a request does not pick one.
pub const DEFAULT_SEED: u64 = 0x5eed_0f_a11;

/// Tunable knobs of one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionParams {
    /// Pitch shift in semitones
    pub f0_up_key: i32,
    pub f0_method: PitchMethod,
    /// Weight of retrieved features, 0 disables retrieval
    pub index_rate: f32,
    /// Median smoothing switch for harvest
    pub filter_radius: usize,
    /// Output rate; 0 keeps the model rate
    pub resample_sr: u32,
    /// 0 imposes the input loudness envelope, 1 keeps the synthesized one
    pub rms_mix_rate: f32,
    /// Retrieval kept on unvoiced frames; 0.5 turns protection off
    pub protect: f32,
    pub speaker_id: usize,
    /// Seed for latent and excitation noise
    pub seed: u64,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self {
            f0_up_key: 0,
            f0_method: PitchMethod::Rmvpe,
            index_rate: 1.0,
            filter_radius: 3,
            resample_sr: 0,
            rms_mix_rate: 0.0,
            protect: 0.33,
            speaker_id: 0,
            seed: DEFAULT_SEED,
        }
    }
}

impl ConversionParams {
    pub fn validate(&self) -> Result<()> {
        if self.f0_up_key.abs() > MAX_SHIFT {
            return Err(VcError::config(format!(
                "pitch shift {} outside [-{MAX_SHIFT}, {MAX_SHIFT}]",
                self.f0_up_key
            ))
            .into());
        }
        check_unit("index rate", self.index_rate, 1.0)?;
        check_unit("protect", self.protect, 0.5)?;
        check_unit("rms mix rate", self.rms_mix_rate, 1.0)?;
        if self.resample_sr > 0 && self.resample_sr < ANALYSIS_SAMPLE_RATE {
            return Err(VcError::config(format!(
                "resample rate {} Hz below {ANALYSIS_SAMPLE_RATE} Hz (use 0 to keep the model rate)",
                self.resample_sr
            ))
            .into());
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32, max: f32) -> Result<()> {
    if !(0.0..=max).contains(&value) {
        return Err(VcError::config(format!("{name} {value} outside [0, {max}]")).into());
    }
    Ok(())
}

/// Which retrieval index a request uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IndexSelection {
    /// Find it next to the model by naming convention
    #[default]
    Resolve,
    Path(PathBuf),
    /// Run without retrieval
    Disabled,
}

/// One input file converted with one model.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConversionRequest {
    pub audio: PathBuf,
    pub model: PathBuf,
    pub index: IndexSelection,
    pub output: PathBuf,
    pub params: ConversionParams,
}

impl VoiceConversionRequest {
    pub fn new(audio: impl Into<PathBuf>, model: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            audio: audio.into(),
            model: model.into(),
            index: IndexSelection::default(),
            output: output.into(),
            params: ConversionParams::default(),
        }
    }

    pub fn with_index(mut self, index: IndexSelection) -> Self {
        self.index = index;
        self
    }

    pub fn with_params(mut self, params: ConversionParams) -> Self {
        self.params = params;
        self
    }
}

/// `<audio stem>_<model stem>.wav`
pub fn output_name(audio: &Path, model: &Path) -> String {
    let stem = |p: &Path| {
        p.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or("out")
            .to_string()
    };
    format!("{}_{}.wav", stem(audio), stem(model))
}

/// Batch description read from `settings.json`.
///
/// Every field is optional; a present field must be valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch_adjustment: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch_extraction_method: Option<String>,
    /// `all`, a name, or `;`-separated names under the models directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// `all`, a name, or `;`-separated names under the input directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
}

impl Settings {
    pub fn from_json(s: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(s)
            .map_err(|e| VcError::config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read `path`; a missing file is the empty settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(key) = self.pitch_adjustment {
            if key.abs() > MAX_SHIFT {
                return Err(VcError::config(format!("invalid pitch adjustment {key} in settings")).into());
            }
        }
        self.pitch_method()?;
        if let Some(device) = &self.device {
            super::context::DeviceSpec::parse(device)?;
        }
        Ok(())
    }

    pub fn pitch_method(&self) -> Result<Option<PitchMethod>> {
        self.pitch_extraction_method
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Models named by `model`, expanded under `models_dir`.
    pub fn models(&self, models_dir: &Path) -> Result<Vec<PathBuf>> {
        match &self.model {
            Some(sel) => expand_selection(sel, models_dir, discover_models, &MODEL_EXTENSIONS),
            None => Ok(Vec::new()),
        }
    }

    /// Audio files named by `audio_file`, expanded under `input_dir`.
    pub fn audio_files(&self, input_dir: &Path) -> Result<Vec<PathBuf>> {
        match &self.audio_file {
            Some(sel) => expand_selection(sel, input_dir, discover_audio, &["wav"]),
            None => Ok(Vec::new()),
        }
    }

    /// Fill `params` from the fields that are set.
    pub fn apply_to(&self, params: &mut ConversionParams) -> Result<()> {
        if let Some(key) = self.pitch_adjustment {
            params.f0_up_key = key;
        }
        if let Some(method) = self.pitch_method()? {
            params.f0_method = method;
        }
        Ok(())
    }
}
