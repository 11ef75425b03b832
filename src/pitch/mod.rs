//! Pitch (F0) estimation and conditioning
//!
//! Four estimators share the [`PitchEstimator`] contract: 16 kHz samples
//! in, one F0 value per 10 ms frame out, with `0.0` marking unvoiced
//! frames. [`PitchContour`] applies the semitone shift and derives the
//! coarse bins the synthesis network is conditioned on.

pub mod harvest;
pub mod neural;
pub mod pm;

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::VcError;

pub use harvest::HarvestEstimator;
pub use neural::{CrepeEstimator, RmvpeEstimator};
pub use pm::PmEstimator;

/// Lowest F0 any estimator reports, in Hz.
pub const F0_MIN: f32 = 50.0;
/// Highest F0 any estimator reports, in Hz.
pub const F0_MAX: f32 = 1100.0;
/// Highest coarse bin; bin 1 doubles as "unvoiced".
pub const COARSE_MAX: u32 = 255;

/// Supported shift range in semitones.
pub const MAX_SHIFT: i32 = 12;

/// Pitch extraction algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PitchMethod {
    /// Autocorrelation; fast, lower quality
    Pm,
    /// WORLD Harvest; better bass, very slow
    Harvest,
    /// CREPE network; good quality, heavy
    Crepe,
    /// RMVPE network; best quality, light
    #[default]
    Rmvpe,
}

impl PitchMethod {
    pub const ALL: [PitchMethod; 4] = [Self::Pm, Self::Harvest, Self::Crepe, Self::Rmvpe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::Harvest => "harvest",
            Self::Crepe => "crepe",
            Self::Rmvpe => "rmvpe",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Pm => "faster extraction but lower-quality speech",
            Self::Harvest => "better bass but extremely slow",
            Self::Crepe => "better quality but GPU intensive",
            Self::Rmvpe => "best quality and little GPU requirement",
        }
    }

    /// Whether the estimator runs a network on the compute device.
    pub fn is_neural(&self) -> bool {
        matches!(self, Self::Crepe | Self::Rmvpe)
    }
}

impl std::fmt::Display for PitchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PitchMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| {
                VcError::config(format!(
                    "unknown pitch method '{s}' (expected one of pm, harvest, crepe, rmvpe)"
                ))
                .into()
            })
    }
}

/// Per-frame F0 from 16 kHz audio.
pub trait PitchEstimator: Send + Sync {
    fn method(&self) -> PitchMethod;

    /// Exactly `n_frames` values at a 10 ms stride, `0.0` where unvoiced.
    fn estimate(&self, audio_16k: &[f32], n_frames: usize) -> Result<Vec<f32>>;
}

/// Shifted F0 and its coarse quantisation, one entry per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PitchContour {
    pub f0: Vec<f32>,
    pub coarse: Vec<u32>,
}

impl PitchContour {
    pub fn new(f0: Vec<f32>) -> Self {
        let coarse = coarse_f0(&f0);
        Self { f0, coarse }
    }

    /// Apply a semitone shift to a raw estimate and quantise.
    pub fn from_estimate(mut f0: Vec<f32>, semitones: i32) -> Self {
        shift_f0(&mut f0, semitones);
        Self::new(f0)
    }

    pub fn len(&self) -> usize {
        self.f0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f0.is_empty()
    }

    pub fn voiced_frames(&self) -> usize {
        self.f0.iter().filter(|&&f| f > 0.0).count()
    }

    pub fn is_voiced(&self, frame: usize) -> bool {
        self.f0.get(frame).is_some_and(|&f| f > 0.0)
    }

    /// `(coarse [1, n] u32, f0 [1, n] f32)`
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let n = self.len();
        let coarse = Tensor::from_slice(&self.coarse, (1, n), device)?;
        let f0 = Tensor::from_slice(&self.f0, (1, n), device)?;
        Ok((coarse, f0))
    }
}

/// `2^(semitones / 12)`
pub fn shift_factor(semitones: i32) -> f32 {
    2f32.powf(semitones as f32 / 12.0)
}

/// Scale voiced frames by the shift factor; unvoiced frames stay at zero.
pub fn shift_f0(f0: &mut [f32], semitones: i32) {
    if semitones == 0 {
        return;
    }
    let factor = shift_factor(semitones);
    for f in f0.iter_mut().filter(|f| **f > 0.0) {
        *f *= factor;
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

/// Map F0 onto bins 1..=255 on the mel scale between [`F0_MIN`] and [`F0_MAX`].
pub fn coarse_f0(f0: &[f32]) -> Vec<u32> {
    let mel_min = hz_to_mel(F0_MIN);
    let mel_max = hz_to_mel(F0_MAX);
    let span = (COARSE_MAX - 1) as f32;
    f0.iter()
        .map(|&f| {
            let mel = hz_to_mel(f.max(0.0));
            let bin = if mel > 0.0 {
                (mel - mel_min) * span / (mel_max - mel_min) + 1.0
            } else {
                mel
            };
            bin.clamp(1.0, COARSE_MAX as f32).round() as u32
        })
        .collect()
}

/// Truncate or zero-extend at the end.
pub fn fit_length(mut f0: Vec<f32>, n_frames: usize) -> Vec<f32> {
    f0.resize(n_frames, 0.0);
    f0
}

/// Zero-pad evenly on both sides (the extra frame goes left), or truncate.
pub fn center_pad(f0: Vec<f32>, n_frames: usize) -> Vec<f32> {
    if f0.len() >= n_frames {
        return fit_length(f0, n_frames);
    }
    let left = (n_frames - f0.len() + 1) / 2;
    let mut out = vec![0.0; left];
    out.extend(f0);
    fit_length(out, n_frames)
}

/// Running median of odd `width`; windows shrink at the edges.
pub fn median_filter(x: &[f32], width: usize) -> Vec<f32> {
    let half = width / 2;
    let mut window = Vec::with_capacity(width);
    (0..x.len())
        .map(|i| {
            window.clear();
            window.extend_from_slice(&x[i.saturating_sub(half)..(i + half + 1).min(x.len())]);
            window.sort_by(f32::total_cmp);
            window[window.len() / 2]
        })
        .collect()
}

/// Running mean of odd `width`; windows shrink at the edges.
pub fn mean_filter(x: &[f32], width: usize) -> Vec<f32> {
    let half = width / 2;
    (0..x.len())
        .map(|i| {
            let w = &x[i.saturating_sub(half)..(i + half + 1).min(x.len())];
            w.iter().sum::<f32>() / w.len() as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_method_parse() {
        assert_eq!("RMVPE".parse::<PitchMethod>().unwrap(), PitchMethod::Rmvpe);
        assert_eq!(" pm ".parse::<PitchMethod>().unwrap(), PitchMethod::Pm);
        let err = "yin".parse::<PitchMethod>().unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_method_serde_names() {
        let json = serde_json::to_string(&PitchMethod::Harvest).unwrap();
        assert_eq!(json, "\"harvest\"");
        let m: PitchMethod = serde_json::from_str("\"crepe\"").unwrap();
        assert_eq!(m, PitchMethod::Crepe);
    }

    #[test]
    fn test_shift_leaves_unvoiced_at_zero() {
        for s in -MAX_SHIFT..=MAX_SHIFT {
            let reference = vec![0.0, 110.0, 0.0, 220.0, 431.5];
            let mut shifted = reference.clone();
            shift_f0(&mut shifted, s);
            let factor = 2f32.powf(s as f32 / 12.0);
            for (r, o) in reference.iter().zip(&shifted) {
                if *r == 0.0 {
                    assert_eq!(*o, 0.0);
                } else {
                    approx::assert_relative_eq!(*o, r * factor, max_relative = 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_octave_shift_doubles() {
        let mut f0 = vec![100.0, 0.0, 200.0];
        shift_f0(&mut f0, 12);
        approx::assert_relative_eq!(f0[0], 200.0, max_relative = 1e-6);
        assert_eq!(f0[1], 0.0);
        approx::assert_relative_eq!(f0[2], 400.0, max_relative = 1e-6);
    }

    #[test]
    fn test_coarse_bins() {
        let bins = coarse_f0(&[0.0, F0_MIN, F0_MAX, 20.0, 5000.0, 220.0]);
        assert_eq!(bins[0], 1);
        assert_eq!(bins[1], 1);
        assert_eq!(bins[2], 255);
        // Out of range clips to the nearest bin
        assert_eq!(bins[3], 1);
        assert_eq!(bins[4], 255);
        assert!(bins[5] > 1 && bins[5] < 255);
    }

    #[test]
    fn test_coarse_is_monotonic() {
        let f0: Vec<f32> = (50..1100).step_by(10).map(|f| f as f32).collect();
        let bins = coarse_f0(&f0);
        assert!(bins.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_center_pad() {
        assert_eq!(center_pad(vec![1.0, 2.0], 5), vec![0.0, 0.0, 1.0, 2.0, 0.0]);
        assert_eq!(center_pad(vec![1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(fit_length(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_filters() {
        let x = [1.0, 9.0, 2.0, 3.0, 4.0];
        assert_eq!(median_filter(&x, 3), vec![9.0, 2.0, 3.0, 3.0, 4.0]);
        let m = mean_filter(&[3.0, 0.0, 3.0], 3);
        assert_eq!(m, vec![1.5, 2.0, 1.5]);
    }

    #[test]
    fn test_contour_tensors() {
        let contour = PitchContour::from_estimate(vec![0.0, 100.0], 12);
        assert_eq!(contour.voiced_frames(), 1);
        assert!(!contour.is_voiced(0));
        let (coarse, f0) = contour.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(coarse.dims(), &[1, 2]);
        assert_eq!(f0.to_vec2::<f32>().unwrap()[0][0], 0.0);
    }
}
