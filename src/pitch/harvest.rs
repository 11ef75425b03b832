//! WORLD Harvest pitch estimation.
//!
//! Requires the `world` feature; without it the estimator still exists so
//! method selection stays uniform, but every call fails with a
//! configuration error naming the feature.

use anyhow::Result;

use super::{fit_length, median_filter, PitchEstimator, PitchMethod};
#[cfg(feature = "world")]
use super::{F0_MAX, F0_MIN};
#[cfg(feature = "world")]
use crate::audio::ANALYSIS_SAMPLE_RATE;
#[cfg(not(feature = "world"))]
use crate::error::VcError;

/// Frame period in milliseconds.
pub const FRAME_PERIOD_MS: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct HarvestEstimator {
    /// Radius above 2 enables a 3-tap median filter on the track
    filter_radius: usize,
}

impl HarvestEstimator {
    pub fn new(filter_radius: usize) -> Self {
        Self { filter_radius }
    }

    fn smooth(&self, f0: Vec<f32>) -> Vec<f32> {
        if self.filter_radius > 2 {
            median_filter(&f0, 3)
        } else {
            f0
        }
    }

    #[cfg(feature = "world")]
    fn track(&self, audio_16k: &[f32]) -> Result<Vec<f32>> {
        let x: Vec<f64> = audio_16k.iter().map(|&s| s as f64).collect();
        let fs = ANALYSIS_SAMPLE_RATE as i32;

        let mut option = rsworld_sys::HarvestOption::new();
        option.f0_floor = F0_MIN as f64;
        option.f0_ceil = F0_MAX as f64;
        option.frame_period = FRAME_PERIOD_MS;

        let (temporal_positions, f0) = rsworld::harvest(&x, fs, &option);
        // StoneMask refines the coarse harvest track
        let refined = rsworld::stonemask(&x, fs, &temporal_positions, &f0);
        Ok(refined.into_iter().map(|f| f as f32).collect())
    }

    #[cfg(not(feature = "world"))]
    fn track(&self, _audio_16k: &[f32]) -> Result<Vec<f32>> {
        Err(VcError::config("pitch method 'harvest' needs the crate built with the `world` feature").into())
    }
}

impl PitchEstimator for HarvestEstimator {
    fn method(&self) -> PitchMethod {
        PitchMethod::Harvest
    }

    fn estimate(&self, audio_16k: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        let f0 = self.track(audio_16k)?;
        tracing::trace!(frames = f0.len(), n_frames, "harvest track");
        Ok(fit_length(self.smooth(f0), n_frames))
    }
}
