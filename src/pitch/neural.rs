//! Network-backed estimators: RMVPE and CREPE.

use anyhow::Result;
use std::sync::Arc;

use super::{fit_length, mean_filter, median_filter, PitchEstimator, PitchMethod, F0_MAX, F0_MIN};
use crate::audio::FRAME_HOP;
use crate::models::crepe::Crepe;
use crate::models::rmvpe::{Rmvpe, VOICING_THRESHOLD};

/// CREPE frames below this periodicity are unvoiced.
pub const PERIODICITY_THRESHOLD: f32 = 0.1;

pub struct RmvpeEstimator {
    model: Arc<Rmvpe>,
    threshold: f32,
}

impl RmvpeEstimator {
    pub fn new(model: Arc<Rmvpe>) -> Self {
        Self {
            model,
            threshold: VOICING_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

impl PitchEstimator for RmvpeEstimator {
    fn method(&self) -> PitchMethod {
        PitchMethod::Rmvpe
    }

    #[tracing::instrument(skip_all, name = "rmvpe")]
    fn estimate(&self, audio_16k: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        let f0 = self.model.infer_f0(audio_16k, self.threshold)?;
        Ok(fit_length(f0, n_frames))
    }
}

pub struct CrepeEstimator {
    model: Arc<Crepe>,
}

impl CrepeEstimator {
    pub fn new(model: Arc<Crepe>) -> Self {
        Self { model }
    }
}

/// Median-filter periodicity, mean-filter F0 and gate on periodicity.
pub fn postprocess_crepe(f0: &[f32], periodicity: &[f32]) -> Vec<f32> {
    let periodicity = median_filter(periodicity, 3);
    mean_filter(f0, 3)
        .into_iter()
        .zip(periodicity)
        .map(|(f, p)| if p < PERIODICITY_THRESHOLD { 0.0 } else { f })
        .collect()
}

impl PitchEstimator for CrepeEstimator {
    fn method(&self) -> PitchMethod {
        PitchMethod::Crepe
    }

    #[tracing::instrument(skip_all, name = "crepe")]
    fn estimate(&self, audio_16k: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        let out = self.model.predict(audio_16k, FRAME_HOP, F0_MIN, F0_MAX)?;
        let f0 = postprocess_crepe(&out.f0, &out.periodicity);
        Ok(fit_length(f0, n_frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MelConfig;
    use crate::models::rmvpe::RmvpeModel;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_crepe_gating() {
        let f0 = [200.0; 5];
        let periodicity = [0.9, 0.05, 0.9, 0.02, 0.01];
        let out = postprocess_crepe(&f0, &periodicity);
        // One dip is smoothed away by the median, the tail is not
        assert_eq!(out[1], 200.0);
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn test_rmvpe_estimator_frame_count() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = crate::models::rmvpe::tests::tiny();
        let mel = MelConfig {
            n_mels: config.n_mels,
            ..MelConfig::rmvpe()
        };
        let model = RmvpeModel::new(config, vb).unwrap();
        let est = RmvpeEstimator::new(Arc::new(Rmvpe::new(model, mel, device)));
        let f0 = est.estimate(&vec![0.01; 3200], 20).unwrap();
        assert_eq!(f0.len(), 20);
        assert!(f0.iter().all(|f| *f == 0.0 || *f >= 10.0));
    }
}
