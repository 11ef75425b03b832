//! Content features for each chunk.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::path::Path;

use crate::models::config::ModelVersion;
use crate::models::hubert::HubertModel;

/// Pretrained speech encoder shared by every voice model.
pub trait ContentEncoder: Send + Sync {
    /// `[1, frames, dim]` at a 20 ms stride; `dim` is 256 for v1 and 768 for v2.
    fn encode(&self, audio_16k: &[f32], version: ModelVersion) -> Result<Tensor>;
}

pub struct HubertEncoder {
    model: HubertModel,
    device: Device,
    dtype: DType,
}

impl HubertEncoder {
    pub fn new(model: HubertModel, device: Device, dtype: DType) -> Self {
        Self {
            model,
            device,
            dtype,
        }
    }

    pub fn load(path: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let model = HubertModel::load(path, dtype, device)?;
        Ok(Self::new(model, device.clone(), dtype))
    }
}

impl ContentEncoder for HubertEncoder {
    #[tracing::instrument(skip_all, name = "hubert")]
    fn encode(&self, audio_16k: &[f32], version: ModelVersion) -> Result<Tensor> {
        let wav = Tensor::from_slice(audio_16k, (1, audio_16k.len()), &self.device)?
            .to_dtype(self.dtype)?;
        let feats = self.model.extract(&wav, version)?;
        Ok(feats.to_dtype(DType::F32)?)
    }
}

/// Repeat each 20 ms frame twice and fit to `n_frames` 10 ms frames.
///
/// A short tail is filled by repeating the last frame.
pub fn to_frame_grid(feats: &Tensor, n_frames: usize) -> Result<Tensor> {
    let (b, t, d) = feats.dims3()?;
    let doubled = feats
        .unsqueeze(2)?
        .broadcast_as((b, t, 2, d))?
        .contiguous()?
        .reshape((b, 2 * t, d))?;
    let have = 2 * t;
    if have >= n_frames {
        return Ok(doubled.narrow(1, 0, n_frames)?);
    }
    if have == 0 {
        anyhow::bail!("content encoder returned no frames");
    }
    let last = doubled
        .narrow(1, have - 1, 1)?
        .broadcast_as((b, n_frames - have, d))?
        .contiguous()?;
    Ok(Tensor::cat(&[&doubled, &last], 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hubert::tests::tiny_config;
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_frame_grid_doubles_and_fits() {
        let device = Device::Cpu;
        let feats = Tensor::new(&[[[1.0f32, 10.0], [2.0, 20.0], [3.0, 30.0]]], &device).unwrap();
        let grid = to_frame_grid(&feats, 5).unwrap();
        let rows = grid.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], vec![1.0, 10.0]);
        assert_eq!(rows[1], vec![1.0, 10.0]);
        assert_eq!(rows[4], vec![3.0, 30.0]);

        let grid = to_frame_grid(&feats, 8).unwrap();
        let rows = grid.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[7], vec![3.0, 30.0]);
    }

    #[test]
    fn test_hubert_encoder_feature_width() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let width = config.hidden_size;
        let model = HubertModel::new(config, vb).unwrap();
        let encoder = HubertEncoder::new(model, device, DType::F32);
        let feats = encoder.encode(&vec![0.1; 1600], ModelVersion::V2).unwrap();
        assert_eq!(feats.dims3().unwrap().0, 1);
        assert_eq!(feats.dim(2).unwrap(), width);
    }
}
