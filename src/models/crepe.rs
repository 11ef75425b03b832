//! CREPE pitch network
//!
//! Six conv blocks over 1024-sample frames followed by a sigmoid classifier
//! over 360 pitch bins. The full-capacity layout is used; parameter names
//! follow the `conv{i}`, `conv{i}_BN`, `classifier` scheme.
//!
//! Decoding runs Viterbi over the softmax-normalised activations with a
//! triangular transition band, and reports the activation at the chosen bin
//! as periodicity.

use anyhow::Result;
use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, linear, BatchNorm, BatchNormConfig, Conv1d, Conv1dConfig, Linear, VarBuilder,
};
use std::path::Path;

use super::rmvpe::{CENTS_OFFSET, CENTS_PER_BIN, PITCH_BINS};

/// Samples per analysis frame at 16 kHz.
pub const FRAME_SIZE: usize = 1024;
/// Frames per forward pass.
const BATCH_FRAMES: usize = 512;
/// Transition band half-width in bins.
const TRANSITION_WIDTH: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct CrepeConfig {
    pub channels: Vec<usize>,
    pub kernels: Vec<usize>,
    pub first_stride: usize,
    pub frame_size: usize,
    pub n_bins: usize,
}

impl Default for CrepeConfig {
    /// Full capacity
    fn default() -> Self {
        Self {
            channels: vec![1024, 128, 128, 128, 256, 512],
            kernels: vec![512, 64, 64, 64, 64, 64],
            first_stride: 4,
            frame_size: FRAME_SIZE,
            n_bins: PITCH_BINS,
        }
    }
}

impl CrepeConfig {
    /// Classifier input width.
    pub fn in_features(&self) -> usize {
        let mut len = self.frame_size / self.first_stride;
        len /= 1 << self.channels.len();
        len * self.channels.last().copied().unwrap_or(0)
    }
}

struct ConvLayer {
    conv: Conv1d,
    bn: BatchNorm,
    /// `(left, right)` zero padding
    padding: (usize, usize),
}

impl ConvLayer {
    fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        stride: usize,
        padding: (usize, usize),
        vb: &VarBuilder,
        name: &str,
    ) -> Result<Self> {
        // Stored as a [out, in, k, 1] 2-D kernel
        let weight = vb
            .get((out_ch, in_ch, kernel, 1), &format!("{name}.weight"))?
            .squeeze(3)?;
        let bias = vb.get(out_ch, &format!("{name}.bias"))?;
        let config = Conv1dConfig {
            stride,
            ..Default::default()
        };
        let bn_config = BatchNormConfig {
            eps: 0.001,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv1d::new(weight, Some(bias), config),
            bn: batch_norm(out_ch, bn_config, vb.pp(format!("{name}_BN")))?,
            padding,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.pad_with_zeros(2, self.padding.0, self.padding.1)?;
        let x = self.conv.forward(&x)?.relu()?;
        let x = self.bn.forward_t(&x, false)?;
        // max pool (2, 1) on the time axis
        let x = x.unsqueeze(3)?.max_pool2d((2, 1))?.squeeze(3)?;
        Ok(x)
    }
}

/// CREPE network: normalised frames in, per-bin activations out.
pub struct CrepeModel {
    config: CrepeConfig,
    layers: Vec<ConvLayer>,
    classifier: Linear,
}

impl CrepeModel {
    pub fn new(config: CrepeConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.channels.len());
        let mut in_ch = 1;
        for (i, (&out_ch, &kernel)) in config.channels.iter().zip(&config.kernels).enumerate() {
            let (stride, padding) = if i == 0 {
                let half = (kernel - config.first_stride) / 2;
                (config.first_stride, (half, half))
            } else {
                (1, ((kernel - 1) / 2, kernel / 2))
            };
            layers.push(ConvLayer::new(
                in_ch,
                out_ch,
                kernel,
                stride,
                padding,
                &vb,
                &format!("conv{}", i + 1),
            )?);
            in_ch = out_ch;
        }
        let classifier = linear(config.in_features(), config.n_bins, vb.pp("classifier"))?;
        Ok(Self {
            config,
            layers,
            classifier,
        })
    }

    /// `[batch, frame_size]` -> `[batch, n_bins]`
    pub fn forward(&self, frames: &Tensor) -> Result<Tensor> {
        let batch = frames.dim(0)?;
        let mut x = frames.unsqueeze(1)?;
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        // [b, c, t] -> [b, t * c], time-major like the trained classifier
        let x = x.transpose(1, 2)?.contiguous()?.reshape((batch, ()))?;
        Ok(candle_nn::ops::sigmoid(&self.classifier.forward(&x)?)?)
    }
}

/// Pitch and periodicity tracks from CREPE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrepeOutput {
    pub f0: Vec<f32>,
    pub periodicity: Vec<f32>,
}

/// Waveform-level CREPE with framing, batching and Viterbi decoding.
pub struct Crepe {
    model: CrepeModel,
    device: Device,
}

impl Crepe {
    pub fn new(model: CrepeModel, device: Device) -> Self {
        Self { model, device }
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let vb = super::weights::load_var_builder(path, None, DType::F32, device)?;
        let model = CrepeModel::new(CrepeConfig::default(), vb)?;
        tracing::info!(path = %path.display(), "loaded CREPE pitch model");
        Ok(Self::new(model, device.clone()))
    }

    /// Per-frame activations, `[frames][n_bins]`, one frame per `hop` samples.
    pub fn activations(&self, samples: &[f32], hop: usize) -> Result<Vec<Vec<f32>>> {
        let frames = frame_and_normalize(samples, self.model.config.frame_size, hop);
        let frame_size = self.model.config.frame_size;
        let mut out = Vec::with_capacity(frames.len());
        for batch in frames.chunks(BATCH_FRAMES) {
            let flat: Vec<f32> = batch.iter().flatten().copied().collect();
            let input = Tensor::from_vec(flat, (batch.len(), frame_size), &self.device)?;
            let probs = self.model.forward(&input)?.to_dtype(DType::F32)?;
            out.extend(probs.to_vec2::<f32>()?);
        }
        Ok(out)
    }

    /// Viterbi-decoded F0 restricted to `[fmin, fmax]`, plus periodicity.
    pub fn predict(&self, samples: &[f32], hop: usize, fmin: f32, fmax: f32) -> Result<CrepeOutput> {
        let activations = self.activations(samples, hop)?;
        Ok(decode_viterbi(&activations, fmin, fmax))
    }
}

/// Zero-pad by half a frame on both sides, cut one frame every `hop`
/// samples and standardise each frame.
pub fn frame_and_normalize(samples: &[f32], frame_size: usize, hop: usize) -> Vec<Vec<f32>> {
    let half = frame_size / 2;
    let mut padded = vec![0.0f32; samples.len() + 2 * half];
    padded[half..half + samples.len()].copy_from_slice(samples);

    let n_frames = 1 + samples.len() / hop;
    (0..n_frames)
        .map(|i| {
            let start = i * hop;
            let mut frame = padded[start..start + frame_size].to_vec();
            let n = frame.len() as f32;
            let mean = frame.iter().sum::<f32>() / n;
            let var = frame.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / (n - 1.0);
            let std = var.sqrt().max(1e-10);
            frame.iter_mut().for_each(|x| *x = (*x - mean) / std);
            frame
        })
        .collect()
}

fn hz_to_bin(hz: f32) -> f32 {
    (1200.0 * (hz / 10.0).log2() - CENTS_OFFSET) / CENTS_PER_BIN
}

fn bin_to_hz(bin: usize) -> f32 {
    10.0 * 2f32.powf((CENTS_OFFSET + CENTS_PER_BIN * bin as f32) / 1200.0)
}

/// Viterbi over softmax-normalised activations.
///
/// Bins outside `[fmin, fmax]` are excluded. Periodicity is the raw
/// activation at the decoded bin.
pub fn decode_viterbi(activations: &[Vec<f32>], fmin: f32, fmax: f32) -> CrepeOutput {
    let Some(n_bins) = activations.first().map(Vec::len) else {
        return CrepeOutput::default();
    };
    let lo = (hz_to_bin(fmin).floor().max(0.0) as usize).min(n_bins);
    let hi = (hz_to_bin(fmax).ceil().max(0.0) as usize).min(n_bins);
    if lo >= hi {
        return CrepeOutput {
            f0: vec![0.0; activations.len()],
            periodicity: vec![0.0; activations.len()],
        };
    }

    // Row-normalised triangular transition, log domain
    let log_trans: Vec<Vec<f32>> = (0..n_bins)
        .map(|from| {
            let weights: Vec<f32> = (0..n_bins)
                .map(|to| (TRANSITION_WIDTH as f32 - from.abs_diff(to) as f32).max(0.0))
                .collect();
            let total: f32 = weights.iter().sum();
            weights.iter().map(|w| (w / total).ln()).collect()
        })
        .collect();

    let log_obs: Vec<Vec<f32>> = activations
        .iter()
        .map(|row| {
            // softmax over the allowed bins
            let max = row[lo..hi].iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let denom: f32 = row[lo..hi].iter().map(|v| (v - max).exp()).sum();
            (0..n_bins)
                .map(|b| {
                    if (lo..hi).contains(&b) {
                        (row[b] - max) - denom.ln()
                    } else {
                        f32::NEG_INFINITY
                    }
                })
                .collect()
        })
        .collect();

    let n_frames = activations.len();
    let init = -(n_bins as f32).ln();
    let mut score: Vec<f32> = log_obs[0].iter().map(|o| o + init).collect();
    let mut backptr = vec![vec![0usize; n_bins]; n_frames];

    for t in 1..n_frames {
        let mut next = vec![f32::NEG_INFINITY; n_bins];
        for to in lo..hi {
            let from_lo = to.saturating_sub(TRANSITION_WIDTH - 1).max(lo);
            let from_hi = (to + TRANSITION_WIDTH).min(hi);
            let mut best = (f32::NEG_INFINITY, from_lo);
            for from in from_lo..from_hi {
                let s = score[from] + log_trans[from][to];
                if s > best.0 {
                    best = (s, from);
                }
            }
            next[to] = best.0 + log_obs[t][to];
            backptr[t][to] = best.1;
        }
        score = next;
    }

    let mut state = (lo..hi)
        .max_by(|&a, &b| score[a].total_cmp(&score[b]))
        .unwrap_or(lo);
    let mut path = vec![0usize; n_frames];
    for t in (0..n_frames).rev() {
        path[t] = state;
        state = backptr[t][state];
    }

    CrepeOutput {
        f0: path.iter().map(|&b| bin_to_hz(b)).collect(),
        periodicity: path
            .iter()
            .zip(activations)
            .map(|(&b, row)| row[b])
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_full_in_features() {
        assert_eq!(CrepeConfig::default().in_features(), 2048);
    }

    #[test]
    fn test_forward_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = CrepeConfig {
            channels: vec![8, 4, 4],
            kernels: vec![16, 8, 8],
            first_stride: 4,
            frame_size: 64,
            n_bins: 20,
        };
        assert_eq!(config.in_features(), 8);
        let model = CrepeModel::new(config, vb).unwrap();
        let frames = Tensor::randn(0.0f32, 1.0, (3, 64), &device).unwrap();
        assert_eq!(model.forward(&frames).unwrap().dims(), &[3, 20]);
    }

    #[test]
    fn test_frame_count_and_normalisation() {
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.05).sin()).collect();
        let frames = frame_and_normalize(&samples, FRAME_SIZE, 160);
        assert_eq!(frames.len(), 11);
        let mid = &frames[5];
        let mean = mid.iter().sum::<f32>() / mid.len() as f32;
        assert!(mean.abs() < 1e-4);
    }

    #[test]
    fn test_viterbi_follows_peak() {
        let target = 150;
        let rows: Vec<Vec<f32>> = (0..20)
            .map(|_| {
                let mut row = vec![0.01f32; PITCH_BINS];
                row[target] = 0.95;
                row
            })
            .collect();
        let out = decode_viterbi(&rows, 50.0, 1100.0);
        let expected = bin_to_hz(target);
        assert!(out.f0.iter().all(|&f| (f - expected).abs() < 1e-3));
        assert!(out.periodicity.iter().all(|&p| (p - 0.95).abs() < 1e-6));
    }

    #[test]
    fn test_viterbi_respects_range() {
        let rows: Vec<Vec<f32>> = (0..5)
            .map(|_| {
                let mut row = vec![0.0f32; PITCH_BINS];
                // 10 Hz region, below fmin
                row[0] = 1.0;
                row
            })
            .collect();
        let out = decode_viterbi(&rows, 50.0, 1100.0);
        assert!(out.f0.iter().all(|&f| f >= 49.0));
    }
}
