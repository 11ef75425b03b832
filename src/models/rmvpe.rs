//! RMVPE pitch network
//!
//! A deep U-Net over the log-mel spectrogram followed by a bidirectional
//! GRU that classifies every 10 ms frame into 360 pitch bins of 20 cents.
//!
//! Architecture:
//! 1. BatchNorm + five residual encoder stages with 2x2 average pooling
//! 2. Four residual intermediate stages
//! 3. Five residual decoder stages with transposed-conv upsampling and skips
//! 4. 3-channel conv, flattened per frame
//! 5. BiGRU -> Linear -> sigmoid salience

use anyhow::Result;
use candle_core::{DType, Device, Module, ModuleT, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, conv_transpose2d_no_bias, linear, BatchNorm,
    BatchNormConfig, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Linear,
    VarBuilder,
};
use std::path::Path;

use crate::audio::{MelConfig, MelSpectrogram};

/// Pitch bins of the salience map.
pub const PITCH_BINS: usize = 360;
/// Cents of bin 0 relative to 10 Hz.
pub const CENTS_OFFSET: f32 = 1997.379_4;
/// Cents between adjacent bins.
pub const CENTS_PER_BIN: f32 = 20.0;
/// Frames are zeroed when the salience peak does not exceed this.
pub const VOICING_THRESHOLD: f32 = 0.03;

const DECODE_RADIUS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct RmvpeConfig {
    pub n_mels: usize,
    pub n_blocks: usize,
    pub en_de_layers: usize,
    pub inter_layers: usize,
    pub en_out_channels: usize,
    pub gru_hidden: usize,
    pub n_bins: usize,
}

impl Default for RmvpeConfig {
    fn default() -> Self {
        Self {
            n_mels: 128,
            n_blocks: 4,
            en_de_layers: 5,
            inter_layers: 4,
            en_out_channels: 16,
            gru_hidden: 256,
            n_bins: PITCH_BINS,
        }
    }
}

impl RmvpeConfig {
    /// Time axis must be a multiple of this.
    pub fn frame_multiple(&self) -> usize {
        1 << self.en_de_layers
    }
}

fn bn(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    let config = BatchNormConfig {
        eps: 1e-5,
        ..Default::default()
    };
    Ok(batch_norm(channels, config, vb)?)
}

fn same_3x3() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

/// conv-bn-relu x2 with a residual path
struct ConvBlockRes {
    conv_a: Conv2d,
    bn_a: BatchNorm,
    conv_b: Conv2d,
    bn_b: BatchNorm,
    shortcut: Option<Conv2d>,
}

impl ConvBlockRes {
    fn new(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Self> {
        let shortcut = if in_ch != out_ch {
            Some(conv2d(in_ch, out_ch, 1, Default::default(), vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            conv_a: conv2d_no_bias(in_ch, out_ch, 3, same_3x3(), vb.pp("conv.0"))?,
            bn_a: bn(out_ch, vb.pp("conv.1"))?,
            conv_b: conv2d_no_bias(out_ch, out_ch, 3, same_3x3(), vb.pp("conv.3"))?,
            bn_b: bn(out_ch, vb.pp("conv.4"))?,
            shortcut,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.bn_a.forward_t(&self.conv_a.forward(x)?, false)?.relu()?;
        let h = self.bn_b.forward_t(&self.conv_b.forward(&h)?, false)?.relu()?;
        let skip = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        Ok((h + skip)?)
    }
}

struct ResEncoderBlock {
    blocks: Vec<ConvBlockRes>,
    pool: bool,
}

impl ResEncoderBlock {
    fn new(in_ch: usize, out_ch: usize, n_blocks: usize, pool: bool, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..n_blocks)
            .map(|i| {
                let c_in = if i == 0 { in_ch } else { out_ch };
                ConvBlockRes::new(c_in, out_ch, vb.pp(format!("conv.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks, pool })
    }

    /// Returns the pre-pool activation (the skip) and the pooled output.
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let pooled = if self.pool {
            h.avg_pool2d(2)?
        } else {
            h.clone()
        };
        Ok((h, pooled))
    }
}

struct ResDecoderBlock {
    up: ConvTranspose2d,
    up_bn: BatchNorm,
    blocks: Vec<ConvBlockRes>,
}

impl ResDecoderBlock {
    fn new(in_ch: usize, out_ch: usize, n_blocks: usize, vb: VarBuilder) -> Result<Self> {
        let config = ConvTranspose2dConfig {
            padding: 1,
            output_padding: 1,
            stride: 2,
            dilation: 1,
        };
        let blocks = (0..n_blocks)
            .map(|i| {
                let c_in = if i == 0 { out_ch * 2 } else { out_ch };
                ConvBlockRes::new(c_in, out_ch, vb.pp(format!("conv2.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            up: conv_transpose2d_no_bias(in_ch, out_ch, 3, config, vb.pp("conv1.0"))?,
            up_bn: bn(out_ch, vb.pp("conv1.1"))?,
            blocks,
        })
    }

    fn forward(&self, x: &Tensor, skip: &Tensor) -> Result<Tensor> {
        let h = self.up_bn.forward_t(&self.up.forward(x)?, false)?.relu()?;
        let mut h = Tensor::cat(&[&h, skip], 1)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}

struct DeepUnet {
    input_bn: BatchNorm,
    encoders: Vec<ResEncoderBlock>,
    intermediate: Vec<ResEncoderBlock>,
    decoders: Vec<ResDecoderBlock>,
}

impl DeepUnet {
    fn new(config: &RmvpeConfig, vb: VarBuilder) -> Result<Self> {
        let enc_vb = vb.pp("encoder");
        let mut encoders = Vec::with_capacity(config.en_de_layers);
        let mut in_ch = 1;
        let mut out_ch = config.en_out_channels;
        for i in 0..config.en_de_layers {
            encoders.push(ResEncoderBlock::new(
                in_ch,
                out_ch,
                config.n_blocks,
                true,
                enc_vb.pp(format!("layers.{i}")),
            )?);
            in_ch = out_ch;
            out_ch *= 2;
        }

        // in_ch is now the deepest encoder width
        let mut intermediate = Vec::with_capacity(config.inter_layers);
        for i in 0..config.inter_layers {
            let c_in = if i == 0 { in_ch } else { in_ch * 2 };
            intermediate.push(ResEncoderBlock::new(
                c_in,
                in_ch * 2,
                config.n_blocks,
                false,
                vb.pp(format!("intermediate.layers.{i}")),
            )?);
        }

        let mut decoders = Vec::with_capacity(config.en_de_layers);
        let mut ch = in_ch * 2;
        for i in 0..config.en_de_layers {
            decoders.push(ResDecoderBlock::new(
                ch,
                ch / 2,
                config.n_blocks,
                vb.pp(format!("decoder.layers.{i}")),
            )?);
            ch /= 2;
        }

        Ok(Self {
            input_bn: bn(1, enc_vb.pp("bn"))?,
            encoders,
            intermediate,
            decoders,
        })
    }

    /// `[batch, 1, frames, mels]` -> `[batch, en_out_channels, frames, mels]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = self.input_bn.forward_t(x, false)?;
        let mut skips = Vec::with_capacity(self.encoders.len());
        for enc in &self.encoders {
            let (skip, pooled) = enc.forward(&x)?;
            skips.push(skip);
            x = pooled;
        }
        for inter in &self.intermediate {
            x = inter.forward(&x)?.1;
        }
        for (dec, skip) in self.decoders.iter().zip(skips.iter().rev()) {
            x = dec.forward(&x, skip)?;
        }
        Ok(x)
    }
}

/// One direction of a single-layer GRU with PyTorch gate order (r, z, n).
struct GruDirection {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden: usize,
}

impl GruDirection {
    fn new(in_dim: usize, hidden: usize, suffix: &str, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            w_ih: vb.get((3 * hidden, in_dim), &format!("weight_ih_l0{suffix}"))?,
            w_hh: vb.get((3 * hidden, hidden), &format!("weight_hh_l0{suffix}"))?,
            b_ih: vb.get(3 * hidden, &format!("bias_ih_l0{suffix}"))?,
            b_hh: vb.get(3 * hidden, &format!("bias_hh_l0{suffix}"))?,
            hidden,
        })
    }

    /// `[batch, frames, in]` -> `[batch, frames, hidden]`
    fn forward(&self, x: &Tensor, reverse: bool) -> Result<Tensor> {
        let (batch, frames, _) = x.dims3()?;
        let h_size = self.hidden;
        // Input projections for every step at once
        let gi = x
            .broadcast_matmul(&self.w_ih.t()?)?
            .broadcast_add(&self.b_ih)?;
        let w_hh_t = self.w_hh.t()?;

        let mut h = Tensor::zeros((batch, h_size), x.dtype(), x.device())?;
        let mut outputs = vec![None; frames];
        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..frames).rev())
        } else {
            Box::new(0..frames)
        };
        for t in order {
            let gi_t = gi.narrow(1, t, 1)?.squeeze(1)?;
            let gh = h.matmul(&w_hh_t)?.broadcast_add(&self.b_hh)?;

            let r = candle_nn::ops::sigmoid(
                &(gi_t.narrow(1, 0, h_size)? + gh.narrow(1, 0, h_size)?)?,
            )?;
            let z = candle_nn::ops::sigmoid(
                &(gi_t.narrow(1, h_size, h_size)? + gh.narrow(1, h_size, h_size)?)?,
            )?;
            let n = (gi_t.narrow(1, 2 * h_size, h_size)?
                + (r * gh.narrow(1, 2 * h_size, h_size)?)?)?
                .tanh()?;
            // h' = (1 - z) * n + z * h = n + z * (h - n)
            h = (&n + (z * (&h - &n)?)?)?;
            outputs[t] = Some(h.clone());
        }

        let outputs = outputs.into_iter().flatten().collect::<Vec<_>>();
        Ok(Tensor::stack(&outputs, 1)?)
    }
}

struct BiGru {
    forward: GruDirection,
    backward: GruDirection,
}

impl BiGru {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            forward: GruDirection::new(in_dim, hidden, "", &vb)?,
            backward: GruDirection::new(in_dim, hidden, "_reverse", &vb)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let fwd = self.forward.forward(x, false)?;
        let bwd = self.backward.forward(x, true)?;
        Ok(Tensor::cat(&[fwd, bwd], D::Minus1)?)
    }
}

/// RMVPE network: log-mel in, per-frame pitch salience out.
pub struct RmvpeModel {
    config: RmvpeConfig,
    unet: DeepUnet,
    cnn: Conv2d,
    gru: BiGru,
    fc: Linear,
}

impl RmvpeModel {
    pub fn new(config: RmvpeConfig, vb: VarBuilder) -> Result<Self> {
        let gru_in = 3 * config.n_mels;
        Ok(Self {
            unet: DeepUnet::new(&config, vb.pp("unet"))?,
            cnn: conv2d(config.en_out_channels, 3, 3, same_3x3(), vb.pp("cnn"))?,
            gru: BiGru::new(gru_in, config.gru_hidden, vb.pp("fc.0.gru"))?,
            fc: linear(2 * config.gru_hidden, config.n_bins, vb.pp("fc.1"))?,
            config,
        })
    }

    pub fn config(&self) -> &RmvpeConfig {
        &self.config
    }

    /// `[batch, n_mels, frames]` -> `[batch, frames, n_bins]`
    ///
    /// The time axis is zero-padded to the U-Net's multiple internally and
    /// trimmed back on output.
    pub fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        let (batch, n_mels, frames) = mel.dims3()?;
        let multiple = self.config.frame_multiple();
        let padded = frames.div_ceil(multiple).max(1) * multiple;
        let mel = mel.pad_with_zeros(2, 0, padded - frames)?;

        let x = mel.transpose(1, 2)?.unsqueeze(1)?.contiguous()?;
        let x = self.unet.forward(&x)?;
        let x = self.cnn.forward(&x)?;
        // [b, 3, t, m] -> [b, t, 3 * m]
        let x = x
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, padded, 3 * n_mels))?;
        let x = self.gru.forward(&x)?;
        let x = candle_nn::ops::sigmoid(&self.fc.forward(&x)?)?;
        Ok(x.narrow(1, 0, frames)?)
    }
}

/// Waveform-level RMVPE: mel front-end, network and decoder.
pub struct Rmvpe {
    model: RmvpeModel,
    mel: MelSpectrogram,
    device: Device,
}

impl Rmvpe {
    pub fn new(model: RmvpeModel, mel: MelConfig, device: Device) -> Self {
        Self {
            model,
            mel: MelSpectrogram::new(mel),
            device,
        }
    }

    /// Load `rmvpe.pt` (or a safetensors export).
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let vb = super::weights::load_var_builder(path, None, DType::F32, device)?;
        let model = RmvpeModel::new(RmvpeConfig::default(), vb)?;
        tracing::info!(path = %path.display(), "loaded RMVPE pitch model");
        Ok(Self::new(model, MelConfig::rmvpe(), device.clone()))
    }

    /// Salience per frame, `[frames][n_bins]`, for 16 kHz samples.
    pub fn salience(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        let mel = self
            .mel
            .log_magnitude_tensor(samples, &self.device)?
            .unsqueeze(0)?;
        if mel.dim(2)? == 0 {
            return Ok(Vec::new());
        }
        let hidden = self.model.forward(&mel)?.squeeze(0)?;
        Ok(hidden.to_dtype(DType::F32)?.to_vec2()?)
    }

    /// F0 in Hz per 10 ms frame, 0 for unvoiced frames.
    pub fn infer_f0(&self, samples: &[f32], threshold: f32) -> Result<Vec<f32>> {
        let salience = self.salience(samples)?;
        Ok(decode_salience(&salience, threshold))
    }
}

/// Weighted average of the bins within four of the peak, in Hz.
pub fn decode_salience(salience: &[Vec<f32>], threshold: f32) -> Vec<f32> {
    salience
        .iter()
        .map(|row| {
            let Some((peak, &max)) = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
            else {
                return 0.0;
            };
            if max <= threshold {
                return 0.0;
            }
            let lo = peak.saturating_sub(DECODE_RADIUS);
            let hi = (peak + DECODE_RADIUS + 1).min(row.len());
            let (num, den) = (lo..hi).fold((0.0f32, 0.0f32), |(num, den), b| {
                let cents = CENTS_OFFSET + CENTS_PER_BIN * b as f32;
                (num + cents * row[b], den + row[b])
            });
            if den <= 0.0 {
                return 0.0;
            }
            cents_to_hz(num / den)
        })
        .collect()
}

/// `10 * 2^(cents / 1200)`; the 10 Hz floor itself maps to unvoiced.
pub fn cents_to_hz(cents: f32) -> f32 {
    let f0 = 10.0 * 2f32.powf(cents / 1200.0);
    if (f0 - 10.0).abs() < 1e-3 {
        0.0
    } else {
        f0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_nn::VarMap;

    pub(crate) fn tiny() -> RmvpeConfig {
        RmvpeConfig {
            n_mels: 8,
            n_blocks: 1,
            en_de_layers: 2,
            inter_layers: 1,
            en_out_channels: 2,
            gru_hidden: 4,
            n_bins: 12,
        }
    }

    #[test]
    fn test_forward_shape_trims_padding() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = RmvpeModel::new(tiny(), vb).unwrap();

        let mel = Tensor::randn(0.0f32, 1.0, (1, 8, 10), &device).unwrap();
        let out = model.forward(&mel).unwrap();
        assert_eq!(out.dims(), &[1, 10, 12]);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_decode_peak_bin() {
        let mut row = vec![0.0f32; PITCH_BINS];
        row[100] = 0.9;
        let f0 = decode_salience(&[row], VOICING_THRESHOLD);
        let expected = 10.0 * 2f32.powf((CENTS_OFFSET + 2000.0) / 1200.0);
        assert!((f0[0] - expected).abs() < 0.01, "{} vs {expected}", f0[0]);
    }

    #[test]
    fn test_decode_interpolates_between_bins() {
        let mut row = vec![0.0f32; PITCH_BINS];
        row[50] = 0.8;
        row[51] = 0.8;
        let f0 = decode_salience(&[row], VOICING_THRESHOLD)[0];
        let lo = cents_to_hz(CENTS_OFFSET + 1000.0);
        let hi = cents_to_hz(CENTS_OFFSET + 1020.0);
        assert!(f0 > lo && f0 < hi);
    }

    #[test]
    fn test_decode_unvoiced_below_threshold() {
        let row = vec![0.02f32; PITCH_BINS];
        assert_eq!(decode_salience(&[row], VOICING_THRESHOLD), vec![0.0]);
    }

    #[test]
    fn test_gru_direction_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gru = BiGru::new(6, 5, vb).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 7, 6), &device).unwrap();
        assert_eq!(gru.forward(&x).unwrap().dims(), &[2, 7, 10]);
    }
}
