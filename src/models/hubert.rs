//! HuBERT content encoder
//!
//! Turns 16 kHz speech into speaker-independent content features at one
//! frame per 320 samples. Parameter names follow the fairseq checkpoint
//! layout (`feature_extractor.conv_layers.*`, `encoder.layers.*`).
//!
//! Architecture:
//! 1. Seven-layer strided conv stack (GroupNorm after the first layer)
//! 2. LayerNorm + projection to the transformer width
//! 3. Grouped positional convolution added to the input
//! 4. Post-LN transformer layers, cut at the layer the voice model expects
//! 5. Optional projection to 256 dims for first-generation voice models

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{
    conv1d, conv1d_no_bias, group_norm, layer_norm, linear, Conv1d, Conv1dConfig, GroupNorm,
    LayerNorm, Linear, VarBuilder,
};

use std::path::Path;

use super::config::ModelVersion;
use super::weights::{is_safetensors, load_var_builder};

/// HuBERT hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct HubertConfig {
    /// `(channels, kernel, stride)` per conv layer
    pub conv_layers: Vec<(usize, usize, usize)>,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub pos_conv_kernel: usize,
    pub pos_conv_groups: usize,
    /// Output width of `final_proj`
    pub final_proj_dim: usize,
    pub layer_norm_eps: f64,
}

impl Default for HubertConfig {
    /// hubert_base
    fn default() -> Self {
        let mut conv_layers = vec![(512, 10, 5)];
        conv_layers.extend(std::iter::repeat((512, 3, 2)).take(4));
        conv_layers.extend(std::iter::repeat((512, 2, 2)).take(2));
        Self {
            conv_layers,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            pos_conv_kernel: 128,
            pos_conv_groups: 16,
            final_proj_dim: 256,
            layer_norm_eps: 1e-5,
        }
    }
}

impl HubertConfig {
    /// Input samples per output frame.
    pub fn total_stride(&self) -> usize {
        self.conv_layers.iter().map(|&(_, _, s)| s).product()
    }

    /// Output frames for `samples` input samples.
    pub fn num_frames(&self, samples: usize) -> usize {
        self.conv_layers.iter().fold(samples, |len, &(_, k, s)| {
            if len < k {
                0
            } else {
                (len - k) / s + 1
            }
        })
    }
}

struct FeatureExtractor {
    convs: Vec<Conv1d>,
    norm: GroupNorm,
}

impl FeatureExtractor {
    fn new(config: &HubertConfig, vb: VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(config.conv_layers.len());
        let mut in_ch = 1;
        for (i, &(out_ch, kernel, stride)) in config.conv_layers.iter().enumerate() {
            let cfg = Conv1dConfig {
                stride,
                ..Default::default()
            };
            convs.push(conv1d_no_bias(
                in_ch,
                out_ch,
                kernel,
                cfg,
                vb.pp(format!("conv_layers.{i}.0")),
            )?);
            in_ch = out_ch;
        }
        let first = config.conv_layers[0].0;
        let norm = group_norm(first, first, 1e-5, vb.pp("conv_layers.0.2"))?;
        Ok(Self { convs, norm })
    }

    /// `[batch, samples]` -> `[batch, channels, frames]`
    fn forward(&self, wav: &Tensor) -> Result<Tensor> {
        let mut x = wav.unsqueeze(1)?;
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.forward(&x)?;
            if i == 0 {
                x = self.norm.forward(&x)?;
            }
            x = x.gelu_erf()?;
        }
        Ok(x)
    }
}

struct PositionalConv {
    conv: Conv1d,
}

impl PositionalConv {
    fn new(config: &HubertConfig, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: config.pos_conv_kernel / 2,
            groups: config.pos_conv_groups,
            ..Default::default()
        };
        let conv = conv1d(
            config.hidden_size,
            config.hidden_size,
            config.pos_conv_kernel,
            cfg,
            vb.pp("0"),
        )?;
        Ok(Self { conv })
    }

    /// `[batch, frames, hidden]` in and out.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let frames = x.dim(1)?;
        let y = self.conv.forward(&x.transpose(1, 2)?)?;
        // Even kernels produce one extra frame
        let y = y.narrow(2, 0, frames)?.gelu_erf()?;
        Ok(y.transpose(1, 2)?)
    }
}

struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn new(config: &HubertConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let head_dim = h / config.num_heads;
        Ok(Self {
            q_proj: linear(h, h, vb.pp("q_proj"))?,
            k_proj: linear(h, h, vb.pp("k_proj"))?,
            v_proj: linear(h, h, vb.pp("v_proj"))?,
            out_proj: linear(h, h, vb.pp("out_proj"))?,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q_proj.forward(x)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

struct EncoderLayer {
    self_attn: SelfAttention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(config: &HubertConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: SelfAttention::new(config, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(h, eps, vb.pp("self_attn_layer_norm"))?,
            fc1: linear(h, config.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(config.intermediate_size, h, vb.pp("fc2"))?,
            final_layer_norm: layer_norm(h, eps, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.self_attn.forward(x)?)?;
        let x = self.self_attn_layer_norm.forward(&x)?;
        let ff = self.fc2.forward(&self.fc1.forward(&x)?.gelu_erf()?)?;
        Ok(self.final_layer_norm.forward(&(x + ff)?)?)
    }
}

/// HuBERT content encoder.
pub struct HubertModel {
    config: HubertConfig,
    feature_extractor: FeatureExtractor,
    layer_norm: LayerNorm,
    post_extract_proj: Linear,
    pos_conv: PositionalConv,
    encoder_layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    final_proj: Linear,
}

impl HubertModel {
    pub fn new(config: HubertConfig, vb: VarBuilder) -> Result<Self> {
        let conv_dim = config.conv_layers.last().map(|&(c, _, _)| c).unwrap_or(512);
        let h = config.hidden_size;
        let eps = config.layer_norm_eps;

        let layers = (0..config.num_layers)
            .map(|i| EncoderLayer::new(&config, vb.pp(format!("encoder.layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            feature_extractor: FeatureExtractor::new(&config, vb.pp("feature_extractor"))?,
            layer_norm: layer_norm(conv_dim, eps, vb.pp("layer_norm"))?,
            post_extract_proj: linear(conv_dim, h, vb.pp("post_extract_proj"))?,
            pos_conv: PositionalConv::new(&config, vb.pp("encoder.pos_conv"))?,
            encoder_layer_norm: layer_norm(h, eps, vb.pp("encoder.layer_norm"))?,
            layers,
            final_proj: linear(h, config.final_proj_dim, vb.pp("final_proj"))?,
            config,
        })
    }

    /// Load `hubert_base.pt` (fairseq, key `model`) or a safetensors export.
    pub fn load(path: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let key = if is_safetensors(path) { None } else { Some("model") };
        let vb = load_var_builder(path, key, dtype, device)?;
        let model = Self::new(HubertConfig::default(), vb)?;
        tracing::info!(path = %path.display(), ?dtype, "loaded HuBERT content encoder");
        Ok(model)
    }

    pub fn config(&self) -> &HubertConfig {
        &self.config
    }

    /// Content features for `version`.
    ///
    /// Input: `[batch, samples]` at 16 kHz.
    /// Output: `[batch, frames, version.feature_dim()]`.
    pub fn extract(&self, wav: &Tensor, version: ModelVersion) -> Result<Tensor> {
        let output_layer = version.output_layer().min(self.layers.len());

        let x = self.feature_extractor.forward(wav)?.transpose(1, 2)?;
        let x = self.layer_norm.forward(&x)?;
        let x = self.post_extract_proj.forward(&x)?;

        let x = (&x + self.pos_conv.forward(&x)?)?;
        let mut x = self.encoder_layer_norm.forward(&x)?;
        for layer in &self.layers[..output_layer] {
            x = layer.forward(&x)?;
        }

        match version {
            ModelVersion::V1 => Ok(self.final_proj.forward(&x)?),
            ModelVersion::V2 => Ok(x),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> HubertConfig {
        HubertConfig {
            conv_layers: vec![(16, 10, 5), (16, 3, 2), (16, 2, 2)],
            hidden_size: 32,
            num_layers: 2,
            num_heads: 4,
            intermediate_size: 64,
            pos_conv_kernel: 8,
            pos_conv_groups: 4,
            final_proj_dim: 8,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn test_base_stride() {
        let config = HubertConfig::default();
        assert_eq!(config.total_stride(), 320);
        assert_eq!(config.num_frames(16000), 49);
    }

    #[test]
    fn test_extract_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let model = HubertModel::new(config.clone(), vb).unwrap();

        let wav = Tensor::randn(0.0f32, 0.1, (1, 2000), &device).unwrap();
        let frames = config.num_frames(2000);

        let v2 = model.extract(&wav, ModelVersion::V2).unwrap();
        assert_eq!(v2.dims(), &[1, frames, 32]);
        let v1 = model.extract(&wav, ModelVersion::V1).unwrap();
        assert_eq!(v1.dims(), &[1, frames, 8]);
    }
}
