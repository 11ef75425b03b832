//! Relative-position transformer encoder used by the phone encoder.
//!
//! Every tensor here is channel-first, `[batch, channels, frames]`.

use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

/// Relative positions attended on each side.
pub const WINDOW_SIZE: usize = 10;

/// LayerNorm over the channel axis with `gamma`/`beta` parameters.
pub struct ChannelLayerNorm {
    gamma: Tensor,
    beta: Tensor,
    eps: f64,
}

impl ChannelLayerNorm {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gamma: vb.get_with_hints(channels, "gamma", candle_nn::Init::Const(1.0))?,
            beta: vb.get_with_hints(channels, "beta", candle_nn::Init::Const(0.0))?,
            eps: 1e-5,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let gamma = self.gamma.reshape((1, (), 1))?;
        let beta = self.beta.reshape((1, (), 1))?;
        Ok(normed.broadcast_mul(&gamma)?.broadcast_add(&beta)?)
    }
}

/// Multi-head self attention with learned relative key/value embeddings.
pub struct RelativeAttention {
    conv_q: Conv1d,
    conv_k: Conv1d,
    conv_v: Conv1d,
    conv_o: Conv1d,
    emb_rel_k: Tensor,
    emb_rel_v: Tensor,
    n_heads: usize,
    k_channels: usize,
}

impl RelativeAttention {
    pub fn new(channels: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        let k_channels = channels / n_heads;
        let pointwise = Conv1dConfig::default();
        let rel_shape = (1, 2 * WINDOW_SIZE + 1, k_channels);
        let rel_init = candle_nn::Init::Randn {
            mean: 0.0,
            stdev: (k_channels as f64).powf(-0.5),
        };
        Ok(Self {
            conv_q: conv1d(channels, channels, 1, pointwise, vb.pp("conv_q"))?,
            conv_k: conv1d(channels, channels, 1, pointwise, vb.pp("conv_k"))?,
            conv_v: conv1d(channels, channels, 1, pointwise, vb.pp("conv_v"))?,
            conv_o: conv1d(channels, channels, 1, pointwise, vb.pp("conv_o"))?,
            emb_rel_k: vb.get_with_hints(rel_shape, "emb_rel_k", rel_init)?,
            emb_rel_v: vb.get_with_hints(rel_shape, "emb_rel_v", rel_init)?,
            n_heads,
            k_channels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, frames) = x.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, self.n_heads, self.k_channels, frames))?
                .transpose(2, 3)?
                .contiguous()?)
        };
        let scale = 1.0 / (self.k_channels as f64).sqrt();
        let q = (heads(self.conv_q.forward(x)?)? * scale)?;
        let k = heads(self.conv_k.forward(x)?)?;
        let v = heads(self.conv_v.forward(x)?)?;

        let scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        // [1, 2t-1, kc] -> logits against every relative offset
        let rel_k = relative_embeddings(&self.emb_rel_k, frames)?;
        let rel_logits = q.broadcast_matmul(&rel_k.transpose(1, 2)?.contiguous()?.unsqueeze(0)?)?;
        let scores = (scores + relative_to_absolute(&rel_logits)?)?;

        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = attn.matmul(&v)?;
        let rel_v = relative_embeddings(&self.emb_rel_v, frames)?;
        let rel_weights = absolute_to_relative(&attn)?;
        let out = (out + rel_weights.broadcast_matmul(&rel_v.unsqueeze(0)?)?)?;

        let out = out.transpose(2, 3)?.reshape((batch, channels, frames))?;
        Ok(self.conv_o.forward(&out)?)
    }
}

/// Slice or zero-pad the `2·window+1` table to `2·length−1` offsets.
fn relative_embeddings(table: &Tensor, length: usize) -> Result<Tensor> {
    let pad = length.saturating_sub(WINDOW_SIZE + 1);
    let start = (WINDOW_SIZE + 1).saturating_sub(length);
    let padded = if pad > 0 {
        table.pad_with_zeros(1, pad, pad)?
    } else {
        table.clone()
    };
    Ok(padded.narrow(1, start, 2 * length - 1)?.contiguous()?)
}

/// `[b, h, l, 2l−1]` relative logits -> `[b, h, l, l]` absolute positions.
fn relative_to_absolute(x: &Tensor) -> Result<Tensor> {
    let (b, h, l, _) = x.dims4()?;
    let x = x.pad_with_zeros(3, 0, 1)?;
    let flat = x.reshape((b, h, l * 2 * l))?.pad_with_zeros(2, 0, l - 1)?;
    let out = flat
        .reshape((b, h, l + 1, 2 * l - 1))?
        .narrow(2, 0, l)?
        .narrow(3, l - 1, l)?;
    Ok(out.contiguous()?)
}

/// `[b, h, l, l]` absolute weights -> `[b, h, l, 2l−1]` relative offsets.
fn absolute_to_relative(x: &Tensor) -> Result<Tensor> {
    let (b, h, l, _) = x.dims4()?;
    let x = x.pad_with_zeros(3, 0, l - 1)?;
    let flat = x
        .reshape((b, h, l * l + l * (l - 1)))?
        .pad_with_zeros(2, l, 0)?;
    let out = flat.reshape((b, h, l, 2 * l))?.narrow(3, 1, 2 * l - 1)?;
    Ok(out.contiguous()?)
}

/// Two same-padded convolutions with ReLU between.
pub struct FeedForward {
    conv_1: Conv1d,
    conv_2: Conv1d,
    kernel_size: usize,
}

impl FeedForward {
    pub fn new(channels: usize, filter: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig::default();
        Ok(Self {
            conv_1: conv1d(channels, filter, kernel_size, cfg, vb.pp("conv_1"))?,
            conv_2: conv1d(filter, channels, kernel_size, cfg, vb.pp("conv_2"))?,
            kernel_size,
        })
    }

    fn same_pad(&self, x: &Tensor) -> Result<Tensor> {
        let left = (self.kernel_size - 1) / 2;
        let right = self.kernel_size / 2;
        Ok(x.pad_with_zeros(2, left, right)?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv_1.forward(&self.same_pad(x)?)?.relu()?;
        Ok(self.conv_2.forward(&self.same_pad(&h)?)?)
    }
}

/// Post-norm encoder stack.
pub struct AttentionEncoder {
    attn_layers: Vec<RelativeAttention>,
    norm_layers_1: Vec<ChannelLayerNorm>,
    ffn_layers: Vec<FeedForward>,
    norm_layers_2: Vec<ChannelLayerNorm>,
}

impl AttentionEncoder {
    pub fn new(
        hidden: usize,
        filter: usize,
        n_heads: usize,
        n_layers: usize,
        kernel_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut encoder = Self {
            attn_layers: Vec::with_capacity(n_layers),
            norm_layers_1: Vec::with_capacity(n_layers),
            ffn_layers: Vec::with_capacity(n_layers),
            norm_layers_2: Vec::with_capacity(n_layers),
        };
        for i in 0..n_layers {
            encoder.attn_layers.push(RelativeAttention::new(
                hidden,
                n_heads,
                vb.pp(format!("attn_layers.{i}")),
            )?);
            encoder
                .norm_layers_1
                .push(ChannelLayerNorm::new(hidden, vb.pp(format!("norm_layers_1.{i}")))?);
            encoder.ffn_layers.push(FeedForward::new(
                hidden,
                filter,
                kernel_size,
                vb.pp(format!("ffn_layers.{i}")),
            )?);
            encoder
                .norm_layers_2
                .push(ChannelLayerNorm::new(hidden, vb.pp(format!("norm_layers_2.{i}")))?);
        }
        Ok(encoder)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for i in 0..self.attn_layers.len() {
            let y = self.attn_layers[i].forward(&x)?;
            x = self.norm_layers_1[i].forward(&(x + y)?)?;
            let y = self.ffn_layers[i].forward(&x)?;
            x = self.norm_layers_2[i].forward(&(x + y)?)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_relative_to_absolute_indexing() {
        let device = Device::Cpu;
        let l = 3;
        // rel[i][r] = 10 * i + r
        let data: Vec<f32> = (0..l)
            .flat_map(|i| (0..2 * l - 1).map(move |r| (10 * i + r) as f32))
            .collect();
        let rel = Tensor::from_vec(data, (1, 1, l, 2 * l - 1), &device).unwrap();
        let abs = relative_to_absolute(&rel).unwrap();
        let abs = abs.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        // abs[i][j] = rel[i][j - i + l - 1]
        for (i, row) in abs.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, (10 * i + (j + l - 1 - i)) as f32);
            }
        }
    }

    #[test]
    fn test_absolute_to_relative_inverts_placement() {
        let device = Device::Cpu;
        let l = 4;
        let data: Vec<f32> = (0..l * l).map(|x| x as f32 + 1.0).collect();
        let abs = Tensor::from_vec(data, (1, 1, l, l), &device).unwrap();
        let rel = absolute_to_relative(&abs).unwrap();
        assert_eq!(rel.dims(), &[1, 1, l, 2 * l - 1]);
        let back = relative_to_absolute(&rel).unwrap();
        let diff = (back - abs).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_relative_embeddings_pad_and_slice() {
        let device = Device::Cpu;
        let table = Tensor::ones((1, 2 * WINDOW_SIZE + 1, 4), DType::F32, &device).unwrap();
        assert_eq!(relative_embeddings(&table, 3).unwrap().dims(), &[1, 5, 4]);
        let long = relative_embeddings(&table, 30).unwrap();
        assert_eq!(long.dims(), &[1, 59, 4]);
        // Offsets beyond the window are zero
        let edge: f32 = long.narrow(1, 0, 1).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(edge, 0.0);
    }

    #[test]
    fn test_encoder_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = AttentionEncoder::new(8, 16, 2, 2, 3, vb).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 8, 13), &device).unwrap();
        assert_eq!(encoder.forward(&x).unwrap().dims(), &[1, 8, 13]);
    }
}
