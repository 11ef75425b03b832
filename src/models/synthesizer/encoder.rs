//! Phone encoder: content features (and coarse pitch) to prior statistics.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, embedding, linear, Conv1d, Embedding, Linear, VarBuilder};

use super::attentions::AttentionEncoder;
use super::leaky_relu;
use crate::models::config::SynthesizerConfig;

/// Number of coarse pitch bins.
pub const PITCH_EMBEDDINGS: usize = 256;

pub struct PhoneEncoder {
    emb_phone: Linear,
    emb_pitch: Option<Embedding>,
    encoder: AttentionEncoder,
    proj: Conv1d,
    hidden: usize,
    out_channels: usize,
}

impl PhoneEncoder {
    pub fn new(
        config: &SynthesizerConfig,
        feature_dim: usize,
        uses_pitch: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = config.hidden_channels;
        let emb_pitch = if uses_pitch {
            Some(embedding(PITCH_EMBEDDINGS, hidden, vb.pp("emb_pitch"))?)
        } else {
            None
        };
        Ok(Self {
            emb_phone: linear(feature_dim, hidden, vb.pp("emb_phone"))?,
            emb_pitch,
            encoder: AttentionEncoder::new(
                hidden,
                config.filter_channels,
                config.n_heads,
                config.n_layers,
                config.kernel_size,
                vb.pp("encoder"),
            )?,
            proj: conv1d(
                hidden,
                2 * config.inter_channels,
                1,
                Default::default(),
                vb.pp("proj"),
            )?,
            hidden,
            out_channels: config.inter_channels,
        })
    }

    /// `phone: [b, t, feature_dim]`, `pitch: [b, t]` coarse bins.
    ///
    /// Returns `(mean, log_scale)`, each `[b, inter_channels, t]`.
    pub fn forward(&self, phone: &Tensor, pitch: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let mut x = self.emb_phone.forward(phone)?;
        if let (Some(emb), Some(pitch)) = (&self.emb_pitch, pitch) {
            x = (x + emb.forward(pitch)?)?;
        }
        let x = (x * (self.hidden as f64).sqrt())?;
        let x = leaky_relu(&x, 0.1)?.transpose(1, 2)?.contiguous()?;

        let x = self.encoder.forward(&x)?;
        let stats = self.proj.forward(&x)?;
        let m = stats.narrow(1, 0, self.out_channels)?;
        let logs = stats.narrow(1, self.out_channels, self.out_channels)?;
        Ok((m, logs))
    }
}
