//! Voice synthesis network.
//!
//! Content features (plus coarse and continuous pitch for the pitch
//! variants) go through the phone encoder, a sampled latent is pushed
//! back through the coupling flow, and the HiFi-GAN generator renders it
//! at the model's sample rate:
//!
//! ```text
//! feats ─► PhoneEncoder ─► (m, logs) ─► z = m + e^logs·ε·0.66666
//!                                         │
//!                         emb_g(sid) ─► CouplingFlow⁻¹ ─► Generator ─► wav
//! ```

pub mod attentions;
pub mod encoder;
pub mod flow;
pub mod generator;

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

use crate::error::VcError;
use crate::models::checkpoint::VoiceCheckpoint;
use crate::models::config::{SynthesizerConfig, SynthesizerVariant};
use crate::models::noise::NoiseSource;
use crate::models::weights::var_builder;

pub use encoder::{PhoneEncoder, PITCH_EMBEDDINGS};
pub use flow::CouplingFlow;
pub use generator::Generator;

/// Scale on the prior noise when sampling the latent.
pub const NOISE_SCALE: f64 = 0.66666;

/// `max(x, slope·x)`, valid for `0 < slope < 1`.
pub fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

pub struct Synthesizer {
    variant: SynthesizerVariant,
    config: SynthesizerConfig,
    emb_g: Embedding,
    enc_p: PhoneEncoder,
    flow: CouplingFlow,
    dec: Generator,
    device: Device,
    dtype: DType,
}

impl Synthesizer {
    pub fn new(config: SynthesizerConfig, variant: SynthesizerVariant, vb: VarBuilder) -> Result<Self> {
        let uses_pitch = variant.uses_pitch();
        let enc_p = PhoneEncoder::new(&config, variant.feature_dim(), uses_pitch, vb.pp("enc_p"))?;
        let flow = CouplingFlow::new(
            config.inter_channels,
            config.hidden_channels,
            config.gin_channels,
            vb.pp("flow"),
        )?;
        let dec = Generator::new(&config, uses_pitch, vb.pp("dec"))?;
        let emb_g = embedding(config.spk_embed_dim, config.gin_channels, vb.pp("emb_g"))?;
        Ok(Self {
            variant,
            config,
            emb_g,
            enc_p,
            flow,
            dec,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Build the network for a loaded checkpoint.
    pub fn from_checkpoint(checkpoint: &VoiceCheckpoint, dtype: DType, device: &Device) -> Result<Self> {
        let vb = var_builder(checkpoint.weights.clone(), dtype, device);
        let synth = Self::new(checkpoint.config.clone(), checkpoint.variant, vb)?;
        tracing::debug!(variant = %synth.variant, ?dtype, "synthesizer ready");
        Ok(synth)
    }

    pub fn variant(&self) -> SynthesizerVariant {
        self.variant
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    pub fn n_speakers(&self) -> usize {
        self.config.spk_embed_dim
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Output samples per content frame.
    pub fn hop_length(&self) -> usize {
        self.dec.upsample_factor()
    }

    /// Render a waveform.
    ///
    /// * `feats` - `[1, frames, feature_dim]` content features on the 10 ms grid
    /// * `pitch` - `(coarse [1, frames], f0 [1, frames])`, pitch variants only
    ///
    /// Returns `[frames * hop_length]` samples in [-1, 1].
    #[tracing::instrument(skip_all, fields(variant = %self.variant))]
    pub fn infer(
        &self,
        feats: &Tensor,
        pitch: Option<(&Tensor, &Tensor)>,
        speaker_id: usize,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        if speaker_id >= self.n_speakers() {
            return Err(VcError::config(format!(
                "speaker id {speaker_id} out of range, model has {} speaker(s)",
                self.n_speakers()
            ))
            .into());
        }
        let pitch = match (self.variant.uses_pitch(), pitch) {
            (true, Some(p)) => Some(p),
            (false, None) => None,
            (true, None) => {
                return Err(VcError::config(format!(
                    "{} model needs a pitch contour",
                    self.variant
                ))
                .into())
            }
            (false, Some(_)) => {
                return Err(VcError::config(format!(
                    "{} model takes no pitch contour",
                    self.variant
                ))
                .into())
            }
        };

        let feats = feats.to_device(&self.device)?.to_dtype(self.dtype)?;
        let sid = Tensor::new(&[speaker_id as u32], &self.device)?;
        let g = self.emb_g.forward(&sid)?.unsqueeze(2)?;

        let coarse = pitch
            .map(|(c, _)| c.to_device(&self.device)?.to_dtype(DType::U32))
            .transpose()?;
        let (m, logs) = self.enc_p.forward(&feats, coarse.as_ref())?;

        let eps = noise
            .randn(m.dims(), &self.device)?
            .to_dtype(self.dtype)?;
        let z_p = (&m + (logs.exp()? * eps)?.affine(NOISE_SCALE, 0.0)?)?;
        let z = self.flow.reverse(&z_p, Some(&g))?;

        let f0 = pitch
            .map(|(_, f)| f.to_device(&self.device)?.to_dtype(DType::F32))
            .transpose()?;
        let wav = self.dec.forward(&z, Some(&g), f0.as_ref(), noise)?;
        Ok(wav.flatten_all()?.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::config::{ModelVersion, ResBlockKind};
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> SynthesizerConfig {
        SynthesizerConfig {
            spec_channels: 17,
            segment_size: 8,
            inter_channels: 4,
            hidden_channels: 8,
            filter_channels: 16,
            n_heads: 2,
            n_layers: 1,
            kernel_size: 3,
            p_dropout: 0.0,
            resblock: ResBlockKind::One,
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3]],
            upsample_rates: vec![4, 4],
            upsample_initial_channel: 8,
            upsample_kernel_sizes: vec![8, 8],
            spk_embed_dim: 2,
            gin_channels: 6,
            sample_rate: 1600,
        }
    }

    fn build(variant: SynthesizerVariant) -> Synthesizer {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Synthesizer::new(tiny_config(), variant, vb).unwrap()
    }

    fn pitch_inputs(frames: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let coarse = Tensor::full(40u32, (1, frames), &device).unwrap();
        let f0 = Tensor::full(150.0f32, (1, frames), &device).unwrap();
        (coarse, f0)
    }

    #[test]
    fn test_leaky_relu() {
        let x = Tensor::new(&[-2.0f32, 0.0, 3.0], &Device::Cpu).unwrap();
        let y = leaky_relu(&x, 0.1).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![-0.2, 0.0, 3.0]);
    }

    #[test]
    fn test_pitch_variant_output_length() {
        let synth = build(SynthesizerVariant::new(ModelVersion::V1, true));
        let feats = Tensor::randn(0.0f32, 1.0, (1, 9, 256), &Device::Cpu).unwrap();
        let (coarse, f0) = pitch_inputs(9);
        let mut noise = NoiseSource::default();
        let wav = synth.infer(&feats, Some((&coarse, &f0)), 0, &mut noise).unwrap();
        assert_eq!(wav.dims(), &[9 * synth.hop_length()]);
        let peak: f32 = wav.abs().unwrap().max(0).unwrap().to_scalar().unwrap();
        assert!(peak <= 1.0);
    }

    #[test]
    fn test_same_seed_same_waveform() {
        let synth = build(SynthesizerVariant::new(ModelVersion::V2, true));
        let feats = Tensor::randn(0.0f32, 1.0, (1, 6, 768), &Device::Cpu).unwrap();
        let (coarse, f0) = pitch_inputs(6);
        let a = synth
            .infer(&feats, Some((&coarse, &f0)), 1, &mut NoiseSource::new(3))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let b = synth
            .infer(&feats, Some((&coarse, &f0)), 1, &mut NoiseSource::new(3))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_pitch_variant() {
        let synth = build(SynthesizerVariant::new(ModelVersion::V2, false));
        let feats = Tensor::randn(0.0f32, 1.0, (1, 5, 768), &Device::Cpu).unwrap();
        let mut noise = NoiseSource::default();
        let wav = synth.infer(&feats, None, 0, &mut noise).unwrap();
        assert_eq!(wav.dims(), &[80]);

        let (coarse, f0) = pitch_inputs(5);
        let err = synth
            .infer(&feats, Some((&coarse, &f0)), 0, &mut noise)
            .unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_speaker_out_of_range() {
        let synth = build(SynthesizerVariant::new(ModelVersion::V1, true));
        let feats = Tensor::randn(0.0f32, 1.0, (1, 4, 256), &Device::Cpu).unwrap();
        let (coarse, f0) = pitch_inputs(4);
        let mut noise = NoiseSource::default();
        let err = synth
            .infer(&feats, Some((&coarse, &f0)), 2, &mut noise)
            .unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Configuration));
    }
}
