//! HiFi-GAN waveform generator with an optional neural source-filter input.
//!
//! The pitch-conditioned variants add a sine excitation, rendered from F0 at
//! the output rate, after every upsampling stage. The plain variant is the
//! same stack without the excitation path.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{
    conv1d, conv1d_no_bias, conv_transpose1d, linear, Conv1d, Conv1dConfig, ConvTranspose1d,
    ConvTranspose1dConfig, Linear, VarBuilder,
};

use super::leaky_relu;
use crate::models::config::{ResBlockKind, SynthesizerConfig};
use crate::models::noise::NoiseSource;

const LRELU_SLOPE: f64 = 0.1;
const SINE_AMP: f32 = 0.1;
const NOISE_STD: f32 = 0.003;

fn dilated(kernel: usize, dilation: usize) -> Conv1dConfig {
    Conv1dConfig {
        padding: (kernel * dilation - dilation) / 2,
        dilation,
        ..Default::default()
    }
}

/// Residual block; kind 1 has a second conv per dilation.
pub struct ResBlock {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock {
    pub fn new(
        kind: ResBlockKind,
        channels: usize,
        kernel: usize,
        dilations: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let first = match kind {
            ResBlockKind::One => "convs1",
            ResBlockKind::Two => "convs",
        };
        let convs1 = dilations
            .iter()
            .enumerate()
            .map(|(j, &d)| {
                conv1d(channels, channels, kernel, dilated(kernel, d), vb.pp(format!("{first}.{j}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let convs2 = match kind {
            ResBlockKind::One => (0..dilations.len())
                .map(|j| {
                    conv1d(channels, channels, kernel, dilated(kernel, 1), vb.pp(format!("convs2.{j}")))
                })
                .collect::<candle_core::Result<Vec<_>>>()?,
            ResBlockKind::Two => Vec::new(),
        };
        Ok(Self { convs1, convs2 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (j, c1) in self.convs1.iter().enumerate() {
            let mut xt = c1.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
            if let Some(c2) = self.convs2.get(j) {
                xt = c2.forward(&leaky_relu(&xt, LRELU_SLOPE)?)?;
            }
            x = (xt + x)?;
        }
        Ok(x)
    }
}

/// Sine excitation from a frame-rate F0 track.
pub struct HarmonicSource {
    l_linear: Linear,
    sample_rate: u32,
}

impl HarmonicSource {
    pub fn new(sample_rate: u32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            l_linear: linear(1, 1, vb.pp("l_linear"))?,
            sample_rate,
        })
    }

    /// Raw excitation: a sine at F0 (amplitude 0.1) plus noise on voiced
    /// samples, noise alone on unvoiced ones. One value per output sample.
    pub fn sine_excitation(&self, f0: &[f32], upp: usize, noise: &mut NoiseSource) -> Vec<f32> {
        let sr = self.sample_rate as f64;
        let mut phase = 0.0f64;
        let mut out = Vec::with_capacity(f0.len() * upp);
        for &f in f0 {
            let voiced = f > 0.0;
            let step = (f as f64 / sr).rem_euclid(1.0);
            for _ in 0..upp {
                phase = (phase + step).fract();
                let n = noise.normal();
                let sample = if voiced {
                    (2.0 * std::f64::consts::PI * phase).sin() as f32 * SINE_AMP + NOISE_STD * n
                } else {
                    SINE_AMP / 3.0 * n
                };
                out.push(sample);
            }
        }
        out
    }

    /// `[b, frames]` F0 -> `[b, 1, frames * upp]` merged source.
    pub fn forward(
        &self,
        f0: &Tensor,
        upp: usize,
        noise: &mut NoiseSource,
        device: &Device,
    ) -> Result<Tensor> {
        let rows = f0.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        let batch = rows.len();
        let len = rows.first().map_or(0, |r| r.len() * upp);
        let flat: Vec<f32> = rows
            .iter()
            .flat_map(|row| self.sine_excitation(row, upp, noise))
            .collect();
        let sines = Tensor::from_vec(flat, (batch, len, 1), device)?;
        let merged = self.l_linear.forward(&sines)?.tanh()?;
        Ok(merged.transpose(1, 2)?.contiguous()?)
    }
}

pub struct Generator {
    conv_pre: Conv1d,
    cond: Option<Conv1d>,
    ups: Vec<ConvTranspose1d>,
    noise_convs: Vec<Conv1d>,
    resblocks: Vec<ResBlock>,
    conv_post: Conv1d,
    num_kernels: usize,
    source: Option<HarmonicSource>,
    upp: usize,
}

impl Generator {
    pub fn new(config: &SynthesizerConfig, nsf: bool, vb: VarBuilder) -> Result<Self> {
        let uic = config.upsample_initial_channel;
        let conv_pre = conv1d(
            config.inter_channels,
            uic,
            7,
            Conv1dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv_pre"),
        )?;
        let cond = if config.gin_channels > 0 {
            Some(conv1d(config.gin_channels, uic, 1, Default::default(), vb.pp("cond")))
                .transpose()?
        } else {
            None
        };

        let rates = &config.upsample_rates;
        let mut ups = Vec::with_capacity(rates.len());
        let mut noise_convs = Vec::new();
        let mut resblocks = Vec::new();
        for (i, (&u, &k)) in rates.iter().zip(&config.upsample_kernel_sizes).enumerate() {
            let c_in = uic >> i;
            let c_out = uic >> (i + 1);
            let up_cfg = ConvTranspose1dConfig {
                padding: (k - u) / 2,
                output_padding: 0,
                stride: u,
                dilation: 1,
                groups: 1,
            };
            ups.push(conv_transpose1d(c_in, c_out, k, up_cfg, vb.pp(format!("ups.{i}")))?);

            if nsf {
                let stride_f0: usize = rates[i + 1..].iter().product();
                let noise_conv = if i + 1 < rates.len() {
                    let cfg = Conv1dConfig {
                        stride: stride_f0,
                        padding: stride_f0 / 2,
                        ..Default::default()
                    };
                    conv1d(1, c_out, 2 * stride_f0, cfg, vb.pp(format!("noise_convs.{i}")))?
                } else {
                    conv1d(1, c_out, 1, Default::default(), vb.pp(format!("noise_convs.{i}")))?
                };
                noise_convs.push(noise_conv);
            }

            for (k_res, dilations) in config
                .resblock_kernel_sizes
                .iter()
                .zip(&config.resblock_dilation_sizes)
            {
                let idx = resblocks.len();
                resblocks.push(ResBlock::new(
                    config.resblock,
                    c_out,
                    *k_res,
                    dilations,
                    vb.pp(format!("resblocks.{idx}")),
                )?);
            }
        }

        let last = uic >> rates.len();
        let conv_post = conv1d_no_bias(
            last,
            1,
            7,
            Conv1dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv_post"),
        )?;
        let source = if nsf {
            Some(HarmonicSource::new(config.sample_rate, vb.pp("m_source"))?)
        } else {
            None
        };

        Ok(Self {
            conv_pre,
            cond,
            ups,
            noise_convs,
            resblocks,
            conv_post,
            num_kernels: config.resblock_kernel_sizes.len(),
            source,
            upp: config.hop_length(),
        })
    }

    pub fn is_nsf(&self) -> bool {
        self.source.is_some()
    }

    /// Output samples per input frame.
    pub fn upsample_factor(&self) -> usize {
        self.upp
    }

    /// `x: [b, inter, t]`, `g: [b, gin, 1]`, `f0: [b, t]` (pitch variants).
    ///
    /// Returns `[b, 1, t * upsample_factor]` in [-1, 1].
    pub fn forward(
        &self,
        x: &Tensor,
        g: Option<&Tensor>,
        f0: Option<&Tensor>,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let har = match (&self.source, f0) {
            (Some(source), Some(f0)) => Some(source.forward(f0, self.upp, noise, x.device())?),
            (Some(_), None) => anyhow::bail!("pitch-conditioned generator needs an F0 track"),
            _ => None,
        };

        let mut x = self.conv_pre.forward(x)?;
        if let (Some(cond), Some(g)) = (&self.cond, g) {
            x = x.broadcast_add(&cond.forward(g)?)?;
        }

        for (i, up) in self.ups.iter().enumerate() {
            x = up.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
            if let Some(har) = &har {
                x = (x + self.noise_convs[i].forward(har)?)?;
            }
            let blocks = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut xs = blocks[0].forward(&x)?;
            for block in &blocks[1..] {
                xs = (xs + block.forward(&x)?)?;
            }
            x = (xs / self.num_kernels as f64)?;
        }

        let x = leaky_relu(&x, 0.01)?;
        Ok(self.conv_post.forward(&x)?.tanh()?)
    }
}
