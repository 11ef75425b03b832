//! Mean-only residual coupling flow, run in the reverse (sampling) direction.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

/// Coupling layers in the flow (each followed by a channel flip).
pub const N_FLOWS: usize = 4;
const WN_KERNEL: usize = 5;
const WN_LAYERS: usize = 3;

/// Gated dilated conv stack conditioned on the speaker embedding.
pub struct WaveNet {
    in_layers: Vec<Conv1d>,
    res_skip_layers: Vec<Conv1d>,
    cond_layer: Option<Conv1d>,
    hidden: usize,
}

impl WaveNet {
    pub fn new(
        hidden: usize,
        kernel_size: usize,
        n_layers: usize,
        gin_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cond_layer = if gin_channels > 0 {
            Some(conv1d(
                gin_channels,
                2 * hidden * n_layers,
                1,
                Default::default(),
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };

        let mut in_layers = Vec::with_capacity(n_layers);
        let mut res_skip_layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            // dilation rate 1 throughout
            let cfg = Conv1dConfig {
                padding: (kernel_size - 1) / 2,
                ..Default::default()
            };
            in_layers.push(conv1d(
                hidden,
                2 * hidden,
                kernel_size,
                cfg,
                vb.pp(format!("in_layers.{i}")),
            )?);
            let res_skip = if i + 1 < n_layers { 2 * hidden } else { hidden };
            res_skip_layers.push(conv1d(
                hidden,
                res_skip,
                1,
                Default::default(),
                vb.pp(format!("res_skip_layers.{i}")),
            )?);
        }

        Ok(Self {
            in_layers,
            res_skip_layers,
            cond_layer,
            hidden,
        })
    }

    /// `x: [b, hidden, t]`, `g: [b, gin, 1]`
    pub fn forward(&self, x: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let h = self.hidden;
        let g = match (&self.cond_layer, g) {
            (Some(layer), Some(g)) => Some(layer.forward(g)?),
            _ => None,
        };

        let mut x = x.clone();
        let mut output = x.zeros_like()?;
        let n_layers = self.in_layers.len();
        for i in 0..n_layers {
            let mut x_in = self.in_layers[i].forward(&x)?;
            if let Some(g) = &g {
                x_in = x_in.broadcast_add(&g.narrow(1, i * 2 * h, 2 * h)?)?;
            }
            let acts = (x_in.narrow(1, 0, h)?.tanh()?
                * candle_nn::ops::sigmoid(&x_in.narrow(1, h, h)?)?)?;
            let res_skip = self.res_skip_layers[i].forward(&acts)?;
            if i + 1 < n_layers {
                x = (x + res_skip.narrow(1, 0, h)?)?;
                output = (output + res_skip.narrow(1, h, h)?)?;
            } else {
                output = (output + res_skip)?;
            }
        }
        Ok(output)
    }
}

pub struct CouplingLayer {
    pre: Conv1d,
    enc: WaveNet,
    post: Conv1d,
    half: usize,
}

impl CouplingLayer {
    pub fn new(channels: usize, hidden: usize, gin_channels: usize, vb: VarBuilder) -> Result<Self> {
        let half = channels / 2;
        Ok(Self {
            pre: conv1d(half, hidden, 1, Default::default(), vb.pp("pre"))?,
            enc: WaveNet::new(hidden, WN_KERNEL, WN_LAYERS, gin_channels, vb.pp("enc"))?,
            post: conv1d(hidden, half, 1, Default::default(), vb.pp("post"))?,
            half,
        })
    }

    /// Inverse of `x1 <- x1 + m(x0)`.
    pub fn reverse(&self, x: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let x0 = x.narrow(1, 0, self.half)?;
        let x1 = x.narrow(1, self.half, self.half)?;
        let h = self.pre.forward(&x0)?;
        let h = self.enc.forward(&h, g)?;
        let m = self.post.forward(&h)?;
        let x1 = (x1 - m)?;
        Ok(Tensor::cat(&[&x0, &x1], 1)?)
    }
}

/// Alternating coupling layers and channel flips.
pub struct CouplingFlow {
    layers: Vec<CouplingLayer>,
}

impl CouplingFlow {
    pub fn new(channels: usize, hidden: usize, gin_channels: usize, vb: VarBuilder) -> Result<Self> {
        // flips sit at the odd indices of the checkpoint's module list
        let layers = (0..N_FLOWS)
            .map(|i| CouplingLayer::new(channels, hidden, gin_channels, vb.pp(format!("flows.{}", 2 * i))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn reverse(&self, z: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut x = z.clone();
        for layer in self.layers.iter().rev() {
            x = flip_channels(&x)?;
            x = layer.reverse(&x, g)?;
        }
        Ok(x)
    }
}

fn flip_channels(x: &Tensor) -> Result<Tensor> {
    let channels = x.dim(1)?;
    let idx: Vec<u32> = (0..channels as u32).rev().collect();
    let idx = Tensor::new(idx.as_slice(), x.device())?;
    Ok(x.index_select(&idx, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_flip_channels() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32], [2.0], [3.0]]], &device).unwrap();
        let flipped = flip_channels(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flipped, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_reverse_shape_with_speaker() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let flow = CouplingFlow::new(4, 8, 6, vb).unwrap();
        let z = Tensor::randn(0.0f32, 1.0, (1, 4, 11), &device).unwrap();
        let g = Tensor::randn(0.0f32, 1.0, (1, 6, 1), &device).unwrap();
        assert_eq!(flow.reverse(&z, Some(&g)).unwrap().dims(), &[1, 4, 11]);
    }

    #[test]
    fn test_zero_post_is_identity_up_to_flips() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = CouplingLayer::new(4, 8, 0, vb).unwrap();
        // Zero the post projection so the coupling adds nothing
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.starts_with("post") {
                var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
            }
        }
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 5), &device).unwrap();
        let y = layer.reverse(&x, None).unwrap();
        let diff: f32 = (y - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }
}
