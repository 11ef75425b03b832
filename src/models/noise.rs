//! Seeded noise for the synthesis network.
//!
//! The vocoder draws Gaussian noise twice per chunk: once for the prior
//! sample fed through the flow and once for the NSF excitation. Drawing it
//! from a [`NoiseSource`] with a fixed seed makes a conversion run
//! reproducible bit for bit on the same device.

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Seed used when a request does not pick one.
pub const DEFAULT_SEED: u64 = 0x5EED_0F_5EC;

/// PCG-XSH-RR 64/32 generator with Box-Muller normals.
///
/// One source is owned by one conversion run and advanced chunk by chunk,
/// so chunks must be rendered in order for the output to be reproducible.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    state: u64,
    /// Second Box-Muller value kept for the next draw
    spare: Option<f32>,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            state: mix_seed(seed),
            spare: None,
        }
    }

    /// Rewind to the start of the stream for `seed`.
    pub fn reset(&mut self, seed: u64) {
        self.state = mix_seed(seed);
        self.spare = None;
    }

    /// Uniform in [0, 1).
    pub fn uniform(&mut self) -> f32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        let out = xorshifted.rotate_right(rot);

        // 24 high bits keep the result strictly below 1.0
        (out >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Standard normal.
    pub fn normal(&mut self) -> f32 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        // Avoid ln(0)
        let u1 = self.uniform().max(f32::MIN_POSITIVE);
        let u2 = self.uniform();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        self.spare = Some(radius * angle.sin());
        radius * angle.cos()
    }

    /// `n` standard normals.
    pub fn normals(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.normal()).collect()
    }

    /// Tensor of standard normals with the given shape.
    pub fn randn(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let n = shape.iter().product();
        Ok(Tensor::from_vec(self.normals(n), shape, device)?)
    }
}

impl Default for NoiseSource {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

fn mix_seed(seed: u64) -> u64 {
    seed.wrapping_mul(2685821657736338717)
        .wrapping_add(1442695040888963407)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range() {
        let mut noise = NoiseSource::new(7);
        for _ in 0..10_000 {
            let u = noise.uniform();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = NoiseSource::new(12345);
        let mut b = NoiseSource::new(12345);
        assert_eq!(a.normals(64), b.normals(64));
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = NoiseSource::new(12345);
        let mut b = NoiseSource::new(67890);
        assert_ne!(a.normals(16), b.normals(16));
    }

    #[test]
    fn test_reset_rewinds() {
        let mut noise = NoiseSource::new(3);
        let first = noise.normals(10);
        noise.normals(5);
        noise.reset(3);
        assert_eq!(noise.normals(10), first);
    }

    #[test]
    fn test_normal_moments() {
        let mut noise = NoiseSource::default();
        let xs = noise.normals(20_000);
        let mean = xs.iter().sum::<f32>() / xs.len() as f32;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / xs.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }

    #[test]
    fn test_randn_shape() {
        let mut noise = NoiseSource::default();
        let t = noise.randn(&[1, 4, 9], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 4, 9]);
    }
}
