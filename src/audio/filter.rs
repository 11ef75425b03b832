//! Zero-phase Butterworth high-pass applied to input speech before analysis.
//!
//! The filter is a 5th-order Butterworth at 48 Hz, realised as two biquads
//! plus one first-order section, and run forward then backward over an
//! odd-extended signal so that phase is preserved.

use anyhow::{anyhow, Result};
use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type};

/// Cut-off of the rumble filter.
pub const HIGH_PASS_HZ: f64 = 48.0;

/// Butterworth order.
pub const HIGH_PASS_ORDER: usize = 5;

/// Cascade of second-order (and at most one first-order) sections.
pub struct ButterworthHighPass {
    sections: Vec<DirectForm1<f64>>,
}

impl ButterworthHighPass {
    pub fn new(order: usize, cutoff_hz: f64, sample_rate: u32) -> Result<Self> {
        let fs = sample_rate as f64;
        if order == 0 || cutoff_hz <= 0.0 || cutoff_hz >= fs / 2.0 {
            return Err(anyhow!(
                "invalid high-pass design: order {order}, cutoff {cutoff_hz} Hz at {fs} Hz"
            ));
        }

        let mut sections = Vec::with_capacity(order / 2 + 1);
        for k in 1..=order / 2 {
            let theta = (2 * k - 1) as f64 * std::f64::consts::PI / (2 * order) as f64;
            let q = 1.0 / (2.0 * theta.cos());
            let coeffs =
                Coefficients::<f64>::from_params(Type::HighPass, fs.hz(), cutoff_hz.hz(), q)
                    .map_err(|e| anyhow!("failed to design high-pass section: {e:?}"))?;
            sections.push(DirectForm1::<f64>::new(coeffs));
        }
        if order % 2 == 1 {
            sections.push(DirectForm1::<f64>::new(first_order_high_pass(fs, cutoff_hz)));
        }

        Ok(Self { sections })
    }

    /// The 48 Hz / 5th-order design used on 16 kHz analysis audio.
    pub fn rumble(sample_rate: u32) -> Result<Self> {
        Self::new(HIGH_PASS_ORDER, HIGH_PASS_HZ, sample_rate)
    }

    /// Forward-backward filtering with odd edge extension.
    pub fn filtfilt(&mut self, samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() {
            return Vec::new();
        }
        let pad = (3 * (2 * self.sections.len() + 1)).min(samples.len() - 1);
        let mut signal = odd_extend(samples, pad);

        self.run_cascade(&mut signal);
        signal.reverse();
        self.run_cascade(&mut signal);
        signal.reverse();

        signal[pad..pad + samples.len()]
            .iter()
            .map(|&x| x as f32)
            .collect()
    }

    fn run_cascade(&mut self, signal: &mut [f64]) {
        for section in &mut self.sections {
            section.reset_state();
            signal.iter_mut().for_each(|x| *x = section.run(*x));
        }
    }
}

/// Bilinear-transform first-order high-pass.
fn first_order_high_pass(fs: f64, cutoff_hz: f64) -> Coefficients<f64> {
    let k = (std::f64::consts::PI * cutoff_hz / fs).tan();
    let norm = 1.0 / (1.0 + k);
    Coefficients {
        a1: (k - 1.0) * norm,
        a2: 0.0,
        b0: norm,
        b1: -norm,
        b2: 0.0,
    }
}

/// `2·x[0] − x[pad..1]` before, `2·x[n−1] − x[n−2..n−1−pad]` after.
fn odd_extend(samples: &[f32], pad: usize) -> Vec<f64> {
    let n = samples.len();
    let first = samples[0] as f64;
    let last = samples[n - 1] as f64;
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - samples[i] as f64));
    out.extend(samples.iter().map(|&x| x as f64));
    out.extend((1..=pad).map(|i| 2.0 * last - samples[n - 1 - i] as f64));
    out
}

/// Apply the rumble filter in one call.
pub fn high_pass(samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
    Ok(ButterworthHighPass::rumble(sample_rate)?.filtfilt(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn rms(x: &[f32]) -> f32 {
        (x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32).sqrt()
    }

    #[test]
    fn test_section_count() {
        let hp = ButterworthHighPass::rumble(16000).unwrap();
        assert_eq!(hp.sections.len(), 3);
    }

    #[test]
    fn test_invalid_design() {
        assert!(ButterworthHighPass::new(5, 9000.0, 16000).is_err());
        assert!(ButterworthHighPass::new(0, 48.0, 16000).is_err());
    }

    #[test]
    fn test_removes_dc() {
        let out = high_pass(&vec![0.5f32; 16000], 16000).unwrap();
        assert_eq!(out.len(), 16000);
        assert!(rms(&out[4000..12000]) < 1e-3);
    }

    #[test]
    fn test_passes_speech_band_with_zero_phase() {
        let input: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 300.0 * i as f32 / 16000.0).sin())
            .collect();
        let out = high_pass(&input, 16000).unwrap();
        let mid = 4000..12000;
        assert!((rms(&out[mid.clone()]) - rms(&input[mid.clone()])).abs() < 0.02);
        // Zero phase: the waveform lines up sample for sample
        let err = out[mid.clone()]
            .iter()
            .zip(&input[mid])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(err < 0.05, "max deviation {err}");
    }

    #[test]
    fn test_attenuates_rumble() {
        let input: Vec<f32> = (0..32000)
            .map(|i| (2.0 * PI * 15.0 * i as f32 / 16000.0).sin())
            .collect();
        let out = high_pass(&input, 16000).unwrap();
        assert!(rms(&out[8000..24000]) < 0.05 * rms(&input[8000..24000]));
    }

    #[test]
    fn test_short_input() {
        assert_eq!(high_pass(&[0.3], 16000).unwrap().len(), 1);
        assert!(high_pass(&[], 16000).unwrap().is_empty());
    }
}
