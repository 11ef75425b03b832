//! Mel-spectrogram front-end
//!
//! STFT + triangular filterbank matching `librosa.filters.mel` (Slaney area
//! normalisation) with either the HTK or the Slaney mel scale. The RMVPE pitch
//! network consumes the log-magnitude variant produced by
//! [`MelSpectrogram::log_magnitude_tensor`].

use anyhow::Result;
use candle_core::{Device, Tensor};
use num_complex::Complex;
use rustfft::{num_complex::Complex as FftComplex, FftPlanner};
use std::f32::consts::PI;

/// Configuration for mel spectrogram computation
#[derive(Debug, Clone)]
pub struct MelConfig {
    /// Sample rate of input audio
    pub sample_rate: u32,
    /// FFT window size
    pub n_fft: usize,
    /// Hop length between frames
    pub hop_length: usize,
    /// Window length (defaults to n_fft)
    pub win_length: Option<usize>,
    /// Number of mel bands
    pub n_mels: usize,
    /// Minimum frequency for mel filterbank
    pub fmin: f32,
    /// Maximum frequency for mel filterbank (defaults to sample_rate / 2)
    pub fmax: Option<f32>,
    /// HTK mel scale instead of Slaney
    pub htk: bool,
    /// Reflect-pad `n_fft / 2` on both sides (torch `center=True`)
    pub center: bool,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self::rmvpe()
    }
}

impl MelConfig {
    /// Front-end of the RMVPE pitch network.
    pub fn rmvpe() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 1024,
            hop_length: 160,
            win_length: Some(1024),
            n_mels: 128,
            fmin: 30.0,
            fmax: Some(8000.0),
            htk: true,
            center: true,
        }
    }
}

/// Mel-spectrogram extractor
pub struct MelSpectrogram {
    config: MelConfig,
    /// `[n_mels][n_fft / 2 + 1]`
    mel_basis: Vec<Vec<f32>>,
    window: Vec<f32>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let win_length = config.win_length.unwrap_or(config.n_fft);
        let fmax = config.fmax.unwrap_or(config.sample_rate as f32 / 2.0);

        let mel_basis = create_mel_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_mels,
            config.fmin,
            fmax,
            config.htk,
        );
        let window = hann_window(win_length);

        Self {
            config,
            mel_basis,
            window,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of STFT frames produced for `n_samples` input samples.
    pub fn n_frames(&self, n_samples: usize) -> usize {
        let padded = if self.config.center {
            n_samples + self.config.n_fft
        } else {
            n_samples
        };
        if padded < self.config.n_fft {
            0
        } else {
            (padded - self.config.n_fft) / self.config.hop_length + 1
        }
    }

    /// Power mel spectrogram, `[frames][n_mels]`.
    pub fn compute(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let power: Vec<Vec<f32>> = self
            .stft(samples)
            .iter()
            .map(|frame| frame.iter().map(|c| c.norm_sqr()).collect())
            .collect();
        self.apply_mel_filterbank(&power)
    }

    /// `log(clamp(mel(|STFT|), 1e-5))` as a `[n_mels, frames]` tensor.
    pub fn log_magnitude_tensor(&self, samples: &[f32], device: &Device) -> Result<Tensor> {
        let magnitude: Vec<Vec<f32>> = self
            .stft(samples)
            .iter()
            .map(|frame| frame.iter().map(|c| c.norm()).collect())
            .collect();
        let mel = self.apply_mel_filterbank(&magnitude);

        let n_frames = mel.len();
        let n_mels = self.config.n_mels;
        let flat: Vec<f32> = mel
            .into_iter()
            .flat_map(|frame| frame.into_iter().map(|v| v.max(1e-5).ln()))
            .collect();

        Ok(Tensor::from_vec(flat, (n_frames, n_mels), device)?
            .t()?
            .contiguous()?)
    }

    fn stft(&self, samples: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let win_length = self.window.len();
        // torch centres a shorter window inside the FFT frame
        let win_offset = (n_fft - win_length.min(n_fft)) / 2;

        let padded = if self.config.center {
            reflect_pad(samples, n_fft / 2)
        } else {
            samples.to_vec()
        };
        if padded.len() < n_fft {
            return Vec::new();
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);

        let n_frames = (padded.len() - n_fft) / hop + 1;
        let mut result = Vec::with_capacity(n_frames);
        let mut buffer = vec![FftComplex::new(0.0f32, 0.0); n_fft];

        for i in 0..n_frames {
            let start = i * hop;
            for (j, slot) in buffer.iter_mut().enumerate() {
                let w = j
                    .checked_sub(win_offset)
                    .and_then(|k| self.window.get(k))
                    .copied()
                    .unwrap_or(0.0);
                *slot = FftComplex::new(padded[start + j] * w, 0.0);
            }
            fft.process(&mut buffer);
            result.push(
                buffer
                    .iter()
                    .take(n_fft / 2 + 1)
                    .map(|c| Complex::new(c.re, c.im))
                    .collect(),
            );
        }

        result
    }

    fn apply_mel_filterbank(&self, spec: &[Vec<f32>]) -> Vec<Vec<f32>> {
        spec.iter()
            .map(|frame| {
                self.mel_basis
                    .iter()
                    .map(|filter| filter.iter().zip(frame.iter()).map(|(f, p)| f * p).sum())
                    .collect()
            })
            .collect()
    }
}

/// Mirror `pad` samples at both ends, excluding the edge sample (numpy `reflect`).
///
/// The reflection repeats when the signal is shorter than the pad.
pub fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    if n == 0 {
        return vec![0.0; 2 * pad];
    }
    let at = |i: isize| -> f32 {
        if n == 1 {
            return samples[0];
        }
        let period = 2 * (n as isize - 1);
        let mut k = i.rem_euclid(period);
        if k >= n as isize {
            k = period - k;
        }
        samples[k as usize]
    };
    (-(pad as isize)..(n + pad) as isize).map(at).collect()
}

fn hz_to_mel(f: f32, htk: bool) -> f32 {
    if htk {
        return 2595.0 * (1.0 + f / 700.0).log10();
    }
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_74; // ln(6.4) / 27
    if f < MIN_LOG_HZ {
        f / F_SP
    } else {
        MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(m: f32, htk: bool) -> f32 {
    if htk {
        return 700.0 * (10f32.powf(m / 2595.0) - 1.0);
    }
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_74;
    if m < MIN_LOG_MEL {
        m * F_SP
    } else {
        MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// Triangular filterbank with Slaney area normalisation.
fn create_mel_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
    htk: bool,
) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;

    let mel_min = hz_to_mel(fmin, htk);
    let mel_max = hz_to_mel(fmax, htk);
    let hz_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .map(|m| mel_to_hz(m, htk))
        .collect();

    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| i as f32 * sample_rate as f32 / n_fft as f32)
        .collect();

    let mut filterbank = vec![vec![0.0f32; n_freqs]; n_mels];
    for (i, filter) in filterbank.iter_mut().enumerate() {
        let (lower, center, upper) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
        for (j, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower).max(f32::EPSILON);
            let falling = (upper - freq) / (upper - center).max(f32::EPSILON);
            filter[j] = rising.min(falling).max(0.0);
        }
        let enorm = 2.0 / (upper - lower).max(f32::EPSILON);
        for v in filter.iter_mut() {
            *v *= enorm;
        }
    }

    filterbank
}

/// Periodic Hann window (torch default).
fn hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / length as f32).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmvpe_config() {
        let config = MelConfig::rmvpe();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.n_fft, 1024);
        assert_eq!(config.hop_length, 160);
        assert_eq!(config.n_mels, 128);
        assert!(config.htk);
    }

    #[test]
    fn test_reflect_pad() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_reflect_pad_longer_than_signal() {
        let padded = reflect_pad(&[1.0, 2.0], 3);
        assert_eq!(padded.len(), 8);
        assert_eq!(&padded[3..5], &[1.0, 2.0]);
    }

    #[test]
    fn test_hann_window_periodic() {
        let window = hann_window(4);
        assert!((window[0] - 0.0).abs() < 1e-6);
        assert!((window[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_htk_scale_roundtrip() {
        for hz in [30.0f32, 440.0, 1000.0, 8000.0] {
            let back = mel_to_hz(hz_to_mel(hz, true), true);
            assert!((back - hz).abs() / hz < 1e-4);
        }
    }

    #[test]
    fn test_filterbank_shape_and_sign() {
        let mel = MelSpectrogram::new(MelConfig::rmvpe());
        assert_eq!(mel.mel_basis.len(), 128);
        assert_eq!(mel.mel_basis[0].len(), 513);
        assert!(mel.mel_basis.iter().flatten().all(|&v| v >= 0.0));
        // Bins above fmax stay empty
        assert!(mel.mel_basis.iter().all(|f| f[512] < 1e-3));
    }

    #[test]
    fn test_centered_frame_count() {
        let mel = MelSpectrogram::new(MelConfig::rmvpe());
        assert_eq!(mel.n_frames(16000), 101);
        let tensor = mel
            .log_magnitude_tensor(&vec![0.0f32; 16000], &Device::Cpu)
            .unwrap();
        assert_eq!(tensor.dims(), &[128, 101]);
    }

    #[test]
    fn test_log_floor_on_silence() {
        let mel = MelSpectrogram::new(MelConfig::rmvpe());
        let tensor = mel
            .log_magnitude_tensor(&vec![0.0f32; 3200], &Device::Cpu)
            .unwrap();
        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        let floor = 1e-5f32.ln();
        assert!(values.iter().all(|&v| (v - floor).abs() < 1e-4));
    }

    #[test]
    fn test_sine_energy_lands_in_matching_band() {
        let mel = MelSpectrogram::new(MelConfig::rmvpe());
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let frames = mel.compute(&samples);
        let mid = &frames[frames.len() / 2];
        let loudest = mid
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // 440 Hz sits in the lower fifth of a 30-8000 Hz HTK scale
        assert!(loudest > 5 && loudest < 40, "peak band {loudest}");
    }
}
