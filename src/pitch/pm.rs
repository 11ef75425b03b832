//! Autocorrelation pitch tracker (Boersma 1993).
//!
//! Hanning-windowed frames, autocorrelation normalised by the window's own
//! autocorrelation, up to 15 candidates per frame plus an unvoiced
//! candidate, and a Viterbi pass penalising octave jumps and voicing
//! changes.

use anyhow::Result;
use num_complex::Complex;
use rustfft::FftPlanner;

use super::{center_pad, PitchEstimator, PitchMethod, F0_MAX, F0_MIN};
use crate::audio::ANALYSIS_SAMPLE_RATE;

const MAX_CANDIDATES: usize = 15;
const PERIODS_PER_WINDOW: f64 = 3.0;

/// Tracker parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PmConfig {
    pub time_step: f64,
    pub pitch_floor: f64,
    pub pitch_ceiling: f64,
    pub voicing_threshold: f64,
    pub silence_threshold: f64,
    pub octave_cost: f64,
    pub octave_jump_cost: f64,
    pub voiced_unvoiced_cost: f64,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            time_step: 0.01,
            pitch_floor: F0_MIN as f64,
            pitch_ceiling: F0_MAX as f64,
            voicing_threshold: 0.6,
            silence_threshold: 0.03,
            octave_cost: 0.01,
            octave_jump_cost: 0.35,
            voiced_unvoiced_cost: 0.14,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    frequency: f64,
    strength: f64,
}

#[derive(Debug, Default, Clone)]
pub struct PmEstimator {
    config: PmConfig,
}

impl PmEstimator {
    pub fn new(config: PmConfig) -> Self {
        Self { config }
    }

    /// Raw track with frames centred in the signal; may be shorter than
    /// the 10 ms grid by a window length.
    pub fn track(&self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        let cfg = &self.config;
        let sr = sample_rate as f64;
        let duration = samples.len() as f64 / sr;
        let window_duration = PERIODS_PER_WINDOW / cfg.pitch_floor;
        if duration < window_duration {
            return Vec::new();
        }

        let min_lag = (sr / cfg.pitch_ceiling).ceil() as usize;
        let max_lag = (sr / cfg.pitch_floor).floor() as usize;
        let mut window_len = (window_duration * sr).round() as usize;
        if window_len % 2 == 0 {
            window_len += 1;
        }
        let half = window_len / 2;

        let window = hanning(window_len);
        let mut correlator = Autocorrelator::new(window_len, max_lag);
        let r_w = correlator.compute(&window);

        let n_frames = ((duration - window_duration) / cfg.time_step + 1e-9).floor() as usize + 1;
        let t1 = (duration - (n_frames - 1) as f64 * cfg.time_step) / 2.0;
        let global_peak = samples.iter().fold(0.0f64, |m, &s| m.max(s.abs() as f64));

        let mut frames = Vec::with_capacity(n_frames);
        let mut buf = vec![0.0f64; window_len];
        for i in 0..n_frames {
            let centre = ((t1 + i as f64 * cfg.time_step) * sr).round() as isize;
            let start = centre - half as isize;
            for (j, b) in buf.iter_mut().enumerate() {
                let idx = start + j as isize;
                *b = if idx >= 0 && (idx as usize) < samples.len() {
                    samples[idx as usize] as f64
                } else {
                    0.0
                };
            }
            let local_peak = buf.iter().fold(0.0f64, |m, s| m.max(s.abs()));
            let intensity = local_peak / (global_peak + 1e-30);

            let mean = buf.iter().sum::<f64>() / window_len as f64;
            let windowed: Vec<f64> = buf.iter().zip(&window).map(|(s, w)| (s - mean) * w).collect();
            let r = correlator.compute(&windowed);

            let mut candidates = vec![Candidate {
                frequency: 0.0,
                strength: cfg.voicing_threshold
                    + (2.0 - intensity / (cfg.silence_threshold / (1.0 + cfg.voicing_threshold)))
                        .max(0.0),
            }];
            for (frequency, strength) in peaks(&r, &r_w, min_lag, max_lag, sr) {
                candidates.push(Candidate {
                    frequency,
                    strength: strength - cfg.octave_cost * (cfg.pitch_floor / frequency).log2(),
                });
            }
            frames.push(candidates);
        }

        viterbi(&frames, cfg)
            .into_iter()
            .map(|f| f as f32)
            .collect()
    }
}

impl PitchEstimator for PmEstimator {
    fn method(&self) -> PitchMethod {
        PitchMethod::Pm
    }

    fn estimate(&self, audio_16k: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        let f0 = self.track(audio_16k, ANALYSIS_SAMPLE_RATE);
        Ok(center_pad(f0, n_frames))
    }
}

fn hanning(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// FFT autocorrelation for lags `0..=max_lag` of fixed-length frames.
struct Autocorrelator {
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
    ifft: std::sync::Arc<dyn rustfft::Fft<f64>>,
    size: usize,
    max_lag: usize,
    buf: Vec<Complex<f64>>,
}

impl Autocorrelator {
    fn new(frame_len: usize, max_lag: usize) -> Self {
        let size = (frame_len + max_lag + 1).next_power_of_two();
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(size),
            ifft: planner.plan_fft_inverse(size),
            size,
            max_lag,
            buf: vec![Complex::new(0.0, 0.0); size],
        }
    }

    fn compute(&mut self, frame: &[f64]) -> Vec<f64> {
        self.buf.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
        for (c, &x) in self.buf.iter_mut().zip(frame) {
            c.re = x;
        }
        self.fft.process(&mut self.buf);
        for c in self.buf.iter_mut() {
            *c = Complex::new(c.norm_sqr(), 0.0);
        }
        self.ifft.process(&mut self.buf);
        let scale = 1.0 / self.size as f64;
        (0..=self.max_lag)
            .map(|lag| if lag < frame.len() { self.buf[lag].re * scale } else { 0.0 })
            .collect()
    }
}

/// Local maxima of the normalised autocorrelation, strongest first.
fn peaks(r: &[f64], r_w: &[f64], min_lag: usize, max_lag: usize, sr: f64) -> Vec<(f64, f64)> {
    if r[0] <= 0.0 {
        return Vec::new();
    }
    let norm: Vec<f64> = (0..=max_lag)
        .map(|lag| {
            if r_w[lag] > 0.0 {
                (r[lag] / r[0]) / (r_w[lag] / r_w[0])
            } else {
                0.0
            }
        })
        .collect();

    let mut out = Vec::new();
    for lag in min_lag.max(1)..max_lag {
        let (prev, cur, next) = (norm[lag - 1], norm[lag], norm[lag + 1]);
        if cur <= prev || cur <= next || cur <= 0.0 {
            continue;
        }
        let denom = prev - 2.0 * cur + next;
        let refined = if denom.abs() > 1e-10 {
            let delta = 0.5 * (prev - next) / denom;
            if delta.abs() < 1.0 {
                lag as f64 + delta
            } else {
                lag as f64
            }
        } else {
            lag as f64
        };
        out.push((sr / refined, cur.min(1.0)));
    }
    out.sort_by(|a, b| b.1.total_cmp(&a.1));
    out.truncate(MAX_CANDIDATES);
    out
}

/// Least-cost candidate path; returns the chosen frequency per frame.
fn viterbi(frames: &[Vec<Candidate>], cfg: &PmConfig) -> Vec<f64> {
    let Some(first) = frames.first() else {
        return Vec::new();
    };
    let correction = 0.01 / cfg.time_step;
    let mut cost: Vec<f64> = first.iter().map(|c| -c.strength).collect();
    let mut back: Vec<Vec<usize>> = vec![vec![0; first.len()]];

    for pair in frames.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let mut next_cost = vec![f64::INFINITY; cur.len()];
        let mut ptr = vec![0usize; cur.len()];
        for (j, cj) in cur.iter().enumerate() {
            for (k, ck) in prev.iter().enumerate() {
                let trans = match (ck.frequency > 0.0, cj.frequency > 0.0) {
                    (false, false) => 0.0,
                    (true, true) => cfg.octave_jump_cost * (cj.frequency / ck.frequency).log2().abs(),
                    _ => cfg.voiced_unvoiced_cost,
                };
                let total = cost[k] + trans * correction - cj.strength;
                if total < next_cost[j] {
                    next_cost[j] = total;
                    ptr[j] = k;
                }
            }
        }
        cost = next_cost;
        back.push(ptr);
    }

    let mut state = cost
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut path = vec![0.0; frames.len()];
    for t in (0..frames.len()).rev() {
        path[t] = frames[t][state].frequency;
        state = back[t][state];
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, seconds: f32) -> Vec<f32> {
        let n = (seconds * 16000.0) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn test_autocorrelation_matches_direct_sum() {
        let x: Vec<f64> = (0..50).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
        let mut ac = Autocorrelator::new(50, 20);
        let fast = ac.compute(&x);
        for lag in 0..=20 {
            let direct: f64 = (0..50 - lag).map(|i| x[i] * x[i + lag]).sum();
            assert!((fast[lag] - direct).abs() < 1e-6, "lag {lag}");
        }
    }

    #[test]
    fn test_tracks_pure_tone() {
        let est = PmEstimator::default();
        let f0 = est.estimate(&tone(220.0, 0.5), 50).unwrap();
        assert_eq!(f0.len(), 50);
        let voiced: Vec<f32> = f0.iter().copied().filter(|&f| f > 0.0).collect();
        assert!(voiced.len() > 35);
        for f in voiced {
            assert!((f - 220.0).abs() < 3.0, "got {f}");
        }
    }

    #[test]
    fn test_silence_is_unvoiced() {
        let est = PmEstimator::default();
        let f0 = est.estimate(&vec![0.0; 8000], 50).unwrap();
        assert!(f0.iter().all(|&f| f == 0.0));
    }

    #[test]
    fn test_too_short_input() {
        let est = PmEstimator::default();
        assert_eq!(est.estimate(&[0.1; 100], 1).unwrap(), vec![0.0]);
    }
}
