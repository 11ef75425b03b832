//! Sample-rate conversion using rubato.
//!
//! Output length is always `round(len * target / source)`: the resampler's
//! group delay is skipped and the tail is flushed with silence, so chunk and
//! file durations survive a rate change unchanged.

use anyhow::{Context, Result};
use rubato::{
    audioadapter::Adapter, Async, FixedAsync, PolynomialDegree, Resampler as RubatoResampler,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::AudioBuffer;

const CHUNK_SIZE: usize = 1024;

/// Resampling quality preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResampleQuality {
    /// Cubic polynomial interpolation
    Fast,
    /// Sinc, 128 taps
    #[default]
    Normal,
    /// Sinc, 256 taps
    High,
}

/// Audio resampler
pub struct Resampler {
    quality: ResampleQuality,
}

impl Resampler {
    pub fn new(quality: ResampleQuality) -> Self {
        Self { quality }
    }

    /// Resample `audio` to `target_rate`.
    pub fn resample(&self, audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
        if audio.sample_rate == target_rate {
            return Ok(audio.clone());
        }
        anyhow::ensure!(
            audio.sample_rate > 0 && target_rate > 0,
            "cannot resample between {} Hz and {} Hz",
            audio.sample_rate,
            target_rate
        );

        let expected = expected_len(audio.len(), audio.sample_rate, target_rate);
        if audio.is_empty() {
            return Ok(AudioBuffer::new(Vec::new(), target_rate));
        }

        let ratio = target_rate as f64 / audio.sample_rate as f64;
        let samples = match self.quality {
            ResampleQuality::Fast => {
                let mut resampler = Async::<f32>::new_poly(
                    ratio,
                    1.0,
                    PolynomialDegree::Cubic,
                    CHUNK_SIZE,
                    1,
                    FixedAsync::Input,
                )
                .context("Failed to create polynomial resampler")?;
                run(&mut resampler, &audio.samples, expected)?
            }
            ResampleQuality::Normal | ResampleQuality::High => {
                let taps = if self.quality == ResampleQuality::High {
                    256
                } else {
                    128
                };
                let params = SincInterpolationParameters {
                    sinc_len: taps,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: taps,
                    window: WindowFunction::BlackmanHarris2,
                };
                let mut resampler = Async::<f32>::new_sinc(
                    ratio,
                    1.0,
                    &params,
                    CHUNK_SIZE,
                    1,
                    FixedAsync::Input,
                )
                .context("Failed to create sinc resampler")?;
                run(&mut resampler, &audio.samples, expected)?
            }
        };

        Ok(AudioBuffer::new(samples, target_rate))
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(ResampleQuality::Normal)
    }
}

/// Number of output samples for `len` input samples.
pub fn expected_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    ((len as f64) * to_rate as f64 / from_rate as f64).round() as usize
}

/// Feed fixed-size chunks, then silence until delay + expected frames are out.
fn run<R: RubatoResampler<f32>>(
    resampler: &mut R,
    samples: &[f32],
    expected: usize,
) -> Result<Vec<f32>> {
    use audioadapter_buffers::direct::SequentialSliceOfVecs;

    let delay = resampler.output_delay();
    let wanted = delay + expected;
    let mut output = Vec::with_capacity(wanted + CHUNK_SIZE);
    let mut pos = 0;

    while output.len() < wanted {
        let mut block = vec![0.0f32; CHUNK_SIZE];
        if pos < samples.len() {
            let end = (pos + CHUNK_SIZE).min(samples.len());
            block[..end - pos].copy_from_slice(&samples[pos..end]);
        }
        pos += CHUNK_SIZE;

        let blocks = vec![block];
        let input = SequentialSliceOfVecs::new(&blocks, 1, CHUNK_SIZE)
            .context("Failed to create input adapter")?;
        let result = resampler
            .process(&input, 0, None)
            .context("Resampling failed")?;
        for i in 0..result.frames() {
            output.push(result.read_sample(0, i).unwrap_or(0.0));
        }

        // A pathological ratio could otherwise spin forever on silence.
        anyhow::ensure!(
            pos <= samples.len() + 64 * CHUNK_SIZE + wanted,
            "resampler did not produce enough output"
        );
    }

    Ok(output[delay..delay + expected].to_vec())
}

/// Resample with the default quality.
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    Resampler::default().resample(audio, target_rate)
}

/// Resample to the 16 kHz analysis rate used by the encoder and pitch models.
pub fn resample_to_16k(audio: &AudioBuffer) -> Result<AudioBuffer> {
    resample(audio, super::ANALYSIS_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_expected_len() {
        assert_eq!(expected_len(16000, 16000, 40000), 40000);
        assert_eq!(expected_len(44100, 44100, 16000), 16000);
        assert_eq!(expected_len(3, 16000, 48000), 9);
    }

    #[test]
    fn test_no_resample_needed() {
        let audio = AudioBuffer::new(vec![0.0; 1000], 16000);
        let result = resample(&audio, 16000).unwrap();
        assert_eq!(result.len(), audio.len());
    }

    #[test]
    fn test_exact_length_downsample() {
        let audio = AudioBuffer::new(vec![0.0; 44100], 44100);
        let result = resample(&audio, 16000).unwrap();
        assert_eq!(result.sample_rate, 16000);
        assert_eq!(result.len(), 16000);
    }

    #[test]
    fn test_exact_length_upsample() {
        let audio = AudioBuffer::new(vec![0.0; 1601], 16000);
        let result = resample(&audio, 48000).unwrap();
        assert_eq!(result.len(), 4803);
    }

    #[test]
    fn test_fast_quality_length() {
        let resampler = Resampler::new(ResampleQuality::Fast);
        let audio = AudioBuffer::new(vec![0.0; 2048], 48000);
        let result = resampler.resample(&audio, 16000).unwrap();
        assert_eq!(result.len(), 683);
    }

    #[test]
    fn test_empty_audio() {
        let audio = AudioBuffer::new(vec![], 16000);
        let result = resample(&audio, 40000).unwrap();
        assert_eq!(result.sample_rate, 40000);
        assert!(result.is_empty());
    }

    #[test]
    fn test_sine_survives_without_leading_delay() {
        let freq = 200.0;
        let audio = AudioBuffer::new(
            (0..48000)
                .map(|i| (2.0 * PI * freq * i as f32 / 48000.0).sin())
                .collect(),
            48000,
        );
        let result = resample(&audio, 16000).unwrap();
        assert_eq!(result.len(), 16000);
        assert!(result.peak() > 0.9);
        // Leading delay is trimmed, so the first samples are not silence padding.
        assert!(result.samples[10..40].iter().any(|s| s.abs() > 0.1));
    }
}
