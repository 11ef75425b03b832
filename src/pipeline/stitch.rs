//! Reassembling chunk outputs into one waveform.

use anyhow::Result;

use super::synthesis::RenderedChunk;
use crate::audio::{mix_rms, resample, AudioBuffer, ANALYSIS_SAMPLE_RATE};

/// Appends rendered chunks, cross-fading the shared samples linearly.
#[derive(Debug, Clone)]
pub struct Stitcher {
    samples: Vec<f32>,
    sample_rate: u32,
    chunks: usize,
}

impl Stitcher {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            chunks: 0,
        }
    }

    pub fn with_capacity(sample_rate: u32, capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            ..Self::new(sample_rate)
        }
    }

    pub fn push(&mut self, chunk: &RenderedChunk) {
        crossfade_append(&mut self.samples, &chunk.samples, chunk.overlap);
        self.chunks += 1;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn finish(self) -> AudioBuffer {
        AudioBuffer::new(self.samples, self.sample_rate)
    }
}

/// Append `src` to `dst`; the first `overlap` samples of `src` fade in over
/// the last `overlap` samples of `dst`.
pub fn crossfade_append(dst: &mut Vec<f32>, src: &[f32], overlap: usize) {
    let overlap = overlap.min(dst.len()).min(src.len());
    let base = dst.len() - overlap;
    for (j, &incoming) in src[..overlap].iter().enumerate() {
        let w = (j + 1) as f32 / (overlap + 1) as f32;
        let out = &mut dst[base + j];
        *out = *out * (1.0 - w) + incoming * w;
    }
    dst.extend_from_slice(&src[overlap..]);
}

/// Loudness matching, optional resampling and peak limiting.
///
/// `input_16k` is the pre-processed input the envelope is taken from.
/// `resample_sr` of 0 keeps the synthesis rate.
pub fn finalize(
    mut audio: AudioBuffer,
    input_16k: &[f32],
    rms_mix_rate: f32,
    resample_sr: u32,
) -> Result<AudioBuffer> {
    if rms_mix_rate < 1.0 {
        let rate = audio.sample_rate;
        mix_rms(input_16k, ANALYSIS_SAMPLE_RATE, &mut audio.samples, rate, rms_mix_rate);
    }
    if resample_sr >= ANALYSIS_SAMPLE_RATE && resample_sr != audio.sample_rate {
        tracing::debug!(from = audio.sample_rate, to = resample_sr, "resampling output");
        audio = resample(&audio, resample_sr)?;
    }
    audio.limit_output_peak();
    Ok(audio)
}
