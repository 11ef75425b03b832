//! Per-chunk synthesis: features, pitch, retrieval, protect, vocoder.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::time::{Duration, Instant};

use super::chunker::AudioChunk;
use super::context::ChunkPlan;
use super::features::{to_frame_grid, ContentEncoder};
use super::retrieval::{blend, NeighborSearch};
use crate::audio::ANALYSIS_SAMPLE_RATE;
use crate::error::VcError;
use crate::models::config::ModelVersion;
use crate::models::noise::NoiseSource;
use crate::models::synthesizer::Synthesizer;
use crate::pitch::{PitchContour, PitchEstimator};

/// Waveform generator behind the pipeline.
pub trait Vocoder: Send + Sync {
    /// `feats` is `[1, frames, dim]` on the 10 ms grid; `pitch` is
    /// `(coarse [1, frames], f0 [1, frames])` for pitch models.
    ///
    /// Returns `frames · target_sample_rate / 100` samples.
    fn infer(
        &self,
        feats: &Tensor,
        pitch: Option<(&Tensor, &Tensor)>,
        speaker_id: usize,
        noise: &mut NoiseSource,
    ) -> Result<Tensor>;

    fn target_sample_rate(&self) -> u32;

    fn uses_pitch(&self) -> bool;

    fn version(&self) -> ModelVersion;

    fn n_speakers(&self) -> usize {
        1
    }
}

impl Vocoder for Synthesizer {
    fn infer(
        &self,
        feats: &Tensor,
        pitch: Option<(&Tensor, &Tensor)>,
        speaker_id: usize,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        Synthesizer::infer(self, feats, pitch, speaker_id, noise)
    }

    fn target_sample_rate(&self) -> u32 {
        self.sample_rate()
    }

    fn uses_pitch(&self) -> bool {
        self.variant().uses_pitch()
    }

    fn version(&self) -> ModelVersion {
        self.variant().version()
    }

    fn n_speakers(&self) -> usize {
        Synthesizer::n_speakers(self)
    }
}

/// Wall-clock time per pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConversionTiming {
    pub pitch: Duration,
    pub encoder: Duration,
    pub retrieval: Duration,
    pub synthesis: Duration,
    pub total: Duration,
}

impl ConversionTiming {
    pub fn accumulate(&mut self, other: &ConversionTiming) {
        self.pitch += other.pitch;
        self.encoder += other.encoder;
        self.retrieval += other.retrieval;
        self.synthesis += other.synthesis;
        self.total += other.total;
    }
}

/// Damp retrieval on unvoiced frames.
///
/// Voiced frames take `blended`; frames with F0 = 0 take
/// `protect · blended + (1 − protect) · original`.
pub fn apply_protect(
    blended: &Tensor,
    original: &Tensor,
    contour: &PitchContour,
    protect: f32,
) -> Result<Tensor> {
    let (_, frames, _) = blended.dims3()?;
    anyhow::ensure!(
        contour.len() == frames,
        "pitch contour has {} frames, features have {frames}",
        contour.len()
    );
    let weights: Vec<f32> = contour
        .f0
        .iter()
        .map(|&f| if f > 0.0 { 1.0 } else { protect })
        .collect();
    let mask = Tensor::from_vec(weights, (1, frames, 1), blended.device())?.to_dtype(blended.dtype())?;
    let keep = mask.affine(-1.0, 1.0)?;
    Ok((blended.broadcast_mul(&mask)? + original.broadcast_mul(&keep)?)?)
}

/// Rendered centre region of one chunk at the target rate.
#[derive(Debug, Clone)]
pub struct RenderedChunk {
    pub index: usize,
    pub samples: Vec<f32>,
    /// Leading samples shared with the previous chunk
    pub overlap: usize,
    pub is_last: bool,
    /// Pitch contour the chunk was conditioned on
    pub contour: Option<PitchContour>,
}

/// Everything one chunk needs, borrowed for the duration of a request.
pub struct ChunkRenderer<'a> {
    pub encoder: &'a dyn ContentEncoder,
    pub pitch: Option<&'a dyn PitchEstimator>,
    pub index: Option<&'a dyn NeighborSearch>,
    pub vocoder: &'a dyn Vocoder,
    pub plan: ChunkPlan,
    pub device: Device,
    pub semitones: i32,
    pub index_rate: f32,
    pub protect: f32,
    pub speaker_id: usize,
}

impl ChunkRenderer<'_> {
    fn to_target(&self, samples_16k: usize) -> usize {
        let tgt = self.vocoder.target_sample_rate() as u64;
        ((samples_16k as u64 * tgt + ANALYSIS_SAMPLE_RATE as u64 / 2) / ANALYSIS_SAMPLE_RATE as u64)
            as usize
    }

    #[tracing::instrument(skip_all, fields(chunk = chunk.index))]
    pub fn render(
        &self,
        chunk: &AudioChunk,
        noise: &mut NoiseSource,
        timing: &mut ConversionTiming,
    ) -> Result<RenderedChunk> {
        let n_frames = chunk.n_frames(self.plan.window);

        let started = Instant::now();
        let feats = self.encoder.encode(&chunk.audio, self.vocoder.version())?;
        let feats = to_frame_grid(&feats.to_device(&self.device)?.to_dtype(DType::F32)?, n_frames)?;
        timing.encoder += started.elapsed();

        // A zero rate leaves the features untouched, same as having no index
        let index = self.index.filter(|_| self.index_rate > 0.0);
        let started = Instant::now();
        let blended = match index {
            Some(index) => blend(&feats, index, self.index_rate)?,
            None => feats.clone(),
        };
        timing.retrieval += started.elapsed();

        let started = Instant::now();
        let contour = if self.vocoder.uses_pitch() {
            let estimator = self
                .pitch
                .ok_or_else(|| VcError::config("pitch model given no pitch estimator"))?;
            let f0 = estimator.estimate(&chunk.audio, n_frames)?;
            Some(PitchContour::from_estimate(f0, self.semitones))
        } else {
            None
        };
        timing.pitch += started.elapsed();

        let feats = match &contour {
            Some(contour) if self.protect < 0.5 && index.is_some() => {
                apply_protect(&blended, &feats, contour, self.protect)?
            }
            _ => blended,
        };

        let started = Instant::now();
        let pitch_tensors = contour
            .as_ref()
            .map(|c| c.to_tensors(&self.device))
            .transpose()?;
        let wav = self.vocoder.infer(
            &feats,
            pitch_tensors.as_ref().map(|(c, f)| (c, f)),
            self.speaker_id,
            noise,
        )?;
        let wav = wav.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        timing.synthesis += started.elapsed();

        let samples = trim(&wav, self.plan.t_pad_tgt, self.to_target(chunk.center_len()));
        tracing::debug!(
            chunk = chunk.index,
            frames = n_frames,
            rendered = wav.len(),
            kept = samples.len(),
            "chunk synthesized"
        );
        Ok(RenderedChunk {
            index: chunk.index,
            samples,
            overlap: self.to_target(chunk.overlap),
            is_last: chunk.is_last,
            contour,
        })
    }
}

/// `len` samples starting at `offset`, zero-filled past the end.
fn trim(wav: &[f32], offset: usize, len: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    if offset < wav.len() {
        let avail = (wav.len() - offset).min(len);
        out[..avail].copy_from_slice(&wav[offset..offset + avail]);
    }
    out
}
