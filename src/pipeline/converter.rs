//! Request-level entry point.
//!
//! [`VoiceConverter`] owns the run's [`SynthesisContext`] and the shared
//! caches: the content encoder is loaded once, voice models, indexes and
//! neural pitch estimators once per key. Each request then runs
//! pre-processing, the chunk loop and the stitcher, and writes its output
//! atomically.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::cache::KeyedCache;
use super::chunker::Chunker;
use super::context::SynthesisContext;
use super::features::{ContentEncoder, HubertEncoder};
use super::request::{output_name, ConversionParams, IndexSelection, VoiceConversionRequest};
use super::resolve::{FileListing, FsListing, ModelLayout};
use super::retrieval::{NeighborSearch, RetrievalIndex};
use super::stitch::{finalize, Stitcher};
use super::synthesis::{ChunkRenderer, ConversionTiming, Vocoder};
use crate::audio::{high_pass, load_wav, resample_to_16k, save_wav_atomic, AudioBuffer, ANALYSIS_SAMPLE_RATE};
use crate::error::VcError;
use crate::models::checkpoint::VoiceCheckpoint;
use crate::models::crepe::Crepe;
use crate::models::noise::NoiseSource;
use crate::models::rmvpe::Rmvpe;
use crate::models::synthesizer::Synthesizer;
use crate::pitch::pm::PmConfig;
use crate::pitch::{
    CrepeEstimator, HarvestEstimator, PitchEstimator, PitchMethod, PmEstimator, RmvpeEstimator,
};
use crate::sync_device;

/// Locations of the pretrained networks shared by every voice model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPaths {
    pub hubert: PathBuf,
    pub rmvpe: PathBuf,
    pub crepe: PathBuf,
}

impl AssetPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            hubert: dir.join("hubert_base.pt"),
            rmvpe: dir.join("rmvpe.pt"),
            crepe: dir.join("crepe_full.safetensors"),
        }
    }
}

impl Default for AssetPaths {
    fn default() -> Self {
        Self::in_dir("assets")
    }
}

/// What a finished request produced.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub sample_rate: u32,
    pub samples: usize,
    pub chunks: usize,
    pub index: Option<PathBuf>,
    pub timing: ConversionTiming,
}

impl ConversionReport {
    pub fn duration(&self) -> f32 {
        self.samples as f32 / self.sample_rate.max(1) as f32
    }
}

/// Output of [`VoiceConverter::convert_audio`].
#[derive(Debug, Clone)]
pub struct ConvertedAudio {
    pub audio: AudioBuffer,
    pub chunks: usize,
    pub timing: ConversionTiming,
}

pub struct VoiceConverter {
    context: SynthesisContext,
    assets: AssetPaths,
    layout: ModelLayout,
    listing: Box<dyn FileListing + Send + Sync>,
    encoder: OnceCell<Arc<dyn ContentEncoder>>,
    estimators: KeyedCache<PitchMethod, Arc<dyn PitchEstimator>>,
    vocoders: KeyedCache<PathBuf, Arc<dyn Vocoder>>,
    indexes: KeyedCache<PathBuf, Arc<dyn NeighborSearch>>,
}

impl VoiceConverter {
    pub fn new(context: SynthesisContext) -> Self {
        Self {
            context,
            assets: AssetPaths::default(),
            layout: ModelLayout::default(),
            listing: Box::new(FsListing),
            encoder: OnceCell::new(),
            estimators: KeyedCache::new(),
            vocoders: KeyedCache::new(),
            indexes: KeyedCache::new(),
        }
    }

    pub fn with_assets(mut self, assets: AssetPaths) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_layout(mut self, layout: ModelLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_listing(mut self, listing: impl FileListing + Send + Sync + 'static) -> Self {
        self.listing = Box::new(listing);
        self
    }

    /// Use `encoder` instead of loading HuBERT from the asset directory.
    pub fn with_encoder(self, encoder: Arc<dyn ContentEncoder>) -> Self {
        let _ = self.encoder.set(encoder);
        self
    }

    /// Use `estimator` whenever `method` is requested.
    pub fn with_pitch_estimator(self, method: PitchMethod, estimator: Arc<dyn PitchEstimator>) -> Self {
        self.estimators.insert(method, estimator);
        self
    }

    /// Register an already-built model under `path`.
    pub fn insert_model(&self, path: impl Into<PathBuf>, vocoder: Arc<dyn Vocoder>) {
        self.vocoders.insert(path.into(), vocoder);
    }

    /// Register an already-built index under `path`.
    pub fn insert_index(&self, path: impl Into<PathBuf>, index: Arc<dyn NeighborSearch>) {
        self.indexes.insert(path.into(), index);
    }

    pub fn context(&self) -> &SynthesisContext {
        &self.context
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn loaded_models(&self) -> usize {
        self.vocoders.len()
    }

    fn encoder(&self) -> Result<Arc<dyn ContentEncoder>> {
        self.encoder
            .get_or_try_init(|| {
                let path = &self.assets.hubert;
                if !path.exists() {
                    return Err(VcError::missing("content encoder", path.display().to_string()).into());
                }
                let encoder = HubertEncoder::load(path, self.context.dtype(), self.context.device())?;
                Ok(Arc::new(encoder) as Arc<dyn ContentEncoder>)
            })
            .cloned()
    }

    /// Estimator for the request's method; neural ones are loaded once.
    pub fn pitch_estimator(&self, params: &ConversionParams) -> Result<Arc<dyn PitchEstimator>> {
        if let Some(estimator) = self.estimators.get(&params.f0_method) {
            return Ok(estimator);
        }
        let device = self.context.device();
        match params.f0_method {
            PitchMethod::Pm => Ok(Arc::new(PmEstimator::new(PmConfig::default()))),
            PitchMethod::Harvest => Ok(Arc::new(HarvestEstimator::new(params.filter_radius))),
            PitchMethod::Rmvpe => self.estimators.get_or_try_init(&PitchMethod::Rmvpe, || {
                let path = &self.assets.rmvpe;
                if !path.exists() {
                    return Err(VcError::missing("rmvpe model", path.display().to_string()).into());
                }
                let model = Rmvpe::load(path, device)?;
                Ok(Arc::new(RmvpeEstimator::new(Arc::new(model))) as Arc<dyn PitchEstimator>)
            }),
            PitchMethod::Crepe => self.estimators.get_or_try_init(&PitchMethod::Crepe, || {
                let path = &self.assets.crepe;
                if !path.exists() {
                    return Err(VcError::missing("crepe model", path.display().to_string()).into());
                }
                let model = Crepe::load(path, device)?;
                Ok(Arc::new(CrepeEstimator::new(Arc::new(model))) as Arc<dyn PitchEstimator>)
            }),
        }
    }

    /// Voice model at `path`, loaded on first use.
    pub fn vocoder(&self, path: &Path) -> Result<Arc<dyn Vocoder>> {
        self.vocoders.get_or_try_init(&path.to_path_buf(), || {
            let checkpoint = VoiceCheckpoint::load(path, self.context.device())?;
            let synth = Synthesizer::from_checkpoint(&checkpoint, self.context.dtype(), self.context.device())?;
            Ok(Arc::new(synth) as Arc<dyn Vocoder>)
        })
    }

    /// Index at `path`, loaded on first use.
    pub fn index(&self, path: &Path) -> Result<Arc<dyn NeighborSearch>> {
        self.indexes.get_or_try_init(&path.to_path_buf(), || {
            Ok(Arc::new(RetrievalIndex::load(path)?) as Arc<dyn NeighborSearch>)
        })
    }

    /// Path of the index a request will use, if any.
    ///
    /// Convention lookup is skipped when the index rate is zero.
    pub fn index_path(&self, request: &VoiceConversionRequest) -> Result<Option<PathBuf>> {
        match &request.index {
            IndexSelection::Disabled => Ok(None),
            IndexSelection::Path(path) => Ok(Some(path.clone())),
            IndexSelection::Resolve if request.params.index_rate == 0.0 => Ok(None),
            IndexSelection::Resolve => self
                .layout
                .resolve_index(&request.model, self.listing.as_ref())
                .map(Some),
        }
    }

    /// Run one request and write its output.
    pub fn convert(&self, request: &VoiceConversionRequest) -> Result<ConversionReport> {
        self.convert_with_progress(request, &mut |_, _| {})
    }

    /// As [`VoiceConverter::convert`], reporting `(done, total)` chunks.
    pub fn convert_with_progress(
        &self,
        request: &VoiceConversionRequest,
        on_chunk: &mut dyn FnMut(usize, usize),
    ) -> Result<ConversionReport> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("convert").entered();

        request.params.validate()?;
        let input = load_wav(&request.audio)?;
        let vocoder = self.vocoder(&request.model)?;
        let index_path = self.index_path(request)?;
        let index = index_path.as_deref().map(|p| self.index(p)).transpose()?;

        let converted = self.convert_audio_with_progress(
            &input,
            vocoder.as_ref(),
            index.as_deref(),
            &request.params,
            on_chunk,
        )?;

        if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        save_wav_atomic(&request.output, &converted.audio.samples, converted.audio.sample_rate)?;

        let t = &converted.timing;
        tracing::info!(
            output = %request.output.display(),
            seconds = converted.audio.duration(),
            chunks = converted.chunks,
            pitch_ms = t.pitch.as_millis() as u64,
            encoder_ms = t.encoder.as_millis() as u64,
            retrieval_ms = t.retrieval.as_millis() as u64,
            synthesis_ms = t.synthesis.as_millis() as u64,
            total_ms = t.total.as_millis() as u64,
            "conversion finished"
        );
        Ok(ConversionReport {
            output: request.output.clone(),
            sample_rate: converted.audio.sample_rate,
            samples: converted.audio.len(),
            chunks: converted.chunks,
            index: index_path,
            timing: converted.timing,
        })
    }

    /// Convert an in-memory buffer with an explicit model and index.
    pub fn convert_audio(
        &self,
        input: &AudioBuffer,
        vocoder: &dyn Vocoder,
        index: Option<&dyn NeighborSearch>,
        params: &ConversionParams,
    ) -> Result<ConvertedAudio> {
        self.convert_audio_with_progress(input, vocoder, index, params, &mut |_, _| {})
    }

    fn convert_audio_with_progress(
        &self,
        input: &AudioBuffer,
        vocoder: &dyn Vocoder,
        index: Option<&dyn NeighborSearch>,
        params: &ConversionParams,
        on_chunk: &mut dyn FnMut(usize, usize),
    ) -> Result<ConvertedAudio> {
        params.validate()?;
        if params.speaker_id >= vocoder.n_speakers() {
            return Err(VcError::config(format!(
                "speaker id {} out of range, model has {} speaker(s)",
                params.speaker_id,
                vocoder.n_speakers()
            ))
            .into());
        }
        let started = Instant::now();

        let audio_16k = preprocess(input)?;
        let encoder = self.encoder()?;
        let estimator = if vocoder.uses_pitch() {
            Some(self.pitch_estimator(params)?)
        } else {
            None
        };

        let plan = self.context.chunk_plan(vocoder.target_sample_rate());
        let renderer = ChunkRenderer {
            encoder: encoder.as_ref(),
            pitch: estimator.as_deref(),
            index,
            vocoder,
            plan,
            device: self.context.device().clone(),
            semitones: params.f0_up_key,
            index_rate: params.index_rate,
            protect: params.protect,
            speaker_id: params.speaker_id,
        };

        let chunker = Chunker::new(&audio_16k, plan);
        let total = chunker.len();
        let expected = crate::audio::resample::expected_len(
            audio_16k.len(),
            ANALYSIS_SAMPLE_RATE,
            vocoder.target_sample_rate(),
        );
        let mut stitcher = Stitcher::with_capacity(vocoder.target_sample_rate(), expected);
        let mut noise = NoiseSource::new(params.seed);
        let mut timing = ConversionTiming::default();

        tracing::debug!(
            samples = audio_16k.len(),
            chunks = total,
            method = %params.f0_method,
            index = index.is_some(),
            "starting conversion"
        );
        for chunk in chunker {
            let rendered = renderer.render(&chunk, &mut noise, &mut timing)?;
            stitcher.push(&rendered);
            on_chunk(rendered.index + 1, total);
        }
        sync_device(self.context.device())?;

        let chunks = stitcher.chunks();
        let audio = finalize(stitcher.finish(), &audio_16k, params.rms_mix_rate, params.resample_sr)?;
        timing.total = started.elapsed();
        Ok(ConvertedAudio {
            audio,
            chunks,
            timing,
        })
    }

    /// Every model against every audio file, written to `output_dir`.
    ///
    /// Stops at the first failure; files already written stay.
    pub fn convert_batch(
        &self,
        models: &[PathBuf],
        audio_files: &[PathBuf],
        output_dir: &Path,
        params: &ConversionParams,
    ) -> Result<Vec<ConversionReport>> {
        params.validate()?;
        let mut reports = Vec::with_capacity(models.len() * audio_files.len());
        for model in models {
            for audio in audio_files {
                let request = VoiceConversionRequest::new(
                    audio.clone(),
                    model.clone(),
                    output_dir.join(output_name(audio, model)),
                )
                .with_params(params.clone());
                let report = self
                    .convert(&request)
                    .with_context(|| format!("converting {} with {}", audio.display(), model.display()))?;
                reports.push(report);
            }
        }
        Ok(reports)
    }
}

/// 16 kHz, peak-normalised, high-passed input.
pub fn preprocess(input: &AudioBuffer) -> Result<Vec<f32>> {
    let mut audio = resample_to_16k(input)?;
    audio.normalize_input();
    high_pass(&audio.samples, ANALYSIS_SAMPLE_RATE)
}
