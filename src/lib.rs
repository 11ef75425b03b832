//! # rvc-infer
//!
//! Pure Rust inference for retrieval-based voice conversion (RVC): speech in,
//! the same words in a target speaker's voice out.
//!
//! ## Features
//!
//! - **CPU inference**, with **CUDA** and **Metal** behind cargo features
//! - **Four pitch estimators**: `pm`, `harvest` (WORLD, feature `world`),
//!   `crepe` and `rmvpe`
//! - **Retrieval blending** against a speaker's feature index
//! - **Unbounded input length**: audio is cut at quiet points into
//!   overlapping chunks and stitched back without seams
//! - **Deterministic**: a seeded noise source makes repeat runs identical
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rvc_infer::{
//!     ConversionParams, Precision, SynthesisContext, SystemInventory,
//!     VoiceConversionRequest, VoiceConverter,
//! };
//!
//! let context = SynthesisContext::resolve("auto", Precision::Half, &SystemInventory)?;
//! let converter = VoiceConverter::new(context);
//!
//! // Index resolved by convention from models/index/
//! let request = VoiceConversionRequest::new("in/take1.wav", "models/alto.pth", "out/take1_alto.wav")
//!     .with_params(ConversionParams { f0_up_key: 3, ..Default::default() });
//! let report = converter.convert(&request)?;
//! println!("{:.1}s in {:?}", report.duration(), report.timing.total);
//! ```
//!
//! ## Architecture
//!
//! 1. **Chunker**: splits 16 kHz input at low-energy points near fixed
//!    intervals, adding context on both sides of each chunk.
//! 2. **ContentEncoder**: HuBERT base, speaker-independent features every
//!    20 ms (layer 9 projected to 256 dims for v1 models, layer 12 at 768
//!    dims for v2).
//! 3. **PitchEstimator**: one F0 per 10 ms, shifted by whole semitones and
//!    quantised to 255 coarse bins.
//! 4. **Retrieval**: each frame is mixed with the inverse-distance weighted
//!    mean of its 8 nearest training vectors.
//! 5. **Synthesizer**: VITS-style prior encoder, reverse coupling flow and
//!    an NSF HiFi-GAN decoder, in four variants (`v1`/`v2`, with or without
//!    pitch) picked from the checkpoint.
//! 6. **Stitcher**: trims chunk context, cross-fades the one-frame overlaps,
//!    matches loudness and limits the peak.
//!
//! ## Errors
//!
//! Plumbing failures are plain [`anyhow::Error`]s. Precondition failures
//! (bad parameters, missing or ambiguous files, unavailable devices) carry
//! a [`VcError`]; see [`VcError::classify`].

pub mod audio;
pub mod error;
#[cfg(feature = "hub")]
pub mod hub;
pub mod models;
pub mod pipeline;
pub mod pitch;
pub mod profiling;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

pub use audio::AudioBuffer;
pub use error::{ErrorKind, VcError};
pub use models::checkpoint::VoiceCheckpoint;
pub use models::config::{ModelVersion, SynthesizerVariant};
pub use models::synthesizer::Synthesizer;
pub use pipeline::{
    AssetPaths, ConversionParams, ConversionReport, ConversionTiming, DeviceSpec, IndexSelection,
    ModelLayout, Precision, RetrievalIndex, Settings, SynthesisContext, SystemInventory,
    VoiceConversionRequest, VoiceConverter,
};
pub use pitch::{PitchContour, PitchMethod};

/// Force the GPU to complete all pending work before returning.
///
/// CUDA and Metal run asynchronously, so stage timings read without a sync
/// measure submission rather than completion. Reading a scalar back forces
/// one. A no-op on CPU.
pub fn sync_device(device: &Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        _ => {
            let _: Vec<f32> = Tensor::zeros(1, DType::F32, device)?.to_vec1()?;
            Ok(())
        }
    }
}

/// Best available device: CUDA 0, then Metal, then CPU.
pub fn auto_device() -> Result<Device> {
    parse_device("auto")
}

/// Open the device a string names.
///
/// Accepts `auto`, `cpu`, `cuda`, `cuda:N` and `metal`, in any case. An
/// unknown string is a [`VcError::Configuration`]; a CUDA ordinal past the
/// number of cards, or a backend that is not compiled in, is a
/// [`VcError::Device`].
pub fn parse_device(device_str: &str) -> Result<Device> {
    let context = SynthesisContext::resolve(device_str, Precision::Full, &SystemInventory)?;
    Ok(context.device().clone())
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
