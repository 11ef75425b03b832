//! Audio processing utilities
//!
//! This module provides:
//! - WAV file I/O with input normalisation and atomic output
//! - Audio resampling
//! - Mel-spectrogram computation for the RMVPE front-end
//! - Zero-phase high-pass filtering
//! - RMS loudness envelopes

pub mod filter;
mod io;
mod mel;
pub mod resample;
mod rms;

pub use filter::{high_pass, ButterworthHighPass};
pub use io::{load_wav, save_wav, save_wav_atomic, AudioBuffer};
pub(crate) use io::peak;
pub use mel::{reflect_pad, MelConfig, MelSpectrogram};
pub use resample::{resample, resample_to_16k, ResampleQuality, Resampler};
pub use rms::{interpolate_linear, mix_rms, rms_envelope};

/// Rate at which pitch and content features are analysed.
pub const ANALYSIS_SAMPLE_RATE: u32 = 16000;

/// Samples per 10 ms analysis frame at [`ANALYSIS_SAMPLE_RATE`].
pub const FRAME_HOP: usize = 160;
