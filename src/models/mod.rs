//! Neural network models for voice conversion
//!
//! This module contains:
//! - `hubert`: Content encoder (fairseq HuBERT base)
//! - `rmvpe`, `crepe`: Neural pitch estimators
//! - `synthesizer`: Phone encoder, coupling flow and NSF HiFi-GAN generator
//! - `checkpoint`: Voice model loading and variant detection
//! - `config`: Voice model configuration
//! - `weights`: Checkpoint readers and weight-norm folding
//! - `noise`: Seeded Gaussian noise for reproducible synthesis

pub mod checkpoint;
pub mod config;
pub mod crepe;
pub mod hubert;
pub mod noise;
pub mod rmvpe;
pub mod synthesizer;
pub mod weights;

pub use checkpoint::{CheckpointMeta, VoiceCheckpoint};
pub use config::{ModelVersion, ResBlockKind, SynthesizerConfig, SynthesizerVariant};
pub use crepe::{Crepe, CrepeConfig, CrepeModel, CrepeOutput};
pub use hubert::{HubertConfig, HubertModel};
pub use noise::{NoiseSource, DEFAULT_SEED};
pub use rmvpe::{Rmvpe, RmvpeConfig, RmvpeModel};
pub use synthesizer::Synthesizer;
pub use weights::{fold_weight_norm, load_weights, WeightMap};
