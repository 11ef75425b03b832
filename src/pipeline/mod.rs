//! Voice conversion pipeline
//!
//! ```text
//! input ─► preprocess ─► Chunker ─┬─► ContentEncoder ─► blend(index) ─┐
//!                                 └─► PitchEstimator ──► protect ◄────┘
//!                                                          │
//!                                       Vocoder ◄──────────┘
//!                                          │
//!                        Stitcher ◄─ trim ─┘ ─► rms mix ─► resample ─► limit
//! ```
//!
//! Every stage sits behind a trait ([`ContentEncoder`], [`PitchEstimator`],
//! [`NeighborSearch`], [`Vocoder`]) so the orchestration can be driven with
//! stand-ins as well as the pretrained networks.
//!
//! [`PitchEstimator`]: crate::pitch::PitchEstimator

pub mod cache;
pub mod chunker;
pub mod context;
pub mod converter;
pub mod faiss;
pub mod features;
pub mod request;
pub mod resolve;
pub mod retrieval;
pub mod stitch;
pub mod synthesis;

pub use cache::KeyedCache;
pub use chunker::{AudioChunk, Chunker};
pub use context::{
    AcceleratorInfo, ChunkPlan, DeviceInventory, DeviceSpec, Precision, SynthesisContext,
    SystemInventory, ThresholdProfile,
};
pub use converter::{preprocess, AssetPaths, ConversionReport, ConvertedAudio, VoiceConverter};
pub use features::{ContentEncoder, HubertEncoder};
pub use request::{ConversionParams, IndexSelection, Settings, VoiceConversionRequest};
pub use resolve::{
    discover_audio, discover_models, normalize_index_path, resolve_index, FileListing, FsListing,
    ModelLayout,
};
pub use retrieval::{blend, NeighborSearch, RetrievalIndex};
pub use stitch::Stitcher;
pub use synthesis::{apply_protect, ConversionTiming, RenderedChunk, Vocoder};
