//! Device and precision selection.
//!
//! A [`SynthesisContext`] is resolved once per run from a device string and
//! what the machine reports about its accelerators. It fixes the compute
//! dtype and the chunking thresholds for the whole run; nothing is written
//! back anywhere.

use anyhow::Result;
use candle_core::{DType, Device};
use std::fmt;

use crate::audio::{ANALYSIS_SAMPLE_RATE, FRAME_HOP};
use crate::error::VcError;

/// Numeric precision of the networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Full => DType::F32,
            Self::Half => DType::F16,
        }
    }
}

/// Chunking thresholds in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdProfile {
    /// Context added on both sides of each chunk
    pub x_pad: f64,
    /// Half-width of the cut-point search window
    pub x_query: f64,
    /// Spacing of ideal cut points
    pub x_center: f64,
    /// Inputs longer than this are split
    pub x_max: f64,
}

impl ThresholdProfile {
    /// Half precision on a roomy accelerator.
    pub const HALF: Self = Self::new(3.0, 10.0, 60.0, 65.0);
    /// Full precision.
    pub const FULL: Self = Self::new(1.0, 6.0, 38.0, 41.0);
    /// Accelerators with 4 GB or less.
    pub const LOW_MEMORY: Self = Self::new(1.0, 5.0, 30.0, 32.0);

    pub const fn new(x_pad: f64, x_query: f64, x_center: f64, x_max: f64) -> Self {
        Self {
            x_pad,
            x_query,
            x_center,
            x_max,
        }
    }

    /// Sample counts at 16 kHz and at the target rate.
    pub fn plan(&self, target_sample_rate: u32) -> ChunkPlan {
        let sr = ANALYSIS_SAMPLE_RATE as f64;
        let t_pad = (sr * self.x_pad) as usize;
        ChunkPlan {
            window: FRAME_HOP,
            t_pad,
            t_pad_tgt: (target_sample_rate as f64 * self.x_pad) as usize,
            t_pad2: 2 * t_pad,
            t_query: (sr * self.x_query) as usize,
            t_center: (sr * self.x_center) as usize,
            t_max: (sr * self.x_max) as usize,
        }
    }
}

/// Thresholds converted to samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub window: usize,
    pub t_pad: usize,
    pub t_pad_tgt: usize,
    pub t_pad2: usize,
    pub t_query: usize,
    pub t_center: usize,
    pub t_max: usize,
}

/// A parsed device string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceSpec {
    /// `auto`, `cpu`, `cuda`, `cuda:N` or `metal`, any case.
    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            "metal" | "mps" => Ok(Self::Metal),
            other => {
                if let Some(idx) = other.strip_prefix("cuda:") {
                    let idx = idx.parse().map_err(|_| {
                        VcError::config(format!("invalid CUDA device index in '{s}'"))
                    })?;
                    return Ok(Self::Cuda(idx));
                }
                Err(VcError::config(format!(
                    "unknown device '{s}'. Supported: auto, cpu, cuda, cuda:N, metal"
                ))
                .into())
            }
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal => f.write_str("metal"),
        }
    }
}

/// What is known about one accelerator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcceleratorInfo {
    pub name: Option<String>,
    pub total_memory: Option<u64>,
}

impl AcceleratorInfo {
    /// Cards that run badly in half precision.
    pub fn is_constrained(&self) -> bool {
        let Some(name) = &self.name else {
            return false;
        };
        let upper = name.to_uppercase();
        (name.contains("16") && !upper.contains("V100"))
            || upper.contains("P40")
            || name.contains("1060")
            || name.contains("1070")
            || name.contains("1080")
    }

    /// Whole gigabytes, rounded up from .6.
    pub fn memory_gb(&self) -> Option<u64> {
        self.total_memory
            .map(|bytes| (bytes as f64 / (1u64 << 30) as f64 + 0.4) as u64)
    }
}

/// Source of accelerator facts; swapped for a fixed table in tests.
pub trait DeviceInventory {
    fn cuda_count(&self) -> usize;

    fn cuda_info(&self, _index: usize) -> AcceleratorInfo {
        AcceleratorInfo::default()
    }

    fn metal_available(&self) -> bool;

    fn open(&self, spec: DeviceSpec) -> Result<Device>;
}

/// Probes the backends compiled into candle.
///
/// candle does not report a card's name or memory, so [`cuda_info`] asks
/// `nvidia-smi`, mapping the CUDA ordinal through a numeric
/// `CUDA_VISIBLE_DEVICES` list. When the tool is missing or the list names
/// cards by UUID the facts stay empty and the requested precision is kept.
///
/// [`cuda_info`]: DeviceInventory::cuda_info
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInventory;

/// Upper bound for CUDA ordinal probing.
const MAX_CUDA_PROBE: usize = 16;

impl DeviceInventory for SystemInventory {
    fn cuda_count(&self) -> usize {
        if !candle_core::utils::cuda_is_available() {
            return 0;
        }
        (0..MAX_CUDA_PROBE)
            .take_while(|&i| Device::new_cuda(i).is_ok())
            .count()
    }

    fn cuda_info(&self, index: usize) -> AcceleratorInfo {
        let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
        let Some(row) = smi_row(visible.as_deref(), index) else {
            return AcceleratorInfo::default();
        };
        let output = std::process::Command::new("nvidia-smi")
            .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let info = parse_gpu_query(&String::from_utf8_lossy(&out.stdout), row);
                tracing::debug!(index, name = ?info.name, memory_gb = ?info.memory_gb(), "cuda device");
                info
            }
            Ok(out) => {
                tracing::debug!(status = %out.status, "nvidia-smi failed; cuda device facts unknown");
                AcceleratorInfo::default()
            }
            Err(e) => {
                tracing::debug!(error = %e, "nvidia-smi unavailable; cuda device facts unknown");
                AcceleratorInfo::default()
            }
        }
    }

    fn metal_available(&self) -> bool {
        candle_core::utils::metal_is_available()
    }

    fn open(&self, spec: DeviceSpec) -> Result<Device> {
        let device = match spec {
            DeviceSpec::Cpu | DeviceSpec::Auto => Device::Cpu,
            DeviceSpec::Cuda(i) => Device::new_cuda(i)
                .map_err(|e| VcError::device(format!("failed to open cuda:{i}: {e}")))?,
            DeviceSpec::Metal => Device::new_metal(0)
                .map_err(|e| VcError::device(format!("failed to open metal: {e}")))?,
        };
        Ok(device)
    }
}

/// `nvidia-smi` row of CUDA ordinal `index` under `CUDA_VISIBLE_DEVICES`.
fn smi_row(visible: Option<&str>, index: usize) -> Option<usize> {
    match visible.map(str::trim) {
        None | Some("") => Some(index),
        Some(list) => list.split(',').nth(index)?.trim().parse().ok(),
    }
}

/// Line `index` of `nvidia-smi --query-gpu=name,memory.total
/// --format=csv,noheader,nounits` output (memory in MiB).
pub fn parse_gpu_query(output: &str, index: usize) -> AcceleratorInfo {
    let Some(line) = output.lines().filter(|l| !l.trim().is_empty()).nth(index) else {
        return AcceleratorInfo::default();
    };
    let (name, memory) = match line.rsplit_once(',') {
        Some((name, memory)) => (name, Some(memory)),
        None => (line, None),
    };
    let name = name.trim();
    AcceleratorInfo {
        name: (!name.is_empty()).then(|| name.to_string()),
        total_memory: memory
            .and_then(|m| m.trim().parse::<u64>().ok())
            .map(|mib| mib << 20),
    }
}

/// Device, precision and chunking thresholds for one run.
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    spec: DeviceSpec,
    device: Device,
    precision: Precision,
    thresholds: ThresholdProfile,
}

impl SynthesisContext {
    /// CPU at full precision.
    pub fn cpu() -> Self {
        Self {
            spec: DeviceSpec::Cpu,
            device: Device::Cpu,
            precision: Precision::Full,
            thresholds: ThresholdProfile::FULL,
        }
    }

    /// Resolve `device` against the machine.
    ///
    /// A CUDA ordinal past the available count is a [`VcError::Device`],
    /// raised before any device is opened.
    pub fn resolve(
        device: &str,
        requested: Precision,
        inventory: &dyn DeviceInventory,
    ) -> Result<Self> {
        let mut spec = DeviceSpec::parse(device)?;
        let cuda_count = inventory.cuda_count();
        if spec == DeviceSpec::Auto {
            spec = if cuda_count > 0 {
                DeviceSpec::Cuda(0)
            } else if inventory.metal_available() {
                DeviceSpec::Metal
            } else {
                DeviceSpec::Cpu
            };
        }

        let (precision, thresholds) = match spec {
            DeviceSpec::Cuda(i) => {
                if i >= cuda_count {
                    return Err(VcError::device(format!(
                        "requested {spec} but only {cuda_count} CUDA device(s) are available"
                    ))
                    .into());
                }
                let info = inventory.cuda_info(i);
                let low_memory = info.memory_gb().is_some_and(|gb| gb <= 4);
                if info.is_constrained() || low_memory {
                    let profile = if low_memory {
                        ThresholdProfile::LOW_MEMORY
                    } else {
                        ThresholdProfile::FULL
                    };
                    (Precision::Full, profile)
                } else {
                    (requested, profile_for(requested))
                }
            }
            DeviceSpec::Metal => {
                if !inventory.metal_available() {
                    return Err(VcError::device("Metal requested but not available").into());
                }
                (requested, profile_for(requested))
            }
            DeviceSpec::Cpu | DeviceSpec::Auto => (Precision::Full, ThresholdProfile::FULL),
        };

        let device = inventory.open(spec)?;
        tracing::info!(
            device = %spec,
            ?precision,
            x_pad = thresholds.x_pad,
            x_query = thresholds.x_query,
            x_center = thresholds.x_center,
            x_max = thresholds.x_max,
            "synthesis context"
        );
        Ok(Self {
            spec,
            device,
            precision,
            thresholds,
        })
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    pub fn thresholds(&self) -> ThresholdProfile {
        self.thresholds
    }

    pub fn chunk_plan(&self, target_sample_rate: u32) -> ChunkPlan {
        self.thresholds.plan(target_sample_rate)
    }

    /// Same device with different thresholds, for short test inputs.
    pub fn with_thresholds(mut self, thresholds: ThresholdProfile) -> Self {
        self.thresholds = thresholds;
        self
    }
}

impl Default for SynthesisContext {
    fn default() -> Self {
        Self::cpu()
    }
}

fn profile_for(precision: Precision) -> ThresholdProfile {
    match precision {
        Precision::Half => ThresholdProfile::HALF,
        Precision::Full => ThresholdProfile::FULL,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::Cell;

    /// Fixed accelerator table that opens everything on the CPU.
    pub(crate) struct FakeInventory {
        pub cards: Vec<AcceleratorInfo>,
        pub metal: bool,
        pub opened: Cell<usize>,
    }

    impl FakeInventory {
        pub fn cards(cards: Vec<AcceleratorInfo>) -> Self {
            Self {
                cards,
                metal: false,
                opened: Cell::new(0),
            }
        }
    }

    impl DeviceInventory for FakeInventory {
        fn cuda_count(&self) -> usize {
            self.cards.len()
        }

        fn cuda_info(&self, index: usize) -> AcceleratorInfo {
            self.cards[index].clone()
        }

        fn metal_available(&self) -> bool {
            self.metal
        }

        fn open(&self, _spec: DeviceSpec) -> Result<Device> {
            self.opened.set(self.opened.get() + 1);
            Ok(Device::Cpu)
        }
    }

    fn card(name: &str, gb: u64) -> AcceleratorInfo {
        AcceleratorInfo {
            name: Some(name.to_string()),
            total_memory: Some(gb << 30),
        }
    }

    #[test]
    fn test_parse_device_strings() {
        assert_eq!(DeviceSpec::parse("CPU").unwrap(), DeviceSpec::Cpu);
        assert_eq!(DeviceSpec::parse("cuda").unwrap(), DeviceSpec::Cuda(0));
        assert_eq!(DeviceSpec::parse("cuda:3").unwrap(), DeviceSpec::Cuda(3));
        assert_eq!(DeviceSpec::parse("Metal").unwrap(), DeviceSpec::Metal);
        let err = DeviceSpec::parse("tpu").unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Configuration));
        assert!(DeviceSpec::parse("cuda:x").is_err());
    }

    #[test]
    fn test_cuda_index_out_of_range_before_open() {
        let inv = FakeInventory::cards(vec![card("RTX 3090", 24), card("RTX 3090", 24)]);
        let err = SynthesisContext::resolve("cuda:5", Precision::Half, &inv).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Device));
        assert_eq!(inv.opened.get(), 0);
    }

    #[test]
    fn test_cpu_forces_full_precision() {
        let inv = FakeInventory::cards(vec![]);
        let ctx = SynthesisContext::resolve("cpu", Precision::Half, &inv).unwrap();
        assert_eq!(ctx.precision(), Precision::Full);
        assert_eq!(ctx.thresholds(), ThresholdProfile::FULL);
        assert_eq!(ctx.dtype(), DType::F32);
    }

    #[test]
    fn test_roomy_card_follows_request() {
        let inv = FakeInventory::cards(vec![card("NVIDIA A100", 40)]);
        let ctx = SynthesisContext::resolve("cuda:0", Precision::Half, &inv).unwrap();
        assert_eq!(ctx.precision(), Precision::Half);
        assert_eq!(ctx.thresholds(), ThresholdProfile::HALF);
    }

    #[test]
    fn test_constrained_cards() {
        for name in ["GeForce GTX 1660", "Tesla P40", "GTX 1080 Ti"] {
            let inv = FakeInventory::cards(vec![card(name, 8)]);
            let ctx = SynthesisContext::resolve("cuda", Precision::Half, &inv).unwrap();
            assert_eq!(ctx.precision(), Precision::Full, "{name}");
        }
        // V100 names contain "16" too but are not constrained
        let inv = FakeInventory::cards(vec![card("Tesla V100-SXM2-16GB", 16)]);
        let ctx = SynthesisContext::resolve("cuda", Precision::Half, &inv).unwrap();
        assert_eq!(ctx.precision(), Precision::Half);
    }

    #[test]
    fn test_small_card_gets_low_memory_profile() {
        let inv = FakeInventory::cards(vec![card("Quadro T1000", 4)]);
        let ctx = SynthesisContext::resolve("cuda:0", Precision::Half, &inv).unwrap();
        assert_eq!(ctx.precision(), Precision::Full);
        assert_eq!(ctx.thresholds(), ThresholdProfile::LOW_MEMORY);
    }

    #[test]
    fn test_gpu_query_feeds_the_profile() {
        let output = "NVIDIA GeForce RTX 4090, 24564\nNVIDIA GeForce GTX 1050, 4096\n";
        let roomy = parse_gpu_query(output, 0);
        assert_eq!(roomy.name.as_deref(), Some("NVIDIA GeForce RTX 4090"));
        assert_eq!(roomy.memory_gb(), Some(24));
        assert_eq!(parse_gpu_query(output, 2), AcceleratorInfo::default());

        let inv = FakeInventory::cards(vec![roomy, parse_gpu_query(output, 1)]);
        let ctx = SynthesisContext::resolve("cuda:1", Precision::Half, &inv).unwrap();
        assert_eq!(ctx.precision(), Precision::Full);
        assert_eq!(ctx.thresholds(), ThresholdProfile::LOW_MEMORY);
    }

    #[test]
    fn test_smi_row_follows_visible_devices() {
        assert_eq!(smi_row(None, 1), Some(1));
        assert_eq!(smi_row(Some(""), 0), Some(0));
        assert_eq!(smi_row(Some("2,0"), 0), Some(2));
        assert_eq!(smi_row(Some("2,0"), 1), Some(0));
        assert_eq!(smi_row(Some("GPU-8f3c"), 0), None);
        assert_eq!(smi_row(Some("1"), 1), None);
    }

    #[test]
    fn test_memory_rounding() {
        let info = AcceleratorInfo {
            name: None,
            total_memory: Some((4.6 * (1u64 << 30) as f64) as u64),
        };
        assert_eq!(info.memory_gb(), Some(5));
    }

    #[test]
    fn test_auto_falls_back_to_cpu() {
        let inv = FakeInventory::cards(vec![]);
        let ctx = SynthesisContext::resolve("auto", Precision::Half, &inv).unwrap();
        assert_eq!(ctx.spec(), DeviceSpec::Cpu);
    }

    #[test]
    fn test_chunk_plan_samples() {
        let plan = ThresholdProfile::FULL.plan(40000);
        assert_eq!(plan.t_pad, 16000);
        assert_eq!(plan.t_pad_tgt, 40000);
        assert_eq!(plan.t_pad2, 32000);
        assert_eq!(plan.t_query, 96000);
        assert_eq!(plan.t_center, 608000);
        assert_eq!(plan.t_max, 656000);
        assert_eq!(plan.window, 160);
    }
}
