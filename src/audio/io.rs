//! WAV I/O and amplitude handling for conversion input and output.

use anyhow::{Context, Result};
use candle_core::Tensor;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::{Path, PathBuf};

use crate::error::VcError;

/// Input is scaled down when its peak exceeds this value.
pub const INPUT_PEAK_CEILING: f32 = 0.95;

/// Output peak after limiting.
pub const OUTPUT_PEAK_CEILING: f32 = 0.99;

/// Mono waveform with its sample rate.
///
/// Samples are 32-bit floats nominally in \[-1.0, 1.0\]. Stereo sources are
/// down-mixed by averaging channels at load time.
///
/// # Example
///
/// ```rust,ignore
/// let audio = AudioBuffer::load("in/take01.wav")?;
/// let audio = resample(&audio, 16000)?;
/// println!("{:.2}s at {} Hz", audio.duration(), audio.sample_rate);
/// ```
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Create from a tensor of shape `[samples]`, `[1, samples]` or `[1, 1, samples]`.
    pub fn from_tensor(tensor: Tensor, sample_rate: u32) -> Result<Self> {
        let samples: Vec<f32> = tensor
            .flatten_all()?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;
        Ok(Self::new(samples, sample_rate))
    }

    pub fn to_tensor(&self, device: &candle_core::Device) -> Result<Tensor> {
        Ok(Tensor::new(self.samples.as_slice(), device)?)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    /// Scale the buffer down so that `peak / 0.95 <= 1`.
    ///
    /// Quiet input is left untouched; only clipping-prone input is attenuated.
    pub fn normalize_input(&mut self) {
        let ratio = self.peak() / INPUT_PEAK_CEILING;
        if ratio > 1.0 {
            for s in &mut self.samples {
                *s /= ratio;
            }
        }
    }

    /// Limit the output peak to 0.99 of full scale.
    ///
    /// Applied to every rendered waveform before quantisation to 16 bit.
    pub fn limit_output_peak(&mut self) {
        let ratio = self.peak() / OUTPUT_PEAK_CEILING;
        if ratio > 1.0 {
            for s in &mut self.samples {
                *s /= ratio;
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

pub(crate) fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

/// Load a WAV file, down-mixing to mono.
///
/// A missing file is a [`VcError::ResourceResolution`].
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(VcError::missing(
            "input audio",
            format!("{} does not exist", path.display()),
        )
        .into());
    }
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let samples = if channels > 1 {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        interleaved
    };

    tracing::debug!(
        path = %path.display(),
        channels,
        sample_rate = spec.sample_rate,
        samples = samples.len(),
        "loaded wav"
    );

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Write mono 16-bit PCM.
pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer.write_sample(scaled)?;
    }

    writer.finalize()?;
    Ok(())
}

/// Write a WAV so that `path` either holds the complete file or nothing.
///
/// Samples go to a hidden sibling first and are renamed into place once the
/// writer has been finalised. On failure the sibling is removed.
pub fn save_wav_atomic<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let staging = staging_path(path);

    if let Err(e) = save_wav(&staging, samples, sample_rate) {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }

    std::fs::rename(&staging, path).with_context(|| {
        let _ = std::fs::remove_file(&staging);
        format!("Failed to move output into place: {}", path.display())
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.wav".to_string());
    path.with_file_name(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use candle_core::Device;
    use tempfile::tempdir;

    #[test]
    fn test_audio_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 16000], 16000);
        assert!((buffer.duration() - 1.0).abs() < 1e-6);
        let buffer = AudioBuffer::new(vec![0.0; 80000], 40000);
        assert!((buffer.duration() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_input_attenuates_hot_signal() {
        let mut buffer = AudioBuffer::new(vec![1.9, -0.5, 0.1], 16000);
        buffer.normalize_input();
        assert!((buffer.peak() - INPUT_PEAK_CEILING).abs() < 1e-6);
        assert!((buffer.samples[1] + 0.5 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_input_leaves_quiet_signal() {
        let mut buffer = AudioBuffer::new(vec![0.5, -0.25, 0.1], 16000);
        buffer.normalize_input();
        assert_eq!(buffer.samples, vec![0.5, -0.25, 0.1]);
    }

    #[test]
    fn test_limit_output_peak() {
        let mut buffer = AudioBuffer::new(vec![0.0, 1.98, -0.99], 40000);
        buffer.limit_output_peak();
        assert!((buffer.peak() - OUTPUT_PEAK_CEILING).abs() < 1e-6);
        assert!((buffer.samples[2] + 0.495).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_conversions() {
        let device = Device::Cpu;
        let buffer = AudioBuffer::new(vec![0.1, 0.2, 0.3], 16000);
        let tensor = buffer.to_tensor(&device).unwrap();
        assert_eq!(tensor.dims(), &[3]);

        let nested = Tensor::new(&[[[0.1f32, 0.2, 0.3]]], &device).unwrap();
        let back = AudioBuffer::from_tensor(nested, 16000).unwrap();
        assert_eq!(back.len(), 3);
    }

    #[test]
    fn test_save_and_load_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("take.wav");

        let original = AudioBuffer::new(vec![0.1, 0.2, -0.3, 0.4, -0.5], 40000);
        original.save(&path).unwrap();

        let loaded = AudioBuffer::load(&path).unwrap();
        assert_eq!(loaded.sample_rate, 40000);
        assert_eq!(loaded.len(), 5);
        for (a, b) in original.samples.iter().zip(loaded.samples.iter()) {
            assert!((a - b).abs() < 1e-4, "sample mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..10 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), 10);
        assert!((loaded.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_missing_file_is_resolution_error() {
        let err = load_wav("/nonexistent/path/to/file.wav").unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::ResourceResolution));
    }

    #[test]
    fn test_atomic_save_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.wav");
        save_wav_atomic(&path, &[0.0, 0.5, -0.5], 48000).unwrap();

        assert!(path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_save_into_missing_dir_fails_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("no_such_dir").join("out.wav");
        assert!(save_wav_atomic(&path, &[0.0; 4], 16000).is_err());
        assert!(!path.exists());
    }
}
