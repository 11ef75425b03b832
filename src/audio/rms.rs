//! Loudness envelopes and envelope matching.

/// Frame RMS with centred, zero-padded frames.
///
/// Produces `1 + len / hop` values.
pub fn rms_envelope(samples: &[f32], frame: usize, hop: usize) -> Vec<f32> {
    if frame == 0 || hop == 0 {
        return Vec::new();
    }
    let half = frame / 2;
    let n_frames = 1 + samples.len() / hop;
    (0..n_frames)
        .map(|i| {
            // Frame i covers [i·hop − half, i·hop − half + frame) of the input
            let start = (i * hop) as isize - half as isize;
            let lo = start.max(0) as usize;
            let hi = ((start + frame as isize).max(0) as usize).min(samples.len());
            let energy: f64 = samples
                .get(lo..hi)
                .map(|s| s.iter().map(|&x| (x as f64) * (x as f64)).sum())
                .unwrap_or(0.0);
            (energy / frame as f64).sqrt() as f32
        })
        .collect()
}

/// Linear interpolation to `len` points, sample centres aligned.
pub fn interpolate_linear(values: &[f32], len: usize) -> Vec<f32> {
    match values.len() {
        0 => vec![0.0; len],
        1 => vec![values[0]; len],
        m => {
            let scale = m as f64 / len.max(1) as f64;
            (0..len)
                .map(|i| {
                    let src = ((i as f64 + 0.5) * scale - 0.5).max(0.0);
                    let i0 = (src.floor() as usize).min(m - 1);
                    let i1 = (i0 + 1).min(m - 1);
                    let frac = (src - i0 as f64) as f32;
                    values[i0] * (1.0 - frac) + values[i1] * frac
                })
                .collect()
        }
    }
}

/// Envelope for half-second frames at `sample_rate`, stretched to `len`.
fn half_second_envelope(samples: &[f32], sample_rate: u32, len: usize) -> Vec<f32> {
    let hop = (sample_rate / 2) as usize;
    interpolate_linear(&rms_envelope(samples, hop * 2, hop), len)
}

/// Pull the loudness of `output` toward that of `input`.
///
/// `rate` 1 keeps the output envelope, 0 imposes the input envelope.
pub fn mix_rms(input: &[f32], input_rate: u32, output: &mut [f32], output_rate: u32, rate: f32) {
    if rate >= 1.0 || output.is_empty() {
        return;
    }
    let len = output.len();
    let env_in = half_second_envelope(input, input_rate, len);
    let env_out = half_second_envelope(output, output_rate, len);
    for ((y, a), b) in output.iter_mut().zip(&env_in).zip(&env_out) {
        *y *= a.powf(1.0 - rate) * b.max(1e-6).powf(rate - 1.0);
    }
}
