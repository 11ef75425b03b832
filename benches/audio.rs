//! Micro-benchmarks for audio processing (mel front-end, resampling,
//! high-pass filtering, loudness matching, pm pitch tracking).
//!
//! Run with: `cargo bench -- audio`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rvc_infer::audio::{high_pass, mix_rms, resample, AudioBuffer, MelConfig, MelSpectrogram};
use rvc_infer::pitch::pm::{PmConfig, PmEstimator};
use std::f32::consts::PI;
use std::hint::black_box;

/// 150 Hz sine at `sample_rate` for the given duration in seconds.
fn sine_wave(duration_secs: f32, sample_rate: u32) -> Vec<f32> {
    let n = (duration_secs * sample_rate as f32) as usize;
    (0..n)
        .map(|i| 0.5 * (2.0 * PI * 150.0 * i as f32 / sample_rate as f32).sin())
        .collect()
}

fn bench_mel_spectrogram(c: &mut Criterion) {
    let mel = MelSpectrogram::new(MelConfig::rmvpe());
    let mut group = c.benchmark_group("mel_spectrogram");

    for duration in [0.5, 2.0, 10.0] {
        let samples = sine_wave(duration, 16000);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{duration}s")),
            &duration,
            |b, _| {
                b.iter(|| mel.compute(black_box(&samples)));
            },
        );
    }
    group.finish();
}

fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample");

    for (from_rate, to_rate) in [(44100u32, 16000u32), (40000, 48000)] {
        for duration in [0.5, 2.0, 10.0] {
            let audio = AudioBuffer::new(sine_wave(duration, from_rate), from_rate);

            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{from_rate}to{to_rate}_{duration}s")),
                &(from_rate, to_rate, duration),
                |b, _| {
                    b.iter(|| resample(black_box(&audio), to_rate).unwrap());
                },
            );
        }
    }
    group.finish();
}

fn bench_high_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("high_pass");

    for duration in [2.0, 10.0] {
        let samples = sine_wave(duration, 16000);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{duration}s")),
            &duration,
            |b, _| {
                b.iter(|| high_pass(black_box(&samples), 16000).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_rms_mix(c: &mut Criterion) {
    let input = sine_wave(10.0, 16000);
    let output = sine_wave(10.0, 40000);

    c.bench_function("rms_mix_10s", |b| {
        b.iter(|| {
            let mut out = output.clone();
            mix_rms(black_box(&input), 16000, &mut out, 40000, 0.25);
            out
        });
    });
}

fn bench_pm_tracking(c: &mut Criterion) {
    let tracker = PmEstimator::new(PmConfig::default());
    let mut group = c.benchmark_group("pm_track");

    for duration in [1.0, 5.0] {
        let samples = sine_wave(duration, 16000);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{duration}s")),
            &duration,
            |b, _| {
                b.iter(|| tracker.track(black_box(&samples), 16000));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_mel_spectrogram,
    bench_resample,
    bench_high_pass,
    bench_rms_mix,
    bench_pm_tracking
);
criterion_main!(benches);
