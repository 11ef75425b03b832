//! Splitting long inputs into overlapping windows.
//!
//! Cut points sit near multiples of `t_center`, moved to the quietest
//! 10 ms window within `t_query` of the ideal point. Each chunk carries
//! `t_pad` samples of reflected or neighbouring context on both sides; its
//! centre region is what survives into the output.

use crate::audio::reflect_pad;

use super::context::ChunkPlan;

/// One processing window.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub index: usize,
    /// Padded chunk audio, zero-extended to whole frames
    pub audio: Vec<f32>,
    /// First input sample of the centre region
    pub start: usize,
    /// One past the last input sample of the centre region
    pub end: usize,
    /// Leading centre samples shared with the previous chunk
    pub overlap: usize,
    pub is_last: bool,
}

impl AudioChunk {
    /// 10 ms frames in [`AudioChunk::audio`].
    pub fn n_frames(&self, window: usize) -> usize {
        self.audio.len() / window
    }

    pub fn center_len(&self) -> usize {
        self.end - self.start
    }
}

/// Cut points for `audio` (16 kHz), in input samples, frame aligned.
///
/// Empty when the input fits in one chunk.
pub fn find_cuts(audio: &[f32], plan: &ChunkPlan) -> Vec<usize> {
    let n = audio.len();
    let window = plan.window;
    // compared on the length after the window/2 reflect padding below
    if n + window <= plan.t_max || plan.t_center == 0 {
        return Vec::new();
    }

    // Moving sum over one window on the reflect-padded signal
    let padded = reflect_pad(audio, window / 2);
    let mut energy = Vec::with_capacity(n);
    let mut acc: f64 = padded[..window].iter().map(|&x| x as f64).sum();
    energy.push(acc);
    for k in 1..n {
        acc += padded[k + window - 1] as f64 - padded[k - 1] as f64;
        energy.push(acc);
    }

    let mut cuts: Vec<usize> = Vec::new();
    for t in (plan.t_center..n).step_by(plan.t_center) {
        let lo = t.saturating_sub(plan.t_query);
        let hi = (t + plan.t_query).min(n);
        let cut = energy[lo..hi]
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| lo + i)
            .unwrap_or(t);
        let cut = cut / window * window;
        if cut > cuts.last().copied().unwrap_or(0) && cut + window <= n {
            cuts.push(cut);
        }
    }
    cuts
}

/// Lazy iterator over the chunks of one input.
///
/// Consumes its input; every centre sample is produced exactly once,
/// apart from the one-window overlaps recorded in [`AudioChunk::overlap`].
#[derive(Debug)]
pub struct Chunker {
    padded: Vec<f32>,
    input_len: usize,
    cuts: std::vec::IntoIter<usize>,
    plan: ChunkPlan,
    start: usize,
    index: usize,
    done: bool,
}

impl Chunker {
    pub fn new(audio: &[f32], plan: ChunkPlan) -> Self {
        let cuts = find_cuts(audio, &plan);
        tracing::debug!(samples = audio.len(), cuts = cuts.len(), "chunking input");
        Self {
            padded: reflect_pad(audio, plan.t_pad),
            input_len: audio.len(),
            cuts: cuts.into_iter(),
            plan,
            start: 0,
            index: 0,
            done: audio.is_empty(),
        }
    }

    /// Padded slice `[from, to)`, zero-extended past the end and to whole frames.
    fn slice(&self, from: usize, to: usize) -> Vec<f32> {
        let window = self.plan.window;
        let len = (to - from).div_ceil(window) * window;
        let mut out = vec![0.0f32; len];
        let avail = to.min(self.padded.len()).saturating_sub(from);
        out[..avail].copy_from_slice(&self.padded[from..from + avail]);
        out
    }
}

impl Iterator for Chunker {
    type Item = AudioChunk;

    fn next(&mut self) -> Option<AudioChunk> {
        if self.done {
            return None;
        }
        let overlap = if self.index == 0 { 0 } else { self.plan.window };
        let chunk = match self.cuts.next() {
            Some(t) => {
                let audio = self.slice(self.start, t + self.plan.t_pad2 + self.plan.window);
                let chunk = AudioChunk {
                    index: self.index,
                    audio,
                    start: self.start,
                    end: t + self.plan.window,
                    overlap,
                    is_last: false,
                };
                self.start = t;
                chunk
            }
            None => {
                self.done = true;
                AudioChunk {
                    index: self.index,
                    audio: self.slice(self.start, self.padded.len()),
                    start: self.start,
                    end: self.input_len,
                    overlap,
                    is_last: true,
                }
            }
        };
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = if self.done { 0 } else { self.cuts.len() + 1 };
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunker {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::ThresholdProfile;

    fn small_plan() -> ChunkPlan {
        // pad 0.01 s, query 0.05 s, centre 0.3 s, max 0.35 s
        ThresholdProfile::new(0.01, 0.05, 0.3, 0.35).plan(16000)
    }

    fn noise_with_gaps(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                // Silent 20 ms every 0.3 s
                if i % 4800 < 320 {
                    0.0
                } else {
                    (((i * 7919) % 200) as f32 / 100.0) - 1.0
                }
            })
            .collect()
    }

    #[test]
    fn test_short_input_single_chunk() {
        let plan = ThresholdProfile::FULL.plan(40000);
        let audio = vec![0.1f32; 48000];
        let chunks: Vec<_> = Chunker::new(&audio, plan).collect();
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert!(c.is_last);
        assert_eq!((c.start, c.end, c.overlap), (0, 48000, 0));
        assert_eq!(c.audio.len(), 48000 + 2 * plan.t_pad);
        assert_eq!(c.n_frames(160), 300 + 200);
    }

    #[test]
    fn test_centres_tile_input() {
        let plan = small_plan();
        let audio = noise_with_gaps(16000 * 2);
        let chunks: Vec<_> = Chunker::new(&audio, plan).collect();
        assert!(chunks.len() > 1);
        assert_eq!(Chunker::new(&audio, plan).len(), chunks.len());
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, audio.len());
        for pair in chunks.windows(2) {
            // Next centre begins one window before the previous one ends
            assert_eq!(pair[1].start + plan.window, pair[0].end);
            assert_eq!(pair[1].overlap, plan.window);
        }
        let covered: usize = chunks.iter().map(|c| c.center_len() - c.overlap).sum();
        assert_eq!(covered, audio.len());
    }

    #[test]
    fn test_cuts_land_in_silence() {
        let plan = small_plan();
        let audio = noise_with_gaps(16000 * 2);
        for cut in find_cuts(&audio, &plan) {
            let window = &audio[cut..cut + plan.window];
            assert!(window.iter().all(|&x| x == 0.0), "cut at {cut}");
        }
    }

    #[test]
    fn test_chunk_audio_is_whole_frames_with_context() {
        let plan = small_plan();
        let audio = noise_with_gaps(16000 * 2 + 77);
        for chunk in Chunker::new(&audio, plan) {
            assert_eq!(chunk.audio.len() % plan.window, 0);
            assert!(chunk.audio.len() >= chunk.center_len() + 2 * plan.t_pad);
        }
    }

    #[test]
    fn test_constant_signal_cuts_at_ideal_range() {
        let plan = small_plan();
        let audio = vec![0.5f32; 16000];
        let cuts = find_cuts(&audio, &plan);
        assert!(!cuts.is_empty());
        let t = plan.t_center;
        assert!(cuts[0] + plan.t_query >= t && cuts[0] < t + plan.t_query);
    }

    #[test]
    fn test_split_threshold_includes_window_padding() {
        let plan = small_plan();
        let fits = plan.t_max - plan.window;
        assert!(find_cuts(&vec![0.5f32; fits], &plan).is_empty());
        assert_eq!(Chunker::new(&vec![0.5f32; fits], plan).count(), 1);

        let over = vec![0.5f32; fits + 1];
        assert!(!find_cuts(&over, &plan).is_empty());
        assert!(Chunker::new(&over, plan).count() > 1);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(Chunker::new(&[], small_plan()).count(), 0);
    }
}
