//! Retrieval index and feature blending.
//!
//! The index holds the target speaker's training features. Two file
//! formats load into the same [`RetrievalIndex`]:
//!
//! - FAISS `IndexFlatL2` / `IndexIVFFlat` files as the trainer writes them
//!   (see [`super::faiss`]).
//! - safetensors with `vectors [N, D]`, optionally `centroids [L, D]` plus
//!   `assignments [N]` (u32 list per vector) and an `nprobe` metadata entry.
//!
//! Blending replaces each frame with a mix of itself and the inverse
//! square-distance weighted mean of its nearest training vectors.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::faiss;
use crate::error::VcError;

/// Neighbours retrieved per frame.
pub const TOP_K: usize = 8;
/// Lists probed when the file does not say.
pub const DEFAULT_NPROBE: usize = 1;
/// Rows per distance matmul in exact search.
const QUERY_BATCH: usize = 256;
const MIN_DISTANCE: f32 = 1e-6;

/// Nearest-neighbour lookup over fixed-width vectors.
pub trait NeighborSearch: Send + Sync {
    fn dim(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// For each row of `queries` (`n × dim`, row-major), up to `k`
    /// `(squared distance, id)` pairs, nearest first.
    fn search(&self, queries: &[f32], k: usize) -> Result<Vec<Vec<(f32, u32)>>>;

    fn reconstruct(&self, id: u32) -> &[f32];
}

#[derive(Debug, Clone)]
struct InvertedLists {
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
    nprobe: usize,
}

/// Transposed base matrix and squared norms for exact search.
#[derive(Debug, Clone)]
struct ExactBase {
    base_t: Tensor,
    base_sq: Vec<f32>,
}

impl ExactBase {
    fn new(vectors: &[f32], dim: usize) -> Result<Self> {
        let base = Tensor::from_slice(vectors, (vectors.len() / dim, dim), &Device::Cpu)?;
        Ok(Self {
            base_t: base.t()?.contiguous()?,
            base_sq: base.sqr()?.sum(1)?.to_vec1::<f32>()?,
        })
    }
}

/// In-memory index over a speaker's training features.
#[derive(Debug, Clone)]
pub struct RetrievalIndex {
    vectors: Vec<f32>,
    dim: usize,
    exact: Option<ExactBase>,
    ivf: Option<InvertedLists>,
    path: Option<PathBuf>,
}

impl RetrievalIndex {
    /// Flat index over `vectors` (`n × dim`, row-major).
    pub fn new(vectors: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 || vectors.len() % dim != 0 {
            return Err(VcError::config(format!(
                "index holds {} values, not a whole number of {dim}-dim vectors",
                vectors.len()
            ))
            .into());
        }
        let exact = if vectors.is_empty() {
            None
        } else {
            Some(ExactBase::new(&vectors, dim)?)
        };
        Ok(Self {
            vectors,
            dim,
            exact,
            ivf: None,
            path: None,
        })
    }

    /// Add inverted lists: `centroids` (`L × dim`) and one list id per vector.
    pub fn with_ivf(mut self, centroids: Vec<f32>, assignments: &[u32], nprobe: usize) -> Result<Self> {
        if centroids.is_empty() || centroids.len() % self.dim != 0 {
            return Err(VcError::config("index centroids do not match the vector width").into());
        }
        if assignments.len() != self.len() {
            return Err(VcError::config(format!(
                "index has {} vectors but {} list assignments",
                self.len(),
                assignments.len()
            ))
            .into());
        }
        let n_lists = centroids.len() / self.dim;
        let mut lists = vec![Vec::new(); n_lists];
        for (id, &list) in assignments.iter().enumerate() {
            let slot = lists.get_mut(list as usize).ok_or_else(|| {
                VcError::config(format!("vector {id} assigned to missing list {list}"))
            })?;
            slot.push(id as u32);
        }
        self.exact = None;
        self.ivf = Some(InvertedLists {
            centroids,
            lists,
            nprobe: nprobe.clamp(1, n_lists),
        });
        Ok(self)
    }

    /// Load a FAISS or safetensors index, chosen by the leading bytes.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VcError::missing("retrieval index", path.display().to_string()).into());
        }
        let bytes = std::fs::read(path).with_context(|| format!("failed to read index {}", path.display()))?;
        let is_faiss = faiss::is_faiss(&bytes);
        let mut index = if is_faiss {
            Self::from_faiss(&bytes)
        } else {
            Self::from_safetensors(&bytes)
        }
        .with_context(|| format!("failed to read index {}", path.display()))?;

        index.path = Some(path.to_path_buf());
        tracing::info!(
            index = %path.display(),
            format = if is_faiss { "faiss" } else { "safetensors" },
            vectors = index.len(),
            dim = index.dim,
            ivf = index.ivf.is_some(),
            "loaded retrieval index"
        );
        Ok(index)
    }

    fn from_faiss(bytes: &[u8]) -> Result<Self> {
        let raw = faiss::read(bytes)?;
        let index = Self::new(raw.vectors, raw.dim)?;
        match raw.ivf {
            Some(lists) => index.with_ivf(lists.centroids, &lists.assignments, lists.nprobe),
            None => Ok(index),
        }
    }

    fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let tensors = candle_core::safetensors::load_buffer(bytes, &Device::Cpu)?;
        let vectors = tensors
            .get("vectors")
            .ok_or_else(|| VcError::config("index has no `vectors` tensor"))?;
        let (_, dim) = vectors.dims2()?;
        let flat = vectors.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let index = Self::new(flat, dim)?;

        match (tensors.get("centroids"), tensors.get("assignments")) {
            (Some(centroids), Some(assignments)) => {
                let centroids = centroids.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                let assignments = assignments.to_dtype(DType::U32)?.to_vec1::<u32>()?;
                let nprobe = read_nprobe(bytes)?.unwrap_or(DEFAULT_NPROBE);
                index.with_ivf(centroids, &assignments, nprobe)
            }
            _ => Ok(index),
        }
    }

    /// Write in the layout [`RetrievalIndex::load`] reads.
    pub fn save(&self, path: &Path) -> Result<()> {
        use safetensors::tensor::{Dtype, TensorView};

        let n = self.len();
        let vec_bytes: Vec<u8> = self.vectors.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut views = vec![(
            "vectors".to_string(),
            TensorView::new(Dtype::F32, vec![n, self.dim], &vec_bytes)?,
        )];
        let mut metadata = HashMap::new();

        let (cent_bytes, assign_bytes) = match &self.ivf {
            Some(ivf) => {
                let mut assignments = vec![0u32; n];
                for (list, ids) in ivf.lists.iter().enumerate() {
                    for &id in ids {
                        assignments[id as usize] = list as u32;
                    }
                }
                metadata.insert("nprobe".to_string(), ivf.nprobe.to_string());
                (
                    ivf.centroids.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
                    assignments.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
                )
            }
            None => (Vec::new(), Vec::new()),
        };
        if let Some(ivf) = &self.ivf {
            views.push((
                "centroids".to_string(),
                TensorView::new(Dtype::F32, vec![ivf.lists.len(), self.dim], &cent_bytes)?,
            ));
            views.push((
                "assignments".to_string(),
                TensorView::new(Dtype::U32, vec![n], &assign_bytes)?,
            ));
        }
        safetensors::serialize_to_file(views, &Some(metadata), path)
            .with_context(|| format!("failed to write index {}", path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn row(&self, id: usize) -> &[f32] {
        &self.vectors[id * self.dim..(id + 1) * self.dim]
    }

    fn exact_search(&self, exact: &ExactBase, queries: &[f32], k: usize) -> Result<Vec<Vec<(f32, u32)>>> {
        let device = Device::Cpu;

        let mut out = Vec::with_capacity(queries.len() / self.dim);
        for batch in queries.chunks(QUERY_BATCH * self.dim) {
            let rows = batch.len() / self.dim;
            let q = Tensor::from_slice(batch, (rows, self.dim), &device)?;
            let dots = q.matmul(&exact.base_t)?.to_vec2::<f32>()?;
            for (r, dot_row) in dots.iter().enumerate() {
                let query = &batch[r * self.dim..(r + 1) * self.dim];
                let q_sq: f32 = query.iter().map(|x| x * x).sum();
                let candidates = dot_row
                    .iter()
                    .zip(&exact.base_sq)
                    .enumerate()
                    .map(|(id, (dot, b))| ((q_sq - 2.0 * dot + b).max(0.0), id as u32));
                out.push(top_k(candidates, k));
            }
        }
        Ok(out)
    }

    fn ivf_search(&self, ivf: &InvertedLists, queries: &[f32], k: usize) -> Vec<Vec<(f32, u32)>> {
        queries
            .chunks(self.dim)
            .map(|query| {
                let nearest_lists = top_k(
                    ivf.centroids
                        .chunks(self.dim)
                        .enumerate()
                        .map(|(l, c)| (squared_distance(query, c), l as u32)),
                    ivf.nprobe,
                );
                let candidates = nearest_lists.iter().flat_map(|&(_, l)| {
                    ivf.lists[l as usize]
                        .iter()
                        .map(|&id| (squared_distance(query, self.row(id as usize)), id))
                });
                top_k(candidates, k)
            })
            .collect()
    }
}

impl NeighborSearch for RetrievalIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.vectors.len() / self.dim
    }

    fn search(&self, queries: &[f32], k: usize) -> Result<Vec<Vec<(f32, u32)>>> {
        if self.is_empty() {
            return Ok(vec![Vec::new(); queries.len() / self.dim]);
        }
        match (&self.ivf, &self.exact) {
            (Some(ivf), _) => Ok(self.ivf_search(ivf, queries, k)),
            (None, Some(exact)) => self.exact_search(exact, queries, k),
            (None, None) => Err(anyhow::anyhow!("flat index has no search matrix")),
        }
    }

    fn reconstruct(&self, id: u32) -> &[f32] {
        self.row(id as usize)
    }
}

fn read_nprobe(bytes: &[u8]) -> Result<Option<usize>> {
    let (_, header) = safetensors::SafeTensors::read_metadata(bytes)
        .map_err(|e| anyhow::anyhow!("invalid index header: {e}"))?;
    Ok(header
        .metadata()
        .as_ref()
        .and_then(|m| m.get("nprobe"))
        .and_then(|v| v.trim().parse().ok()))
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// The `k` smallest by distance, ascending.
fn top_k(items: impl Iterator<Item = (f32, u32)>, k: usize) -> Vec<(f32, u32)> {
    let mut all: Vec<(f32, u32)> = items.collect();
    if all.len() > k && k > 0 {
        all.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
        all.truncate(k);
    }
    all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    all.truncate(k);
    all
}

/// Check an index rate lies in [0, 1].
pub fn validate_index_rate(rate: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(VcError::config(format!("index rate {rate} outside [0, 1]")).into());
    }
    Ok(())
}

/// `rate · retrieved + (1 − rate) · feats` for `[1, frames, dim]` features.
///
/// A zero rate returns the input without querying the index.
#[tracing::instrument(skip_all, fields(rate))]
pub fn blend(feats: &Tensor, index: &dyn NeighborSearch, rate: f32) -> Result<Tensor> {
    validate_index_rate(rate)?;
    if rate == 0.0 {
        return Ok(feats.clone());
    }
    let (b, frames, dim) = feats.dims3()?;
    if dim != index.dim() {
        return Err(VcError::config(format!(
            "index vectors are {}-dim but the content features are {dim}-dim",
            index.dim()
        ))
        .into());
    }
    if index.is_empty() || frames == 0 {
        return Ok(feats.clone());
    }

    let original = feats.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let neighbours = index.search(&original, TOP_K)?;

    let mut mixed = Vec::with_capacity(original.len());
    for (query, hits) in original.chunks(dim).zip(&neighbours) {
        let weights: Vec<f32> = hits
            .iter()
            .map(|(d, _)| 1.0 / d.max(MIN_DISTANCE).powi(2))
            .collect();
        let total: f32 = weights.iter().sum();
        let mut retrieved = vec![0.0f32; dim];
        for ((_, id), w) in hits.iter().zip(&weights) {
            for (acc, v) in retrieved.iter_mut().zip(index.reconstruct(*id)) {
                *acc += w / total * v;
            }
        }
        if hits.is_empty() {
            retrieved.copy_from_slice(query);
        }
        mixed.extend(
            retrieved
                .iter()
                .zip(query)
                .map(|(r, q)| rate * r + (1.0 - rate) * q),
        );
    }
    let out = Tensor::from_vec(mixed, (b, frames, dim), feats.device())?;
    Ok(out.to_dtype(feats.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts searches so the zero-rate fast path can be checked.
    struct CountingIndex {
        inner: RetrievalIndex,
        searches: AtomicUsize,
    }

    impl NeighborSearch for CountingIndex {
        fn dim(&self) -> usize {
            self.inner.dim()
        }
        fn len(&self) -> usize {
            self.inner.len()
        }
        fn search(&self, queries: &[f32], k: usize) -> Result<Vec<Vec<(f32, u32)>>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.inner.search(queries, k)
        }
        fn reconstruct(&self, id: u32) -> &[f32] {
            self.inner.reconstruct(id)
        }
    }

    fn grid_index() -> RetrievalIndex {
        // 16 points on a 4x4 grid in 2-D
        let vectors: Vec<f32> = (0..16).flat_map(|i| [(i % 4) as f32, (i / 4) as f32]).collect();
        RetrievalIndex::new(vectors, 2).unwrap()
    }

    #[test]
    fn test_exact_search_orders_by_distance() {
        let index = grid_index();
        let hits = index.search(&[0.1, 0.0, 3.0, 3.2], 3).unwrap();
        assert_eq!(hits[0][0].1, 0);
        assert!((hits[0][0].0 - 0.01).abs() < 1e-5);
        assert_eq!(hits[0][1].1, 1);
        assert_eq!(hits[1][0].1, 15);
        assert!(hits[0].windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_ivf_search_probes_nearest_list() {
        // Left half in list 0, right half in list 1
        let assignments: Vec<u32> = (0..16).map(|i| if i % 4 < 2 { 0 } else { 1 }).collect();
        let index = grid_index()
            .with_ivf(vec![0.5, 1.5, 2.5, 1.5], &assignments, 1)
            .unwrap();
        let hits = index.search(&[3.0, 0.0], 4).unwrap();
        assert_eq!(hits[0][0].1, 3);
        assert!(hits[0].iter().all(|&(_, id)| id % 4 >= 2));
    }

    #[test]
    fn test_zero_rate_skips_search() {
        let index = CountingIndex {
            inner: grid_index(),
            searches: AtomicUsize::new(0),
        };
        let feats = Tensor::new(&[[[0.3f32, 0.7], [2.2, 1.1]]], &Device::Cpu).unwrap();
        let out = blend(&feats, &index, 0.0).unwrap();
        assert_eq!(index.searches.load(Ordering::SeqCst), 0);
        assert_eq!(out.to_vec3::<f32>().unwrap(), feats.to_vec3::<f32>().unwrap());
    }

    #[test]
    fn test_full_rate_pulls_onto_index() {
        let index = grid_index();
        // Exactly on a grid point: the exact match dominates the weights
        let feats = Tensor::new(&[[[2.0f32, 1.0]]], &Device::Cpu).unwrap();
        let out = blend(&feats, &index, 1.0).unwrap().to_vec3::<f32>().unwrap();
        assert!((out[0][0][0] - 2.0).abs() < 1e-3);
        assert!((out[0][0][1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_half_rate_is_midpoint() {
        let index = RetrievalIndex::new(vec![1.0, 1.0], 2).unwrap();
        let feats = Tensor::new(&[[[0.0f32, 0.0]]], &Device::Cpu).unwrap();
        let out = blend(&feats, &index, 0.5).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(out[0][0], vec![0.5, 0.5]);
    }

    #[test]
    fn test_rate_and_dim_errors() {
        let index = grid_index();
        let feats = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let err = blend(&feats, &index, 1.5).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Configuration));
        let wide = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = blend(&wide, &index, 0.5).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_save_load_keeps_ivf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speaker_v2.index");
        let assignments: Vec<u32> = (0..16).map(|i| (i % 2) as u32).collect();
        let index = grid_index()
            .with_ivf(vec![1.0, 1.0, 2.0, 2.0], &assignments, 2)
            .unwrap();
        index.save(&path).unwrap();

        let loaded = RetrievalIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 16);
        assert_eq!(loaded.dim(), 2);
        assert_eq!(loaded.reconstruct(5), &[1.0, 1.0]);
        let ivf = loaded.ivf.as_ref().unwrap();
        assert_eq!(ivf.nprobe, 2);
        assert_eq!(ivf.lists[1].len(), 8);
    }

    #[test]
    fn test_missing_index_file() {
        let err = RetrievalIndex::load(Path::new("/nonexistent/x.index")).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::ResourceResolution));
    }

    #[test]
    fn test_load_faiss_flat_trainer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("added_IVF1_Flat_nprobe_1_voice_v2.index");
        std::fs::write(&path, faiss::test_files::flat(4, &[1.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0])).unwrap();

        let index = RetrievalIndex::load(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.dim(), 4);
        assert_eq!(index.reconstruct(1), &[0.0, 2.0, 0.0, 0.0]);
        let hits = index.search(&[0.0, 1.9, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0][0].1, 1);
        assert_eq!(index.path(), Some(path.as_path()));
    }

    #[test]
    fn test_load_faiss_ivf_flat_matches_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("added_IVF2_Flat_nprobe_1_voice_v1.index");
        let grid = grid_index();
        let lists: Vec<Vec<u32>> = vec![
            (0..16).filter(|i| i % 4 < 2).collect(),
            (0..16).filter(|i| i % 4 >= 2).collect(),
        ];
        let bytes = faiss::test_files::ivf_flat(2, &grid.vectors, &[0.5, 1.5, 2.5, 1.5], &lists, 1, false);
        std::fs::write(&path, bytes).unwrap();

        let index = RetrievalIndex::load(&path).unwrap();
        assert_eq!(index.vectors, grid.vectors);
        let ivf = index.ivf.as_ref().unwrap();
        assert_eq!(ivf.nprobe, 1);
        assert_eq!(ivf.lists[1], lists[1]);
        let hits = index.search(&[3.0, 0.0], 4).unwrap();
        assert_eq!(hits[0][0].1, 3);
        assert!(hits[0].iter().all(|&(_, id)| id % 4 >= 2));
    }

    #[test]
    fn test_unreadable_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.index");
        std::fs::write(&path, b"not an index at all").unwrap();
        assert!(RetrievalIndex::load(&path).is_err());
    }

    #[test]
    fn test_exact_search_reuses_base_across_batches() {
        let index = grid_index();
        // More rows than one matmul batch
        let queries: Vec<f32> = (0..QUERY_BATCH * 2 + 7)
            .flat_map(|i| [(i % 5) as f32 * 0.7, (i % 3) as f32 * 1.1])
            .collect();
        let first = index.search(&queries, 3).unwrap();
        let second = index.search(&queries, 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), QUERY_BATCH * 2 + 7);
        for (query, hits) in queries.chunks(2).zip(&first) {
            let best = (0..16u32)
                .map(|id| squared_distance(query, index.reconstruct(id)))
                .fold(f32::INFINITY, f32::min);
            assert!((hits[0].0 - best).abs() < 1e-4);
        }
    }
}
