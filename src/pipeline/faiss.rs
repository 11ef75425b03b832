//! Reader for the FAISS index files written by the RVC trainer.
//!
//! Two layouts are understood: `IndexFlatL2` (fourcc `IxF2`) and
//! `IndexIVFFlat` (fourcc `IwFl`) with a flat L2 coarse quantizer and array
//! inverted lists (`ilar`). Integers are little-endian, `idx_t` and
//! `size_t` are 64-bit.
//!
//! Layout of an `IwFl` file:
//!
//! ```text
//! "IwFl" header nlist nprobe
//!   "IxF2" header n_floats centroids...      coarse quantizer
//!   direct_map_type array_len array... [hash_len pairs...]
//!   "ilar" nlist code_size ("full" sizes | "sprs" (list, size) pairs)
//!   per non-empty list: codes (size * code_size bytes), ids (size * i64)
//! ```

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::VcError;

const FLAT_L2: [u8; 4] = *b"IxF2";
const FLAT_IP: [u8; 4] = *b"IxFI";
const IVF_FLAT: [u8; 4] = *b"IwFl";
const ARRAY_LISTS: [u8; 4] = *b"ilar";
const NO_LISTS: [u8; 4] = *b"il00";
const FULL_SIZES: [u8; 4] = *b"full";
const SPARSE_SIZES: [u8; 4] = *b"sprs";

const METRIC_L2: i32 = 1;
const DIRECT_MAP_HASHTABLE: u8 = 2;

/// Vectors and, for IVF files, the list layout recovered from a FAISS file.
#[derive(Debug)]
pub struct FaissIndex {
    pub dim: usize,
    pub vectors: Vec<f32>,
    pub ivf: Option<FaissLists>,
}

#[derive(Debug)]
pub struct FaissLists {
    pub centroids: Vec<f32>,
    /// Inverted list of each vector, by vector id.
    pub assignments: Vec<u32>,
    pub nprobe: usize,
}

/// Whether `bytes` starts with a FAISS index fourcc.
pub fn is_faiss(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && [FLAT_L2, FLAT_IP, IVF_FLAT].iter().any(|f| bytes[..4] == f[..])
}

pub fn read(bytes: &[u8]) -> Result<FaissIndex> {
    let mut r = Cursor::new(bytes);
    let index = match fourcc(&mut r)? {
        FLAT_L2 => {
            let (dim, vectors) = read_flat_body(&mut r)?;
            FaissIndex {
                dim,
                vectors,
                ivf: None,
            }
        }
        IVF_FLAT => read_ivf_flat(&mut r)?,
        FLAT_IP => return Err(VcError::config("inner-product FAISS indexes are not supported").into()),
        other => return Err(unsupported("index", other).into()),
    };
    if (r.position() as usize) < bytes.len() {
        tracing::debug!(trailing = bytes.len() - r.position() as usize, "ignoring bytes after FAISS index");
    }
    Ok(index)
}

struct Header {
    dim: usize,
    ntotal: usize,
}

fn read_header(r: &mut Cursor<&[u8]>) -> Result<Header> {
    let dim = r.read_i32::<LittleEndian>()?;
    let ntotal = r.read_i64::<LittleEndian>()?;
    // two unused idx_t fields
    r.read_i64::<LittleEndian>()?;
    r.read_i64::<LittleEndian>()?;
    let _is_trained = r.read_u8()?;
    let metric = r.read_i32::<LittleEndian>()?;
    if metric > 1 {
        r.read_f32::<LittleEndian>()?;
    }
    if metric != METRIC_L2 {
        return Err(VcError::config(format!("FAISS index uses metric {metric}, expected L2")).into());
    }
    if dim <= 0 || ntotal < 0 {
        return Err(VcError::config(format!("FAISS header has d = {dim}, ntotal = {ntotal}")).into());
    }
    Ok(Header {
        dim: dim as usize,
        ntotal: ntotal as usize,
    })
}

/// Header plus the `xb` float vector of an `IndexFlat`.
fn read_flat_body(r: &mut Cursor<&[u8]>) -> Result<(usize, Vec<f32>)> {
    let header = read_header(r)?;
    let n_floats = read_len(r, 4)?;
    if n_floats != header.ntotal * header.dim {
        return Err(VcError::config(format!(
            "flat index stores {n_floats} floats for {} vectors of dim {}",
            header.ntotal, header.dim
        ))
        .into());
    }
    let mut vectors = vec![0.0f32; n_floats];
    r.read_f32_into::<LittleEndian>(&mut vectors)
        .context("truncated FAISS vector data")?;
    Ok((header.dim, vectors))
}

fn read_ivf_flat(r: &mut Cursor<&[u8]>) -> Result<FaissIndex> {
    let header = read_header(r)?;
    let nlist = r.read_u64::<LittleEndian>()? as usize;
    let nprobe = r.read_u64::<LittleEndian>()? as usize;

    let quantizer = fourcc(r)?;
    if quantizer != FLAT_L2 {
        return Err(unsupported("coarse quantizer", quantizer).into());
    }
    let (q_dim, centroids) = read_flat_body(r)?;
    if q_dim != header.dim || centroids.len() != nlist * header.dim {
        return Err(VcError::config(format!(
            "coarse quantizer holds {} centroids of dim {q_dim}, expected {nlist} of dim {}",
            centroids.len() / q_dim.max(1),
            header.dim
        ))
        .into());
    }
    skip_direct_map(r)?;

    let mut vectors = vec![0.0f32; header.ntotal * header.dim];
    let mut assignments = vec![u32::MAX; header.ntotal];
    match fourcc(r)? {
        NO_LISTS => {}
        ARRAY_LISTS => {
            let sizes = read_list_sizes(r, nlist, header.dim)?;
            let code_size = header.dim * 4;
            for (list, size) in sizes.into_iter().enumerate().filter(|&(_, s)| s > 0) {
                let mut codes = vec![0.0f32; size * header.dim];
                ensure_remaining(r, size * code_size)?;
                r.read_f32_into::<LittleEndian>(&mut codes)?;
                let mut ids = vec![0i64; size];
                ensure_remaining(r, size * 8)?;
                r.read_i64_into::<LittleEndian>(&mut ids)?;
                for (id, code) in ids.into_iter().zip(codes.chunks(header.dim)) {
                    let slot = usize::try_from(id)
                        .ok()
                        .filter(|&i| i < header.ntotal)
                        .ok_or_else(|| VcError::config(format!("list {list} holds vector id {id} outside 0..{}", header.ntotal)))?;
                    vectors[slot * header.dim..(slot + 1) * header.dim].copy_from_slice(code);
                    assignments[slot] = list as u32;
                }
            }
        }
        other => return Err(unsupported("inverted lists", other).into()),
    }
    if let Some(missing) = assignments.iter().position(|&l| l == u32::MAX) {
        return Err(VcError::config(format!("vector {missing} is in no inverted list")).into());
    }

    Ok(FaissIndex {
        dim: header.dim,
        vectors,
        ivf: Some(FaissLists {
            centroids,
            assignments,
            nprobe,
        }),
    })
}

fn skip_direct_map(r: &mut Cursor<&[u8]>) -> Result<()> {
    let kind = r.read_u8()?;
    let array = read_len(r, 8)?;
    r.set_position(r.position() + array as u64 * 8);
    if kind == DIRECT_MAP_HASHTABLE {
        let pairs = read_len(r, 16)?;
        r.set_position(r.position() + pairs as u64 * 16);
    }
    Ok(())
}

/// Entries per inverted list, from either the dense or the sparse encoding.
fn read_list_sizes(r: &mut Cursor<&[u8]>, nlist: usize, dim: usize) -> Result<Vec<usize>> {
    let stored_nlist = r.read_u64::<LittleEndian>()? as usize;
    let code_size = r.read_u64::<LittleEndian>()? as usize;
    if stored_nlist != nlist || code_size != dim * 4 {
        return Err(VcError::config(format!(
            "inverted lists have nlist {stored_nlist} and code size {code_size}, expected {nlist} and {}",
            dim * 4
        ))
        .into());
    }
    let kind = fourcc(r)?;
    let n = read_len(r, 8)?;
    let mut raw = vec![0u64; n];
    r.read_u64_into::<LittleEndian>(&mut raw)?;
    match kind {
        FULL_SIZES if n == nlist => Ok(raw.into_iter().map(|s| s as usize).collect()),
        SPARSE_SIZES if n % 2 == 0 => {
            let mut sizes = vec![0usize; nlist];
            for pair in raw.chunks(2) {
                let slot = sizes
                    .get_mut(pair[0] as usize)
                    .ok_or_else(|| VcError::config(format!("sparse size for missing list {}", pair[0])))?;
                *slot = pair[1] as usize;
            }
            Ok(sizes)
        }
        FULL_SIZES | SPARSE_SIZES => Err(VcError::config(format!("malformed list size table of {n} entries")).into()),
        other => Err(unsupported("list size table", other).into()),
    }
}

fn fourcc(r: &mut Cursor<&[u8]>) -> Result<[u8; 4]> {
    let mut tag = [0u8; 4];
    r.read_exact(&mut tag).context("truncated FAISS index")?;
    Ok(tag)
}

/// A 64-bit element count, checked against the bytes left in the file.
fn read_len(r: &mut Cursor<&[u8]>, elem_size: usize) -> Result<usize> {
    let n = r.read_u64::<LittleEndian>().context("truncated FAISS index")? as usize;
    ensure_remaining(r, n.saturating_mul(elem_size))?;
    Ok(n)
}

fn ensure_remaining(r: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    let left = r.get_ref().len().saturating_sub(r.position() as usize);
    if needed > left {
        return Err(VcError::config(format!("truncated FAISS index: need {needed} bytes, {left} left")).into());
    }
    Ok(())
}

fn unsupported(what: &str, tag: [u8; 4]) -> VcError {
    VcError::config(format!(
        "unsupported FAISS {what} `{}`",
        String::from_utf8_lossy(&tag)
    ))
}
