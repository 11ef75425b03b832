//! Locating models, indexes and input audio on disk.
//!
//! Index lookup is a pure function over a [`FileListing`], so the naming
//! convention can be tested against an in-memory table.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::VcError;

/// Extensions of loadable voice checkpoints.
pub const MODEL_EXTENSIONS: [&str; 2] = ["pth", "safetensors"];

/// Directory the index mirror lives in, under the models root.
pub const INDEX_DIR: &str = "index";

/// File names directly inside a directory.
pub trait FileListing {
    /// Names of regular files in `dir`; a missing directory lists as empty.
    fn files(&self, dir: &Path) -> Result<Vec<String>>;
}

/// Lists the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsListing;

impl FileListing for FsListing {
    fn files(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Directory → file names, for tests and pre-enumerated trees.
impl FileListing for BTreeMap<PathBuf, Vec<String>> {
    fn files(&self, dir: &Path) -> Result<Vec<String>> {
        Ok(self.get(dir).cloned().unwrap_or_default())
    }
}

/// Where models and their indexes are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLayout {
    pub models_dir: PathBuf,
    pub index_dir: PathBuf,
}

impl ModelLayout {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        Self {
            index_dir: models_dir.join(INDEX_DIR),
            models_dir,
        }
    }

    /// Sub-directory of the models root holding `model`, empty at the root.
    pub fn category(&self, model: &Path) -> PathBuf {
        model
            .parent()
            .and_then(|p| p.strip_prefix(&self.models_dir).ok())
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Index for `model` under this layout.
    pub fn resolve_index(&self, model: &Path, listing: &dyn FileListing) -> Result<PathBuf> {
        let name = model_name(model)?;
        resolve_index(&name, &self.category(model), &self.index_dir, listing)
    }
}

impl Default for ModelLayout {
    fn default() -> Self {
        Self::new("models")
    }
}

/// File stem up to the first dot.
pub fn model_name(model: &Path) -> Result<String> {
    model
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| VcError::missing("model", format!("'{}' has no file name", model.display())).into())
}

fn index_candidates(model_name: &str) -> [String; 3] {
    [
        format!("{model_name}_v1.index"),
        format!("{model_name}_v2.index"),
        format!("{model_name}.index"),
    ]
}

fn matches_candidate(file: &str, candidates: &[String]) -> bool {
    candidates
        .iter()
        .any(|c| file == c || file.ends_with(&format!("_{c}")))
}

/// Find the one index belonging to `model_name`.
///
/// The index root is searched first, then `index_dir/category`. Exactly one
/// match is required in the first directory that has any; none anywhere or
/// several in one directory is a [`VcError::ResourceResolution`] carrying
/// the candidates.
pub fn resolve_index(
    model_name: &str,
    category: &Path,
    index_dir: &Path,
    listing: &dyn FileListing,
) -> Result<PathBuf> {
    let candidates = index_candidates(model_name);
    let mut dirs = vec![index_dir.to_path_buf()];
    if !category.as_os_str().is_empty() {
        dirs.push(index_dir.join(category));
    }

    for dir in &dirs {
        let mut found: Vec<String> = listing
            .files(dir)?
            .into_iter()
            .filter(|f| matches_candidate(f, &candidates))
            .collect();
        found.sort();
        match found.len() {
            0 => continue,
            1 => {
                let path = dir.join(&found[0]);
                tracing::debug!(model = model_name, index = %path.display(), "resolved index");
                return Ok(path);
            }
            _ => {
                return Err(VcError::ambiguous(
                    "retrieval index",
                    format!(
                        "multiple matching indexes for model '{model_name}' in {}",
                        dir.display()
                    ),
                    found,
                )
                .into())
            }
        }
    }

    let searched = dirs
        .iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(VcError::missing(
        "retrieval index",
        format!("no index for model '{model_name}' in {searched}"),
    )
    .into())
}

/// Clean up a user-supplied index path.
///
/// Surrounding whitespace and quotes are stripped, and `trained` in the
/// file name becomes `added`, pointing at the index the trainer finalised.
pub fn normalize_index_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
    let path = PathBuf::from(trimmed);
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.contains("trained") => path.with_file_name(name.replace("trained", "added")),
        _ => path,
    }
}

fn walk(dir: &Path, skip_top: Option<&str>, keep: &dyn Fn(&Path) -> bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if skip_top.is_some_and(|s| entry.file_name() == s) {
                continue;
            }
            walk(&path, None, keep, out)?;
        } else if file_type.is_file() && keep(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Every checkpoint under `root`, skipping the index mirror, sorted.
pub fn discover_models(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(VcError::missing("models directory", format!("{} does not exist", root.display())).into());
    }
    let mut out = Vec::new();
    walk(root, Some(INDEX_DIR), &|p| has_extension(p, &MODEL_EXTENSIONS), &mut out)?;
    out.sort();
    Ok(out)
}

/// Every `.wav` under `root`, sorted.
pub fn discover_audio(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(VcError::missing("audio directory", format!("{} does not exist", root.display())).into());
    }
    let mut out = Vec::new();
    walk(root, None, &|p| has_extension(p, &["wav"]), &mut out)?;
    out.sort();
    Ok(out)
}

/// Expand a selection string against `root`.
///
/// `all` takes everything; otherwise `;`-separated entries name files or
/// directories relative to `root`. An entry that matches nothing is a
/// [`VcError::ResourceResolution`].
pub fn expand_selection(
    selection: &str,
    root: &Path,
    discover: fn(&Path) -> Result<Vec<PathBuf>>,
    extensions: &[&str],
) -> Result<Vec<PathBuf>> {
    let selection = selection.trim();
    if selection.is_empty() {
        return Err(VcError::config("empty selection").into());
    }
    if selection == "all" {
        return discover(root);
    }
    let mut out = Vec::new();
    for entry in selection.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let path = root.join(entry);
        if path.is_file() && has_extension(&path, extensions) {
            out.push(path);
        } else if path.is_dir() {
            out.extend(discover(&path)?);
        } else {
            return Err(VcError::missing(
                "selection",
                format!("'{entry}' does not exist under {}", root.display()),
            )
            .into());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn listing(entries: &[(&str, &[&str])]) -> BTreeMap<PathBuf, Vec<String>> {
        entries
            .iter()
            .map(|(dir, files)| (PathBuf::from(dir), files.iter().map(|f| f.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_unique_match_at_root() {
        let l = listing(&[("models/index", &["alto_v2.index", "bass.index"])]);
        let path = resolve_index("alto", Path::new(""), Path::new("models/index"), &l).unwrap();
        assert_eq!(path, PathBuf::from("models/index/alto_v2.index"));
    }

    #[test]
    fn test_trainer_prefixed_name() {
        let l = listing(&[(
            "models/index",
            &["added_IVF256_Flat_nprobe_1_alto_v2.index", "trained_x.index"],
        )]);
        let path = resolve_index("alto", Path::new(""), Path::new("models/index"), &l).unwrap();
        assert!(path.ends_with("added_IVF256_Flat_nprobe_1_alto_v2.index"));
    }

    #[test]
    fn test_suffix_must_be_separated() {
        // "contralto" ends with "alto" but is a different model
        let l = listing(&[("models/index", &["contralto.index"])]);
        let err = resolve_index("alto", Path::new(""), Path::new("models/index"), &l).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::ResourceResolution));
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let l = listing(&[("models/index", &["alto_v1.index", "alto_v2.index"])]);
        let err = resolve_index("alto", Path::new(""), Path::new("models/index"), &l).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::ResourceResolution));
        let msg = err.to_string();
        assert!(msg.contains("alto_v1.index") && msg.contains("alto_v2.index"));
    }

    #[test]
    fn test_category_mirror() {
        let l = listing(&[
            ("models/index", &["other.index"]),
            ("models/index/choir", &["alto.index"]),
        ]);
        let layout = ModelLayout::new("models");
        let path = layout
            .resolve_index(Path::new("models/choir/alto.pth"), &l)
            .unwrap();
        assert_eq!(path, PathBuf::from("models/index/choir/alto.index"));
    }

    #[test]
    fn test_missing_everywhere() {
        let l = listing(&[]);
        let err = ModelLayout::default()
            .resolve_index(Path::new("models/alto.pth"), &l)
            .unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::ResourceResolution));
    }

    #[test]
    fn test_normalize_index_path() {
        assert_eq!(
            normalize_index_path("  \"models/index/trained_IVF_alto.index\"\n"),
            PathBuf::from("models/index/added_IVF_alto.index")
        );
        assert_eq!(normalize_index_path("a/b.index"), PathBuf::from("a/b.index"));
    }

    #[test]
    fn test_model_name_stops_at_first_dot() {
        assert_eq!(model_name(Path::new("models/alto.v2.pth")).unwrap(), "alto");
    }

    #[test]
    fn test_discover_models_skips_index() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("index")).unwrap();
        std::fs::create_dir_all(root.join("choir")).unwrap();
        std::fs::write(root.join("b.pth"), b"").unwrap();
        std::fs::write(root.join("choir/a.safetensors"), b"").unwrap();
        std::fs::write(root.join("index/c.pth"), b"").unwrap();
        std::fs::write(root.join("notes.txt"), b"").unwrap();
        let found = discover_models(root).unwrap();
        assert_eq!(found, vec![root.join("b.pth"), root.join("choir/a.safetensors")]);
    }

    #[test]
    fn test_expand_selection() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("takes")).unwrap();
        std::fs::write(root.join("a.wav"), b"").unwrap();
        std::fs::write(root.join("takes/b.wav"), b"").unwrap();

        let all = expand_selection("all", root, discover_audio, &["wav"]).unwrap();
        assert_eq!(all.len(), 2);
        let some = expand_selection("a.wav;takes", root, discover_audio, &["wav"]).unwrap();
        assert_eq!(some, vec![root.join("a.wav"), root.join("takes/b.wav")]);
        let err = expand_selection("nope.wav", root, discover_audio, &["wav"]).unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::ResourceResolution));
    }
}
