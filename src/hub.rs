//! HuggingFace Hub download of the shared pretrained networks.
//!
//! Voice models are user supplied; only the content encoder and the RMVPE
//! pitch model are fetched. Enable with the `hub` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use rvc_infer::hub::download_assets;
//!
//! let assets = download_assets(None)?;
//! let converter = VoiceConverter::new(context).with_assets(assets);
//! ```

use anyhow::{Context, Result};
use hf_hub::api::sync::Api;

use crate::pipeline::AssetPaths;

/// Repository and file names of the public RVC assets.
pub mod asset_ids {
    pub const REPO: &str = "lj1995/VoiceConversionWebUI";

    pub const HUBERT: &str = "hubert_base.pt";

    pub const RMVPE: &str = "rmvpe.pt";
}

/// Fetch the encoder and RMVPE into the HuggingFace cache.
///
/// `revision` pins a branch, tag or commit; `None` uses `main`. The CREPE
/// path keeps its local default.
pub fn download_assets(revision: Option<&str>) -> Result<AssetPaths> {
    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = match revision {
        Some(rev) => api.repo(hf_hub::Repo::with_revision(
            asset_ids::REPO.to_string(),
            hf_hub::RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(asset_ids::REPO.to_string()),
    };

    tracing::info!(repo = asset_ids::REPO, revision = revision.unwrap_or("main"), "downloading pretrained assets");
    let hubert = repo
        .get(asset_ids::HUBERT)
        .with_context(|| format!("Failed to download {}", asset_ids::HUBERT))?;
    let rmvpe = repo
        .get(asset_ids::RMVPE)
        .with_context(|| format!("Failed to download {}", asset_ids::RMVPE))?;
    tracing::info!(hubert = %hubert.display(), rmvpe = %rmvpe.display(), "assets ready");

    Ok(AssetPaths {
        hubert,
        rmvpe,
        ..AssetPaths::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_names_match_loader_defaults() {
        let defaults = AssetPaths::default();
        assert!(defaults.hubert.ends_with(asset_ids::HUBERT));
        assert!(defaults.rmvpe.ends_with(asset_ids::RMVPE));
    }
}
