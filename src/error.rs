//! Fatal precondition failures.
//!
//! Everything else in the crate propagates through [`anyhow::Result`]. The
//! variants here mark the three classes of failure that abort a conversion
//! run without retry. They travel inside `anyhow::Error`; recover the class
//! with [`VcError::classify`] or `err.downcast_ref::<VcError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcError {
    /// Invalid or out-of-range pipeline parameter.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing checkpoint, audio or index, or an ambiguous index match.
    #[error("cannot resolve {what}: {detail}{}", format_candidates(.candidates))]
    ResourceResolution {
        what: String,
        detail: String,
        candidates: Vec<String>,
    },

    /// Requested device is not available on this host.
    #[error("device error: {0}")]
    Device(String),
}

/// Error class without payload, handy for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ResourceResolution,
    Device,
}

impl VcError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn missing(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ResourceResolution {
            what: what.into(),
            detail: detail.into(),
            candidates: Vec::new(),
        }
    }

    pub fn ambiguous(
        what: impl Into<String>,
        detail: impl Into<String>,
        candidates: Vec<String>,
    ) -> Self {
        Self::ResourceResolution {
            what: what.into(),
            detail: detail.into(),
            candidates,
        }
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::ResourceResolution { .. } => ErrorKind::ResourceResolution,
            Self::Device(_) => ErrorKind::Device,
        }
    }

    /// Find the first `VcError` in an error chain.
    pub fn classify(err: &anyhow::Error) -> Option<ErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<VcError>())
            .map(VcError::kind)
    }
}

fn format_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        String::new()
    } else {
        format!(" (candidates: {})", candidates.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_display_includes_candidates() {
        let err = VcError::ambiguous(
            "retrieval index",
            "multiple matches for model 'alto'",
            vec!["alto_v1.index".into(), "alto_v2.index".into()],
        );
        let msg = err.to_string();
        assert!(msg.contains("alto_v1.index"));
        assert!(msg.contains("alto_v2.index"));
    }

    #[test]
    fn test_display_without_candidates() {
        let err = VcError::missing("checkpoint", "models/alto.pth does not exist");
        assert_eq!(
            err.to_string(),
            "cannot resolve checkpoint: models/alto.pth does not exist"
        );
    }

    #[test]
    fn test_classify_through_context() {
        let result: anyhow::Result<()> = Err(VcError::device("cuda:5 requested, 2 available"))
            .context("while preparing synthesis context");
        let err = result.unwrap_err();
        assert_eq!(VcError::classify(&err), Some(ErrorKind::Device));
    }

    #[test]
    fn test_classify_plain_error() {
        let err = anyhow::anyhow!("tensor shape mismatch");
        assert_eq!(VcError::classify(&err), None);
    }
}
