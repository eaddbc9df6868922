use keepsake_contracts::jobs::StoreError;
use thiserror::Error;

/// Message persisted on a job whose polling budget ran out.
pub const POLLING_TIMEOUT_MESSAGE: &str = "polling timeout";

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("no images to composite")]
    EmptyInput,
    #[error("panel count must be at least 1 (got {0})")]
    InvalidPanelCount(u32),
    #[error("unusable image dimensions: {0}")]
    Dimension(String),
    #[error("image codec failed: {0}")]
    Codec(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("provider disabled: {0}")]
    ProviderDisabled(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("generation failed: {}", describe_generation_failure(.primary, .fallback))]
    GenerationFailed {
        primary: String,
        fallback: Option<String>,
    },
    #[error("transient polling failure: {0}")]
    PollingTransient(String),
    #[error("polling timeout after {attempts} attempts")]
    PollingTimeout { attempts: u32 },
    #[error("adapter id already exists: {0}")]
    DuplicateAdapterId(String),
    #[error("not supported by the configured backend: {0}")]
    Unsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("blob store failed: {0}")]
    Blob(String),
    #[error("polling worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Composite(#[from] CompositeError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateAdapterId(adapter_id) => Self::DuplicateAdapterId(adapter_id),
            other => Self::Store(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

fn describe_generation_failure(primary: &str, fallback: &Option<String>) -> String {
    match fallback {
        Some(fallback) => format!("primary: {primary}; fallback: {fallback}"),
        None => format!("primary: {primary}; no fallback attempted"),
    }
}

/// Flattens an error chain into one line, dropping repeated causes.
pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use keepsake_contracts::jobs::StoreError;

    use super::{error_chain_text, EngineError};

    #[test]
    fn duplicate_adapter_is_lifted_out_of_store_errors() {
        let err = EngineError::from(StoreError::DuplicateAdapterId("a-1".to_string()));
        assert!(matches!(err, EngineError::DuplicateAdapterId(id) if id == "a-1"));
        assert!(matches!(
            EngineError::from(StoreError::Poisoned),
            EngineError::Store(StoreError::Poisoned)
        ));
    }

    #[test]
    fn generation_failure_mentions_both_hops() {
        let err = EngineError::GenerationFailed {
            primary: "503".to_string(),
            fallback: Some("timeout".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "generation failed: primary: 503; fallback: timeout"
        );
        let timeout = EngineError::PollingTimeout { attempts: 360 };
        assert!(timeout.to_string().contains("polling timeout"));
    }

    #[test]
    fn error_chain_text_joins_unique_causes() {
        let err = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("hosted generate request failed")
            .context("hosted generate request failed")
            .unwrap_err();
        assert_eq!(
            error_chain_text(&err, 200),
            "hosted generate request failed | caused by: connection refused"
        );
        assert!(error_chain_text(&err, 10).ends_with('…'));
    }
}
