use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Graph database error: {0}")]
    Graph(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Could not translate question after {attempts} attempts: {reason}")]
    Translation { attempts: u32, reason: String },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LatticeError {
    /// Stable machine-readable code carried by failure results.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LatticeError::Http(_) => "http_error",
            LatticeError::Json(_) => "json_error",
            LatticeError::Config(_) => "config_error",
            LatticeError::Graph(_) => "graph_error",
            LatticeError::QueryExecution(_) => "query_execution_error",
            LatticeError::Extraction(_) => "extraction_error",
            LatticeError::Translation { .. } => "translation_error",
            LatticeError::ModelUnavailable(_) => "model_unavailable",
            LatticeError::Timeout(_) => "timeout",
            LatticeError::Model(_) => "model_error",
            LatticeError::Cancelled => "cancelled",
            LatticeError::NotFound(_) => "not_found",
            LatticeError::Internal(_) => "internal_error",
        }
    }

    /// Transient failures are worth another model call after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LatticeError::ModelUnavailable(_) | LatticeError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(LatticeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LatticeError::ModelUnavailable("503".into()).is_transient());
        assert!(!LatticeError::Config("bad".into()).is_transient());
        assert!(!LatticeError::QueryExecution("unknown property".into()).is_transient());
    }

    #[test]
    fn reason_codes_are_stable() {
        let err = LatticeError::Translation {
            attempts: 3,
            reason: "syntax".into(),
        };
        assert_eq!(err.reason_code(), "translation_error");
        assert_eq!(LatticeError::Cancelled.reason_code(), "cancelled");
        assert!(err.to_string().contains("3 attempts"));
    }
}
