//! Error types shared across the pipeline.

use crate::llm_client::LlmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("No summaries for topic '{topic}' fit within {max_chars} characters")]
    NoExamplesFit { topic: String, max_chars: usize },

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_error_message_names_topic() {
        let err = PipelineError::NoExamplesFit { topic: "12_retirement".into(), max_chars: 200 };
        let msg = err.to_string();
        assert!(msg.contains("12_retirement"));
        assert!(msg.contains("200"));
    }

    #[test]
    fn test_llm_error_is_transparent() {
        let err: PipelineError = LlmError::EmptyResponse.into();
        assert_eq!(err.to_string(), LlmError::EmptyResponse.to_string());
    }
}
