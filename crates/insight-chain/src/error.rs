use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::model::ResponseType;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generation,
    Validation,
    Execution,
    Summarization,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Generation => "generation",
            Stage::Validation => "validation",
            Stage::Execution => "execution",
            Stage::Summarization => "summarization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("SQL generation failed: {0}")]
    Generation(String),
    #[error("SQL validation failed: {0}")]
    Validation(String),
    #[error("SQL execution failed: {0}")]
    Execution(String),
    #[error("Data summarization failed: {0}")]
    Summarization(String),
    /// A defect inside a stage or the orchestrator itself (e.g. a panic).
    #[error("Sequential chain processing failed: {0}")]
    Unexpected(String),
}

impl ChainError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ChainError::Generation(_) => Some(Stage::Generation),
            ChainError::Validation(_) => Some(Stage::Validation),
            ChainError::Execution(_) => Some(Stage::Execution),
            ChainError::Summarization(_) => Some(Stage::Summarization),
            ChainError::Unexpected(_) => None,
        }
    }

    pub fn response_type(&self) -> ResponseType {
        match self {
            ChainError::Generation(_) => ResponseType::SqlGenerationError,
            ChainError::Validation(_) => ResponseType::SqlValidationError,
            ChainError::Execution(_) => ResponseType::SqlExecutionError,
            ChainError::Summarization(_) => ResponseType::DataSummarizationError,
            ChainError::Unexpected(_) => ResponseType::ChainError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_stage_prefix() {
        let err = ChainError::Execution("no such table: nope".into());
        assert_eq!(err.to_string(), "SQL execution failed: no such table: nope");
        assert_eq!(err.response_type(), ResponseType::SqlExecutionError);
        assert_eq!(err.stage(), Some(Stage::Execution));

        let err = ChainError::Unexpected("boom".into());
        assert_eq!(err.stage(), None);
        assert_eq!(err.response_type(), ResponseType::ChainError);
    }
}
