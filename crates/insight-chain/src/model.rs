//! Stage and pipeline result types.
//!
//! Every stage reports `success` plus an optional `error` instead of
//! returning `Err`, so a failed pipeline still serialises into a complete,
//! renderable object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use insight_guard::ValidationOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, Value>;

/// Coarse tag derived from keywords in the generated SQL. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Analytics,
    Reporting,
    Summary,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub success: bool,
    pub sql_query: Option<String>,
    pub error: Option<String>,
    pub query_type: QueryType,
    pub generation_time_ms: f64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl GenerationResult {
    pub fn failure(error: impl Into<String>, generation_time_ms: f64) -> Self {
        Self {
            success: false,
            sql_query: None,
            error: Some(error.into()),
            query_type: QueryType::Unknown,
            generation_time_ms,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }
}

/// Validator outcome plus the time the check took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    #[serde(flatten)]
    pub outcome: ValidationOutcome,
    pub validation_time_ms: f64,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_valid
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.error.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    /// Declared or inferred type name per column.
    pub data_types: BTreeMap<String, String>,
    pub row_count: usize,
    /// Set when the row cap cut the result short.
    pub truncated: bool,
    pub execution_time_ms: f64,
    pub error: Option<String>,
    pub query_executed: Option<String>,
}

impl ExecutionResult {
    pub fn failure(
        error: impl Into<String>,
        query: Option<String>,
        execution_time_ms: f64,
    ) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            columns: Vec::new(),
            data_types: BTreeMap::new(),
            row_count: 0,
            truncated: false,
            execution_time_ms,
            error: Some(error.into()),
            query_executed: query,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryResult {
    pub success: bool,
    /// Plain summary text.
    pub summary: Option<String>,
    /// Summary restricted to `p`, `strong`, `em` and `span`.
    pub html_summary: Option<String>,
    pub markdown_data: Option<String>,
    pub key_insights: Vec<String>,
    pub error: Option<String>,
    pub data_points_analyzed: usize,
    pub summary_time_ms: f64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl SummaryResult {
    pub fn failure(error: impl Into<String>, data_points_analyzed: usize, elapsed_ms: f64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data_points_analyzed,
            summary_time_ms: elapsed_ms,
            ..Self::default()
        }
    }
}

/// Tag the transport layer switches on when rendering a [`PipelineResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Summary,
    Data,
    SqlGenerationError,
    SqlValidationError,
    SqlExecutionError,
    DataSummarizationError,
    ChainError,
    RetryExhausted,
    UnknownError,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Summary => "summary",
            ResponseType::Data => "data",
            ResponseType::SqlGenerationError => "sql_generation_error",
            ResponseType::SqlValidationError => "sql_validation_error",
            ResponseType::SqlExecutionError => "sql_execution_error",
            ResponseType::DataSummarizationError => "data_summarization_error",
            ResponseType::ChainError => "chain_error",
            ResponseType::RetryExhausted => "retry_exhausted",
            ResponseType::UnknownError => "unknown_error",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, ResponseType::Summary | ResponseType::Data)
    }

    /// Validation and execution failures are deterministic for a given SQL
    /// text, so re-running the pipeline cannot fix them.
    pub fn is_retryable(&self) -> bool {
        self.is_error()
            && !matches!(
                self,
                ResponseType::SqlValidationError | ResponseType::SqlExecutionError
            )
    }
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub response_type: ResponseType,
    pub final_response: SummaryResult,
    pub sql_generation: Option<GenerationResult>,
    pub sql_validation: Option<ValidationReport>,
    pub sql_execution: Option<ExecutionResult>,
    pub data_summary: Option<SummaryResult>,
    pub total_processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub user_query: String,
    pub session_id: String,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

/// Stage results gathered while a run progresses.
#[derive(Debug, Clone, Default)]
pub struct StageRecords {
    pub generation: Option<GenerationResult>,
    pub validation: Option<ValidationReport>,
    pub execution: Option<ExecutionResult>,
    pub summary: Option<SummaryResult>,
}

impl PipelineResult {
    pub fn success(
        response_type: ResponseType,
        final_response: SummaryResult,
        records: StageRecords,
        user_query: &str,
        session_id: &str,
        elapsed_ms: f64,
    ) -> Self {
        Self::assemble(
            true,
            response_type,
            final_response,
            records,
            user_query,
            session_id,
            elapsed_ms,
        )
    }

    /// Builds an unsuccessful result whose final response still renders.
    pub fn failure(
        error: &str,
        response_type: ResponseType,
        records: StageRecords,
        user_query: &str,
        session_id: &str,
        elapsed_ms: f64,
    ) -> Self {
        Self::assemble(
            false,
            response_type,
            error_summary(error, response_type),
            records,
            user_query,
            session_id,
            elapsed_ms,
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        self.final_response.error.as_deref()
    }

    fn assemble(
        success: bool,
        response_type: ResponseType,
        final_response: SummaryResult,
        records: StageRecords,
        user_query: &str,
        session_id: &str,
        elapsed_ms: f64,
    ) -> Self {
        let generation_tokens = records
            .generation
            .as_ref()
            .map(|g| (g.prompt_tokens, g.completion_tokens));
        let summary_tokens = records
            .summary
            .as_ref()
            .map(|s| (s.prompt_tokens, s.completion_tokens));

        let (mut prompt, mut completion) = (0, 0);
        for (p, c) in [generation_tokens, summary_tokens].into_iter().flatten() {
            prompt += p.unwrap_or(0);
            completion += c.unwrap_or(0);
        }

        Self {
            success,
            response_type,
            final_response,
            sql_generation: records.generation,
            sql_validation: records.validation,
            sql_execution: records.execution,
            data_summary: records.summary,
            total_processing_time_ms: elapsed_ms,
            timestamp: Utc::now(),
            user_query: user_query.to_string(),
            session_id: session_id.to_string(),
            total_prompt_tokens: prompt,
            total_completion_tokens: completion,
        }
    }
}

fn error_summary(error: &str, response_type: ResponseType) -> SummaryResult {
    SummaryResult {
        success: false,
        error: Some(error.to_string()),
        html_summary: Some(format!("<p><strong>Error:</strong> {error}</p>")),
        markdown_data: Some("No data available due to error".to_string()),
        key_insights: vec![format!("Error occurred: {}", response_type.as_str())],
        ..SummaryResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_by_response_type() {
        assert!(ResponseType::SqlGenerationError.is_retryable());
        assert!(ResponseType::DataSummarizationError.is_retryable());
        assert!(ResponseType::ChainError.is_retryable());
        assert!(!ResponseType::SqlValidationError.is_retryable());
        assert!(!ResponseType::SqlExecutionError.is_retryable());
        assert!(!ResponseType::Summary.is_retryable());
    }

    #[test]
    fn failure_results_are_renderable() {
        let result = PipelineResult::failure(
            "SQL generation failed: boom",
            ResponseType::SqlGenerationError,
            StageRecords::default(),
            "how many payments?",
            "s-1",
            12.5,
        );

        assert!(!result.success);
        assert_eq!(
            result.final_response.html_summary.as_deref(),
            Some("<p><strong>Error:</strong> SQL generation failed: boom</p>")
        );
        assert_eq!(
            result.final_response.markdown_data.as_deref(),
            Some("No data available due to error")
        );
        assert_eq!(
            result.final_response.key_insights,
            vec!["Error occurred: sql_generation_error".to_string()]
        );
    }

    #[test]
    fn token_totals_sum_generation_and_summary() {
        let records = StageRecords {
            generation: Some(GenerationResult {
                success: true,
                sql_query: Some("SELECT 1".into()),
                error: None,
                query_type: QueryType::Unknown,
                generation_time_ms: 1.0,
                prompt_tokens: Some(100),
                completion_tokens: Some(10),
            }),
            summary: Some(SummaryResult {
                success: true,
                prompt_tokens: Some(50),
                completion_tokens: None,
                ..SummaryResult::default()
            }),
            ..StageRecords::default()
        };

        let result = PipelineResult::success(
            ResponseType::Summary,
            SummaryResult::default(),
            records,
            "q",
            "s",
            3.0,
        );
        assert_eq!(result.total_prompt_tokens, 150);
        assert_eq!(result.total_completion_tokens, 10);
    }

    #[test]
    fn response_type_serializes_snake_case() {
        let json = serde_json::to_string(&ResponseType::DataSummarizationError).unwrap();
        assert_eq!(json, "\"data_summarization_error\"");
        assert!(ResponseType::RetryExhausted.is_error());
        assert!(!ResponseType::Data.is_error());
    }
}
