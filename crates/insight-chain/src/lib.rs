//! Natural-language analytics pipeline.
//!
//! A [`Pipeline`] takes an assembled prompt through four stages: SQL
//! generation, the safety gate from `insight_guard`, execution through a
//! caller-supplied [`ConnectionAccessor`], and summarization. Every run
//! yields a [`PipelineResult`], including runs that fail.

pub mod config;
pub mod error;
pub mod execution;
pub mod generation;
pub mod health;
pub mod llm;
pub mod model;
pub mod orchestrator;
pub mod render;
pub mod summarize;
pub mod validation;

pub use config::{ChainConfig, ConfigHandle, ExecutionConfig, LlmConfig};
pub use error::{ChainError, Stage};
pub use execution::{ConnectionAccessor, QueryExecutor, RowSet, SqlExecutor, SqlitePoolAccessor};
pub use generation::{LlmSqlGenerator, PromptSections, SqlGenerator};
pub use health::{HealthReport, HealthStatus, ServiceHealth};
pub use llm::{Completion, CompletionClient, CompletionRequest, OpenAiCompatClient};
pub use model::{
    ExecutionResult, GenerationResult, PipelineResult, QueryType, ResponseType, Row, StageRecords,
    SummaryResult, ValidationReport,
};
pub use orchestrator::{ChainStats, Pipeline, PipelineRequest};
pub use summarize::{LlmSummarizer, Summarizer};
pub use validation::{ValidationContext, ValidationService};
