//! Sequential pipeline: generate SQL, validate it, execute it, summarise the
//! rows. Each run walks an explicit state machine over one configuration
//! snapshot and always ends in a renderable [`PipelineResult`].

use std::{
    any::Any,
    collections::BTreeMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ChainConfig, ConfigHandle};
use crate::error::ChainError;
use crate::execution::{ConnectionAccessor, QueryExecutor};
use crate::generation::SqlGenerator;
use crate::health::{HealthReport, ServiceHealth};
use crate::model::{
    ExecutionResult, GenerationResult, PipelineResult, ResponseType, StageRecords, SummaryResult,
};
use crate::render::fallback_summary;
use crate::summarize::Summarizer;
use crate::validation::{ValidationContext, ValidationService};

/// One question to answer.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    /// Fully assembled generation prompt (see [`crate::PromptSections`]).
    pub prompt: String,
    /// The question as the user typed it; used for summaries and logging.
    pub user_query: String,
    /// Generated when absent.
    pub session_id: Option<String>,
}

impl PipelineRequest {
    pub fn new(prompt: impl Into<String>, user_query: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            user_query: user_query.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Configuration flags currently in force.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStats {
    pub fallback_enabled: bool,
    pub retry_enabled: bool,
    pub max_retries: u32,
    pub max_rows: usize,
    pub security_checks_enabled: bool,
    pub table_authorization_enabled: bool,
    pub reject_set_operations: bool,
    pub allowed_tables: Vec<String>,
}

enum State {
    Generating,
    Validating { sql: String },
    Executing { sql: String },
    Summarizing { sql: String, execution: ExecutionResult },
    Done {
        response_type: ResponseType,
        final_response: SummaryResult,
    },
    Failed(ChainError),
}

enum StageFault {
    Failed(String),
    Panicked(String),
}

pub struct Pipeline {
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn QueryExecutor>,
    summarizer: Arc<dyn Summarizer>,
    config: ConfigHandle,
}

impl Pipeline {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn QueryExecutor>,
        summarizer: Arc<dyn Summarizer>,
        config: ChainConfig,
    ) -> Self {
        Self {
            generator,
            executor,
            summarizer,
            config: ConfigHandle::new(config),
        }
    }

    pub fn config(&self) -> Arc<ChainConfig> {
        self.config.snapshot()
    }

    /// Swaps the configuration; runs already in flight keep their snapshot.
    pub fn update_config(&self, config: ChainConfig) {
        let previous = self.config.replace(config);
        let current = self.config.snapshot();
        info!(
            fallback = current.enable_fallback_to_data,
            retry = current.enable_retry_on_failure,
            max_retries = current.max_retries,
            previous_max_retries = previous.max_retries,
            "pipeline configuration updated"
        );
    }

    pub fn stats(&self) -> ChainStats {
        let config = self.config.snapshot();
        ChainStats {
            fallback_enabled: config.enable_fallback_to_data,
            retry_enabled: config.enable_retry_on_failure,
            max_retries: config.max_retries,
            max_rows: config.execution.max_rows,
            security_checks_enabled: config.validation.enable_security_checks,
            table_authorization_enabled: config.validation.enable_table_authorization,
            reject_set_operations: config.validation.reject_set_operations,
            allowed_tables: config.validation.allowed_tables.clone(),
        }
    }

    /// Runs the pipeline once.
    pub async fn process(
        &self,
        request: &PipelineRequest,
        connections: &dyn ConnectionAccessor,
    ) -> PipelineResult {
        let config = self.config.snapshot();
        let session_id = resolve_session(request);
        self.run(request, &session_id, connections, &config).await
    }

    /// Runs the pipeline, re-running it from generation on transient
    /// failures when retries are enabled. Validation and execution failures
    /// are returned after the first attempt.
    pub async fn process_with_retry(
        &self,
        request: &PipelineRequest,
        connections: &dyn ConnectionAccessor,
    ) -> PipelineResult {
        let config = self.config.snapshot();
        let session_id = resolve_session(request);
        if !config.enable_retry_on_failure {
            return self.run(request, &session_id, connections, &config).await;
        }

        let started = Instant::now();
        let attempts = config.max_retries.saturating_add(1);
        let mut last = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                info!(%session_id, attempt, max_retries = config.max_retries, "retrying pipeline");
            }
            let result = self.run(request, &session_id, connections, &config).await;

            if result.success {
                if attempt > 1 {
                    info!(%session_id, attempt, "retry succeeded");
                }
                return result;
            }

            if !result.response_type.is_retryable() {
                info!(%session_id, response_type = result.response_type.as_str(), "not retrying");
                return result;
            }
            if result.response_type != ResponseType::ChainError {
                last = Some(result);
                continue;
            }

            let cause = result.error_message().unwrap_or("unknown error").to_string();
            error!(%session_id, attempt, %cause, "attempt interrupted");
            if attempt == attempts {
                return PipelineResult::failure(
                    &format!("All retry attempts failed: {cause}"),
                    ResponseType::RetryExhausted,
                    StageRecords::default(),
                    &request.user_query,
                    &session_id,
                    elapsed_ms(started),
                );
            }
        }

        last.unwrap_or_else(|| {
            PipelineResult::failure(
                "Processing failed with no result",
                ResponseType::UnknownError,
                StageRecords::default(),
                &request.user_query,
                &session_id,
                elapsed_ms(started),
            )
        })
    }

    #[instrument(skip(self, request, session_id, connections, config), fields(session_id = %session_id))]
    async fn run(
        &self,
        request: &PipelineRequest,
        session_id: &str,
        connections: &dyn ConnectionAccessor,
        config: &ChainConfig,
    ) -> PipelineResult {
        let started = Instant::now();
        let mut records = StageRecords::default();
        let mut state = State::Generating;

        let terminal = loop {
            state = match state {
                State::Generating => self.generate(request, config, &mut records).await,
                State::Validating { sql } => {
                    validate(sql, request, session_id, config, &mut records)
                }
                State::Executing { sql } => {
                    self.execute(sql, connections, config, &mut records).await
                }
                State::Summarizing { sql, execution } => {
                    self.summarize(sql, execution, request, config, &mut records)
                        .await
                }
                State::Done {
                    response_type,
                    final_response,
                } => break Ok((response_type, final_response)),
                State::Failed(err) => break Err(err),
            };
        };

        let total_ms = elapsed_ms(started);
        match terminal {
            Ok((response_type, final_response)) => {
                info!(
                    response_type = response_type.as_str(),
                    total_ms, "pipeline finished"
                );
                PipelineResult::success(
                    response_type,
                    final_response,
                    records,
                    &request.user_query,
                    session_id,
                    total_ms,
                )
            }
            Err(err) => {
                warn!(
                    stage = err.stage().map(|s| s.as_str()).unwrap_or("pipeline"),
                    error = %err,
                    total_ms,
                    "pipeline failed"
                );
                PipelineResult::failure(
                    &err.to_string(),
                    err.response_type(),
                    records,
                    &request.user_query,
                    session_id,
                    total_ms,
                )
            }
        }
    }

    async fn generate(
        &self,
        request: &PipelineRequest,
        config: &ChainConfig,
        records: &mut StageRecords,
    ) -> State {
        let (outcome, stage_ms) = guarded(
            config.llm.timeout(),
            self.generator.generate(&request.prompt, &config.llm),
        )
        .await;

        match outcome {
            Ok(result) => {
                let sql = result
                    .sql_query
                    .clone()
                    .filter(|sql| result.success && !sql.trim().is_empty());
                let error = result.error.clone();
                records.generation = Some(result);
                match sql {
                    Some(sql) => State::Validating { sql },
                    None => State::Failed(ChainError::Generation(
                        error.unwrap_or_else(|| "No SQL query generated".to_string()),
                    )),
                }
            }
            Err(StageFault::Failed(message)) => {
                records.generation = Some(GenerationResult::failure(message.clone(), stage_ms));
                State::Failed(ChainError::Generation(message))
            }
            Err(StageFault::Panicked(message)) => State::Failed(ChainError::Unexpected(message)),
        }
    }

    async fn execute(
        &self,
        sql: String,
        connections: &dyn ConnectionAccessor,
        config: &ChainConfig,
        records: &mut StageRecords,
    ) -> State {
        let (outcome, stage_ms) = guarded(
            config.execution.timeout(),
            self.executor.execute(&sql, connections, &config.execution),
        )
        .await;

        match outcome {
            Ok(result) if result.success => State::Summarizing {
                sql,
                execution: result,
            },
            Ok(result) => {
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                records.execution = Some(result);
                State::Failed(ChainError::Execution(message))
            }
            Err(StageFault::Failed(message)) => {
                records.execution = Some(ExecutionResult::failure(
                    message.clone(),
                    Some(sql),
                    stage_ms,
                ));
                State::Failed(ChainError::Execution(message))
            }
            Err(StageFault::Panicked(message)) => State::Failed(ChainError::Unexpected(message)),
        }
    }

    async fn summarize(
        &self,
        sql: String,
        execution: ExecutionResult,
        request: &PipelineRequest,
        config: &ChainConfig,
        records: &mut StageRecords,
    ) -> State {
        let (outcome, stage_ms) = guarded(
            config.llm.timeout(),
            self.summarizer
                .summarize(&execution, &request.user_query, &sql, config),
        )
        .await;

        let failure = match outcome {
            Ok(summary) if summary.success => {
                records.summary = Some(summary.clone());
                records.execution = Some(execution);
                return State::Done {
                    response_type: ResponseType::Summary,
                    final_response: summary,
                };
            }
            Ok(summary) => {
                let message = summary
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                records.summary = Some(summary);
                message
            }
            Err(StageFault::Failed(message)) => {
                records.summary = Some(SummaryResult::failure(
                    message.clone(),
                    execution.row_count,
                    stage_ms,
                ));
                message
            }
            Err(StageFault::Panicked(message)) => {
                records.execution = Some(execution);
                return State::Failed(ChainError::Unexpected(message));
            }
        };

        let next = if config.enable_fallback_to_data {
            warn!(error = %failure, rows = execution.row_count, "summarization failed, using data fallback");
            State::Done {
                response_type: ResponseType::Data,
                final_response: fallback_summary(&execution, config.markdown_row_limit),
            }
        } else {
            State::Failed(ChainError::Summarization(failure))
        };
        records.execution = Some(execution);
        next
    }

    /// Probes every stage service once.
    pub async fn health_check(&self, connections: &dyn ConnectionAccessor) -> HealthReport {
        let config = self.config.snapshot();
        let mut services = BTreeMap::new();

        let generator = tokio::time::timeout(
            config.llm.timeout(),
            self.generator.health_check(&config.llm),
        )
        .await
        .unwrap_or_else(|_| timed_out(config.llm.timeout()));
        services.insert("sql_generator".to_string(), generator);

        services.insert(
            "sql_validator".to_string(),
            ValidationService::new(config.validation.clone()).health_check(),
        );

        let executor = tokio::time::timeout(
            config.execution.timeout(),
            self.executor.health_check(connections, &config.execution),
        )
        .await
        .unwrap_or_else(|_| timed_out(config.execution.timeout()));
        services.insert("sql_executor".to_string(), executor);

        let summarizer = tokio::time::timeout(
            config.llm.timeout(),
            self.summarizer.health_check(&config),
        )
        .await
        .unwrap_or_else(|_| timed_out(config.llm.timeout()));
        services.insert("data_summarizer".to_string(), summarizer);

        let report = HealthReport::from_services(services);
        info!(
            overall = ?report.overall_status,
            unhealthy = ?report.unhealthy_services,
            "health check finished"
        );
        report
    }
}

fn validate(
    sql: String,
    request: &PipelineRequest,
    session_id: &str,
    config: &ChainConfig,
    records: &mut StageRecords,
) -> State {
    let service = ValidationService::new(config.validation.clone());
    let context = ValidationContext {
        session_id: Some(session_id.to_string()),
        user_query: Some(request.user_query.clone()),
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| {
        service.validate_with_context(&sql, &context)
    })) {
        Ok(report) if report.is_valid() => {
            records.validation = Some(report);
            State::Executing { sql }
        }
        Ok(report) => {
            let message = report.error().unwrap_or("unknown error").to_string();
            records.validation = Some(report);
            State::Failed(ChainError::Validation(message))
        }
        Err(payload) => State::Failed(ChainError::Unexpected(panic_message(payload))),
    }
}

/// Runs one stage call under its timeout, turning errors, timeouts and
/// panics into a [`StageFault`]. Dropping the timed-out future releases
/// whatever the stage held.
async fn guarded<T>(
    limit: Duration,
    call: impl Future<Output = anyhow::Result<T>>,
) -> (Result<T, StageFault>, f64) {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(limit, AssertUnwindSafe(call).catch_unwind()).await {
        Err(_) => Err(StageFault::Failed(format!(
            "timed out after {}s",
            limit.as_secs()
        ))),
        Ok(Err(payload)) => Err(StageFault::Panicked(panic_message(payload))),
        Ok(Ok(Err(err))) => Err(StageFault::Failed(format!("{err:#}"))),
        Ok(Ok(Ok(value))) => Ok(value),
    };
    (outcome, elapsed_ms(started))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "stage panicked".to_string())
}

fn timed_out(limit: Duration) -> ServiceHealth {
    ServiceHealth::unhealthy(format!("timed out after {}s", limit.as_secs()))
}

fn resolve_session(request: &PipelineRequest) -> String {
    request
        .session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
