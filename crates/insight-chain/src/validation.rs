use std::{sync::Arc, time::Instant};

use insight_guard::{SqlSafetyValidator, ValidationConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::health::ServiceHealth;
use crate::model::ValidationReport;

const HEALTH_PROBE_SQL: &str =
    "SELECT id, amount FROM payment_intent WHERE status = 'succeeded' LIMIT 10";
const DEFAULT_ACTOR: &str = "system";

/// Request metadata attached to a validation call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationContext {
    pub session_id: Option<String>,
    pub user_query: Option<String>,
}

/// Validation stage: the guard plus timing, logging and context warnings.
#[derive(Debug, Clone)]
pub struct ValidationService {
    validator: SqlSafetyValidator,
}

impl ValidationService {
    pub fn new(config: Arc<ValidationConfig>) -> Self {
        Self {
            validator: SqlSafetyValidator::new(config),
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        self.validator.config()
    }

    #[instrument(skip(self, sql), fields(sql_len = sql.len()))]
    pub fn validate(&self, sql: &str, actor_id: &str) -> ValidationReport {
        let started = Instant::now();
        let outcome = self.validator.validate(sql, actor_id);
        let validation_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            is_valid = outcome.is_valid,
            validation_time_ms, "validation finished"
        );
        ValidationReport {
            outcome,
            validation_time_ms,
        }
    }

    /// Validates with the session id as actor and, on success, records the
    /// session and a coarse classification of the user question as warnings.
    pub fn validate_with_context(&self, sql: &str, context: &ValidationContext) -> ValidationReport {
        let actor = context
            .session_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(DEFAULT_ACTOR);
        let mut report = self.validate(sql, actor);

        if report.is_valid() {
            let mut notes = Vec::new();
            if let Some(session_id) = &context.session_id {
                notes.push(format!("Session: {session_id}"));
            }
            if let Some(user_query) = &context.user_query {
                notes.push(format!("Query type: {}", classify_user_query(user_query)));
            }
            if !notes.is_empty() {
                report
                    .outcome
                    .warnings
                    .get_or_insert_with(Vec::new)
                    .extend(notes);
            }
        }
        report
    }

    pub fn batch_validate<S: AsRef<str>>(&self, queries: &[S], actor_id: &str) -> Vec<ValidationReport> {
        let reports: Vec<ValidationReport> = queries
            .iter()
            .enumerate()
            .map(|(i, sql)| self.validate(sql.as_ref(), &format!("{actor_id}_batch_{i}")))
            .collect();
        let valid = reports.iter().filter(|r| r.is_valid()).count();
        info!(total = reports.len(), valid, "batch validation finished");
        reports
    }

    /// Runs a known-good statement through the guard.
    pub fn health_check(&self) -> ServiceHealth {
        let report = self.validate(HEALTH_PROBE_SQL, "health_check");
        if report.is_valid() {
            ServiceHealth::healthy(Some(report.validation_time_ms))
        } else {
            ServiceHealth::degraded(format!(
                "Validation test failed: {}",
                report.error().unwrap_or("unknown error")
            ))
        }
    }
}

impl Default for ValidationService {
    fn default() -> Self {
        Self::new(Arc::new(ValidationConfig::default()))
    }
}

/// Keyword classification of a natural-language question; the first
/// matching group wins.
pub fn classify_user_query(user_query: &str) -> &'static str {
    if user_query.trim().is_empty() {
        return "unknown";
    }
    let lower = user_query.to_lowercase();
    let has_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has_any(&["count", "total", "sum", "average"]) {
        "aggregation"
    } else if has_any(&["trend", "over time", "daily", "monthly"]) {
        "trend_analysis"
    } else if has_any(&["top", "best", "worst", "highest", "lowest"]) {
        "ranking"
    } else if has_any(&["compare", "vs", "versus", "difference"]) {
        "comparison"
    } else {
        "general"
    }
}
