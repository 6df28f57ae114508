use std::{collections::BTreeMap, sync::Arc, time::Instant};

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::config::ChainConfig;
use crate::health::ServiceHealth;
use crate::llm::{estimate_tokens, CompletionClient, CompletionRequest};
use crate::model::{ExecutionResult, SummaryResult};
use crate::render::{data_sample, key_insights, markdown_table};

const ALLOWED_TAGS: &[&str] = &["p", "strong", "em", "span"];

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)[^>]*>").expect("static regex"));

const SUMMARY_INSTRUCTIONS: &str = "You are a payments data analyst. Summarise the query result \
below for a business reader.

Question: {user_query}

SQL executed: {sql}

Result rows:
{data}

Total rows: {row_count}
Columns: {columns}
Execution time: {execution_ms}ms

Write at most {word_limit} words in two or three sentences. Use HTML with only <p>, <strong>, \
<em> and <span> tags, put the key numbers in <strong>, and avoid technical jargon.

HTML Summary:";

/// Summarization stage: turns a result set into prose, a table and insights.
#[async_trait]
pub trait Summarizer: Send + Sync + 'static {
    async fn summarize(
        &self,
        execution: &ExecutionResult,
        user_query: &str,
        sql: &str,
        config: &ChainConfig,
    ) -> Result<SummaryResult>;

    async fn health_check(&self, config: &ChainConfig) -> ServiceHealth {
        let probe = probe_execution();
        match self.summarize(&probe, "test query", "test sql", config).await {
            Ok(result) if result.success => ServiceHealth::healthy(Some(result.summary_time_ms)),
            Ok(result) => ServiceHealth::unhealthy(result.error.unwrap_or_default()),
            Err(err) => ServiceHealth::unhealthy(format!("{err:#}")),
        }
    }
}

fn probe_execution() -> ExecutionResult {
    let mut row = serde_json::Map::new();
    row.insert("test_column".into(), json!("test_value"));
    row.insert("count".into(), json!(1));
    ExecutionResult {
        success: true,
        rows: vec![row],
        columns: vec!["test_column".into(), "count".into()],
        data_types: BTreeMap::new(),
        row_count: 1,
        truncated: false,
        execution_time_ms: 10.0,
        error: None,
        query_executed: Some("SELECT 'test_value' AS test_column, 1 AS count".into()),
    }
}

pub struct LlmSummarizer {
    client: Arc<dyn CompletionClient>,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    #[instrument(skip_all, fields(rows = execution.row_count))]
    async fn summarize(
        &self,
        execution: &ExecutionResult,
        user_query: &str,
        sql: &str,
        config: &ChainConfig,
    ) -> Result<SummaryResult> {
        let started = Instant::now();
        if !execution.success {
            return Ok(SummaryResult::failure(
                format!(
                    "Cannot summarize failed execution: {}",
                    execution.error.as_deref().unwrap_or("unknown error")
                ),
                0,
                0.0,
            ));
        }

        let user_query = if user_query.trim().is_empty() {
            "Data analysis query"
        } else {
            user_query
        };
        let sql = if sql.trim().is_empty() {
            execution.query_executed.as_deref().unwrap_or("SQL query")
        } else {
            sql
        };
        let prompt = SUMMARY_INSTRUCTIONS
            .replace("{user_query}", user_query)
            .replace("{sql}", sql)
            .replace("{data}", &data_sample(&execution.rows))
            .replace("{row_count}", &execution.row_count.to_string())
            .replace("{columns}", &execution.columns.join(", "))
            .replace("{execution_ms}", &format!("{:.2}", execution.execution_time_ms))
            .replace("{word_limit}", &config.summary_word_limit.to_string());

        let completion = self
            .client
            .complete(CompletionRequest {
                prompt: &prompt,
                model: &config.llm.model_name,
                temperature: config.llm.summary_temperature,
                timeout: config.llm.timeout(),
            })
            .await?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let text = completion.text.trim();
        if text.is_empty() {
            warn!("model returned an empty summary");
            return Ok(SummaryResult::failure(
                "LLM returned an empty summary",
                execution.row_count,
                elapsed_ms,
            ));
        }

        let html = sanitize_html(text, config.summary_word_limit);
        info!(elapsed_ms, html_len = html.len(), "summary generated");

        Ok(SummaryResult {
            success: true,
            summary: Some(html.clone()),
            html_summary: Some(html),
            markdown_data: Some(markdown_table(
                &execution.columns,
                &execution.rows,
                config.markdown_row_limit,
            )),
            key_insights: key_insights(text, &execution.rows, config.max_insights),
            error: None,
            data_points_analyzed: execution.row_count,
            summary_time_ms: elapsed_ms,
            prompt_tokens: Some(
                completion
                    .prompt_tokens
                    .unwrap_or_else(|| estimate_tokens(&prompt)),
            ),
            completion_tokens: Some(
                completion
                    .completion_tokens
                    .unwrap_or_else(|| estimate_tokens(text)),
            ),
        })
    }
}

/// Keeps only `p`, `strong`, `em` and `span` tags (without attributes) and
/// caps the visible text at `word_limit` words. Over-long summaries are
/// reduced to plain text wrapped in a single paragraph.
pub fn sanitize_html(html: &str, word_limit: usize) -> String {
    let cleaned = TAG.replace_all(html, |caps: &regex::Captures<'_>| {
        let name = caps[2].to_ascii_lowercase();
        if ALLOWED_TAGS.contains(&name.as_str()) {
            format!("<{}{}>", &caps[1], name)
        } else {
            String::new()
        }
    });

    let visible = TAG.replace_all(&cleaned, " ");
    let words: Vec<&str> = visible.split_whitespace().collect();
    if words.len() <= word_limit {
        return cleaned.trim().to_string();
    }

    format!("<p>{}...</p>", words[..word_limit].join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Completion;
    use serde_json::Value;

    struct FixedReply(String);

    #[async_trait]
    impl CompletionClient for FixedReply {
        async fn complete(&self, _request: CompletionRequest<'_>) -> Result<Completion> {
            Ok(Completion {
                text: self.0.clone(),
                prompt_tokens: None,
                completion_tokens: None,
            })
        }
    }

    fn rows_execution() -> ExecutionResult {
        let rows = (1..=3)
            .map(|i| match json!({"status": "succeeded", "amount": i * 10}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect();
        ExecutionResult {
            success: true,
            rows,
            columns: vec!["status".into(), "amount".into()],
            data_types: BTreeMap::new(),
            row_count: 3,
            truncated: false,
            execution_time_ms: 2.0,
            error: None,
            query_executed: Some("SELECT status, amount FROM payment_intent".into()),
        }
    }

    #[test]
    fn disallowed_tags_and_attributes_are_removed() {
        let html = r#"<div class="x"><p style="color:red">Revenue <b>grew</b> <strong>12%</strong></p><script>alert(1)</script></div>"#;
        assert_eq!(
            sanitize_html(html, 60),
            "<p>Revenue grew <strong>12%</strong></p>alert(1)"
        );
    }

    #[test]
    fn long_summaries_are_truncated() {
        let html = format!("<p>{}</p>", vec!["word"; 80].join(" "));
        let out = sanitize_html(&html, 60);
        assert!(out.starts_with("<p>word word"));
        assert!(out.ends_with("...</p>"));
        let visible = out.trim_start_matches("<p>").trim_end_matches("...</p>");
        assert_eq!(visible.split_whitespace().count(), 60);
    }

    #[tokio::test]
    async fn summarizes_rows() {
        let summarizer = LlmSummarizer::new(Arc::new(FixedReply(
            "<p>The data <strong>shows</strong> all payments succeeded.</p>".into(),
        )));
        let result = summarizer
            .summarize(&rows_execution(), "status breakdown", "", &ChainConfig::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.data_points_analyzed, 3);
        assert!(result.markdown_data.unwrap().starts_with("| status | amount |"));
        assert_eq!(result.key_insights[0], "Dataset contains 3 records");
        assert!(result.prompt_tokens.unwrap() > 0);
    }

    #[tokio::test]
    async fn refuses_failed_execution() {
        let summarizer = LlmSummarizer::new(Arc::new(FixedReply("unused".into())));
        let failed = ExecutionResult::failure("boom", None, 1.0);
        let result = summarizer
            .summarize(&failed, "q", "SELECT 1", &ChainConfig::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Cannot summarize failed execution: boom")
        );
    }

    #[tokio::test]
    async fn empty_reply_is_a_failure() {
        let summarizer = LlmSummarizer::new(Arc::new(FixedReply("  ".into())));
        let result = summarizer
            .summarize(&rows_execution(), "q", "SELECT 1", &ChainConfig::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.data_points_analyzed, 3);
    }
}
