use std::{sync::Arc, time::Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::LlmConfig;
use crate::health::ServiceHealth;
use crate::llm::{estimate_tokens, CompletionClient, CompletionRequest};
use crate::model::{GenerationResult, QueryType};

const HEALTH_PROBE_PROMPT: &str = "Generate a simple SELECT query for payment_intent table";

const SQL_INSTRUCTIONS: &str = "You translate analytics questions about payment data into a single \
read-only SQL query.

{prompt}

Rules:
1. Answer with the SQL query only, without explanations or markdown fences.
2. Produce exactly one SELECT statement (a leading WITH clause is allowed).
3. Only reference tables described in the tool context.
4. Filter with WHERE clauses where the question implies it and use table aliases.
5. Do not end the query with a semicolon.

SQL Query:";

/// Labelled sections the caller assembles into one generation prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSections {
    pub system: String,
    pub tool: String,
    pub user: String,
}

impl PromptSections {
    pub fn render(&self) -> String {
        format!(
            "[SYSTEM CONTEXT]\n{}\n\n[TOOL CONTEXT]\n{}\n\n[USER CONTEXT]\n{}",
            self.system.trim(),
            self.tool.trim(),
            self.user.trim()
        )
    }
}

/// Generation stage: turns an assembled prompt into SQL text.
#[async_trait]
pub trait SqlGenerator: Send + Sync + 'static {
    async fn generate(&self, prompt: &str, config: &LlmConfig) -> Result<GenerationResult>;

    async fn health_check(&self, config: &LlmConfig) -> ServiceHealth {
        match self.generate(HEALTH_PROBE_PROMPT, config).await {
            Ok(result) if result.success => ServiceHealth::healthy(Some(result.generation_time_ms)),
            Ok(result) => ServiceHealth::unhealthy(result.error.unwrap_or_default()),
            Err(err) => ServiceHealth::unhealthy(format!("{err:#}")),
        }
    }
}

pub struct LlmSqlGenerator {
    client: Arc<dyn CompletionClient>,
}

impl LlmSqlGenerator {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    #[instrument(skip(self, prompt, config), fields(prompt_len = prompt.len()))]
    async fn generate(&self, prompt: &str, config: &LlmConfig) -> Result<GenerationResult> {
        let started = Instant::now();
        if prompt.trim().is_empty() {
            warn!("empty generation prompt");
            return Ok(GenerationResult::failure("Empty final_prompt provided", 0.0));
        }

        let full_prompt = SQL_INSTRUCTIONS.replace("{prompt}", prompt);
        let completion = self
            .client
            .complete(CompletionRequest {
                prompt: &full_prompt,
                model: &config.model_name,
                temperature: config.sql_generation_temperature,
                timeout: config.timeout(),
            })
            .await?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let sql = clean_sql_output(&completion.text);
        if sql.is_empty() {
            warn!(raw_len = completion.text.len(), "model returned no SQL");
            return Ok(GenerationResult::failure(
                "LLM returned empty SQL query",
                elapsed_ms,
            ));
        }

        let query_type = classify_sql(&sql);
        info!(?query_type, sql_len = sql.len(), elapsed_ms, "sql generated");

        Ok(GenerationResult {
            success: true,
            prompt_tokens: Some(
                completion
                    .prompt_tokens
                    .unwrap_or_else(|| estimate_tokens(&full_prompt)),
            ),
            completion_tokens: Some(
                completion
                    .completion_tokens
                    .unwrap_or_else(|| estimate_tokens(&sql)),
            ),
            sql_query: Some(sql),
            error: None,
            query_type,
            generation_time_ms: elapsed_ms,
        })
    }
}

/// Strips code fences and trailing semicolons and collapses whitespace.
pub fn clean_sql_output(raw: &str) -> String {
    let mut sql = raw.trim();
    if let Some(rest) = sql.strip_prefix("```sql") {
        sql = rest;
    } else if let Some(rest) = sql.strip_prefix("```") {
        sql = rest;
    }
    if let Some(rest) = sql.strip_suffix("```") {
        sql = rest;
    }
    let sql = sql.trim_end_matches(';').trim();
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keyword sniffing; the first matching rule wins.
pub fn classify_sql(sql: &str) -> QueryType {
    let lower = sql.to_ascii_lowercase();
    if ["count(", "sum(", "avg("].iter().any(|f| lower.contains(f)) {
        QueryType::Analytics
    } else if lower.contains("group by") || lower.contains("order by") {
        QueryType::Reporting
    } else if lower.contains("limit") && lower.contains("desc") {
        QueryType::Summary
    } else {
        QueryType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Completion;
    use parking_lot::Mutex;

    struct CannedClient {
        reply: String,
        seen: Mutex<Vec<(String, f32)>>,
    }

    impl CannedClient {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for CannedClient {
        async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
            self.seen
                .lock()
                .push((request.prompt.to_string(), request.temperature));
            Ok(Completion {
                text: self.reply.clone(),
                prompt_tokens: None,
                completion_tokens: Some(7),
            })
        }
    }

    #[test]
    fn cleaning_strips_fences_semicolons_and_whitespace() {
        assert_eq!(
            clean_sql_output("```sql\nSELECT *\n  FROM customers;\n```"),
            "SELECT * FROM customers"
        );
        assert_eq!(clean_sql_output("```SELECT 1```"), "SELECT 1");
        assert_eq!(clean_sql_output("SELECT 1;;"), "SELECT 1");
        assert_eq!(clean_sql_output("```\n```"), "");
    }

    #[test]
    fn classification_rules_in_order() {
        assert_eq!(
            classify_sql("SELECT COUNT(*) FROM t GROUP BY a"),
            QueryType::Analytics
        );
        assert_eq!(
            classify_sql("SELECT a FROM t ORDER BY a DESC LIMIT 5"),
            QueryType::Reporting
        );
        assert_eq!(classify_sql("SELECT a FROM t LIMIT 5"), QueryType::Unknown);
        assert_eq!(classify_sql("SELECT desc_col FROM t LIMIT 5"), QueryType::Summary);
    }

    #[test]
    fn prompt_sections_are_labelled() {
        let prompt = PromptSections {
            system: "You are helpful.".into(),
            tool: "payment_intent(id, amount)".into(),
            user: "total volume?".into(),
        }
        .render();
        assert!(prompt.starts_with("[SYSTEM CONTEXT]\nYou are helpful."));
        assert!(prompt.contains("[TOOL CONTEXT]\npayment_intent(id, amount)"));
        assert!(prompt.ends_with("[USER CONTEXT]\ntotal volume?"));
    }

    #[tokio::test]
    async fn generates_cleaned_sql_with_token_counts() {
        let client = CannedClient::new("```sql\nSELECT count(*) FROM payment_intent;\n```");
        let generator = LlmSqlGenerator::new(client.clone());
        let result = generator
            .generate("how many payments?", &LlmConfig::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.sql_query.as_deref(),
            Some("SELECT count(*) FROM payment_intent")
        );
        assert_eq!(result.query_type, QueryType::Analytics);
        assert_eq!(result.completion_tokens, Some(7));
        assert!(result.prompt_tokens.unwrap() > 0);

        let seen = client.seen.lock();
        assert!(seen[0].0.contains("how many payments?"));
        assert_eq!(seen[0].1, 0.1);
    }

    #[tokio::test]
    async fn empty_prompt_and_empty_reply_fail() {
        let generator = LlmSqlGenerator::new(CannedClient::new("   "));
        let config = LlmConfig::default();

        let result = generator.generate("  ", &config).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("Empty final_prompt provided"));

        let result = generator.generate("question", &config).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("LLM returned empty SQL query"));
    }

    #[tokio::test]
    async fn health_check_uses_a_probe_prompt() {
        let generator = LlmSqlGenerator::new(CannedClient::new("SELECT 1"));
        let health = generator.health_check(&LlmConfig::default()).await;
        assert!(health.is_healthy());
    }
}
