use std::{env, str::FromStr, sync::Arc};

use anyhow::{Context, Result};
use insight_chain::{ChainConfig, ExecutionConfig, LlmConfig};
use insight_guard::ValidationConfig;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;

/// Source of configuration values, keyed by environment variable name.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

/// The process environment.
pub struct ProcessEnv;

impl Lookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub chain: ChainConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(&ProcessEnv)
    }

    pub fn load(source: &dyn Lookup) -> Result<Self> {
        let database_url = source
            .get("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .context("DATABASE_URL must be configured")?;

        Ok(Self {
            database_url,
            db_max_connections: parse_env(source, "INSIGHT_DB_MAX_CONNECTIONS")
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            chain: chain_config(source),
        })
    }
}

/// Pipeline configuration; malformed values fall back to defaults.
pub fn chain_config(source: &dyn Lookup) -> ChainConfig {
    let base = ChainConfig::default();
    let llm_base = LlmConfig::default();
    let exec_base = ExecutionConfig::default();
    let validation_base = ValidationConfig::default();

    let llm = LlmConfig {
        model_name: source.get("AI_MODEL").unwrap_or_default(),
        api_base: source.get("AI_BASE_URL").filter(|v| !v.trim().is_empty()),
        api_key: source.get("AI_API_KEY").filter(|v| !v.trim().is_empty()),
        temperature: parse_env(source, "AI_TEMPERATURE").unwrap_or(llm_base.temperature),
        sql_generation_temperature: parse_env(source, "AI_SQL_TEMPERATURE")
            .unwrap_or(llm_base.sql_generation_temperature),
        summary_temperature: parse_env(source, "AI_SUMMARY_TEMPERATURE")
            .unwrap_or(llm_base.summary_temperature),
        timeout_seconds: parse_env(source, "AI_TIMEOUT").unwrap_or(llm_base.timeout_seconds),
    };

    let execution = ExecutionConfig {
        max_rows: parse_env(source, "INSIGHT_MAX_ROWS").unwrap_or(exec_base.max_rows),
        timeout_seconds: parse_env(source, "INSIGHT_QUERY_TIMEOUT")
            .unwrap_or(exec_base.timeout_seconds),
    };

    let validation = ValidationConfig {
        allowed_tables: parse_string_list_env(source, "INSIGHT_ALLOWED_TABLES")
            .filter(|tables| !tables.is_empty())
            .unwrap_or(validation_base.allowed_tables),
        max_query_length: parse_env(source, "INSIGHT_MAX_QUERY_LENGTH")
            .unwrap_or(validation_base.max_query_length),
        ..validation_base
    };

    ChainConfig {
        llm,
        validation: Arc::new(validation),
        execution,
        enable_fallback_to_data: !bool_env(source, "INSIGHT_DISABLE_FALLBACK").unwrap_or(false),
        enable_retry_on_failure: bool_env(source, "INSIGHT_ENABLE_RETRY")
            .unwrap_or(base.enable_retry_on_failure),
        max_retries: parse_env(source, "INSIGHT_MAX_RETRIES").unwrap_or(base.max_retries),
        ..base
    }
}

fn parse_env<T: FromStr>(source: &dyn Lookup, key: &str) -> Option<T> {
    source.get(key).and_then(|value| value.trim().parse().ok())
}

fn bool_env(source: &dyn Lookup, key: &str) -> Option<bool> {
    source
        .get(key)
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn parse_string_list_env(source: &dyn Lookup, key: &str) -> Option<Vec<String>> {
    source.get(key).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()
    })
}
