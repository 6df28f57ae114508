use std::{sync::Arc, time::Duration};

use insight_guard::ValidationConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Stage timeouts below one second are raised to one second.
const MIN_TIMEOUT_SECONDS: u64 = 1;

/// Settings shared by the generation and summarization LLM calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model_name: String,
    pub api_base: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub sql_generation_temperature: f32,
    pub summary_temperature: f32,
    pub timeout_seconds: u64,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(MIN_TIMEOUT_SECONDS))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            api_base: None,
            api_key: None,
            temperature: 0.1,
            sql_generation_temperature: 0.1,
            summary_temperature: 0.3,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Rows beyond this cap are dropped and the result is flagged truncated.
    pub max_rows: usize,
    pub timeout_seconds: u64,
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(MIN_TIMEOUT_SECONDS))
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            timeout_seconds: 30,
        }
    }
}

/// Complete configuration of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub llm: LlmConfig,
    pub validation: Arc<ValidationConfig>,
    pub execution: ExecutionConfig,
    /// Return a deterministic data summary when the summarization call fails.
    pub enable_fallback_to_data: bool,
    pub enable_retry_on_failure: bool,
    pub max_retries: u32,
    pub summary_word_limit: usize,
    pub max_insights: usize,
    pub markdown_row_limit: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            validation: Arc::new(ValidationConfig::default()),
            execution: ExecutionConfig::default(),
            enable_fallback_to_data: true,
            enable_retry_on_failure: false,
            max_retries: 1,
            summary_word_limit: 60,
            max_insights: 10,
            markdown_row_limit: 50,
        }
    }
}

/// Read-mostly holder for the active [`ChainConfig`].
///
/// Readers take a snapshot (`Arc` clone) and keep using it for the whole
/// run; [`ConfigHandle::replace`] swaps the pointer without touching
/// snapshots already handed out.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: RwLock<Arc<ChainConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<ChainConfig> {
        self.current.read().clone()
    }

    pub fn replace(&self, config: ChainConfig) -> Arc<ChainConfig> {
        let next = Arc::new(config);
        let mut guard = self.current.write();
        std::mem::replace(&mut *guard, next)
    }
}
