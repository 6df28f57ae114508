use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_QUERY_LENGTH: usize = 10_000;

pub fn default_allowed_tables() -> Vec<String> {
    ["payment_intent", "payment_attempt", "customers", "address"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub allowed_tables: Vec<String>,
    /// Maximum statement length in characters.
    pub max_query_length: usize,
    pub enable_security_checks: bool,
    pub enable_table_authorization: bool,
    /// Reject UNION / INTERSECT / EXCEPT outright. Conservative policy; turn
    /// off only where set operations are known to be needed.
    pub reject_set_operations: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_tables: default_allowed_tables(),
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            enable_security_checks: true,
            enable_table_authorization: true,
            reject_set_operations: true,
        }
    }
}
