use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::authorize::{TableAllowList, UnauthorizedTable};
use crate::config::ValidationConfig;
use crate::decompose::{decompose, DecomposeError};
use crate::nested::extract_nested_queries;
use crate::patterns::{check_fragment, SecurityViolation};
use crate::scanner::{is_balanced, try_tokenize, ScanError};
use crate::tables::Fragment;

/// Which authorization path approved a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Allow-list and pattern checks only; the actor id is advisory and no
    /// actor-scoped predicate is enforced.
    General,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub error: Option<String>,
    pub validated_tables: Option<BTreeSet<String>>,
    pub warnings: Option<Vec<String>>,
    pub policy_mode: PolicyMode,
}

impl ValidationOutcome {
    pub fn valid(tables: BTreeSet<String>) -> Self {
        Self {
            is_valid: true,
            error: None,
            validated_tables: Some(tables),
            warnings: None,
            policy_mode: PolicyMode::General,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
            validated_tables: None,
            warnings: None,
            policy_mode: PolicyMode::General,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Empty query")]
    EmptyQuery,
    #[error("Empty actor_id value")]
    EmptyActor,
    #[error("Query too long (max {max} characters)")]
    TooLong { max: usize },
    #[error("Unbalanced parentheses in query")]
    Unbalanced,
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Malformed CTE statement: {0}")]
    Malformed(#[from] DecomposeError),
    #[error(transparent)]
    Security(#[from] SecurityViolation),
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedTable),
    #[error("{context}: {source}")]
    ScopedUnauthorized {
        context: String,
        source: UnauthorizedTable,
    },
}

/// Decomposes a statement and checks every CTE body, the main query and each
/// nested subquery or `LATERAL` body, stopping at the first violation.
///
/// Holds no mutable state; one instance can serve any number of threads.
#[derive(Debug, Clone)]
pub struct SqlSafetyValidator {
    config: Arc<ValidationConfig>,
    allow_list: TableAllowList,
}

impl SqlSafetyValidator {
    pub fn new(config: Arc<ValidationConfig>) -> Self {
        let allow_list = TableAllowList::new(&config.allowed_tables);
        Self { config, allow_list }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn validate(&self, sql: &str, actor_id: &str) -> ValidationOutcome {
        match self.check(sql, actor_id) {
            Ok(tables) => {
                debug!(actor_id, tables = ?tables, "sql statement validated");
                ValidationOutcome::valid(tables)
            }
            Err(err) => {
                warn!(actor_id, error = %err, "sql statement rejected");
                ValidationOutcome::invalid(err.to_string())
            }
        }
    }

    /// Returns every table the statement reads or the first violation found.
    pub fn check(&self, sql: &str, actor_id: &str) -> Result<BTreeSet<String>, GuardError> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(GuardError::EmptyQuery);
        }
        if actor_id.trim().is_empty() {
            return Err(GuardError::EmptyActor);
        }
        if sql.chars().count() > self.config.max_query_length {
            return Err(GuardError::TooLong {
                max: self.config.max_query_length,
            });
        }
        if !is_balanced(&try_tokenize(sql)?) {
            return Err(GuardError::Unbalanced);
        }

        let decomposition = decompose(sql)?;
        let local_names = decomposition.local_names();
        let mut tables = BTreeSet::new();

        for cte in &decomposition.ctes {
            let context = format!("CTE {}", cte.name);
            tables.extend(self.check_scoped(&cte.body, &context, &local_names)?);
        }

        let context = if decomposition.has_cte {
            "Main query"
        } else {
            "Query"
        };
        let main = &decomposition.main_query;
        self.check_patterns(main, context)?;
        let main_tables = Fragment::new(main, &local_names).tables();
        self.authorize(&main_tables)?;
        tables.extend(main_tables);

        for nested in extract_nested_queries(main) {
            self.check_scoped(&nested.body, &nested.context(), &local_names)?;
        }

        Ok(tables)
    }

    // Pattern checks plus authorization for a fragment whose authorization
    // errors are reported under `context`.
    fn check_scoped(
        &self,
        sql: &str,
        context: &str,
        local_names: &HashSet<String>,
    ) -> Result<BTreeSet<String>, GuardError> {
        self.check_patterns(sql, context)?;
        let tables = Fragment::new(sql, local_names).tables();
        self.authorize(&tables)
            .map_err(|err| match err {
                GuardError::Unauthorized(source) => GuardError::ScopedUnauthorized {
                    context: context.to_string(),
                    source,
                },
                other => other,
            })?;
        Ok(tables)
    }

    fn check_patterns(&self, sql: &str, context: &str) -> Result<(), GuardError> {
        if self.config.enable_security_checks {
            check_fragment(sql, context, self.config.reject_set_operations)?;
        }
        Ok(())
    }

    fn authorize(&self, tables: &BTreeSet<String>) -> Result<(), GuardError> {
        if self.config.enable_table_authorization {
            self.allow_list.authorize(tables)?;
        }
        Ok(())
    }
}

impl Default for SqlSafetyValidator {
    fn default() -> Self {
        Self::new(Arc::new(ValidationConfig::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SqlSafetyValidator {
        SqlSafetyValidator::default()
    }

    #[test]
    fn rejects_empty_inputs() {
        let v = validator();
        assert_eq!(v.check("  ", "u1"), Err(GuardError::EmptyQuery));
        assert_eq!(
            v.check("SELECT * FROM customers", ""),
            Err(GuardError::EmptyActor)
        );
    }

    #[test]
    fn length_limit_counts_characters() {
        let config = ValidationConfig {
            max_query_length: 30,
            ..ValidationConfig::default()
        };
        let v = SqlSafetyValidator::new(Arc::new(config));
        assert!(v.check("SELECT * FROM customers", "u1").is_ok());

        let outcome = v.validate("SELECT * FROM customers WHERE name = 'x'", "u1");
        assert!(!outcome.is_valid);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Query too long (max 30 characters)")
        );
    }

    #[test]
    fn unbalanced_statement_is_rejected() {
        let err = validator()
            .check("SELECT * FROM customers WHERE id IN (SELECT id FROM address", "u1")
            .unwrap_err();
        assert_eq!(err, GuardError::Unbalanced);
    }

    #[test]
    fn unterminated_literal_is_rejected() {
        let err = validator()
            .check("SELECT * FROM customers WHERE name = 'open", "u1")
            .unwrap_err();
        assert!(matches!(err, GuardError::Scan(_)));
        assert!(err.to_string().starts_with("Unable to tokenize query: "));
    }

    #[test]
    fn malformed_cte_is_rejected() {
        let err = validator()
            .check("WITH recent AS SELECT 1 SELECT * FROM recent", "u1")
            .unwrap_err();
        assert!(matches!(err, GuardError::Malformed(_)));
        assert!(err.to_string().starts_with("Malformed CTE statement: "));
    }

    #[test]
    fn cte_errors_are_prefixed_with_cte_name() {
        let v = validator();
        let err = v
            .check("WITH x AS (SELECT * FROM secret_table) SELECT * FROM x", "u1")
            .unwrap_err();
        assert_eq!(err.to_string(), "CTE x: Unauthorized table access: secret_table");

        let err = v
            .check("WITH x AS (SELECT * FROM customers WHERE a = 1 OR 1=1) SELECT * FROM x", "u1")
            .unwrap_err();
        assert_eq!(err.to_string(), "CTE x: Suspicious OR condition detected");
    }

    #[test]
    fn main_query_context_depends_on_cte_presence() {
        let v = validator();
        let err = v
            .check("WITH x AS (SELECT 1) SELECT * FROM customers WHERE a = 1 OR 1 = 1", "u1")
            .unwrap_err();
        assert!(err.to_string().starts_with("Main query: "));

        let err = v
            .check("SELECT * FROM customers WHERE a = 1 OR 1 = 1", "u1")
            .unwrap_err();
        assert!(err.to_string().starts_with("Query: "));
    }

    #[test]
    fn cte_failures_win_over_main_query_failures() {
        let err = validator()
            .check(
                "WITH x AS (SELECT * FROM hidden) SELECT * FROM also_hidden",
                "u1",
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "CTE x: Unauthorized table access: hidden");
    }

    #[test]
    fn disabled_checks_are_skipped() {
        let config = ValidationConfig {
            enable_security_checks: false,
            enable_table_authorization: false,
            ..ValidationConfig::default()
        };
        let v = SqlSafetyValidator::new(Arc::new(config));
        let tables = v
            .check("SELECT * FROM secret_table WHERE a = 1 OR 1=1", "u1")
            .unwrap();
        assert!(tables.contains("secret_table"));
    }

    #[test]
    fn valid_outcome_carries_policy_mode() {
        let outcome = validator().validate("SELECT id FROM customers", "u1");
        assert!(outcome.is_valid);
        assert_eq!(outcome.policy_mode, PolicyMode::General);
        assert!(outcome.error.is_none());
    }
}
