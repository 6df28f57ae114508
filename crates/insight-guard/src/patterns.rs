use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::scanner::tokenize;

static SET_OPERATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(union|intersect|except)\b").expect("static regex"));

// `OR 1=1`, `OR '1'='1'`, `OR/**/1 = 1` ...
static NUMERIC_TAUTOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bor\s*(?:/\*.*?\*/)?\s*['"]?1['"]?\s*=\s*['"]?1['"]?"#)
        .expect("static regex")
});

// `OR 'a'='a'`, `OR "x" = "y"` ...
static QUOTED_TAUTOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bor\s*(?:/\*.*?\*/)?\s*['"][^'"]*['"]\s*=\s*['"][^'"]*['"]"#)
        .expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityCheck {
    MultipleStatements,
    SetOperation,
    NumericTautology,
    QuotedTautology,
}

/// A forbidden shape found in one fragment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{context}: {message}")]
pub struct SecurityViolation {
    pub context: String,
    pub check: SecurityCheck,
    pub message: String,
}

/// Runs the pattern checks against one fragment in fixed order; the first
/// match is reported. `context` only labels the error.
pub fn check_fragment(
    sql: &str,
    context: &str,
    reject_set_operations: bool,
) -> Result<(), SecurityViolation> {
    let violation = |check, message: String| SecurityViolation {
        context: context.to_string(),
        check,
        message,
    };

    if has_stacked_statements(sql) {
        return Err(violation(
            SecurityCheck::MultipleStatements,
            "Multiple semicolons not allowed".into(),
        ));
    }

    if reject_set_operations {
        if let Some(found) = SET_OPERATION.find(sql) {
            return Err(violation(
                SecurityCheck::SetOperation,
                format!("{} clauses not allowed", found.as_str().to_ascii_uppercase()),
            ));
        }
    }

    if NUMERIC_TAUTOLOGY.is_match(sql) {
        return Err(violation(
            SecurityCheck::NumericTautology,
            "Suspicious OR condition detected".into(),
        ));
    }

    if QUOTED_TAUTOLOGY.is_match(sql) {
        return Err(violation(
            SecurityCheck::QuotedTautology,
            "Suspicious OR condition with quoted strings".into(),
        ));
    }

    Ok(())
}

// A second separator, or any token after the first one. Separators inside
// literals and comments do not count.
fn has_stacked_statements(sql: &str) -> bool {
    let tokens = tokenize(sql);
    let mut separators = tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| token.is_punct(';'));
    match (separators.next(), separators.next()) {
        (None, _) => false,
        (Some(_), Some(_)) => true,
        (Some((idx, _)), None) => idx + 1 < tokens.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(sql: &str) -> Result<(), SecurityViolation> {
        check_fragment(sql, "Query", true)
    }

    #[test]
    fn clean_query_passes() {
        assert!(check("SELECT status, count(*) FROM payment_intent GROUP BY status").is_ok());
        assert!(check("SELECT * FROM customers WHERE name = 'Orion';").is_ok());
    }

    #[test]
    fn multiple_semicolons() {
        let err = check("SELECT 1; DROP TABLE customers;").unwrap_err();
        assert_eq!(err.check, SecurityCheck::MultipleStatements);
        assert_eq!(err.to_string(), "Query: Multiple semicolons not allowed");

        let err = check("SELECT * FROM payment_intent; SELECT * FROM customers").unwrap_err();
        assert_eq!(err.check, SecurityCheck::MultipleStatements);
    }

    #[test]
    fn trailing_and_quoted_semicolons_are_allowed() {
        assert!(check("SELECT 1 FROM t; -- done").is_ok());
        assert!(check("SELECT * FROM t WHERE note = 'a;b;c'").is_ok());
    }

    #[test]
    fn set_operations_are_rejected_when_enabled() {
        let sql = "SELECT id FROM customers UNION ALL SELECT id FROM address";
        let err = check(sql).unwrap_err();
        assert_eq!(err.to_string(), "Query: UNION clauses not allowed");

        let err = check("SELECT id FROM customers except SELECT id FROM address").unwrap_err();
        assert_eq!(err.message, "EXCEPT clauses not allowed");

        assert!(check_fragment(sql, "Query", false).is_ok());
    }

    #[test]
    fn union_inside_identifier_is_not_a_set_operation() {
        assert!(check("SELECT reunion_date FROM customers").is_ok());
    }

    #[test]
    fn numeric_tautologies() {
        for sql in [
            "SELECT a FROM t WHERE 1=1 OR 1=1",
            "SELECT a FROM t WHERE x = 2 or '1' = '1'",
            "SELECT a FROM t WHERE x = 2 OR/**/1=1",
        ] {
            let err = check(sql).unwrap_err();
            assert_eq!(err.check, SecurityCheck::NumericTautology, "{sql}");
            assert!(err.to_string().contains("Suspicious OR condition"));
        }
    }

    #[test]
    fn quoted_tautologies() {
        let err = check("SELECT a FROM t WHERE name = 'x' OR 'a'='a'").unwrap_err();
        assert_eq!(err.check, SecurityCheck::QuotedTautology);
        assert_eq!(
            err.to_string(),
            "Query: Suspicious OR condition with quoted strings"
        );
    }

    #[test]
    fn first_failing_check_wins() {
        let err = check("SELECT 1 UNION SELECT 2 WHERE 1=1 OR 1=1;;").unwrap_err();
        assert_eq!(err.check, SecurityCheck::MultipleStatements);
    }

    #[test]
    fn context_prefixes_message() {
        let err = check_fragment("SELECT 1 OR 1=1", "CTE recent", true).unwrap_err();
        assert_eq!(err.to_string(), "CTE recent: Suspicious OR condition detected");
    }
}
