use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::scanner::{inner_text, matching_paren, tokenize, Token};

/// One `name AS ( body )` entry of a `WITH` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CteDefinition {
    pub name: String,
    pub body: String,
}

/// A statement split into its CTE list and the query that consumes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decomposition {
    pub has_cte: bool,
    pub ctes: Vec<CteDefinition>,
    pub main_query: String,
}

impl Decomposition {
    /// Result for a statement that does not open with `WITH`.
    pub fn plain(sql: &str) -> Self {
        Self {
            has_cte: false,
            ctes: Vec::new(),
            main_query: sql.to_string(),
        }
    }

    /// Lower-cased CTE names bound by this statement.
    pub fn local_names(&self) -> HashSet<String> {
        self.ctes
            .iter()
            .map(|cte| cte.name.to_ascii_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecomposeError {
    #[error("unbalanced parentheses in CTE {0}")]
    UnbalancedCte(String),
    #[error("unexpected token '{0}' in WITH clause")]
    UnexpectedToken(String),
    #[error("WITH clause is not followed by a SELECT")]
    MissingMainQuery,
}

/// Splits a statement into CTE definitions and the main query.
///
/// Statements that do not start with `WITH` come back unchanged as
/// [`Decomposition::plain`]. `RECURSIVE` / `MATERIALIZED` after `WITH` and
/// `[NOT] MATERIALIZED` after a CTE's `AS` are accepted and discarded, as is
/// an optional column list after the CTE name.
pub fn decompose(sql: &str) -> Result<Decomposition, DecomposeError> {
    let tokens = tokenize(sql);
    if !tokens.first().is_some_and(|t| t.is_keyword("with")) {
        return Ok(Decomposition::plain(sql));
    }

    let mut idx = 1;
    while tokens
        .get(idx)
        .is_some_and(|t| t.is_any_keyword(&["recursive", "materialized"]))
    {
        idx += 1;
    }

    let mut ctes = Vec::new();
    loop {
        let token = tokens.get(idx).ok_or(DecomposeError::MissingMainQuery)?;

        if token.is_keyword("select") {
            if ctes.is_empty() {
                return Err(DecomposeError::UnexpectedToken(token.text.to_string()));
            }
            return Ok(Decomposition {
                has_cte: true,
                ctes,
                main_query: sql[token.start..].trim().to_string(),
            });
        }

        let (cte, next) = parse_cte(sql, &tokens, idx)?;
        ctes.push(cte);
        idx = next;

        if tokens.get(idx).is_some_and(|t| t.is_punct(',')) {
            idx += 1;
        }
    }
}

// Parses `name [ ( columns ) ] AS [ [NOT] MATERIALIZED ] ( body )` starting at
// `idx` and returns the definition plus the index just past the closing paren.
fn parse_cte(
    sql: &str,
    tokens: &[Token<'_>],
    mut idx: usize,
) -> Result<(CteDefinition, usize), DecomposeError> {
    let unexpected = |token: Option<&Token<'_>>| match token {
        Some(token) => DecomposeError::UnexpectedToken(token.text.to_string()),
        None => DecomposeError::MissingMainQuery,
    };

    let name = tokens
        .get(idx)
        .and_then(|t| t.ident())
        .filter(|name| !name.eq_ignore_ascii_case("as"))
        .ok_or_else(|| unexpected(tokens.get(idx)))?
        .to_string();
    idx += 1;

    if tokens.get(idx).is_some_and(|t| t.is_punct('(')) {
        let close = matching_paren(tokens, idx)
            .ok_or_else(|| DecomposeError::UnbalancedCte(name.clone()))?;
        idx = close + 1;
    }

    if !tokens.get(idx).is_some_and(|t| t.is_keyword("as")) {
        return Err(unexpected(tokens.get(idx)));
    }
    idx += 1;

    if tokens.get(idx).is_some_and(|t| t.is_keyword("not")) {
        idx += 1;
    }
    if tokens.get(idx).is_some_and(|t| t.is_keyword("materialized")) {
        idx += 1;
    }

    if !tokens.get(idx).is_some_and(|t| t.is_punct('(')) {
        return Err(unexpected(tokens.get(idx)));
    }
    let close =
        matching_paren(tokens, idx).ok_or_else(|| DecomposeError::UnbalancedCte(name.clone()))?;
    let body = inner_text(sql, tokens, idx, close).to_string();

    Ok((CteDefinition { name, body }, close + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_statement_is_returned_unchanged() {
        let sql = "SELECT * FROM payment_intent";
        let result = decompose(sql).unwrap();
        assert!(!result.has_cte);
        assert!(result.ctes.is_empty());
        assert_eq!(result.main_query, sql);
    }

    #[test]
    fn splits_multiple_ctes() {
        let sql = "WITH a AS (SELECT id FROM payment_intent WHERE amount > (SELECT 1)), \
                   b AS (SELECT * FROM a) SELECT * FROM b";
        let result = decompose(sql).unwrap();
        assert!(result.has_cte);
        assert_eq!(result.ctes.len(), 2);
        assert_eq!(result.ctes[0].name, "a");
        assert_eq!(
            result.ctes[0].body,
            "SELECT id FROM payment_intent WHERE amount > (SELECT 1)"
        );
        assert_eq!(result.ctes[1].body, "SELECT * FROM a");
        assert_eq!(result.main_query, "SELECT * FROM b");
    }

    #[test]
    fn accepts_recursive_materialized_and_column_lists() {
        let sql = "WITH RECURSIVE t(n) AS NOT MATERIALIZED (SELECT 1) SELECT n FROM t";
        let result = decompose(sql).unwrap();
        assert_eq!(result.ctes.len(), 1);
        assert_eq!(result.ctes[0].name, "t");
        assert_eq!(result.ctes[0].body, "SELECT 1");
        assert!(result.main_query.starts_with("SELECT"));
    }

    #[test]
    fn parentheses_in_literals_do_not_break_bodies() {
        let sql = "with x as (select ')' as p from customers) select * from x";
        let result = decompose(sql).unwrap();
        assert_eq!(result.ctes[0].body, "select ')' as p from customers");
        assert_eq!(result.main_query, "select * from x");
    }

    #[test]
    fn unbalanced_body_fails() {
        let err = decompose("WITH a AS (SELECT (1 FROM t SELECT * FROM a").unwrap_err();
        assert_eq!(err, DecomposeError::UnbalancedCte("a".into()));
    }

    #[test]
    fn garbage_before_select_fails() {
        let err = decompose("WITH a AS (SELECT 1) DELETE FROM t").unwrap_err();
        assert!(matches!(err, DecomposeError::UnexpectedToken(t) if t == "FROM"));

        let err = decompose("WITH SELECT 1").unwrap_err();
        assert_eq!(err, DecomposeError::UnexpectedToken("SELECT".into()));

        let err = decompose("WITH a AS (SELECT 1)").unwrap_err();
        assert_eq!(err, DecomposeError::MissingMainQuery);
    }

    #[test]
    fn local_names_are_lowercased() {
        let result = decompose("WITH Recent AS (SELECT 1) SELECT * FROM recent").unwrap();
        assert!(result.local_names().contains("recent"));
    }
}
