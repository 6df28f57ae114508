use std::fmt;

use crate::scanner::{inner_text, matching_paren, tokenize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedKind {
    /// `( SELECT ... )`, numbered from 1 in source order.
    Subquery(usize),
    /// `LATERAL ( ... )`.
    Lateral,
}

/// A parenthesised query body found inside a larger fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedQuery {
    pub kind: NestedKind,
    pub body: String,
}

impl NestedQuery {
    /// Label used to prefix validation errors for this fragment.
    pub fn context(&self) -> String {
        self.kind.to_string()
    }
}

impl fmt::Display for NestedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NestedKind::Subquery(n) => write!(f, "Subquery {n}"),
            NestedKind::Lateral => f.write_str("LATERAL subquery"),
        }
    }
}

/// Returns every `( SELECT ... )` and `LATERAL ( ... )` body in `sql`, in the
/// order their opening parentheses appear. Bodies nested inside other bodies
/// are reported as well. Groups that never close are skipped.
pub fn extract_nested_queries(sql: &str) -> Vec<NestedQuery> {
    let tokens = tokenize(sql);
    let mut found = Vec::new();
    let mut subqueries = 0;

    for (idx, token) in tokens.iter().enumerate() {
        if !token.is_punct('(') {
            continue;
        }

        let lateral = idx > 0 && tokens[idx - 1].is_keyword("lateral");
        let select = tokens.get(idx + 1).is_some_and(|t| t.is_keyword("select"));
        if !lateral && !select {
            continue;
        }

        let Some(close) = matching_paren(&tokens, idx) else {
            continue;
        };

        let kind = if lateral {
            NestedKind::Lateral
        } else {
            subqueries += 1;
            NestedKind::Subquery(subqueries)
        };

        found.push(NestedQuery {
            kind,
            body: inner_text(sql, &tokens, idx, close).to_string(),
        });
    }

    found
}
