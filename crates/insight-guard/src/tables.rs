//! Table reference extraction.
//!
//! Walks the token stream of a fragment and collects the names that appear in
//! table position: after `FROM`, after any `JOIN`, and in comma-separated
//! `FROM` lists. Table functions count as references unless they are in
//! [`RESERVED_WORDS`]. Derived tables are stepped over; the queries inside
//! them are visited by the same walk, so tables referenced in subqueries and
//! `LATERAL` bodies are reported too.

use std::collections::{BTreeSet, HashSet};

use once_cell::sync::Lazy;

use crate::scanner::{matching_paren, tokenize, Token, TokenKind};

/// Words that can sit in table position without naming a table.
pub static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "lateral",
        "tablesample",
        "unnest",
        "recursive",
        "materialized",
        "values",
        "generate_series",
        "information_schema",
        "pg_catalog",
        "with",
        "ordinality",
        "over",
        "partition",
        "rows",
        "range",
        "preceding",
        "following",
        "unbounded",
        "current",
        "row",
        "not",
        "exists",
        "in",
        "any",
        "all",
        "some",
        "between",
        "cast",
        "convert",
        "array",
        "record",
        "case",
        "when",
        "then",
        "else",
        "end",
        "coalesce",
        "nullif",
        "jsonb_array_elements",
        "jsonb_object_keys",
        "json_each",
        "jsonb_each",
        "union",
        "intersect",
        "except",
        "default",
        "null",
        "true",
        "false",
        "select",
        "dual",
    ]
    .into_iter()
    .collect()
});

// Words that end a table reference instead of naming its alias.
const CLAUSE_WORDS: &[&str] = &[
    "where",
    "join",
    "inner",
    "left",
    "right",
    "full",
    "outer",
    "cross",
    "natural",
    "on",
    "using",
    "group",
    "order",
    "having",
    "limit",
    "offset",
    "fetch",
    "for",
    "window",
    "union",
    "intersect",
    "except",
    "lateral",
    "tablesample",
    "returning",
    "as",
];

// Functions whose argument syntax uses FROM without naming a table.
const FROM_ARGUMENT_FUNCTIONS: &[&str] = &["extract", "trim", "substring", "position", "overlay"];

/// A piece of SQL together with the names it binds locally (CTE aliases).
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub sql: &'a str,
    /// Lower-cased names that must never be reported as tables.
    pub local_names: &'a HashSet<String>,
}

impl<'a> Fragment<'a> {
    pub fn new(sql: &'a str, local_names: &'a HashSet<String>) -> Self {
        Self { sql, local_names }
    }

    pub fn tables(&self) -> BTreeSet<String> {
        extract_tables(self.sql, self.local_names)
    }
}

/// Returns the lower-cased physical tables read by `sql`.
///
/// Schema-qualified names report only the final component. Reserved words
/// and any name in `local_names` are excluded.
pub fn extract_tables(sql: &str, local_names: &HashSet<String>) -> BTreeSet<String> {
    let tokens = tokenize(sql);
    let mut tables = BTreeSet::new();
    // One entry per open parenthesis: true when FROM inside it is argument syntax.
    let mut groups: Vec<bool> = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        if token.is_punct('(') {
            let argument_syntax = idx > 0 && tokens[idx - 1].is_any_keyword(FROM_ARGUMENT_FUNCTIONS);
            groups.push(argument_syntax);
            continue;
        }
        if token.is_punct(')') {
            groups.pop();
            continue;
        }

        if token.is_keyword("from") {
            if groups.last().copied().unwrap_or(false) || is_distinct_from(&tokens, idx) {
                continue;
            }
            read_table_list(&tokens, idx + 1, true, local_names, &mut tables);
        } else if token.is_keyword("join") {
            read_table_list(&tokens, idx + 1, false, local_names, &mut tables);
        }
    }

    tables
}

fn is_distinct_from(tokens: &[Token<'_>], from_idx: usize) -> bool {
    from_idx >= 2
        && tokens[from_idx - 1].is_keyword("distinct")
        && tokens[from_idx - 2].is_any_keyword(&["is", "not"])
}

// Reads one table reference (or, after FROM, a comma-separated list of them)
// starting at `idx`.
fn read_table_list(
    tokens: &[Token<'_>],
    mut idx: usize,
    allow_list: bool,
    local_names: &HashSet<String>,
    tables: &mut BTreeSet<String>,
) {
    loop {
        let Some(next) = read_table_ref(tokens, idx, local_names, tables) else {
            return;
        };
        idx = next;

        if allow_list && tokens.get(idx).is_some_and(|t| t.is_punct(',')) {
            idx += 1;
        } else {
            return;
        }
    }
}

// Returns the index just past the reference and its alias, or `None` when the
// reference cannot be delimited.
fn read_table_ref(
    tokens: &[Token<'_>],
    mut idx: usize,
    local_names: &HashSet<String>,
    tables: &mut BTreeSet<String>,
) -> Option<usize> {
    while tokens
        .get(idx)
        .is_some_and(|t| t.is_any_keyword(&["lateral", "only"]))
    {
        idx += 1;
    }

    let token = tokens.get(idx)?;
    if token.is_punct('(') {
        let close = matching_paren(tokens, idx)?;
        // A parenthesized join group names tables; a derived table's own FROM
        // is reached by the outer walk.
        let derived = tokens
            .get(idx + 1)
            .is_some_and(|t| t.is_any_keyword(&["select", "with", "values"]));
        if !derived {
            read_table_list(tokens, idx + 1, true, local_names, tables);
        }
        return Some(skip_alias(tokens, close + 1));
    }

    let mut name = token.ident()?;
    idx += 1;
    while tokens.get(idx).is_some_and(|t| t.is_punct('.')) {
        name = tokens.get(idx + 1)?.ident()?;
        idx += 2;
    }
    // Table functions are recorded like tables; reserved ones are filtered.
    record_table(name, local_names, tables);
    if tokens.get(idx).is_some_and(|t| t.is_punct('(')) {
        idx = matching_paren(tokens, idx)? + 1;
    }

    Some(skip_alias(tokens, idx))
}

fn record_table(name: &str, local_names: &HashSet<String>, tables: &mut BTreeSet<String>) {
    let lowered = name.to_ascii_lowercase();
    if !lowered.is_empty()
        && !RESERVED_WORDS.contains(lowered.as_str())
        && !local_names.contains(&lowered)
    {
        tables.insert(lowered);
    }
}

fn skip_alias(tokens: &[Token<'_>], mut idx: usize) -> usize {
    if tokens.get(idx).is_some_and(|t| t.is_keyword("as")) {
        idx += 1;
    }
    match tokens.get(idx) {
        Some(t) if t.kind == TokenKind::QuotedIdent => idx + 1,
        Some(t) if t.kind == TokenKind::Word && !t.is_any_keyword(CLAUSE_WORDS) => {
            let mut next = idx + 1;
            // Column alias list: `AS x(a, b)`.
            if tokens.get(next).is_some_and(|t| t.is_punct('(')) {
                if let Some(close) = matching_paren(tokens, next) {
                    next = close + 1;
                }
            }
            next
        }
        _ => idx,
    }
}
