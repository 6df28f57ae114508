//! Lexical scanner shared by statement decomposition, table extraction and
//! nested-query discovery.
//!
//! Lexing is done by `sqlparser`'s tokenizer with the generic dialect, so
//! comments, string literals and quoted identifiers never leak `(`, `)` or
//! `;` into the token stream. Each token is mapped back onto the exact slice
//! of the input it came from so callers can cut CTE and subquery bodies out
//! of the original text.

use std::str::CharIndices;

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Location, Token as SqlToken, Tokenizer};
use thiserror::Error;

/// Classification of a scanned token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword (`select`, `payment_intent`, `p1`).
    Word,
    /// Identifier wrapped in double quotes or backticks.
    QuotedIdent,
    /// String literal of any flavour.
    Literal,
    Number,
    /// Operators and punctuation (`(`, `)`, `,`, `.`, `;`, `::` ...).
    Punct,
}

/// A token borrowed from the scanned SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
}

impl<'a> Token<'a> {
    /// Case-insensitive keyword comparison; only bare words can be keywords.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_any_keyword(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|keyword| self.is_keyword(keyword))
    }

    pub fn is_punct(&self, ch: char) -> bool {
        let mut chars = self.text.chars();
        self.kind == TokenKind::Punct && chars.next() == Some(ch) && chars.next().is_none()
    }

    /// Identifier text with surrounding quotes removed.
    pub fn ident(&self) -> Option<&'a str> {
        match self.kind {
            TokenKind::Word => Some(self.text),
            TokenKind::QuotedIdent if self.text.len() >= 2 => {
                Some(&self.text[1..self.text.len() - 1])
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unable to tokenize query: {0}")]
pub struct ScanError(String);

/// Splits `sql` into tokens, skipping whitespace and comments.
pub fn try_tokenize(sql: &str) -> Result<Vec<Token<'_>>, ScanError> {
    let dialect = GenericDialect {};
    let scanned = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|err| ScanError(err.to_string()))?;

    let mut cursor = SourceCursor::new(sql);
    let starts: Vec<usize> = scanned
        .iter()
        .map(|token| cursor.seek(&token.location))
        .collect();

    let mut tokens = Vec::with_capacity(scanned.len());
    for (idx, scanned_token) in scanned.iter().enumerate() {
        let Some(kind) = classify(&scanned_token.token) else {
            continue;
        };
        let start = starts[idx];
        let end = starts.get(idx + 1).copied().unwrap_or(sql.len());
        tokens.push(Token {
            kind,
            text: &sql[start..end],
            start,
            end,
        });
    }
    Ok(tokens)
}

/// Like [`try_tokenize`], but input the tokenizer rejects (an unterminated
/// literal or comment) yields no tokens. The validator rejects such input
/// before any fragment is scanned this way.
pub fn tokenize(sql: &str) -> Vec<Token<'_>> {
    try_tokenize(sql).unwrap_or_default()
}

fn classify(token: &SqlToken) -> Option<TokenKind> {
    let kind = match token {
        SqlToken::Whitespace(_) | SqlToken::EOF => return None,
        SqlToken::Word(word) if word.quote_style.is_some() => TokenKind::QuotedIdent,
        SqlToken::Word(_) => TokenKind::Word,
        SqlToken::Number(..) => TokenKind::Number,
        SqlToken::SingleQuotedString(_)
        | SqlToken::DoubleQuotedString(_)
        | SqlToken::NationalStringLiteral(_)
        | SqlToken::EscapedStringLiteral(_)
        | SqlToken::HexStringLiteral(_) => TokenKind::Literal,
        _ => TokenKind::Punct,
    };
    Some(kind)
}

// Converts the tokenizer's line/column positions into byte offsets. Positions
// arrive in increasing order, so the walk over the source is single pass.
struct SourceCursor<'a> {
    chars: CharIndices<'a>,
    len: usize,
    line: u64,
    column: u64,
    offset: usize,
}

impl<'a> SourceCursor<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            chars: sql.char_indices(),
            len: sql.len(),
            line: 1,
            column: 1,
            offset: 0,
        }
    }

    fn seek(&mut self, target: &Location) -> usize {
        while (self.line, self.column) < (target.line, target.column) {
            let Some((idx, ch)) = self.chars.next() else {
                self.offset = self.len;
                break;
            };
            self.offset = idx + ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.offset
    }
}

/// Returns the index of the `)` token closing the `(` at `open`, or `None`
/// when the group never closes.
pub fn matching_paren(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    if !tokens.get(open)?.is_punct('(') {
        return None;
    }

    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct('(') {
            depth += 1;
        } else if token.is_punct(')') {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

/// True when every `(` has a matching `)` and no `)` closes an unopened group.
pub fn is_balanced(tokens: &[Token<'_>]) -> bool {
    let mut depth = 0i64;
    for token in tokens {
        if token.is_punct('(') {
            depth += 1;
        } else if token.is_punct(')') {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        }
    }
    depth == 0
}

/// Text strictly between the parenthesis tokens at `open` and `close`, trimmed.
pub fn inner_text<'a>(sql: &'a str, tokens: &[Token<'a>], open: usize, close: usize) -> &'a str {
    sql[tokens[open].end..tokens[close].start].trim()
}
