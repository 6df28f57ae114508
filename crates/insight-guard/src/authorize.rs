use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unauthorized table access: {0}")]
pub struct UnauthorizedTable(pub String);

/// Case-insensitive allow-list of physical tables.
#[derive(Debug, Clone, Default)]
pub struct TableAllowList {
    allowed: HashSet<String>,
}

impl TableAllowList {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: tables
                .into_iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.allowed.contains(&table.to_ascii_lowercase())
    }

    /// Fails on the first table (in sorted order) that is not allowed.
    pub fn authorize(&self, tables: &BTreeSet<String>) -> Result<(), UnauthorizedTable> {
        match tables.iter().find(|table| !self.contains(table)) {
            Some(table) => Err(UnauthorizedTable(table.clone())),
            None => Ok(()),
        }
    }
}
