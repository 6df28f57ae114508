use std::{
    collections::BTreeMap,
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Number, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Column, Executor, Row, SqlitePool, TypeInfo, ValueRef,
};
use tracing::{info, instrument, warn};

use crate::config::ExecutionConfig;
use crate::health::ServiceHealth;
use crate::model::{ExecutionResult, Row as ResultRow};

const HEALTH_PROBE_SQL: &str = "SELECT 1 AS test_value";
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Rows fetched for one query, capped at the caller's limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
    pub data_types: BTreeMap<String, String>,
    pub truncated: bool,
}

/// Caller-owned access to the relational store.
#[async_trait]
pub trait ConnectionAccessor: Send + Sync {
    /// Runs `sql` and returns at most `max_rows` rows. Stops reading once the
    /// cap is exceeded and reports `truncated`.
    async fn fetch(&self, sql: &str, max_rows: usize) -> Result<RowSet>;
}

#[derive(Debug, Clone)]
pub struct SqlitePoolAccessor {
    pool: SqlitePool,
}

impl SqlitePoolAccessor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a pool on `database_url` (e.g. `sqlite:///var/lib/insight/payments.db`).
    /// An in-memory database needs `max_connections = 1`, since every
    /// connection would otherwise see its own empty database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url}"))?
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionAccessor for SqlitePoolAccessor {
    async fn fetch(&self, sql: &str, max_rows: usize) -> Result<RowSet> {
        let mut set = RowSet::default();
        {
            // The connection goes back to the pool when the stream is dropped,
            // including when the surrounding future is cancelled by a timeout.
            let mut rows = sqlx::query(sql).fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                if set.columns.is_empty() {
                    describe_columns(&row, &mut set);
                }
                if set.rows.len() >= max_rows {
                    set.truncated = true;
                    break;
                }
                set.rows.push(decode_row(&row)?);
            }
        }

        if set.columns.is_empty() {
            // No row to read names from; the prepared statement still knows them.
            let described = self.pool.describe(sql).await?;
            for column in described.columns() {
                let name = column.name().to_string();
                set.data_types
                    .insert(name.clone(), column.type_info().name().to_string());
                set.columns.push(name);
            }
        }

        Ok(set)
    }
}

fn describe_columns(row: &SqliteRow, set: &mut RowSet) {
    for column in row.columns() {
        let name = column.name().to_string();
        let declared = column.type_info();
        let type_name = if declared.is_null() {
            // Expression columns have no declared type; use the value's.
            row.try_get_raw(column.ordinal())
                .map(|raw| raw.type_info().name().to_string())
                .unwrap_or_else(|_| "NULL".to_string())
        } else {
            declared.name().to_string()
        };
        set.data_types.insert(name.clone(), type_name);
        set.columns.push(name);
    }
}

fn decode_row(row: &SqliteRow) -> Result<ResultRow> {
    let mut out = ResultRow::new();
    for column in row.columns() {
        let value = decode_value(row, column.ordinal())
            .with_context(|| format!("failed to decode column {}", column.name()))?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_value(row: &SqliteRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" | "NUMERIC" => {
            let float = row.try_get_unchecked::<f64, _>(idx)?;
            Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null)
        }
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

/// Execution stage: runs validated SQL through a [`ConnectionAccessor`].
#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        sql: &str,
        connections: &dyn ConnectionAccessor,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult>;

    async fn health_check(
        &self,
        connections: &dyn ConnectionAccessor,
        config: &ExecutionConfig,
    ) -> ServiceHealth {
        match self.execute(HEALTH_PROBE_SQL, connections, config).await {
            Ok(result) if result.success => ServiceHealth::healthy(Some(result.execution_time_ms)),
            Ok(result) => ServiceHealth::unhealthy(result.error.unwrap_or_default()),
            Err(err) => ServiceHealth::unhealthy(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SqlExecutor;

impl SqlExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryExecutor for SqlExecutor {
    #[instrument(skip(self, sql, connections, config), fields(max_rows = config.max_rows))]
    async fn execute(
        &self,
        sql: &str,
        connections: &dyn ConnectionAccessor,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        if sql.trim().is_empty() {
            return Ok(ExecutionResult::failure("Empty SQL query provided", None, 0.0));
        }

        let fetched = connections.fetch(sql, config.max_rows).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let set = match fetched {
            Ok(set) => set,
            Err(err) => {
                warn!(error = %format!("{err:#}"), elapsed_ms, "query failed");
                return Ok(ExecutionResult::failure(
                    format!("{err:#}"),
                    Some(sql.to_string()),
                    elapsed_ms,
                ));
            }
        };

        if set.truncated {
            warn!(max_rows = config.max_rows, "result truncated to row cap");
        }
        info!(rows = set.rows.len(), elapsed_ms, "query executed");

        Ok(ExecutionResult {
            success: true,
            row_count: set.rows.len(),
            rows: set.rows,
            columns: set.columns,
            data_types: set.data_types,
            truncated: set.truncated,
            execution_time_ms: elapsed_ms,
            error: None,
            query_executed: Some(sql.to_string()),
        })
    }
}
