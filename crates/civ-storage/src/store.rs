use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use civ_core::whole_seconds;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions,
};
use sqlx::{QueryBuilder, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::records::{Record, SCHEMA};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to {url}: {source}")]
    Connect { url: String, source: sqlx::Error },
    #[error("applying schema: {0}")]
    Migrate(sqlx::Error),
    #[error("writing {table}: {source}")]
    Write {
        table: &'static str,
        source: sqlx::Error,
    },
    #[error("decoding {table} row: {source}")]
    Decode {
        table: &'static str,
        source: sqlx::Error,
    },
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A typed column value. Every variant is nullable.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Real(Option<f64>),
    Int(Option<i64>),
    Bool(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
    Date(Option<NaiveDate>),
}

impl SqlValue {
    /// Null, or text that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            SqlValue::Text(v) => v.as_deref().map_or(true, |s| s.trim().is_empty()),
            SqlValue::Real(v) => v.is_none(),
            SqlValue::Int(v) => v.is_none(),
            SqlValue::Bool(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
            SqlValue::Date(v) => v.is_none(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(Some(value.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(Some(value))
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(Some(value))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(Some(value))
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(Some(value))
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        SqlValue::Date(Some(value))
    }
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Real(v) => query.bind(v),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Bool(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v.map(whole_seconds)),
        SqlValue::Date(v) => query.bind(v),
    }
}

pub(crate) fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: SqlValue) {
    match value {
        SqlValue::Text(v) => {
            builder.push_bind(v);
        }
        SqlValue::Real(v) => {
            builder.push_bind(v);
        }
        SqlValue::Int(v) => {
            builder.push_bind(v);
        }
        SqlValue::Bool(v) => {
            builder.push_bind(v);
        }
        SqlValue::Timestamp(v) => {
            builder.push_bind(v.map(whole_seconds));
        }
        SqlValue::Date(v) => {
            builder.push_bind(v);
        }
    }
}

/// Filter predicate over a column known at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(&'static str, SqlValue),
    Ne(&'static str, SqlValue),
    Gt(&'static str, SqlValue),
    Gte(&'static str, SqlValue),
    Lt(&'static str, SqlValue),
    Lte(&'static str, SqlValue),
    In(&'static str, Vec<SqlValue>),
    NotNull(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    conditions: Vec<Condition>,
    order_by: Vec<(&'static str, Order)>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn eq(self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filter(Condition::Eq(column, value.into()))
    }

    pub fn gte(self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filter(Condition::Gte(column, value.into()))
    }

    pub fn lt(self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filter(Condition::Lt(column, value.into()))
    }

    pub fn order_by(mut self, column: &'static str, order: Order) -> Self {
        self.order_by.push((column, order));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn push_clauses(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        for (idx, condition) in self.conditions.iter().enumerate() {
            builder.push(if idx == 0 { " WHERE " } else { " AND " });
            let (column, op, value) = match condition {
                Condition::Eq(c, v) => (c, " = ", v),
                Condition::Ne(c, v) => (c, " <> ", v),
                Condition::Gt(c, v) => (c, " > ", v),
                Condition::Gte(c, v) => (c, " >= ", v),
                Condition::Lt(c, v) => (c, " < ", v),
                Condition::Lte(c, v) => (c, " <= ", v),
                Condition::In(c, values) => {
                    if values.is_empty() {
                        builder.push("0 = 1");
                        continue;
                    }
                    builder.push(*c).push(" IN (");
                    for (i, value) in values.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        push_value(builder, value.clone());
                    }
                    builder.push(")");
                    continue;
                }
                Condition::NotNull(c) => {
                    builder.push(*c).push(" IS NOT NULL");
                    continue;
                }
            };
            builder.push(*column).push(op);
            push_value(builder, value.clone());
        }

        for (idx, (column, order)) in self.order_by.iter().enumerate() {
            builder.push(if idx == 0 { " ORDER BY " } else { ", " });
            builder.push(*column).push(match order {
                Order::Asc => " ASC",
                Order::Desc => " DESC",
            });
        }

        match (self.limit, self.offset) {
            (Some(limit), offset) => {
                builder.push(" LIMIT ").push_bind(limit);
                if let Some(offset) = offset {
                    builder.push(" OFFSET ").push_bind(offset);
                }
            }
            (None, Some(offset)) => {
                builder.push(" LIMIT -1 OFFSET ").push_bind(offset);
            }
            (None, None) => {}
        }
    }
}

fn upsert_sql<R: Record>() -> String {
    let columns = R::COLUMNS.join(", ");
    let placeholders = vec!["?"; R::COLUMNS.len()].join(", ");
    let updates = R::COLUMNS
        .iter()
        .filter(|c| !R::CONFLICT_KEY.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders}) ON CONFLICT({}) DO UPDATE SET {updates}",
        R::TABLE,
        R::CONFLICT_KEY.join(", ")
    )
}

/// Upserts `rows` on an open connection or transaction, skipping keyless rows.
pub(crate) async fn upsert_rows<R: Record>(
    conn: &mut SqliteConnection,
    rows: &[R],
) -> Result<usize, sqlx::Error> {
    let sql = upsert_sql::<R>();
    let key_positions: Vec<usize> = R::CONFLICT_KEY
        .iter()
        .filter_map(|key| R::COLUMNS.iter().position(|c| c == key))
        .collect();

    let mut written = 0usize;
    let mut dropped = 0usize;
    for row in rows {
        let values = row.values();
        if key_positions
            .iter()
            .any(|&i| values.get(i).map_or(true, SqlValue::is_blank))
        {
            dropped += 1;
            continue;
        }

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }
        query.execute(&mut *conn).await?;
        written += 1;
    }

    if dropped > 0 {
        warn!(table = R::TABLE, dropped, "dropped rows without a natural key");
    }
    debug!(table = R::TABLE, written, "upserted rows");
    Ok(written)
}

/// The single shared store. Cloning shares the pool and the per-table write locks.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    write_locks: Arc<Mutex<HashMap<&'static str, Arc<Mutex<()>>>>>,
}

impl RecordStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|source| StoreError::Connect {
                url: url.to_string(),
                source,
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        if let Some(parent) = options
            .get_filename()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Connect {
                url: url.to_string(),
                source,
            })?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(url, "record store ready");
        Ok(store)
    }

    /// Private in-memory database. One pinned connection, since every
    /// connection to `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let url = "sqlite::memory:";
        let options = SqliteConnectOptions::from_str(url).map_err(|source| StoreError::Connect {
            url: url.to_string(),
            source,
        })?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Connect {
                url: url.to_string(),
                source,
            })?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Migrate)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) async fn table_lock(&self, table: &'static str) -> Arc<Mutex<()>> {
        let mut map = self.write_locks.lock().await;
        map.entry(table)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert or overwrite `rows` keyed by `R::CONFLICT_KEY`, in one transaction.
    ///
    /// Rows with a missing or blank key are skipped and logged. Returns the
    /// number of rows written. Any database rejection aborts the whole batch.
    pub async fn upsert_many<R: Record>(&self, rows: &[R]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let lock = self.table_lock(R::TABLE).await;
        let _guard = lock.lock().await;

        let write_err = |source| StoreError::Write {
            table: R::TABLE,
            source,
        };
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let written = upsert_rows(&mut *tx, rows).await.map_err(write_err)?;
        tx.commit().await.map_err(write_err)?;
        Ok(written)
    }

    pub async fn select<R: Record>(&self, query: &Select) -> Result<Vec<R>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {}",
            R::COLUMNS.join(", "),
            R::TABLE
        ));
        query.push_clauses(&mut builder);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(R::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Decode {
                table: R::TABLE,
                source,
            })
    }

    /// Fetch one row by the first column of its conflict key.
    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>, StoreError> {
        let Some(&column) = R::CONFLICT_KEY.first() else {
            return Ok(None);
        };
        let mut rows = self.select::<R>(&Select::new().eq(column, key).limit(1)).await?;
        Ok(rows.pop())
    }

    pub async fn count(&self, table: &'static str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Rows in the primary `events` table; zero means a cold start.
    pub async fn count_primary(&self) -> Result<i64, StoreError> {
        self.count("events").await
    }
}
