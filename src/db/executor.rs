//! Statement execution.
//!
//! Reads are exposed as cursors: a spawned task drives the sqlx row stream
//! and forwards decoded rows over a bounded channel, so a slow consumer
//! applies backpressure and a dropped consumer stops the fetch. Writes return
//! the affected row count.
//!
//! # Architecture
//!
//! The database-specific halves live in parallel submodules (`mysql`,
//! `postgres`, `sqlite`) that differ only in their argument types.

use crate::db::pool::DbPool;
use crate::db::types::RowToJson;
use crate::error::{DispatchError, DispatchResult};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// Rows buffered ahead of the consumer.
const CURSOR_BUFFER: usize = 64;

pub type RowCursor = BoxStream<'static, DispatchResult<Value>>;

/// Run a query and stream its rows as JSON objects.
pub fn fetch(pool: &DbPool, sql: String, params: Vec<Value>, query_timeout: Duration) -> RowCursor {
    debug!(
        sql = %sql,
        params = params.len(),
        timeout_secs = query_timeout.as_secs(),
        "Executing query"
    );

    let (tx, rx) = mpsc::channel(CURSOR_BUFFER);
    match pool.clone() {
        DbPool::MySql(p) => {
            tokio::spawn(mysql::fetch_rows(p, sql, params, query_timeout, tx));
        }
        DbPool::Postgres(p) => {
            tokio::spawn(postgres::fetch_rows(p, sql, params, query_timeout, tx));
        }
        DbPool::SQLite(p) => {
            tokio::spawn(sqlite::fetch_rows(p, sql, params, query_timeout, tx));
        }
    }

    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Run a query and collect every row.
pub async fn fetch_all(
    pool: &DbPool,
    sql: String,
    params: Vec<Value>,
    query_timeout: Duration,
) -> DispatchResult<Vec<Value>> {
    let mut cursor = fetch(pool, sql, params, query_timeout);
    let mut rows = Vec::new();
    while let Some(row) = cursor.next().await {
        rows.push(row?);
    }
    Ok(rows)
}

/// Execute a write statement (INSERT, UPDATE, DELETE, DDL) and return affected rows.
pub async fn execute(
    pool: &DbPool,
    sql: &str,
    params: &[Value],
    query_timeout: Duration,
) -> DispatchResult<u64> {
    debug!(
        sql = %sql,
        params = params.len(),
        timeout_secs = query_timeout.as_secs(),
        "Executing write operation"
    );

    match pool {
        DbPool::MySql(p) => mysql::execute_write(p, sql, params, query_timeout).await,
        DbPool::Postgres(p) => postgres::execute_write(p, sql, params, query_timeout).await,
        DbPool::SQLite(p) => sqlite::execute_write(p, sql, params, query_timeout).await,
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DispatchError {
    DispatchError::timeout(operation, timeout.as_secs() as u32)
}

/// Forward rows from a sqlx stream until it ends, fails, times out, or the
/// receiver goes away.
async fn forward_rows<R, S>(
    mut rows: S,
    query_timeout: Duration,
    tx: mpsc::Sender<DispatchResult<Value>>,
) where
    R: RowToJson,
    S: futures_util::Stream<Item = Result<R, sqlx::Error>> + Unpin,
{
    loop {
        let item = match timeout(query_timeout, rows.next()).await {
            Ok(Some(Ok(row))) => Ok(row.to_json()),
            Ok(Some(Err(e))) => Err(DispatchError::from(e)),
            Ok(None) => return,
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            debug!("Cursor consumer dropped, stopping fetch");
            return;
        }
        if failed {
            return;
        }
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use sqlx::MySqlPool;
    use sqlx::mysql::MySqlArguments;

    pub async fn fetch_rows(
        pool: MySqlPool,
        sql: String,
        params: Vec<Value>,
        query_timeout: Duration,
        tx: mpsc::Sender<DispatchResult<Value>>,
    ) {
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        forward_rows(query.fetch(&pool), query_timeout, tx).await;
    }

    pub async fn execute_write(
        pool: &MySqlPool,
        sql: &str,
        params: &[Value],
        query_timeout: Duration,
    ) -> DispatchResult<u64> {
        // Without params, run raw SQL; some statements reject the prepared protocol
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DispatchError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
        param: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
        match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => query.bind(v),
                None => query.bind(n.as_f64()),
            },
            Value::String(v) => query.bind(v.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(param)),
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::PgPool;
    use sqlx::postgres::PgArguments;

    pub async fn fetch_rows(
        pool: PgPool,
        sql: String,
        params: Vec<Value>,
        query_timeout: Duration,
        tx: mpsc::Sender<DispatchResult<Value>>,
    ) {
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        forward_rows(query.fetch(&pool), query_timeout, tx).await;
    }

    pub async fn execute_write(
        pool: &PgPool,
        sql: &str,
        params: &[Value],
        query_timeout: Duration,
    ) -> DispatchResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DispatchError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
        param: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
        match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => query.bind(v),
                None => query.bind(n.as_f64()),
            },
            Value::String(v) => query.bind(v.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(param)),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqliteArguments;

    pub async fn fetch_rows(
        pool: SqlitePool,
        sql: String,
        params: Vec<Value>,
        query_timeout: Duration,
        tx: mpsc::Sender<DispatchResult<Value>>,
    ) {
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        forward_rows(query.fetch(&pool), query_timeout, tx).await;
    }

    pub async fn execute_write(
        pool: &SqlitePool,
        sql: &str,
        params: &[Value],
        query_timeout: Duration,
    ) -> DispatchResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DispatchError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
        param: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
        match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => query.bind(v),
                None => query.bind(n.as_f64()),
            },
            Value::String(v) => query.bind(v.as_str()),
            // No native JSON type; store the serialized text
            Value::Array(_) | Value::Object(_) => query.bind(param.to_string()),
        }
    }
}
