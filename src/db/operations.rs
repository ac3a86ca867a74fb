//! The SQL operation table.
//!
//! | name                      | scope      | arguments                 |
//! |---------------------------|------------|---------------------------|
//! | `db`, `collection`        | both       | none                      |
//! | `query.toArray/forEach`   | database   | sql, params               |
//! | `execute`                 | database   | sql, params               |
//! | `db.listCollections.*`    | database   | none                      |
//! | `find.toArray/forEach`    | collection | filter, options `{limit}` |
//! | `count`                   | collection | filter                    |
//! | `insertOne`               | collection | document                  |
//! | `insertMany`              | collection | documents                 |
//! | `updateMany`              | collection | filter, `{"$set": {..}}`  |
//! | `deleteMany`              | collection | filter                    |
//!
//! Filters are objects of column/value pairs combined with AND; `null` or `{}`
//! matches every row. Column names go through the same identifier check as
//! collection names.

use crate::db::executor::{self, RowCursor};
use crate::db::pool::{DbPool, SqlDriver, validate_identifier};
use crate::dispatch::{OperationRegistry, Resource, Scope};
use crate::error::{DispatchError, DispatchResult};
use crate::models::DatabaseType;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Build the registry of every SQL operation on top of the pass-through ones.
pub fn sql_registry(driver: Arc<SqlDriver>) -> OperationRegistry<SqlDriver> {
    let timeout = driver.query_timeout();
    let mut registry = OperationRegistry::with_passthrough(driver);

    registry.register_cursor("query", Scope::Database, Some(2), move |resource, args| {
        async move {
            let pool = pool_of(&resource);
            let sql = required_string(&args, 0, "query", "sql")?;
            let params = positional_params(args.get(1), "query")?;
            Ok(executor::fetch(&pool, sql, params, timeout))
        }
    });

    registry.register("execute", Scope::Database, Some(2), move |resource, args| {
        async move {
            let pool = pool_of(&resource);
            let sql = required_string(&args, 0, "execute", "sql")?;
            let params = positional_params(args.get(1), "execute")?;
            let affected = executor::execute(&pool, &sql, &params, timeout).await?;
            Ok(json!({ "rowsAffected": affected }))
        }
    });

    registry.register_cursor(
        "db.listCollections",
        Scope::Database,
        Some(0),
        move |resource, _args| async move {
            let pool = pool_of(&resource);
            let sql = list_tables_sql(pool.db_type()).to_string();
            Ok(executor::fetch(&pool, sql, Vec::new(), timeout))
        },
    );

    registry.register_cursor("find", Scope::Collection, Some(2), move |resource, args| {
        async move {
            let (pool, table) = table_of(resource, "find")?;
            let filter = filter_arg(args.first(), "find")?;
            let limit = limit_option(args.get(1))?;
            let (sql, params) = select_sql(pool.db_type(), &table, &filter, limit)?;
            Ok::<RowCursor, DispatchError>(executor::fetch(&pool, sql, params, timeout))
        }
    });

    registry.register("count", Scope::Collection, Some(1), move |resource, args| {
        async move {
            let (pool, table) = table_of(resource, "count")?;
            let filter = filter_arg(args.first(), "count")?;
            let (sql, params) = count_sql(pool.db_type(), &table, &filter)?;
            let rows = executor::fetch_all(&pool, sql, params, timeout).await?;
            Ok(rows
                .first()
                .and_then(|row| row.get("count"))
                .cloned()
                .unwrap_or_else(|| json!(0)))
        }
    });

    registry.register("insertOne", Scope::Collection, Some(1), move |resource, args| {
        async move {
            let (pool, table) = table_of(resource, "insertOne")?;
            let document = document_arg(args.first(), "insertOne")?;
            let (sql, params) = insert_sql(pool.db_type(), &table, &document)?;
            let inserted = executor::execute(&pool, &sql, &params, timeout).await?;
            Ok(json!({ "insertedCount": inserted }))
        }
    });

    registry.register("insertMany", Scope::Collection, Some(1), move |resource, args| {
        async move {
            let (pool, table) = table_of(resource, "insertMany")?;
            let documents = match args.first() {
                Some(Value::Array(items)) => items.clone(),
                _ => {
                    return Err(DispatchError::operation(
                        "insertMany",
                        "expected an array of documents",
                    ));
                }
            };
            let mut inserted = 0u64;
            for document in &documents {
                let document = document_arg(Some(document), "insertMany")?;
                let (sql, params) = insert_sql(pool.db_type(), &table, &document)?;
                inserted += executor::execute(&pool, &sql, &params, timeout).await?;
            }
            Ok(json!({ "insertedCount": inserted }))
        }
    });

    registry.register("updateMany", Scope::Collection, Some(2), move |resource, args| {
        async move {
            let (pool, table) = table_of(resource, "updateMany")?;
            let filter = filter_arg(args.first(), "updateMany")?;
            let changes = match args.get(1).and_then(|u| u.get("$set")) {
                Some(Value::Object(set)) if !set.is_empty() => set.clone(),
                _ => {
                    return Err(DispatchError::operation(
                        "updateMany",
                        "expected an update of the form {\"$set\": {...}}",
                    ));
                }
            };
            let (sql, params) = update_sql(pool.db_type(), &table, &filter, &changes)?;
            let modified = executor::execute(&pool, &sql, &params, timeout).await?;
            Ok(json!({ "modifiedCount": modified }))
        }
    });

    registry.register("deleteMany", Scope::Collection, Some(1), move |resource, args| {
        async move {
            let (pool, table) = table_of(resource, "deleteMany")?;
            let filter = filter_arg(args.first(), "deleteMany")?;
            let (sql, params) = delete_sql(pool.db_type(), &table, &filter)?;
            let deleted = executor::execute(&pool, &sql, &params, timeout).await?;
            Ok(json!({ "deletedCount": deleted }))
        }
    });

    registry
}

fn pool_of(resource: &Resource<SqlDriver>) -> DbPool {
    match resource {
        Resource::Database(db) => db.pool.clone(),
        Resource::Collection(table) => table.pool.clone(),
    }
}

fn table_of(resource: Resource<SqlDriver>, operation: &str) -> DispatchResult<(DbPool, String)> {
    match resource {
        Resource::Collection(table) => Ok((table.pool, table.table)),
        Resource::Database(_) => Err(DispatchError::operation(
            operation,
            "requires a collection",
        )),
    }
}

fn required_string(
    args: &[Value],
    idx: usize,
    operation: &str,
    what: &str,
) -> DispatchResult<String> {
    match args.get(idx) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(DispatchError::operation(
            operation,
            format!("argument {} ({}) must be a non-empty string", idx + 1, what),
        )),
    }
}

fn positional_params(arg: Option<&Value>, operation: &str) -> DispatchResult<Vec<Value>> {
    match arg {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(DispatchError::operation(
            operation,
            "params must be an array",
        )),
    }
}

fn filter_arg(arg: Option<&Value>, operation: &str) -> DispatchResult<Map<String, Value>> {
    match arg {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(filter)) => Ok(filter.clone()),
        Some(_) => Err(DispatchError::operation(
            operation,
            "filter must be an object",
        )),
    }
}

fn document_arg(arg: Option<&Value>, operation: &str) -> DispatchResult<Map<String, Value>> {
    match arg {
        Some(Value::Object(doc)) if !doc.is_empty() => Ok(doc.clone()),
        _ => Err(DispatchError::operation(
            operation,
            "document must be a non-empty object",
        )),
    }
}

fn limit_option(arg: Option<&Value>) -> DispatchResult<Option<u64>> {
    match arg.and_then(|options| options.get("limit")) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            // Same as the mongo driver: a zero limit means no limit
            Some(0) => Ok(None),
            Some(limit) => Ok(Some(limit)),
            None => Err(DispatchError::operation("find", "limit must be a non-negative integer")),
        },
        Some(_) => Err(DispatchError::operation("find", "limit must be a number")),
    }
}

fn list_tables_sql(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::SQLite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        DatabaseType::PostgreSQL => {
            "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = current_schema() ORDER BY table_name"
        }
        DatabaseType::MySQL => {
            "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = DATABASE() ORDER BY table_name"
        }
    }
}

fn quote_ident(db_type: DatabaseType, ident: &str) -> DispatchResult<String> {
    validate_identifier(ident)?;
    Ok(match db_type {
        DatabaseType::MySQL => format!("`{}`", ident),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => format!("\"{}\"", ident),
    })
}

fn placeholder(db_type: DatabaseType, n: usize) -> String {
    match db_type {
        DatabaseType::PostgreSQL => format!("${}", n),
        DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
    }
}

/// WHERE clause for an equality filter; placeholders are numbered from `first`.
fn where_clause(
    db_type: DatabaseType,
    filter: &Map<String, Value>,
    first: usize,
) -> DispatchResult<(String, Vec<Value>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut conditions = Vec::with_capacity(filter.len());
    let mut params = Vec::new();
    for (column, value) in filter {
        let column = quote_ident(db_type, column)?;
        if value.is_null() {
            conditions.push(format!("{} IS NULL", column));
        } else {
            params.push(value.clone());
            conditions.push(format!(
                "{} = {}",
                column,
                placeholder(db_type, first + params.len() - 1)
            ));
        }
    }
    Ok((format!(" WHERE {}", conditions.join(" AND ")), params))
}

fn select_sql(
    db_type: DatabaseType,
    table: &str,
    filter: &Map<String, Value>,
    limit: Option<u64>,
) -> DispatchResult<(String, Vec<Value>)> {
    let (clause, params) = where_clause(db_type, filter, 1)?;
    let mut sql = format!("SELECT * FROM {}{}", quote_ident(db_type, table)?, clause);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    Ok((sql, params))
}

fn count_sql(
    db_type: DatabaseType,
    table: &str,
    filter: &Map<String, Value>,
) -> DispatchResult<(String, Vec<Value>)> {
    let (clause, params) = where_clause(db_type, filter, 1)?;
    Ok((
        format!(
            "SELECT COUNT(*) AS count FROM {}{}",
            quote_ident(db_type, table)?,
            clause
        ),
        params,
    ))
}

fn insert_sql(
    db_type: DatabaseType,
    table: &str,
    document: &Map<String, Value>,
) -> DispatchResult<(String, Vec<Value>)> {
    let mut columns = Vec::with_capacity(document.len());
    let mut placeholders = Vec::with_capacity(document.len());
    let mut params = Vec::with_capacity(document.len());
    for (idx, (column, value)) in document.iter().enumerate() {
        columns.push(quote_ident(db_type, column)?);
        placeholders.push(placeholder(db_type, idx + 1));
        params.push(value.clone());
    }
    Ok((
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(db_type, table)?,
            columns.join(", "),
            placeholders.join(", ")
        ),
        params,
    ))
}

fn update_sql(
    db_type: DatabaseType,
    table: &str,
    filter: &Map<String, Value>,
    changes: &Map<String, Value>,
) -> DispatchResult<(String, Vec<Value>)> {
    let mut assignments = Vec::with_capacity(changes.len());
    let mut params = Vec::with_capacity(changes.len() + filter.len());
    for (idx, (column, value)) in changes.iter().enumerate() {
        assignments.push(format!(
            "{} = {}",
            quote_ident(db_type, column)?,
            placeholder(db_type, idx + 1)
        ));
        params.push(value.clone());
    }
    let (clause, filter_params) = where_clause(db_type, filter, params.len() + 1)?;
    params.extend(filter_params);
    Ok((
        format!(
            "UPDATE {} SET {}{}",
            quote_ident(db_type, table)?,
            assignments.join(", "),
            clause
        ),
        params,
    ))
}

fn delete_sql(
    db_type: DatabaseType,
    table: &str,
    filter: &Map<String, Value>,
) -> DispatchResult<(String, Vec<Value>)> {
    let (clause, params) = where_clause(db_type, filter, 1)?;
    Ok((
        format!("DELETE FROM {}{}", quote_ident(db_type, table)?, clause),
        params,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn filter(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_registry_names() {
        let registry = sql_registry(Arc::new(SqlDriver::new(Duration::from_secs(5))));
        let names = registry.names();
        for expected in [
            "collection",
            "count",
            "db",
            "deleteMany",
            "execute",
            "find.forEach",
            "find.toArray",
            "insertMany",
            "insertOne",
            "db.listCollections.forEach",
            "db.listCollections.toArray",
            "query.forEach",
            "query.toArray",
            "updateMany",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(!registry.contains("find"));
        assert_eq!(registry.get("count").map(|op| op.scope()), Some(Scope::Collection));
        assert_eq!(registry.get("query.toArray").map(|op| op.scope()), Some(Scope::Database));
    }

    #[test]
    fn test_select_sql_postgres_numbering() {
        let (sql, params) = select_sql(
            DatabaseType::PostgreSQL,
            "users",
            &filter(json!({"age": 30, "name": "ann"})),
            Some(5),
        )
        .unwrap();
        assert_eq!(
            sql,
            r#"SELECT * FROM "users" WHERE "age" = $1 AND "name" = $2 LIMIT 5"#
        );
        assert_eq!(params, vec![json!(30), json!("ann")]);
    }

    #[test]
    fn test_select_sql_null_filter_value() {
        let (sql, params) = select_sql(
            DatabaseType::MySQL,
            "users",
            &filter(json!({"deleted_at": null})),
            None,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM `users` WHERE `deleted_at` IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_update_sql_numbers_filter_after_changes() {
        let (sql, params) = update_sql(
            DatabaseType::PostgreSQL,
            "users",
            &filter(json!({"id": 7})),
            &filter(json!({"name": "bo"})),
        )
        .unwrap();
        assert_eq!(sql, r#"UPDATE "users" SET "name" = $1 WHERE "id" = $2"#);
        assert_eq!(params, vec![json!("bo"), json!(7)]);
    }

    #[test]
    fn test_insert_and_delete_sql_sqlite() {
        let (sql, params) =
            insert_sql(DatabaseType::SQLite, "t", &filter(json!({"a": 1, "b": "x"}))).unwrap();
        assert_eq!(sql, r#"INSERT INTO "t" ("a", "b") VALUES (?, ?)"#);
        assert_eq!(params.len(), 2);

        let (sql, params) = delete_sql(DatabaseType::SQLite, "t", &Map::new()).unwrap();
        assert_eq!(sql, r#"DELETE FROM "t""#);
        assert!(params.is_empty());
    }

    #[test]
    fn test_bad_column_rejected() {
        let err = count_sql(
            DatabaseType::SQLite,
            "t",
            &filter(json!({"a OR 1=1 --": 1})),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput { .. }));
    }

    #[test]
    fn test_argument_validation() {
        assert!(filter_arg(Some(&json!([1])), "find").is_err());
        assert!(filter_arg(None, "find").unwrap().is_empty());
        assert!(positional_params(Some(&json!({"a": 1})), "query").is_err());
        assert_eq!(limit_option(Some(&json!({"limit": 0}))).unwrap(), None);
        assert_eq!(limit_option(Some(&json!({"limit": 3}))).unwrap(), Some(3));
        assert!(limit_option(Some(&json!({"limit": "x"}))).is_err());
        assert!(document_arg(Some(&json!({})), "insertOne").is_err());
    }
}
