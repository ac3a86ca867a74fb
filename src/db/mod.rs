//! Database abstraction layer.
//!
//! This module provides the sqlx-backed driver:
//! - Connection pool management
//! - Statement execution and row streaming
//! - Row to JSON mapping
//! - The SQL operation table

pub mod executor;
pub mod operations;
pub mod pool;
pub mod types;

pub use executor::RowCursor;
pub use operations::sql_registry;
pub use pool::{DbPool, SqlDatabase, SqlDriver, SqlTable};
pub use types::RowToJson;
