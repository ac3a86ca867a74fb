//! db-dispatch library
//!
//! Bounded-concurrency dispatch of named database operations over shared,
//! lazily connected backends (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod services;
pub mod transport;

pub use config::Config;
pub use dispatch::{Dispatcher, Driver, Endpoint, EndpointSettings};
pub use error::{DispatchError, DispatchResult};
pub use models::{BackendConfig, BackendId, Message};
