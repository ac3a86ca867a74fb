//! Data models for the dispatcher.
//!
//! This module re-exports all model types used throughout the application.

pub mod backend;
pub mod message;

// Re-export commonly used types
pub use backend::{BackendConfig, BackendId, DatabaseType, database_name};
pub use message::{Message, normalize_result};
