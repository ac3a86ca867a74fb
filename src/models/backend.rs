//! Backend-related data models.
//!
//! This module defines the identity and configuration of one logical database
//! deployment. Everything here is derived from configuration, never from a
//! live connection.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Parse database type from a service label such as `postgresql-14` or `MySQL`.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        if lower.starts_with("postgres") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql") || lower.starts_with("mariadb") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Stable identity of one logical database deployment.
///
/// Two configurations with the same identity share one connection cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum BackendId {
    /// Backend declared in the dispatcher configuration.
    Deployment(String),
    /// Backend discovered from the service environment.
    Service(String),
}

impl BackendId {
    pub fn deployment(name: impl Into<String>) -> Self {
        Self::Deployment(name.into())
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }

    /// Name without the kind prefix.
    pub fn name(&self) -> &str {
        match self {
            Self::Deployment(name) | Self::Service(name) => name,
        }
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deployment(name) => write!(f, "#{}", name),
            Self::Service(name) => write!(f, "service:{}", name),
        }
    }
}

/// Configuration for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// Database name resolved from the URL path. Empty when the URL names none.
    #[serde(default)]
    pub database: String,
    /// Maximum concurrently in-flight operations; 0 means unlimited.
    #[serde(default)]
    pub parallelism: u32,
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl BackendConfig {
    /// Create a configuration with unlimited parallelism and default pool options.
    pub fn new(id: BackendId, connection_string: impl Into<String>) -> Self {
        let connection_string = connection_string.into();
        let database = database_name(&connection_string).unwrap_or_default();
        Self {
            id,
            connection_string,
            database,
            parallelism: 0,
            pool_options: PoolOptions::default(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    /// True when there is something to connect to.
    pub fn has_target(&self) -> bool {
        !self.connection_string.trim().is_empty()
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@') {
            if let Some(colon_pos) = self.connection_string[..at_pos].rfind(':') {
                let prefix = &self.connection_string[..colon_pos + 1];
                let suffix = &self.connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
        self.connection_string.clone()
    }
}

/// Extract the database name from the last path segment of a connection URL.
///
/// SQLite file extensions are stripped so `sqlite:data/app.db` names `app`.
pub fn database_name(connection_string: &str) -> Option<String> {
    let url = Url::parse(connection_string).ok()?;
    // path() also covers opaque URLs such as `sqlite:data/app.db`
    url.path()
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        // Percent-decode the segment; '=' never appears in a database name
        .map(|s| {
            url::form_urlencoded::parse(s.as_bytes())
                .next()
                .map(|(name, _)| name.into_owned())
                .unwrap_or_else(|| s.to_string())
        })
        .map(|s| {
            s.trim_end_matches(".sqlite")
                .trim_end_matches(".db")
                .to_string()
        })
        .filter(|s| !s.is_empty())
}
