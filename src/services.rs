//! Database services bound through the platform environment.
//!
//! Cloud Foundry style platforms publish bound services as a JSON document in
//! `VCAP_SERVICES`, keyed by service label:
//!
//! ```json
//! { "postgresql": [ { "name": "orders-db", "label": "postgresql",
//!                     "credentials": { "uri": "postgres://..." } } ] }
//! ```
//!
//! Only labels naming a supported database are kept.

use crate::error::{DispatchError, DispatchResult};
use crate::models::{BackendConfig, BackendId, DatabaseType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const SERVICES_ENV: &str = "VCAP_SERVICES";

#[derive(Debug, Clone, Deserialize)]
struct ServiceEntry {
    name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    credentials: Map<String, Value>,
}

/// Listing entry; never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: Vec<(String, ServiceEntry)>,
}

impl ServiceCatalog {
    /// Read the catalog from `VCAP_SERVICES`; an unset variable is an empty catalog.
    pub fn from_env() -> DispatchResult<Self> {
        match std::env::var(SERVICES_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::parse(&raw),
            _ => {
                debug!("{} not set, no services discovered", SERVICES_ENV);
                Ok(Self::default())
            }
        }
    }

    pub fn parse(raw: &str) -> DispatchResult<Self> {
        let by_label: BTreeMap<String, Vec<ServiceEntry>> = serde_json::from_str(raw)
            .map_err(|e| {
                DispatchError::configuration(format!("invalid {}: {}", SERVICES_ENV, e))
            })?;

        let services: Vec<(String, ServiceEntry)> = by_label
            .into_iter()
            .filter(|(label, _)| DatabaseType::from_label(label).is_some())
            .flat_map(|(label, entries)| {
                entries.into_iter().map(move |entry| {
                    let label = entry.label.clone().unwrap_or_else(|| label.clone());
                    (label, entry)
                })
            })
            .collect();

        debug!(count = services.len(), "Discovered database services");
        Ok(Self { services })
    }

    pub fn summaries(&self) -> Vec<ServiceSummary> {
        self.services
            .iter()
            .map(|(label, entry)| ServiceSummary {
                name: entry.name.clone(),
                label: label.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Backend configuration for the service called `name`.
    ///
    /// The URL comes from `credentials.uri`, falling back to `credentials.url`.
    /// A service without either yields a configuration with no target, which
    /// the pool rejects on attach.
    pub fn backend_config(&self, name: &str, parallelism: u32) -> DispatchResult<BackendConfig> {
        let (_, entry) = self
            .services
            .iter()
            .find(|(_, entry)| entry.name == name)
            .ok_or_else(|| {
                DispatchError::configuration(format!("service '{}' is not bound", name))
            })?;

        let uri = ["uri", "url"]
            .iter()
            .find_map(|key| entry.credentials.get(*key).and_then(Value::as_str))
            .unwrap_or_default();

        Ok(BackendConfig::new(BackendId::service(name), uri).with_parallelism(parallelism))
    }
}
