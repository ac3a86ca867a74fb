//! The seam between the dispatcher and a concrete database client.

use crate::error::DispatchResult;
use crate::models::BackendConfig;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::future::Future;

/// A database client library as seen by the dispatcher.
///
/// The dispatcher only ever connects, resolves a database or collection
/// handle, and closes. Everything else happens inside registered operations.
pub trait Driver: Sized + Send + Sync + 'static {
    /// Shared connection handle. Cloning must be cheap.
    type Client: Clone + Send + Sync + 'static;
    type Database: Send + 'static;
    type Collection: Send + 'static;

    /// Open a client for `config`. Called at most once per live connection cell.
    fn connect(&self, config: &BackendConfig)
    -> impl Future<Output = DispatchResult<Self::Client>> + Send;

    /// Close a client previously returned by `connect`.
    fn close(&self, client: Self::Client) -> impl Future<Output = DispatchResult<()>> + Send;

    fn database(&self, client: &Self::Client, name: &str) -> DispatchResult<Self::Database>;

    fn collection(&self, database: &Self::Database, name: &str)
    -> DispatchResult<Self::Collection>;

    /// JSON description of a resolved handle, used by the pass-through operations.
    fn describe(&self, resource: &Resource<Self>) -> Value;
}

/// Handle an operation runs against.
pub enum Resource<D: Driver> {
    Database(D::Database),
    Collection(D::Collection),
}

impl<D: Driver> Resource<D> {
    pub fn is_collection(&self) -> bool {
        matches!(self, Resource::Collection(_))
    }
}

/// What an operation handler produces.
pub enum OperationOutput {
    Value(Value),
    /// Item-by-item results; the stream ends after the last item or the first error.
    Cursor(BoxStream<'static, DispatchResult<Value>>),
}

impl std::fmt::Debug for OperationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            OperationOutput::Cursor(_) => f.write_str("Cursor(..)"),
        }
    }
}
