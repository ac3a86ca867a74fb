//! Named operations.
//!
//! The registry is a flat name → operation table. Cursor-producing operations
//! are registered once and exposed under two names: `<name>.toArray` collects
//! every item into one array result, `<name>.forEach` streams the items.

use super::driver::{Driver, OperationOutput, Resource};
use crate::error::DispatchResult;
use crate::models::Message;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type OperationFuture = BoxFuture<'static, DispatchResult<OperationOutput>>;

type Handler<D> = Arc<dyn Fn(Resource<D>, Vec<Value>) -> OperationFuture + Send + Sync>;

pub const TO_ARRAY_SUFFIX: &str = ".toArray";
pub const FOR_EACH_SUFFIX: &str = ".forEach";

/// Which handle an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Database,
    Collection,
}

pub struct Operation<D: Driver> {
    name: String,
    scope: Scope,
    /// Maximum positional arguments; extra ones are dropped.
    arity: Option<usize>,
    handler: Handler<D>,
}

impl<D: Driver> Clone for Operation<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            scope: self.scope,
            arity: self.arity,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Operation<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("arity", &self.arity)
            .finish()
    }
}

impl<D: Driver> Operation<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    /// Positional arguments for this operation, shaped from the message payload.
    pub fn arguments(&self, msg: &Message) -> Vec<Value> {
        let mut args = msg.arguments();
        if let Some(arity) = self.arity {
            args.truncate(arity);
        }
        args
    }

    pub fn invoke(&self, resource: Resource<D>, args: Vec<Value>) -> OperationFuture {
        (self.handler)(resource, args)
    }
}

pub struct OperationRegistry<D: Driver> {
    operations: HashMap<String, Operation<D>>,
}

impl<D: Driver> Default for OperationRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Driver> OperationRegistry<D> {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Registry preloaded with `db` and `collection`, which return a
    /// description of the resolved handle itself.
    pub fn with_passthrough(driver: Arc<D>) -> Self {
        let mut registry = Self::new();
        for (name, scope) in [("db", Scope::Database), ("collection", Scope::Collection)] {
            let driver = Arc::clone(&driver);
            registry.register(name, scope, Some(0), move |resource, _args| {
                let description = driver.describe(&resource);
                async move { Ok(description) }
            });
        }
        registry
    }

    /// Register an operation producing a single value.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        scope: Scope,
        arity: Option<usize>,
        handler: F,
    ) where
        F: Fn(Resource<D>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Value>> + Send + 'static,
    {
        let handler: Handler<D> = Arc::new(move |resource: Resource<D>, args: Vec<Value>| {
            handler(resource, args)
                .map(|result| result.map(OperationOutput::Value))
                .boxed()
        });
        self.insert(name.into(), scope, arity, handler);
    }

    /// Register a cursor operation under its `.toArray` and `.forEach` names.
    pub fn register_cursor<F, Fut>(
        &mut self,
        name: impl Into<String>,
        scope: Scope,
        arity: Option<usize>,
        handler: F,
    ) where
        F: Fn(Resource<D>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<BoxStream<'static, DispatchResult<Value>>>>
            + Send
            + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);

        let collect = Arc::clone(&handler);
        let to_array: Handler<D> = Arc::new(move |resource: Resource<D>, args: Vec<Value>| {
            let cursor = collect(resource, args);
            let collected: OperationFuture = async move {
                let items: Vec<Value> = cursor.await?.try_collect().await?;
                Ok(OperationOutput::Value(Value::Array(items)))
            }
            .boxed();
            collected
        });

        let for_each: Handler<D> = Arc::new(move |resource: Resource<D>, args: Vec<Value>| {
            handler(resource, args)
                .map(|result| result.map(OperationOutput::Cursor))
                .boxed()
        });

        self.operations.remove(&name);
        self.insert(format!("{name}{TO_ARRAY_SUFFIX}"), scope, arity, to_array);
        self.insert(format!("{name}{FOR_EACH_SUFFIX}"), scope, arity, for_each);
    }

    fn insert(&mut self, name: String, scope: Scope, arity: Option<usize>, handler: Handler<D>) {
        let operation = Operation {
            name: name.clone(),
            scope,
            arity,
            handler,
        };
        self.operations.insert(name, operation);
    }

    pub fn get(&self, name: &str) -> Option<&Operation<D>> {
        self.operations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// All operation names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
