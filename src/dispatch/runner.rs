//! Runs one operation against a cell and reports its outcomes.

use super::cell::Cell;
use super::driver::{Driver, OperationOutput, Resource};
use super::registry::Operation;
use crate::error::{DispatchError, DispatchResult};
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

/// One event produced while running an operation.
#[derive(Debug)]
pub enum Outcome {
    /// Single result of a value-producing operation.
    Completed(Value),
    /// One cursor item; more may follow.
    Item(Value),
    /// The cursor finished without error.
    End,
    Failure(DispatchError),
}

impl Outcome {
    /// True for the last outcome of a run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Item(_))
    }
}

/// Resolve the handle for `collection` (or the database when `None`) and run
/// `operation` against it.
///
/// `on_outcome` sees zero or more `Item`s followed by exactly one terminal
/// outcome. A cursor stops at its first error.
pub async fn run<D, F>(
    cell: &Cell<D>,
    collection: Option<&str>,
    operation: &Operation<D>,
    args: Vec<Value>,
    mut on_outcome: F,
) where
    D: Driver,
    F: FnMut(Outcome),
{
    let start = Instant::now();
    let resource = match resolve(cell, collection).await {
        Ok(resource) => resource,
        Err(e) => {
            on_outcome(Outcome::Failure(e));
            return;
        }
    };

    match operation.invoke(resource, args).await {
        Ok(OperationOutput::Value(value)) => on_outcome(Outcome::Completed(value)),
        Ok(OperationOutput::Cursor(mut cursor)) => {
            let mut items = 0usize;
            while let Some(item) = cursor.next().await {
                match item {
                    Ok(value) => {
                        items += 1;
                        on_outcome(Outcome::Item(value));
                    }
                    Err(e) => {
                        on_outcome(Outcome::Failure(e));
                        return;
                    }
                }
            }
            debug!(operation = operation.name(), items, "Cursor exhausted");
            on_outcome(Outcome::End);
        }
        Err(e) => on_outcome(Outcome::Failure(e)),
    }

    debug!(
        backend = %cell.id(),
        operation = operation.name(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Operation finished"
    );
}

async fn resolve<D: Driver>(cell: &Cell<D>, collection: Option<&str>) -> DispatchResult<Resource<D>> {
    let client = cell.acquire().await?;
    let driver = cell.driver();
    let database = driver.database(&client, cell.database())?;
    match collection {
        Some(name) => Ok(Resource::Collection(driver.collection(&database, name)?)),
        None => Ok(Resource::Database(database)),
    }
}
