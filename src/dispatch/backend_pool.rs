//! Shared connection cells keyed by backend identity.
//!
//! Every endpoint pointing at the same backend shares one [`Cell`]. The pool
//! counts consumers; the last `detach` closes the client and removes the entry.
//! A teardown that overlaps a fresh `attach` never removes the replacement:
//! a retiring cell is replaced on attach, and removal checks pointer identity.

use super::cell::Cell;
use super::driver::Driver;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{BackendConfig, BackendId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub struct BackendPool<D: Driver> {
    driver: Arc<D>,
    cells: Mutex<HashMap<BackendId, Arc<Cell<D>>>>,
}

impl<D: Driver> BackendPool<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Register one consumer of `config`'s backend and return its shared cell.
    ///
    /// Fails without touching the pool when the configuration has no target.
    /// Connecting is deferred to the first request.
    pub fn attach(&self, config: &BackendConfig) -> DispatchResult<Arc<Cell<D>>> {
        if !config.has_target() {
            return Err(DispatchError::configuration(format!(
                "missing connection target for backend {}",
                config.id
            )));
        }

        let mut cells = self.cells();
        let cell = match cells.get(&config.id) {
            Some(cell) if !cell.is_retiring() => Arc::clone(cell),
            existing => {
                if existing.is_some() {
                    debug!(backend = %config.id, "Replacing retiring connection cell");
                }
                let cell = Arc::new(Cell::new(config.clone(), Arc::clone(&self.driver)));
                cells.insert(config.id.clone(), Arc::clone(&cell));
                cell
            }
        };
        let consumers = cell.add_consumer();
        debug!(backend = %config.id, consumers, "Backend attached");
        Ok(cell)
    }

    /// Drop one consumer of `cell`. The last one closes and removes it.
    ///
    /// The last detach waits for operations still running on the cell before
    /// closing, so none of them can reconnect behind the close.
    pub async fn detach(&self, cell: &Arc<Cell<D>>) {
        let last = {
            let _cells = self.cells();
            let remaining = cell.remove_consumer();
            debug!(backend = %cell.id(), consumers = remaining, "Backend detached");
            remaining == 0 && !cell.mark_retiring()
        };
        if !last {
            return;
        }

        if !cell.is_idle() {
            debug!(
                backend = %cell.id(),
                in_flight = cell.in_flight(),
                "Waiting for running operations before closing"
            );
            cell.wait_idle().await;
        }
        cell.close().await;

        let mut cells = self.cells();
        if cells
            .get(cell.id())
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            cells.remove(cell.id());
            info!(backend = %cell.id(), "Backend removed");
        } else {
            debug!(
                backend = %cell.id(),
                "Entry already replaced by a newer cell, leaving it in place"
            );
        }
    }

    pub fn get(&self, id: &BackendId) -> Option<Arc<Cell<D>>> {
        self.cells().get(id).cloned()
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.cells().contains_key(id)
    }

    /// Registered backend identities, sorted.
    pub fn backend_ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.cells().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.cells().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells().is_empty()
    }

    /// Close every cell and clear the pool, regardless of consumers.
    pub async fn close_all(&self) {
        // Collect first so no lock is held across close()
        let drained: Vec<Arc<Cell<D>>> = {
            let mut cells = self.cells();
            cells.drain().map(|(_, cell)| cell).collect()
        };
        for cell in drained {
            cell.mark_retiring();
            cell.close().await;
        }
        info!("All backends closed");
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<BackendId, Arc<Cell<D>>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
