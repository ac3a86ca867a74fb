//! Connection cell: one lazily connected client per backend identity.
//!
//! A cell owns the client handle, the admission queue, and the consumer count
//! for one backend. Connecting is single-flight: the first `acquire` connects
//! while concurrent callers wait on the same lock and then share the result.
//! A failed connect leaves the cell empty so the next request retries.
//! Once closed, a cell never connects again.

use super::driver::Driver;
use super::endpoint::RequesterId;
use super::queue::{Admission, DispatchQueue, Release};
use crate::error::{DispatchError, DispatchResult};
use crate::models::{BackendConfig, BackendId, Message};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

pub struct Cell<D: Driver> {
    config: BackendConfig,
    driver: Arc<D>,
    client: AsyncMutex<Option<D::Client>>,
    consumers: AtomicUsize,
    retiring: AtomicBool,
    /// Set under the client lock by `close`.
    closed: AtomicBool,
    queue: Mutex<DispatchQueue<RequesterId, Message>>,
    idle: Notify,
}

impl<D: Driver> Cell<D> {
    pub fn new(config: BackendConfig, driver: Arc<D>) -> Self {
        let limit = config.parallelism as usize;
        Self {
            config,
            driver,
            client: AsyncMutex::new(None),
            consumers: AtomicUsize::new(0),
            retiring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queue: Mutex::new(DispatchQueue::new(limit)),
            idle: Notify::new(),
        }
    }

    pub fn id(&self) -> &BackendId {
        &self.config.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Database name every request on this cell resolves against.
    pub fn database(&self) -> &str {
        &self.config.database
    }

    /// Client handle, connecting first if needed. Fails once the cell is closed.
    pub async fn acquire(&self) -> DispatchResult<D::Client> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            warn!(backend = %self.config.id, "Refusing to reconnect a closed backend");
            return Err(DispatchError::connection(
                format!("backend {} is closed", self.config.id),
                "Open a new endpoint for this backend",
            ));
        }

        info!(
            backend = %self.config.id,
            target = %self.config.masked_connection_string(),
            "Connecting to backend"
        );
        match self.driver.connect(&self.config).await {
            Ok(client) => {
                *slot = Some(client.clone());
                info!(backend = %self.config.id, "Connected successfully");
                Ok(client)
            }
            Err(e) => {
                warn!(backend = %self.config.id, error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    /// True once a client has been established and not yet closed.
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Close the client if one exists. Close errors are logged, never returned.
    pub async fn close(&self) {
        let client = {
            let mut slot = self.client.lock().await;
            self.closed.store(true, Ordering::Release);
            slot.take()
        };
        let Some(client) = client else {
            debug!(backend = %self.config.id, "No client to close");
            return;
        };
        match self.driver.close(client).await {
            Ok(()) => info!(backend = %self.config.id, "Connection closed"),
            Err(e) => warn!(backend = %self.config.id, error = %e, "Error while closing connection"),
        }
    }

    pub fn admit(&self, requester: RequesterId, msg: Message) -> Admission<Message> {
        self.queue().admit(requester, msg)
    }

    pub fn release<H>(&self, resolve: impl FnMut(&RequesterId) -> Option<H>) -> Release<H, Message> {
        let (release, idle) = {
            let mut queue = self.queue();
            let release = queue.release(resolve);
            (release, queue.is_idle())
        };
        if idle {
            self.idle.notify_waiters();
        }
        release
    }

    /// Wait until nothing is running or waiting on this cell.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.queue().in_flight()
    }

    pub fn backlog_len(&self) -> usize {
        self.queue().backlog_len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue().is_idle()
    }

    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Consumer counts change only under the pool map lock. `mark_retiring` is
    // also called by `close_all` after the map was drained, when no attach can
    // reach the cell any more.

    pub(crate) fn add_consumer(&self) -> usize {
        self.consumers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturating decrement; returns the remaining count.
    pub(crate) fn remove_consumer(&self) -> usize {
        let result = self
            .consumers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(previous) => previous - 1,
            Err(_) => {
                warn!(
                    backend = %self.config.id,
                    "Attempted to remove consumer with count already at 0"
                );
                0
            }
        }
    }

    /// Mark the cell as being torn down. Returns true if it already was.
    pub(crate) fn mark_retiring(&self) -> bool {
        self.retiring.swap(true, Ordering::AcqRel)
    }

    fn queue(&self) -> MutexGuard<'_, DispatchQueue<RequesterId, Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: Driver> std::fmt::Debug for Cell<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.config.id)
            .field("consumers", &self.consumers.load(Ordering::Relaxed))
            .field("retiring", &self.retiring.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
