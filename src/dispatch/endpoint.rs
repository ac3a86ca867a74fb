//! Endpoints and the dispatcher that owns them.
//!
//! An [`Endpoint`] is one requester bound to one backend. Messages sent to it
//! are admitted against the backend's parallelism limit, run on their own task,
//! and their results delivered on the endpoint's success or failure channel.
//! When a run finishes, its slot goes to the oldest waiting message on the
//! same backend, whichever endpoint sent it.

use super::backend_pool::BackendPool;
use super::cell::Cell;
use super::driver::Driver;
use super::queue::{Admission, Release};
use super::registry::{OperationRegistry, Scope};
use super::runner::{self, Outcome};
use crate::error::{DispatchError, DispatchResult};
use crate::models::{BackendConfig, BackendId, Message, normalize_result};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId(Uuid);

impl RequesterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequesterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed routing for an endpoint. Set values win over per-message hints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointSettings {
    pub operation: Option<String>,
    pub collection: Option<String>,
}

impl EndpointSettings {
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

/// Receiving halves of an endpoint's result channels.
#[derive(Debug)]
pub struct EndpointOutputs {
    pub success: mpsc::UnboundedReceiver<Message>,
    pub failure: mpsc::UnboundedReceiver<Message>,
}

#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub success: u64,
    pub error: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, success: {}, error: {}",
            self.requests, self.success, self.error
        )
    }
}

/// Owns the backend pool, the operation table, and the live endpoints.
pub struct Dispatcher<D: Driver> {
    pool: BackendPool<D>,
    registry: OperationRegistry<D>,
    requesters: RwLock<HashMap<RequesterId, Weak<Endpoint<D>>>>,
}

impl<D: Driver> Dispatcher<D> {
    pub fn new(driver: Arc<D>, registry: OperationRegistry<D>) -> Arc<Self> {
        Arc::new(Self {
            pool: BackendPool::new(driver),
            registry,
            requesters: RwLock::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &BackendPool<D> {
        &self.pool
    }

    pub fn registry(&self) -> &OperationRegistry<D> {
        &self.registry
    }

    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.pool.backend_ids()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Create an endpoint bound to `config`'s backend.
    ///
    /// Fails when the backend configuration has no connection target; no
    /// pool entry is created in that case.
    pub fn open_endpoint(
        self: &Arc<Self>,
        config: &BackendConfig,
        settings: EndpointSettings,
    ) -> DispatchResult<(Arc<Endpoint<D>>, EndpointOutputs)> {
        let cell = self.pool.attach(config)?;
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Endpoint {
            id: RequesterId::new(),
            settings,
            cell,
            dispatcher: Arc::clone(self),
            success: success_tx,
            failure: failure_tx,
            stats: Stats::default(),
            closed: AtomicBool::new(false),
        });

        self.requesters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.id, Arc::downgrade(&endpoint));

        info!(
            requester = %endpoint.id,
            backend = %config.id,
            operation = ?endpoint.settings.operation,
            collection = ?endpoint.settings.collection,
            "Endpoint opened"
        );

        Ok((
            endpoint,
            EndpointOutputs {
                success: success_rx,
                failure: failure_rx,
            },
        ))
    }

    /// Live endpoint for `id`, or `None` once it was closed or dropped.
    pub fn endpoint(&self, id: &RequesterId) -> Option<Arc<Endpoint<D>>> {
        self.requesters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|endpoint| !endpoint.is_closed())
    }

    pub fn endpoint_count(&self) -> usize {
        self.requesters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn unregister(&self, id: &RequesterId) {
        self.requesters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

pub struct Endpoint<D: Driver> {
    id: RequesterId,
    settings: EndpointSettings,
    cell: Arc<Cell<D>>,
    dispatcher: Arc<Dispatcher<D>>,
    success: mpsc::UnboundedSender<Message>,
    failure: mpsc::UnboundedSender<Message>,
    stats: Stats,
    closed: AtomicBool,
}

impl<D: Driver> Endpoint<D> {
    pub fn id(&self) -> RequesterId {
        self.id
    }

    pub fn backend(&self) -> &BackendId {
        self.cell.id()
    }

    pub fn cell(&self) -> &Arc<Cell<D>> {
        &self.cell
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit a message. Must be called from within a tokio runtime.
    ///
    /// The message runs immediately when the backend has a free slot and
    /// waits in the backend's backlog otherwise.
    pub fn send(self: &Arc<Self>, msg: Message) {
        if self.is_closed() {
            self.emit_failure(&msg, &DispatchError::internal("endpoint is closed"));
            return;
        }
        match self.cell.admit(self.id, msg) {
            Admission::Admitted(msg) => self.dispatch(msg),
            Admission::Queued => debug!(
                requester = %self.id,
                backend = %self.cell.id(),
                backlog = self.cell.backlog_len(),
                "Request queued"
            ),
        }
    }

    /// Stop accepting messages and release the backend.
    ///
    /// Messages of this endpoint still waiting in the backlog are skipped;
    /// messages already running finish normally. When this is the backend's
    /// last endpoint, the call returns once those have finished and the
    /// connection is closed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.unregister(&self.id);
        self.dispatcher.pool.detach(&self.cell).await;
        info!(requester = %self.id, backend = %self.cell.id(), stats = %self.stats(), "Endpoint closed");
    }

    /// Run `msg` on a new task holding an already charged slot.
    ///
    /// A panicking operation is reported on the failure channel and its slot
    /// is released like any other.
    fn dispatch(self: &Arc<Self>, msg: Message) {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let mut reply = msg.clone();
            reply.take_routing();
            if AssertUnwindSafe(endpoint.process(msg))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(requester = %endpoint.id, backend = %endpoint.cell.id(), "Operation panicked");
                endpoint.fail(&reply, DispatchError::internal("operation panicked"));
            }
            debug!(requester = %endpoint.id, stats = %endpoint.stats(), "Request completed");
            endpoint.complete();
        });
    }

    /// Give back the slot, or pass it on to the next waiting message.
    fn complete(&self) {
        let dispatcher = &self.dispatcher;
        match self.cell.release(|id| dispatcher.endpoint(id)) {
            Release::Handoff { requester, payload } => {
                debug!(
                    from = %self.id,
                    to = %requester.id,
                    backend = %self.cell.id(),
                    "Handing slot to queued request"
                );
                requester.dispatch(payload);
            }
            Release::Freed | Release::Underflow => {}
        }
    }

    async fn process(&self, mut msg: Message) {
        let (msg_collection, msg_operation) = msg.take_routing();
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let Some(name) = self.settings.operation.clone().or(msg_operation) else {
            self.fail(&msg, DispatchError::NoOperation);
            return;
        };
        let Some(operation) = self.dispatcher.registry.get(&name) else {
            self.fail(&msg, DispatchError::unknown_operation(name));
            return;
        };

        let collection = match operation.scope() {
            Scope::Database => None,
            Scope::Collection => match self.settings.collection.clone().or(msg_collection) {
                Some(collection) => Some(collection),
                None => {
                    self.fail(&msg, DispatchError::NoCollection);
                    return;
                }
            },
        };

        let args = operation.arguments(&msg);
        debug!(
            requester = %self.id,
            backend = %self.cell.id(),
            operation = %name,
            collection = ?collection,
            args = args.len(),
            "Running operation"
        );

        runner::run(&self.cell, collection.as_deref(), operation, args, |outcome| {
            self.deliver(&msg, outcome)
        })
        .await;
    }

    fn deliver(&self, msg: &Message, outcome: Outcome) {
        match outcome {
            Outcome::Completed(value) => {
                self.stats.success.fetch_add(1, Ordering::Relaxed);
                self.emit_success(msg.with_payload(normalize_result(value)));
            }
            Outcome::Item(value) => {
                self.emit_success(msg.with_payload(normalize_result(value)));
            }
            Outcome::End => {
                self.stats.success.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure(e) => self.fail(msg, e),
        }
    }

    fn fail(&self, msg: &Message, error: DispatchError) {
        self.stats.error.fetch_add(1, Ordering::Relaxed);
        warn!(
            requester = %self.id,
            backend = %self.cell.id(),
            error = %error,
            "Operation failed"
        );
        self.emit_failure(msg, &error);
    }

    fn emit_success(&self, msg: Message) {
        if self.success.send(msg).is_err() {
            debug!(requester = %self.id, "Success receiver dropped");
        }
    }

    fn emit_failure(&self, msg: &Message, error: &DispatchError) {
        if self.failure.send(msg.with_error(error.to_string())).is_err() {
            debug!(requester = %self.id, "Failure receiver dropped");
        }
    }
}

impl<D: Driver> std::fmt::Debug for Endpoint<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("backend", self.cell.id())
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
