//! Bounded-concurrency request dispatch.
//!
//! - `queue`: per-backend slot accounting and FIFO backlog
//! - `cell`: lazily connected client shared by every endpoint of a backend
//! - `backend_pool`: identity → cell map with consumer counting
//! - `driver`: the seam to a concrete database client
//! - `registry`: named operations
//! - `runner`: executes one operation and reports outcomes
//! - `endpoint`: requesters, result channels, and the dispatcher

pub mod backend_pool;
pub mod cell;
pub mod driver;
pub mod endpoint;
pub mod queue;
pub mod registry;
pub mod runner;

pub use backend_pool::BackendPool;
pub use cell::Cell;
pub use driver::{Driver, OperationOutput, Resource};
pub use endpoint::{
    Dispatcher, Endpoint, EndpointOutputs, EndpointSettings, RequesterId, Stats, StatsSnapshot,
};
pub use queue::{Admission, DispatchQueue, Release};
pub use registry::{Operation, OperationFuture, OperationRegistry, Scope};
pub use runner::Outcome;
