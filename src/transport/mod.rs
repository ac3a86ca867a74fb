//! Transport layer for the dispatcher.
//!
//! A transport feeds messages from outside the process into endpoints and
//! carries their results back out:
//! - Stdio: JSON lines on standard input/output

pub mod stdio;

pub use stdio::StdioTransport;

use crate::error::DispatchResult;
use std::future::Future;

/// Trait for dispatcher transport implementations.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = DispatchResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
