//! Stdio transport for the dispatcher.
//!
//! Each stdin line is one JSON request: a message plus a `backend` field
//! naming the endpoint to send it to. The field may be omitted when exactly
//! one backend is configured. Results go to stdout, one JSON object per line:
//!
//! ```json
//! {"channel":"success","backend":"orders","message":{"payload":[...]}}
//! ```

use crate::dispatch::{Dispatcher, Driver, Endpoint, EndpointOutputs, EndpointSettings};
use crate::error::{DispatchError, DispatchResult};
use crate::models::{BackendConfig, Message};
use crate::transport::Transport;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Success,
    Failure,
}

/// One stdout line.
#[derive(Debug, Serialize)]
pub struct OutputLine {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub message: Message,
}

/// Stdio transport implementation.
pub struct StdioTransport<D: Driver> {
    dispatcher: Arc<Dispatcher<D>>,
    backends: Vec<BackendConfig>,
    drain_timeout: Duration,
}

impl<D: Driver> StdioTransport<D> {
    pub fn new(
        dispatcher: Arc<Dispatcher<D>>,
        backends: Vec<BackendConfig>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            backends,
            drain_timeout,
        }
    }

    /// Open one endpoint per configured backend.
    fn open_endpoints(
        &self,
        out: &mpsc::UnboundedSender<OutputLine>,
    ) -> DispatchResult<Vec<(String, Arc<Endpoint<D>>)>> {
        let mut endpoints = Vec::with_capacity(self.backends.len());
        for config in &self.backends {
            let (endpoint, outputs) = self
                .dispatcher
                .open_endpoint(config, EndpointSettings::default())?;
            let name = config.id.name().to_string();
            forward_outputs(name.clone(), outputs, out.clone());
            endpoints.push((name, endpoint));
        }
        Ok(endpoints)
    }

    async fn drain(&self, endpoints: &[(String, Arc<Endpoint<D>>)]) {
        let idle = async {
            while !endpoints.iter().all(|(_, endpoint)| endpoint.cell().is_idle()) {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, idle).await.is_err() {
            warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain timed out with requests still in flight"
            );
        }
    }
}

impl<D: Driver> Transport for StdioTransport<D> {
    async fn run(&self) -> DispatchResult<()> {
        info!(backends = self.backends.len(), "Starting dispatcher with stdio transport");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(out_rx));
        let endpoints = self.open_endpoints(&out_tx)?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let shutdown_requested = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => route_line(&line, &endpoints, &out_tx),
                    Ok(None) => {
                        info!("Stdin closed");
                        break false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break false;
                    }
                },
                _ = wait_for_signal() => {
                    info!("Shutdown signal received (send again to force exit)");
                    break true;
                }
            }
        };

        if shutdown_requested {
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        self.drain(&endpoints).await;
        info!("Closing endpoints");
        for (_, endpoint) in &endpoints {
            info!(backend = %endpoint.backend(), stats = %endpoint.stats(), "Endpoint summary");
            endpoint.close().await;
        }
        drop(endpoints);
        drop(out_tx);

        // Late results of drained-out requests may still arrive; bound the wait
        if tokio::time::timeout(self.drain_timeout, writer).await.is_err() {
            warn!("Output writer did not finish in time");
        }

        if shutdown_requested {
            // tokio::select! cannot interrupt the blocking stdin read
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Parse one input line and hand it to its endpoint.
fn route_line<D: Driver>(
    line: &str,
    endpoints: &[(String, Arc<Endpoint<D>>)],
    out: &mpsc::UnboundedSender<OutputLine>,
) {
    if line.trim().is_empty() {
        return;
    }
    match parse_request(line) {
        Ok((backend, msg)) => {
            let target = match &backend {
                Some(name) => endpoints.iter().find(|(n, _)| n == name),
                None if endpoints.len() == 1 => endpoints.first(),
                None => None,
            };
            match target {
                Some((_, endpoint)) => endpoint.send(msg),
                None => {
                    let name = backend.unwrap_or_default();
                    let error = DispatchError::backend_not_found(name.clone());
                    warn!(backend = %name, "Request for unknown backend");
                    emit(out, Channel::Failure, Some(name), msg.with_error(error.to_string()));
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Rejected input line");
            emit(out, Channel::Failure, None, Message::default().with_error(e.to_string()));
        }
    }
}

/// Split a request line into its backend name and message.
pub fn parse_request(line: &str) -> DispatchResult<(Option<String>, Message)> {
    let mut value: Value = serde_json::from_str(line)
        .map_err(|e| DispatchError::invalid_input(format!("malformed JSON: {}", e)))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| DispatchError::invalid_input("request must be a JSON object"))?;
    let backend = match object.remove("backend") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name),
        Some(_) => return Err(DispatchError::invalid_input("backend must be a string")),
    };
    let msg: Message = serde_json::from_value(value)
        .map_err(|e| DispatchError::invalid_input(format!("invalid message: {}", e)))?;
    Ok((backend, msg))
}

fn forward_outputs(
    backend: String,
    outputs: EndpointOutputs,
    out: mpsc::UnboundedSender<OutputLine>,
) {
    let EndpointOutputs {
        mut success,
        mut failure,
    } = outputs;

    let success_out = out.clone();
    let success_backend = backend.clone();
    tokio::spawn(async move {
        while let Some(msg) = success.recv().await {
            emit(&success_out, Channel::Success, Some(success_backend.clone()), msg);
        }
    });
    tokio::spawn(async move {
        while let Some(msg) = failure.recv().await {
            emit(&out, Channel::Failure, Some(backend.clone()), msg);
        }
    });
}

fn emit(
    out: &mpsc::UnboundedSender<OutputLine>,
    channel: Channel,
    backend: Option<String>,
    message: Message,
) {
    if out
        .send(OutputLine {
            channel,
            backend,
            message,
        })
        .is_err()
    {
        debug!("Output writer gone, dropping result");
    }
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<OutputLine>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let mut encoded = match serde_json::to_vec(&line) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode output line");
                continue;
            }
        };
        encoded.push(b'\n');
        if let Err(e) = stdout.write_all(&encoded).await {
            warn!(error = %e, "Failed to write stdout, stopping output");
            return;
        }
        if let Err(e) = stdout.flush().await {
            warn!(error = %e, "Failed to flush stdout");
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
