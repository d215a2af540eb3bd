//! Transport Manager
//!
//! Owns the framed stream and the handler registry. Pulls envelopes off the
//! input in stream order and dispatches each one on its own task, so reading
//! continues while handlers run. Responses go back through the shared writer.

use crate::error::RpcError;
use crate::framer::{FramedReader, FramedWriter};
use crate::handler::{HandlerRegistry, MethodHandler};
use crate::types::{Message, MessageKind};
use flowline_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Grace period for in-flight handlers once the loop ends (5 seconds)
pub const HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for flushing and closing the writer on stop (5 seconds)
pub const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Aborts the handler task if its dispatch task is dropped
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Dispatch loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Reading,
    Dispatching,
    Stopped,
}

/// Requests a running transport to stop
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Signal the dispatch loop to stop; unblocks a pending read
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

pub struct TransportManager<R, W> {
    reader: FramedReader<R>,
    writer: FramedWriter<W>,
    registry: HandlerRegistry,
    state: Arc<watch::Sender<TransportState>>,
    stop: StopHandle,
}

impl TransportManager<tokio::io::Stdin, tokio::io::Stdout> {
    /// Transport over the process's stdin/stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> TransportManager<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        let (state, _) = watch::channel(TransportState::Idle);
        let (stop, _) = watch::channel(false);

        Self {
            reader: FramedReader::new(reader),
            writer: FramedWriter::new(writer),
            registry: HandlerRegistry::new(),
            state: Arc::new(state),
            stop: StopHandle { tx: Arc::new(stop) },
        }
    }

    /// Register a handler for `method`, replacing any previous one
    pub fn register_handler(&self, method: impl Into<String>, handler: impl MethodHandler) {
        self.registry.register(method, handler);
    }

    pub fn registry(&self) -> HandlerRegistry {
        self.registry.clone()
    }

    /// Handle for originating requests and notifications
    pub fn writer(&self) -> FramedWriter<W> {
        self.writer.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    /// Run the dispatch loop until the stream closes or stop is requested
    ///
    /// In-flight handlers get `HANDLER_DRAIN_TIMEOUT` to finish and are
    /// aborted after that. The writer is flushed and closed before
    /// returning. Only stream I/O failures are returned as errors.
    pub async fn run(mut self) -> Result<()> {
        info!(methods = ?self.registry.methods(), "Starting transport");

        let mut stop = self.stop.tx.subscribe();
        let mut in_flight = JoinSet::new();

        let outcome = loop {
            if *stop.borrow_and_update() {
                info!("Stop requested");
                break Ok(());
            }
            self.set_state(TransportState::Reading);

            let next = tokio::select! {
                biased;
                _ = stop.changed() => continue,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Dispatch task failed");
                    }
                    continue;
                }
                next = self.reader.next_message() => next,
            };

            match next {
                Ok(Some(message)) => {
                    self.set_state(TransportState::Dispatching);
                    in_flight.spawn(dispatch(
                        self.registry.clone(),
                        self.writer.clone(),
                        message,
                    ));
                    self.set_state(TransportState::Idle);
                }
                Ok(None) => {
                    info!("Input stream closed");
                    break Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Transport read failed");
                    break Err(e);
                }
            }
        };

        let drained = tokio::time::timeout(HANDLER_DRAIN_TIMEOUT, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Dispatch task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Handlers still running after {:?}, aborting", HANDLER_DRAIN_TIMEOUT
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to close writer"),
            Err(_) => warn!("Timed out closing writer"),
        }

        self.stop.stop();
        self.set_state(TransportState::Stopped);
        info!("Transport stopped");
        outcome
    }
}

/// Route one inbound envelope and write back its response, if any
///
/// Notifications never get a response. Handler panics are contained in the
/// handler's own task and reported as internal errors.
pub async fn dispatch<W>(registry: HandlerRegistry, writer: FramedWriter<W>, message: Message)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let kind = message.kind();
    let Message {
        id, method, params, ..
    } = message;

    let Some(method) = method else {
        match kind {
            MessageKind::Response => debug!(id = ?id, "Ignoring response envelope"),
            _ => warn!("Dropping envelope with neither method nor id"),
        }
        return;
    };

    let reply = match registry.get(&method) {
        Some(handler) => {
            let params = params.unwrap_or_default();
            let task = tokio::spawn(async move { handler.call(params).await });
            let _abort = AbortOnDrop(task.abort_handle());
            match task.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => {
                    error!(method = %method, error = %err, "Error handling request");
                    Err(err)
                }
                Err(join_err) => {
                    error!(method = %method, error = %join_err, "Handler panicked");
                    Err(RpcError::internal(format!(
                        "Handler for {} failed: {}",
                        method, join_err
                    )))
                }
            }
        }
        None => {
            warn!(method = %method, id = ?id, "Method not found");
            Err(RpcError::method_not_found(&method))
        }
    };

    let Some(id) = id else {
        return;
    };

    let response = match reply {
        Ok(value) => Message::response(id, value),
        Err(err) => Message::error_response(id, err),
    };
    if let Err(e) = writer.write_message(&response).await {
        error!(id = id, error = %e, "Failed to write response");
    }
}
