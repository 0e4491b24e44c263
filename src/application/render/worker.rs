use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use platelet_worker_protocol::{RenderRequest, RenderResponse};

use super::capability::{CapabilityState, RenderCapabilityCell};
use super::types::{CapabilityLoader, LoadError, RenderFailure};

const METRIC_REQUESTS: &str = "platelet_worker_requests_total";
const METRIC_FAILURES: &str = "platelet_worker_failures_total";
const METRIC_RENDER_MS: &str = "platelet_worker_render_ms";

/// Everything that can go wrong between receiving a request and producing
/// its response. Rendered to text for the failure response.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to serialize files: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Render(#[from] RenderFailure),
    #[error("renderer panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    InvalidRequest(String),
}

impl WorkerError {
    fn kind(&self) -> &'static str {
        match self {
            WorkerError::Load(_) => "load",
            WorkerError::Serialize(_) => "serialize",
            WorkerError::Render(_) => "render",
            WorkerError::Panicked(_) => "panic",
            WorkerError::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("render worker has stopped")]
pub struct WorkerClosed;

/// Inbound message as seen by the worker loop.
#[derive(Debug)]
enum Inbound {
    Request(RenderRequest),
    Malformed(String),
}

/// Bridges render requests to the rendering capability, one at a time.
#[derive(Debug)]
pub struct RenderWorker {
    id: Uuid,
    capability: RenderCapabilityCell,
}

impl RenderWorker {
    pub fn new(loader: Arc<dyn CapabilityLoader>) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability: RenderCapabilityCell::new(loader),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capability_state(&self) -> CapabilityState {
        self.capability.state()
    }

    /// Render a single request. Never fails: every error, including a panic
    /// inside the capability, becomes a failure response.
    pub async fn handle(&self, request: RenderRequest) -> RenderResponse {
        let started_at = Instant::now();
        counter!(METRIC_REQUESTS).increment(1);

        let outcome = match AssertUnwindSafe(self.render(&request))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => Err(WorkerError::Panicked(panic_message(payload.as_ref()))),
        };

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!(METRIC_RENDER_MS).record(elapsed_ms as f64);

        match outcome {
            Ok(result) => {
                debug!(
                    target = "application::render::worker",
                    op = "worker::handle",
                    worker_id = %self.id,
                    root = %request.root,
                    result = "ok",
                    elapsed_ms,
                    output_bytes = result.len(),
                    "Render completed"
                );
                RenderResponse::success(result)
            }
            Err(err) => self.fail(&request.root, err, elapsed_ms),
        }
    }

    async fn render(&self, request: &RenderRequest) -> Result<String, WorkerError> {
        let capability = self.capability.get().await?;
        let files = serde_json::to_string(&request.files)?;
        let result = capability
            .render(&request.root, &files, &request.json)
            .await?;
        Ok(result)
    }

    fn fail(&self, root: &str, err: WorkerError, elapsed_ms: u64) -> RenderResponse {
        counter!(METRIC_FAILURES, "kind" => err.kind()).increment(1);
        warn!(
            target = "application::render::worker",
            op = "worker::handle",
            worker_id = %self.id,
            root = %root,
            result = "error",
            error_code = err.kind(),
            elapsed_ms,
            error = %err,
            "Render failed"
        );
        RenderResponse::failure(err.to_string())
    }

    /// Run the worker on its own task.
    ///
    /// The readiness message is the first thing sent on the response
    /// channel. Requests are answered in arrival order. The task ends once
    /// every [`WorkerHandle`] is dropped and the queue is drained, or once
    /// the response receiver is dropped.
    pub fn spawn(self, queue_capacity: usize) -> SpawnedWorker {
        let (inbox_tx, inbox_rx) = mpsc::channel(queue_capacity.max(1));
        let (outbox_tx, outbox_rx) = mpsc::channel(queue_capacity.max(1));
        let join = tokio::spawn(self.run(inbox_rx, outbox_tx));

        SpawnedWorker {
            handle: WorkerHandle { inbox: inbox_tx },
            responses: outbox_rx,
            join,
        }
    }

    async fn run(self, mut inbox: mpsc::Receiver<Inbound>, outbox: mpsc::Sender<RenderResponse>) {
        info!(
            target = "application::render::worker",
            worker_id = %self.id,
            "Render worker started"
        );

        if outbox.send(RenderResponse::ready()).await.is_err() {
            return;
        }

        let mut handled: u64 = 0;
        while let Some(message) = inbox.recv().await {
            let response = match message {
                Inbound::Request(request) => self.handle(request).await,
                Inbound::Malformed(reason) => {
                    counter!(METRIC_REQUESTS).increment(1);
                    self.fail("", WorkerError::InvalidRequest(reason), 0)
                }
            };
            handled += 1;

            if outbox.send(response).await.is_err() {
                debug!(
                    target = "application::render::worker",
                    worker_id = %self.id,
                    "Response receiver dropped; stopping"
                );
                break;
            }
        }

        info!(
            target = "application::render::worker",
            worker_id = %self.id,
            handled,
            "Render worker stopped"
        );
    }
}

/// Sending side of a spawned worker. Cloning yields another producer for
/// the same queue.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inbox: mpsc::Sender<Inbound>,
}

impl WorkerHandle {
    pub async fn post(&self, request: RenderRequest) -> Result<(), WorkerClosed> {
        self.inbox
            .send(Inbound::Request(request))
            .await
            .map_err(|_| WorkerClosed)
    }

    /// Post a raw JSON message. Bytes that do not decode as a request,
    /// including invalid UTF-8, are still queued and answered, in order,
    /// with a failure response.
    pub async fn post_raw(&self, data: impl AsRef<[u8]>) -> Result<(), WorkerClosed> {
        let message = match serde_json::from_slice::<RenderRequest>(data.as_ref()) {
            Ok(request) => Inbound::Request(request),
            Err(err) => Inbound::Malformed(format!("invalid render request: {err}")),
        };
        self.inbox.send(message).await.map_err(|_| WorkerClosed)
    }
}

/// A running worker: its handle, its response stream, and its task.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub handle: WorkerHandle,
    pub responses: mpsc::Receiver<RenderResponse>,
    pub join: JoinHandle<()>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
