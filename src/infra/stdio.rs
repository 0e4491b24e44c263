//! Newline-delimited JSON transport between an external host and a worker.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::application::render::{RenderWorker, SpawnedWorker};

use super::error::InfraError;

/// Message counts for one bridge session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeSummary {
    pub requests: usize,
    /// Includes the readiness message.
    pub responses: usize,
}

/// Feed every non-blank line of `reader` to the worker and write each
/// response as one JSON line to `writer`.
///
/// Lines are handed over as raw bytes, so a line that is not UTF-8 still
/// gets its own failure response. Returns after `reader` reaches end of
/// input and the worker has answered everything it received. A read error
/// ends input early; responses already owed are still written before the
/// error is returned.
pub async fn serve_lines<R, W>(
    worker: RenderWorker,
    queue_capacity: usize,
    reader: R,
    writer: &mut W,
) -> Result<BridgeSummary, InfraError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let worker_id = worker.id();
    let SpawnedWorker {
        handle,
        mut responses,
        join,
    } = worker.spawn(queue_capacity);

    let read = async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut requests = 0usize;
        let mut failure = None;
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        target = "infra::stdio",
                        %worker_id,
                        error = %err,
                        "Failed to read host input; draining worker"
                    );
                    failure = Some(err);
                    break;
                }
            }

            let message = line.trim_ascii();
            if message.is_empty() {
                continue;
            }
            if handle.post_raw(message).await.is_err() {
                debug!(
                    target = "infra::stdio",
                    %worker_id,
                    "Worker stopped before input ended"
                );
                break;
            }
            requests += 1;
        }
        // Dropping the handle lets the worker drain and stop.
        drop(handle);
        (requests, failure)
    };

    // Owns the receiver so a failed write stops the worker instead of
    // leaving it blocked on a full outbox.
    let write = async move {
        let mut written = 0usize;
        while let Some(response) = responses.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
            written += 1;
        }
        Ok::<_, InfraError>(written)
    };

    let ((requests, failure), written) = tokio::join!(read, write);
    let responses = written?;
    join.await?;

    info!(
        target = "infra::stdio",
        %worker_id,
        requests,
        responses,
        "Stdio session finished"
    );

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(BridgeSummary {
            requests,
            responses,
        }),
    }
}
