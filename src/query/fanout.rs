use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use scopeguard::defer;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QuerySettings;
use crate::error::{VaultError, VaultResult};
use crate::query::registry::EndpointEntry;
use crate::store::{SeriesEndpoint, SeriesFrame, SeriesRequest};

/// The receiving end of one dispatched endpoint call. `ordinal` is the
/// position in dispatch order; the merge uses it as its last tie-break.
pub struct EndpointFeed {
    pub name: String,
    pub ordinal: usize,
    pub rx: mpsc::Receiver<VaultResult<SeriesFrame>>,
}

/// Drops endpoints whose advertisement rules them out for this request.
/// Advertisements are conservative, so this can only remove endpoints that
/// had nothing to contribute; it never removes a possible match.
pub fn prune(entries: Vec<EndpointEntry>, request: &SeriesRequest) -> Vec<EndpointEntry> {
    entries
        .into_iter()
        .filter(|entry| {
            let keep = entry.info.overlaps(request.min_time, request.max_time)
                && entry.info.could_serve(&request.matchers);
            if !keep {
                tracing::debug!(
                    "pruned endpoint {} for {}..{} with {}",
                    entry.name,
                    request.min_time,
                    request.max_time,
                    request.matchers
                );
            }
            keep
        })
        .collect()
}

/// Starts one `Series` call per endpoint, all concurrently, and returns the
/// feeds in dispatch order.
///
/// Each call runs on its own task and forwards frames into a bounded
/// channel, so a fast endpoint can never buffer more than `stream_buffer`
/// undelivered series. A shared semaphore caps how many calls make progress
/// at once. Every call gets the same sub-deadline: the per-endpoint timeout,
/// clamped so no call outlives the global deadline. A call that hits it
/// delivers `DeadlineExceeded` as its final frame; cancelling `cancel` makes
/// every task wind down and deliver `Cancelled`.
pub fn dispatch(
    entries: Vec<EndpointEntry>,
    request: &SeriesRequest,
    settings: &QuerySettings,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Vec<EndpointFeed> {
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_requests));
    let now = Instant::now();
    let call_timeout = settings
        .endpoint_timeout
        .min(deadline.saturating_duration_since(now));
    let call_deadline = now + call_timeout;

    entries
        .into_iter()
        .enumerate()
        .map(|(ordinal, entry)| {
            let (tx, rx) = mpsc::channel(settings.stream_buffer);
            tokio::spawn(run_call(
                entry.name.clone(),
                entry.endpoint,
                request.clone(),
                semaphore.clone(),
                call_deadline,
                call_timeout,
                cancel.clone(),
                tx,
            ));
            EndpointFeed {
                name: entry.name,
                ordinal,
                rx,
            }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    name: String,
    endpoint: Arc<dyn SeriesEndpoint>,
    request: SeriesRequest,
    semaphore: Arc<Semaphore>,
    call_deadline: Instant,
    call_timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<VaultResult<SeriesFrame>>,
) {
    let finished = name.clone();
    defer! {
        tracing::trace!("series call to {} finished", finished);
    }

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(VaultError::Cancelled),
        result = tokio::time::timeout_at(call_deadline, forward(&name, endpoint, request, semaphore, &tx)) => {
            match result {
                Ok(outcome) => outcome,
                Err(_) => Err(VaultError::DeadlineExceeded(name.clone(), call_timeout)),
            }
        }
    };

    if let Err(err) = outcome {
        // Receiver may be gone already; that call is over either way.
        let _ = tx.send(Err(err)).await;
    }
}

/// The body of one call: wait for a slot, open the stream, pump frames.
/// An `Err` frame from the endpoint ends the stream by contract, so it is
/// forwarded and the pump stops.
async fn forward(
    name: &str,
    endpoint: Arc<dyn SeriesEndpoint>,
    request: SeriesRequest,
    semaphore: Arc<Semaphore>,
    tx: &mpsc::Sender<VaultResult<SeriesFrame>>,
) -> VaultResult<()> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| VaultError::Cancelled)?;

    let mut stream = endpoint.series(request).await?;
    let mut frames = 0usize;
    while let Some(frame) = stream.next().await {
        let last = frame.is_err();
        if tx.send(frame).await.is_err() {
            tracing::trace!("receiver for {} went away", name);
            return Ok(());
        }
        if last {
            return Ok(());
        }
        frames += 1;
    }
    tracing::debug!("endpoint {} delivered {} frames", name, frames);
    Ok(())
}
