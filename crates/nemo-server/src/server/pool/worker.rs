use crate::server::{
    generator::{ContentGenerator, PreparedImage, resolve_image},
    pool::resources::ResourceMonitor,
    queue::RequestQueue,
    store::ResultStore,
    telemetry::{increment_generation_errors, record_generation_duration},
};
use core::time::Duration;
use nemo_core::{
    BasicResult, Error, ForwardedResult, Performance, RequestRecord, Result, Stage2Message,
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a Stage-1 worker needs, shared by the whole pool.
pub struct Stage1Shared {
    pub queue: Arc<RequestQueue>,
    pub store: Arc<ResultStore>,
    pub generator: Arc<dyn ContentGenerator>,
    /// Sending half of the cross-boundary queue.
    pub forward: mpsc::UnboundedSender<Stage2Message>,
    pub resources: ResourceMonitor,
    pub poll_interval: Duration,
    pub request_timeout: Option<Duration>,
    pub image_root: Option<PathBuf>,
}

/// Stage-1 worker task.
///
/// Polls the request queue with a bounded wait and checks `shutdown` between
/// attempts, so a stop request is observed within one poll interval of the
/// worker going idle. Each dequeued record produces exactly one
/// [`BasicResult`], success or error, which is written to the store *before*
/// it is forwarded to Stage 2.
///
/// # Arguments
///
/// - `worker_id`: 1-based index, rendered as `worker-{id}` in results and
///   logs.
/// - `shared`: Queue, store, generator and settings of the pool.
/// - `shutdown`: Cooperative stop signal.
pub async fn worker_loop(worker_id: usize, shared: Arc<Stage1Shared>, shutdown: CancellationToken) {
    let worker_name = format!("worker-{worker_id}");
    tracing::trace!("{worker_name} started");

    while !shutdown.is_cancelled() {
        let Some(record) = shared.queue.pop_timeout(shared.poll_interval).await else {
            continue;
        };

        tracing::debug!(id = %record.id, "{worker_name} picked up request");
        let result = handle_record(&worker_name, &shared, record).await;
        publish(&shared, result);
        shared.queue.task_done();
    }

    tracing::trace!("{worker_name} stopped");
}

async fn handle_record(worker_name: &str, shared: &Stage1Shared, record: RequestRecord) -> BasicResult {
    let before = shared.resources.sample();
    let outcome = generate(shared, &record).await;

    let (response, performance, error) = match outcome {
        Ok(text) => {
            let performance = shared.resources.measure_since(before);
            record_generation_duration(performance.time * 1000.0);
            (text, performance, false)
        }
        Err(e) => {
            tracing::warn!(id = %record.id, "{worker_name} failed request: {e}");
            increment_generation_errors();
            (format!("Error: {e}"), Performance::default(), true)
        }
    };

    BasicResult {
        id: record.id,
        prompt: record.prompt,
        response,
        worker_name: worker_name.to_string(),
        timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        has_image: record.image.is_some(),
        image_data: record.image,
        performance,
        error,
    }
}

async fn generate(shared: &Stage1Shared, record: &RequestRecord) -> Result<String> {
    let image = match &record.image {
        Some(raw) => Some(prepare_image(raw.clone(), shared.image_root.clone()).await?),
        None => None,
    };

    let call = shared.generator.generate(&record.prompt, image.as_ref());
    match shared.request_timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::GenerationTimeout {
                secs: limit.as_secs(),
            })?,
        None => call.await,
    }
}

async fn prepare_image(raw: String, image_root: Option<PathBuf>) -> Result<PreparedImage> {
    tokio::task::spawn_blocking(move || resolve_image(&raw, image_root.as_deref()))
        .await
        .map_err(|e| Error::InvalidImage {
            reason: format!("decoding was aborted: {e}"),
        })?
}

/// Stores the result, then forwards it across the boundary.
fn publish(shared: &Stage1Shared, result: BasicResult) {
    let id = result.id.clone();
    let forwarded = Stage2Message::Work(ForwardedResult::from(&result));

    shared.store.insert(result);

    if let Err(e) = shared.forward.send(forwarded) {
        tracing::error!(%id, "Failed to forward result to Stage 2: {e}");
    }
}
