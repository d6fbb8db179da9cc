//! The two-stage generation pipeline.
//!
//! [`Pipeline`] owns every moving part: the request queue, the result store,
//! both worker pools, the cross-boundary queue between them and the output
//! channel of Stage 2. The HTTP layer holds it as `Arc<Pipeline>`.
//!
//! ```text
//! submit ──► RequestQueue ──► Stage 1 ──► ResultStore
//!                                 │            ▲
//!                                 ▼            │ reconcile (on every read)
//!                      cross-boundary queue    │
//!                                 │            │
//!                                 ▼            │
//!                             Stage 2 ──► processed output
//! ```
//!
//! ## Invariants
//!
//! - An id present in the store was fully generated; an absent id is queued
//!   or in flight.
//! - Stage 1 stores a result before forwarding it, so a processed result
//!   never precedes its basic result.
//! - Processed output is drained at most once, and only by
//!   [`Pipeline::reconcile`], which persists every drained overlay in the
//!   store.

use crate::server::{
    config::PipelineConfig,
    generator::ContentGenerator,
    isolation::{Stage2Pool, WorkerSpawner},
    pool::{ResourceMonitor, Stage1Pool, Stage1Shared},
    queue::RequestQueue,
    store::ResultStore,
    telemetry::{increment_rejected, increment_requests, increment_results_processed},
};
use core::time::Duration;
use nemo_core::{
    Error, ProcessedResult, RequestIdGenerator, RequestRecord, ResponseView, Result, StatusView,
    WAITING_FOR_PROCESS,
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct Pipeline {
    ids: RequestIdGenerator,
    queue: Arc<RequestQueue>,
    store: Arc<ResultStore>,
    stage1: Stage1Pool,
    stage2: Stage2Pool,
    processed: Mutex<mpsc::UnboundedReceiver<ProcessedResult>>,
    /// Set once Stage 1 has stopped and unfinished work was abandoned.
    drained: AtomicBool,
}

impl Pipeline {
    /// Creates the queues and starts both worker pools.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &PipelineConfig,
        generator: Arc<dyn ContentGenerator>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        let queue = Arc::new(RequestQueue::new(config.queue_capacity));
        let store = Arc::new(ResultStore::new());
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (processed_tx, processed_rx) = mpsc::unbounded_channel();

        tracing::info!(
            generator = generator.name(),
            "Starting pipeline ({} Stage-1 workers, {} Stage-2 workers)",
            config.num_threads,
            config.num_processes
        );

        let stage1 = Stage1Pool::spawn(
            Arc::new(Stage1Shared {
                queue: Arc::clone(&queue),
                store: Arc::clone(&store),
                generator,
                forward: forward_tx.clone(),
                resources: ResourceMonitor::new(),
                poll_interval: config.poll_interval,
                request_timeout: config.request_timeout,
                image_root: config.image_root.clone(),
            }),
            config.num_threads,
            config.shutdown_timeout,
        );

        let stage2 = Stage2Pool::spawn(
            spawner,
            config.num_processes,
            forward_tx,
            forward_rx,
            processed_tx,
            config.poll_interval,
            config.shutdown_timeout,
        );

        Self {
            ids: RequestIdGenerator::new(),
            queue,
            store,
            stage1,
            stage2,
            processed: Mutex::new(processed_rx),
            drained: AtomicBool::new(false),
        }
    }

    /// Accepts a prompt for asynchronous processing and returns its id.
    ///
    /// A fresh time-ordered id is generated unless `id` is supplied. Never
    /// blocks on the workers; a malformed image is only detected by Stage 1.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if the prompt is empty or whitespace.
    /// - [`Error::ServiceShutdown`] once [`Pipeline::shutdown`] has begun.
    /// - [`Error::QueueFull`] if the queue is bounded and full.
    pub fn submit(&self, prompt: &str, image: Option<String>, id: Option<String>) -> Result<String> {
        let prompt = validate_prompt(prompt)?;
        let record = RequestRecord {
            id: match id {
                Some(id) => id,
                None => self.ids.next_id()?,
            },
            prompt: prompt.to_string(),
            image: image.filter(|raw| !raw.trim().is_empty()),
        };
        let id = record.id.clone();

        self.enqueue(record)?;
        increment_requests(1);
        tracing::debug!(%id, "Accepted request");
        Ok(id)
    }

    /// Submits several text-only prompts, returning their ids in order.
    ///
    /// All prompts are validated before any is enqueued.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::submit`]; [`Error::InvalidRequest`] if the batch is
    /// empty. A capacity error part-way through leaves the earlier prompts
    /// queued.
    pub fn submit_batch(&self, prompts: &[String]) -> Result<Vec<String>> {
        if prompts.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "Prompts must be a non-empty list".to_string(),
            });
        }
        for prompt in prompts {
            validate_prompt(prompt)?;
        }

        prompts
            .iter()
            .map(|prompt| self.submit(prompt, None, None))
            .collect()
    }

    fn enqueue(&self, record: RequestRecord) -> Result<()> {
        if self.is_stopping() {
            increment_rejected();
            return Err(Error::ServiceShutdown);
        }
        self.queue.push(record).inspect_err(|e| {
            increment_rejected();
            tracing::warn!("Refused request: {e}");
        })
    }

    /// Reports the state of one request.
    pub fn status(&self, id: &str) -> StatusView {
        self.reconcile();

        match self.store.get(id) {
            Some(view) => StatusView::Completed {
                processing_status: (!view.is_processed()).then_some(WAITING_FOR_PROCESS),
                data: view.merged(),
            },
            None => StatusView::Processing {
                queue_size: self.queue.len(),
            },
        }
    }

    /// Every completed result in submission order, merged with its Stage-2
    /// output where available.
    pub fn list(&self) -> Vec<ResponseView> {
        self.reconcile();
        self.store.all().iter().map(|view| view.merged()).collect()
    }

    /// Drops every stored result. Requests still in flight will reappear
    /// when they complete.
    pub fn clear(&self) {
        self.store.clear();
        tracing::info!("Cleared all stored results");
    }

    /// Drains Stage-2 output and persists each overlay in the store.
    ///
    /// Returns how many results were applied. Output for ids no longer in the
    /// store (cleared meanwhile) is discarded.
    pub fn reconcile(&self) -> usize {
        let drained = self.drain_processed();
        if drained.is_empty() {
            return 0;
        }

        let total = drained.len();
        let applied = drained
            .into_iter()
            .filter(|processed| self.store.apply_processed(processed.clone()))
            .count();

        if applied < total {
            tracing::debug!("Discarded {} processed results for unknown ids", total - applied);
        }
        increment_results_processed(applied as u64);
        applied
    }

    /// Removes and returns everything Stage 2 has produced so far without
    /// waiting. A second call with no new output returns an empty list.
    ///
    /// Results taken here are gone from the pipeline; read paths go through
    /// [`Pipeline::reconcile`] instead.
    pub fn drain_processed(&self) -> Vec<ProcessedResult> {
        let mut rx = self.processed.lock();
        let mut drained = Vec::new();
        while let Ok(processed) = rx.try_recv() {
            drained.push(processed);
        }
        drained
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn result_count(&self) -> usize {
        self.store.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stage1.is_stopping() || self.stage2.is_stopping()
    }

    /// Resolves once the request queue is empty and no Stage-1 worker is
    /// mid-request. Stage-2 output may still be pending.
    ///
    /// Also resolves once [`Pipeline::shutdown`] has stopped Stage 1; requests
    /// left queued or in flight at that point are never answered.
    pub async fn wait_idle(&self) {
        while self.queue.unfinished() > 0 && !self.drained.load(Ordering::Acquire) {
            tokio::time::sleep(IDLE_CHECK_INTERVAL).await;
        }
    }

    /// Stops both pools.
    ///
    /// New submissions are refused immediately. Stage 1 is joined first so
    /// everything it forwarded precedes the stop tokens, then Stage 2 is
    /// stopped, killing workers that outlive the grace period.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down pipeline");
        self.stage1.shutdown().await;
        let abandoned = self.queue.abandon();
        self.drained.store(true, Ordering::Release);
        self.stage2.shutdown().await;
        tracing::info!("Pipeline stopped ({abandoned} queued requests abandoned)");
    }
}

fn validate_prompt(prompt: &str) -> Result<&str> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(Error::InvalidRequest {
            reason: "Prompt is required".to_string(),
        });
    }
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{generator::PreparedImage, isolation::TaskSpawner};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct Scripted;

    #[async_trait]
    impl ContentGenerator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _image: Option<&PreparedImage>) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            match prompt {
                "hello" => Ok("hi there".to_string()),
                "hang" => futures::future::pending().await,
                "explode" => Err(Error::Generation {
                    message: "upstream unavailable".to_string(),
                }),
                other => Ok(format!("answer to {other}")),
            }
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            num_threads: 3,
            num_processes: 2,
            poll_interval: Duration::from_millis(20),
            request_timeout: Some(Duration::from_secs(2)),
            queue_capacity: None,
            shutdown_timeout: Duration::from_secs(1),
            transform_delay: Duration::from_millis(5),
            image_root: None,
        }
    }

    fn start(config: &PipelineConfig) -> Pipeline {
        Pipeline::start(
            config,
            Arc::new(Scripted),
            Arc::new(TaskSpawner::new(config.transform_delay)),
        )
    }

    async fn wait_processed(pipeline: &Pipeline, id: &str) -> ResponseView {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let StatusView::Completed {
                data,
                processing_status: None,
            } = pipeline.status(id)
            {
                return data;
            }
            assert!(tokio::time::Instant::now() < deadline, "{id} never processed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn hello_is_answered_and_processed() {
        let pipeline = start(&config());
        let id = pipeline.submit("hello", None, None).unwrap();

        let view = wait_processed(&pipeline, &id).await;
        assert_eq!(view.basic.response, "Question: hello\n\nhi there");
        assert_eq!(view.processed, Some(true));
        let processor = view.processor.unwrap();
        assert!(processor == "Process 1" || processor == "Process 2", "{processor}");
        assert!(!view.basic.error);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn every_submission_completes_exactly_once() {
        let pipeline = start(&config());
        let ids: Vec<_> = (0..20)
            .map(|i| pipeline.submit(&format!("q{i}"), None, None).unwrap())
            .collect();
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 20);

        tokio::time::timeout(Duration::from_secs(5), pipeline.wait_idle())
            .await
            .unwrap();
        for id in &ids {
            wait_processed(&pipeline, id).await;
        }

        let listed = pipeline.list();
        assert_eq!(listed.len(), 20);
        let listed_ids: Vec<_> = listed.iter().map(|v| v.basic.id.clone()).collect();
        assert_eq!(listed_ids, ids);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_id_is_processing() {
        let pipeline = start(&config());
        assert_eq!(
            pipeline.status("nope"),
            StatusView::Processing { queue_size: 0 }
        );
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_isolated_per_request() {
        let pipeline = start(&config());
        let bad = pipeline
            .submit("look", Some("not-an-image".to_string()), None)
            .unwrap();
        let broken = pipeline.submit("explode", None, None).unwrap();
        let good = pipeline.submit("hello", None, None).unwrap();

        let bad_view = wait_processed(&pipeline, &bad).await;
        assert!(bad_view.basic.error);
        assert!(bad_view.basic.has_image);
        assert!(bad_view.basic.response.to_lowercase().contains("invalid"));

        let broken_view = wait_processed(&pipeline, &broken).await;
        assert!(broken_view.basic.error);
        assert!(broken_view.basic.response.contains("upstream unavailable"));

        assert!(!wait_processed(&pipeline, &good).await.basic.error);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn empty_prompts_are_rejected() {
        let pipeline = start(&config());
        assert!(matches!(
            pipeline.submit("   ", None, None),
            Err(Error::InvalidRequest { .. })
        ));
        assert!(pipeline.submit_batch(&[]).is_err());
        assert!(
            pipeline
                .submit_batch(&["ok".to_string(), " ".to_string()])
                .is_err()
        );
        // Nothing from the rejected batch was queued.
        assert_eq!(pipeline.queue_size(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn caller_supplied_id_is_kept() {
        let pipeline = start(&config());
        let id = pipeline
            .submit("hello", None, Some("client-42".to_string()))
            .unwrap();
        assert_eq!(id, "client-42");
        wait_processed(&pipeline, "client-42").await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn clear_and_double_drain() {
        let pipeline = start(&config());
        let id = pipeline.submit("hello", None, None).unwrap();
        wait_processed(&pipeline, &id).await;

        pipeline.clear();
        assert!(pipeline.list().is_empty());
        pipeline.clear();
        assert_eq!(pipeline.result_count(), 0);

        assert!(pipeline.drain_processed().is_empty());
        assert!(pipeline.drain_processed().is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_persists_overlays() {
        let pipeline = start(&config());
        let id = pipeline.submit("hello", None, None).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pipeline.wait_idle())
            .await
            .unwrap();

        // Give Stage 2 time to answer, then reconcile manually.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pipeline.reconcile() == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The overlay survives even though the output channel is now empty.
        assert!(pipeline.drain_processed().is_empty());
        assert!(matches!(
            pipeline.status(&id),
            StatusView::Completed {
                processing_status: None,
                ..
            }
        ));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn bounded_queue_and_shutdown_refuse_work() {
        let mut config = config();
        config.queue_capacity = Some(1);
        config.num_threads = 1;
        config.poll_interval = Duration::from_secs(1);
        let pipeline = start(&config);

        // Fill the single slot faster than the one worker can poll it.
        let mut refused = false;
        for i in 0..10 {
            if let Err(e) = pipeline.submit(&format!("q{i}"), None, None) {
                assert!(matches!(e, Error::QueueFull { capacity: 1 }));
                refused = true;
                break;
            }
        }
        assert!(refused);

        pipeline.shutdown().await;
        assert!(pipeline.is_stopping());
        assert_eq!(
            pipeline.submit("late", None, None),
            Err(Error::ServiceShutdown)
        );
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_shutdown_abandons_work() {
        let mut config = config();
        config.num_threads = 1;
        config.shutdown_timeout = Duration::from_millis(100);
        let pipeline = start(&config);

        let stuck = pipeline.submit("hang", None, None).unwrap();
        pipeline.submit("queued behind", None, None).unwrap();
        // The only worker picks up the hanging request; the other one waits.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pipeline.queue_size(), 1);

        pipeline.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), pipeline.wait_idle())
            .await
            .expect("wait_idle resolves once the aborted worker is gone");
        assert_eq!(pipeline.queue_size(), 0);
        assert!(matches!(
            pipeline.status(&stuck),
            StatusView::Processing { .. }
        ));
    }
}
