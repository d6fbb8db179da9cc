//! The Stage-1 worker pool.
//!
//! This module defines [`Stage1Pool`], a fixed set of Tokio tasks that drain
//! the shared request queue and call the external generator. Unlike a
//! round-robin pool with per-worker channels, every worker competes for the
//! same FIFO, so a slow external call only ever stalls the worker making it.
//!
//! Shutdown is cooperative: the pool's [`CancellationToken`] is cancelled,
//! each worker notices it at its next poll, and tasks that are still stuck in
//! an external call after the join timeout are aborted.

use crate::server::pool::worker::{Stage1Shared, worker_loop};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

pub struct Stage1Pool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    join_timeout: Duration,
}

impl Stage1Pool {
    /// Spawns `num_workers` workers named `worker-1` to `worker-N`.
    pub fn spawn(shared: Arc<Stage1Shared>, num_workers: usize, join_timeout: Duration) -> Self {
        let shutdown_token = CancellationToken::new();
        let handles = (1..=num_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&shared),
                    shutdown_token.clone(),
                ))
            })
            .collect();

        tracing::info!("Started {num_workers} Stage-1 workers");

        Self {
            handles: Mutex::new(handles),
            shutdown_token,
            join_timeout,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Signals every worker to stop and joins them.
    ///
    /// Each worker gets `join_timeout` to finish; workers still running after
    /// that (typically blocked in an external call) are aborted. Calling this
    /// more than once is harmless.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handles = core::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        tracing::debug!("Joining {} Stage-1 workers", handles.len());
        let join_timeout = self.join_timeout;

        let joins = handles
            .into_iter()
            .enumerate()
            .map(|(i, mut handle)| async move {
                match timeout(join_timeout, &mut handle).await {
                    Ok(Ok(())) => {
                        tracing::trace!("worker-{} joined", i + 1);
                    }
                    Ok(Err(e)) => {
                        tracing::error!("worker-{} ended abnormally: {e}", i + 1);
                    }
                    Err(_) => {
                        tracing::warn!("worker-{} did not stop in time; aborting", i + 1);
                        handle.abort();
                    }
                }
            });

        futures::future::join_all(joins).await;
        tracing::info!("Stage-1 pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        generator::{ContentGenerator, PreparedImage},
        pool::resources::ResourceMonitor,
        queue::RequestQueue,
        store::ResultStore,
    };
    use async_trait::async_trait;
    use nemo_core::{RequestRecord, Result};
    use std::time::Instant;
    use tokio::sync::mpsc;

    struct Hang;

    #[async_trait]
    impl ContentGenerator for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        async fn generate(&self, _prompt: &str, _image: Option<&PreparedImage>) -> Result<String> {
            futures::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn shutdown_aborts_hung_workers() {
        let (forward, _rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Stage1Shared {
            queue: Arc::new(RequestQueue::new(None)),
            store: Arc::new(ResultStore::new()),
            generator: Arc::new(Hang),
            forward,
            resources: ResourceMonitor::new(),
            poll_interval: Duration::from_millis(20),
            request_timeout: None,
            image_root: None,
        });
        shared
            .queue
            .push(RequestRecord {
                id: "stuck".to_string(),
                prompt: "p".to_string(),
                image: None,
            })
            .unwrap();

        let pool = Stage1Pool::spawn(Arc::clone(&shared), 2, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        pool.shutdown().await;
        assert!(pool.is_stopping());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(shared.store.get("stuck").is_none());

        // Second call is a no-op.
        pool.shutdown().await;
    }
}
