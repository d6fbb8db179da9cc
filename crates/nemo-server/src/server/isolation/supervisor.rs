//! The Stage-2 worker pool.
//!
//! [`Stage2Pool`] owns the receiving side of the cross-boundary queue and one
//! supervising task ("pump") per isolated worker. A pump dequeues one message
//! at a time with a bounded wait, ships it to its worker and relays the
//! worker's answer to the output channel drained by reconciliation.
//!
//! ## Shutdown
//!
//! 1. Respawning is disabled and exactly one stop token per worker is
//!    enqueued. A pump that dequeues a token forwards it and waits for its
//!    worker to exit.
//! 2. Pumps are joined against a shared deadline (the grace period).
//! 3. When the deadline passes, remaining workers are killed.
//!
//! A worker that dies on its own is logged and respawned under the same
//! processor id. The item it was working on is lost.

use crate::server::isolation::{
    protocol::{FrameReader, FrameWriter, frame_reader, frame_writer, read_message, write_message},
    spawner::{SpawnedWorker, WorkerSpawner, WorkerStdin, WorkerStdout},
};
use core::time::Duration;
use nemo_core::{ProcessedResult, Stage2Message};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
    time::{Instant, sleep, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;

const RESPAWN_BACKOFF: Duration = Duration::from_millis(500);

type Inbox = Arc<AsyncMutex<mpsc::UnboundedReceiver<Stage2Message>>>;

/// Settings shared by every pump.
#[derive(Clone)]
struct PumpContext {
    spawner: Arc<dyn WorkerSpawner>,
    inbox: Inbox,
    outbox: mpsc::UnboundedSender<ProcessedResult>,
    poll_interval: Duration,
    /// Cancelled when shutdown starts; disables respawning.
    stopping: CancellationToken,
    /// Cancelled when the grace period is over.
    kill: CancellationToken,
}

pub struct Stage2Pool {
    inbox_tx: mpsc::UnboundedSender<Stage2Message>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    grace: Duration,
    stopping: CancellationToken,
    kill: CancellationToken,
}

impl Stage2Pool {
    /// Starts `num_workers` isolated workers with processor ids `1..=N`.
    ///
    /// `inbox` is the cross-boundary queue (`inbox_tx` is kept to enqueue
    /// stop tokens) and every processed result is sent on `outbox`.
    pub fn spawn(
        spawner: Arc<dyn WorkerSpawner>,
        num_workers: usize,
        inbox_tx: mpsc::UnboundedSender<Stage2Message>,
        inbox: mpsc::UnboundedReceiver<Stage2Message>,
        outbox: mpsc::UnboundedSender<ProcessedResult>,
        poll_interval: Duration,
        grace: Duration,
    ) -> Self {
        let stopping = CancellationToken::new();
        let kill = CancellationToken::new();
        let context = PumpContext {
            spawner,
            inbox: Arc::new(AsyncMutex::new(inbox)),
            outbox,
            poll_interval,
            stopping: stopping.clone(),
            kill: kill.clone(),
        };

        let pumps = (1..=num_workers)
            .map(|processor_id| tokio::spawn(supervise(processor_id, context.clone())))
            .collect();

        tracing::info!("Started {num_workers} Stage-2 workers");

        Self {
            inbox_tx,
            pumps: Mutex::new(pumps),
            num_workers,
            grace,
            stopping,
            kill,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Stops every worker, killing those still alive after the grace period.
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.stopping.cancel();
        let pumps = core::mem::take(&mut *self.pumps.lock());
        if pumps.is_empty() {
            return;
        }

        for _ in 0..self.num_workers {
            if self.inbox_tx.send(Stage2Message::Stop).is_err() {
                tracing::debug!("Cross-boundary queue already closed");
                break;
            }
        }

        let deadline = Instant::now() + self.grace;
        let joins = pumps.into_iter().enumerate().map(|(i, mut pump)| {
            let kill = self.kill.clone();
            async move {
                if timeout_at(deadline, &mut pump).await.is_err() {
                    tracing::warn!("Stage-2 worker {} did not stop in time; killing", i + 1);
                    kill.cancel();
                    if let Err(e) = pump.await {
                        tracing::error!("Stage-2 supervisor {} ended abnormally: {e}", i + 1);
                    }
                }
            }
        });

        futures::future::join_all(joins).await;
        tracing::info!("Stage-2 pool stopped");
    }
}

/// How a worker's session ended.
enum SessionEnd {
    /// A stop token was forwarded to the worker.
    Stopped,
    /// The worker's pipe broke or it exited unexpectedly.
    Crashed(String),
    /// The grace period ran out.
    Killed,
}

async fn supervise(processor_id: usize, context: PumpContext) {
    loop {
        let SpawnedWorker {
            stdin,
            stdout,
            mut handle,
        } = match context.spawner.spawn(processor_id) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!("Stage-2 worker {processor_id}: {e}");
                if context.stopping.is_cancelled() {
                    return;
                }
                tokio::select! {
                    () = context.kill.cancelled() => return,
                    () = sleep(RESPAWN_BACKOFF) => continue,
                }
            }
        };

        let end = relay(processor_id, &context, stdin, stdout).await;

        match end {
            SessionEnd::Stopped => {
                tokio::select! {
                    status = handle.wait() => {
                        tracing::debug!("Stage-2 worker {processor_id} exited: {status}");
                    }
                    () = context.kill.cancelled() => handle.kill().await,
                }
                return;
            }
            SessionEnd::Killed => {
                handle.kill().await;
                return;
            }
            SessionEnd::Crashed(reason) => {
                tracing::error!("Stage-2 worker {processor_id} crashed: {reason}");
                handle.kill().await;
                if context.stopping.is_cancelled() {
                    return;
                }
                tracing::info!("Respawning Stage-2 worker {processor_id}");
            }
        }
    }
}

/// Ships messages to one worker until it is stopped, crashes or is killed.
async fn relay(
    processor_id: usize,
    context: &PumpContext,
    stdin: WorkerStdin,
    stdout: WorkerStdout,
) -> SessionEnd {
    let mut writer: FrameWriter<WorkerStdin> = frame_writer(stdin);
    let mut reader: FrameReader<WorkerStdout> = frame_reader(stdout);

    loop {
        let next = tokio::select! {
            () = context.kill.cancelled() => return SessionEnd::Killed,
            next = timeout(context.poll_interval, async { context.inbox.lock().await.recv().await }) => next,
        };

        let message = match next {
            Err(_elapsed) => continue,
            // Every sender is gone, nothing more can arrive.
            Ok(None) => Stage2Message::Stop,
            Ok(Some(message)) => message,
        };

        if let Err(e) = write_message(&mut writer, &message).await {
            return match message {
                Stage2Message::Stop => SessionEnd::Stopped,
                Stage2Message::Work(item) => {
                    SessionEnd::Crashed(format!("lost {} while sending: {e}", item.id))
                }
            };
        }

        let item_id = match message {
            Stage2Message::Stop => return SessionEnd::Stopped,
            Stage2Message::Work(item) => item.id,
        };

        let answer = tokio::select! {
            () = context.kill.cancelled() => return SessionEnd::Killed,
            answer = read_message::<_, ProcessedResult>(&mut reader) => answer,
        };

        match answer {
            Ok(Some(processed)) => {
                tracing::trace!(id = %processed.id, "Stage-2 worker {processor_id} finished");
                if context.outbox.send(processed).is_err() {
                    tracing::warn!("Stage-2 output channel closed; dropping result");
                }
            }
            Ok(None) => return SessionEnd::Crashed(format!("exited while processing {item_id}")),
            Err(e) => return SessionEnd::Crashed(format!("bad answer for {item_id}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::isolation::spawner::{TaskSpawner, WorkerHandle};
    use nemo_core::{ForwardedResult, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn work(id: &str) -> Stage2Message {
        Stage2Message::Work(ForwardedResult {
            id: id.to_string(),
            prompt: "p".to_string(),
            text: "t".to_string(),
        })
    }

    struct Pool {
        pool: Stage2Pool,
        tx: mpsc::UnboundedSender<Stage2Message>,
        out: mpsc::UnboundedReceiver<ProcessedResult>,
    }

    fn start(spawner: Arc<dyn WorkerSpawner>, workers: usize, grace: Duration) -> Pool {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out) = mpsc::unbounded_channel();
        let pool = Stage2Pool::spawn(
            spawner,
            workers,
            tx.clone(),
            rx,
            out_tx,
            Duration::from_millis(20),
            grace,
        );
        Pool { pool, tx, out }
    }

    async fn collect(out: &mut mpsc::UnboundedReceiver<ProcessedResult>, n: usize) -> Vec<ProcessedResult> {
        let mut results = Vec::with_capacity(n);
        while results.len() < n {
            let next = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
            results.push(next);
        }
        results
    }

    #[tokio::test]
    async fn every_item_is_processed_once() {
        let mut p = start(
            Arc::new(TaskSpawner::new(Duration::from_millis(5))),
            3,
            Duration::from_secs(2),
        );
        for i in 0..9 {
            p.tx.send(work(&format!("id-{i}"))).unwrap();
        }

        let mut ids: Vec<_> = collect(&mut p.out, 9).await.into_iter().map(|r| r.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 9);

        p.pool.shutdown().await;
        assert!(p.pool.is_stopping());
    }

    /// Worker whose pipe is never read, so it hangs on every item.
    struct Deaf {
        spawned: AtomicUsize,
    }

    impl WorkerSpawner for Deaf {
        fn spawn(&self, _processor_id: usize) -> Result<SpawnedWorker> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (server_side, worker_side) = tokio::io::duplex(1024);
            let (read, write) = tokio::io::split(server_side);
            let handle = tokio::spawn(async move {
                let _keep = worker_side;
                futures::future::pending::<()>().await;
                Ok(())
            });
            Ok(SpawnedWorker {
                stdin: Box::new(write),
                stdout: Box::new(read),
                handle: WorkerHandle::Task(handle),
            })
        }
    }

    #[tokio::test]
    async fn stragglers_are_killed_after_grace() {
        let spawner = Arc::new(Deaf {
            spawned: AtomicUsize::new(0),
        });
        let p = start(spawner.clone(), 2, Duration::from_millis(200));
        p.tx.send(work("a")).unwrap();
        p.tx.send(work("b")).unwrap();
        sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        p.pool.shutdown().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    /// Worker that exits immediately, as if it crashed on startup.
    struct Flaky {
        spawned: AtomicUsize,
        inner: TaskSpawner,
    }

    impl WorkerSpawner for Flaky {
        fn spawn(&self, processor_id: usize) -> Result<SpawnedWorker> {
            if self.spawned.fetch_add(1, Ordering::SeqCst) == 0 {
                let (server_side, _dropped) = tokio::io::duplex(1024);
                let (read, write) = tokio::io::split(server_side);
                return Ok(SpawnedWorker {
                    stdin: Box::new(write),
                    stdout: Box::new(read),
                    handle: WorkerHandle::Task(tokio::spawn(async { Ok(()) })),
                });
            }
            self.inner.spawn(processor_id)
        }
    }

    #[tokio::test]
    async fn crashed_worker_is_respawned() {
        let spawner = Arc::new(Flaky {
            spawned: AtomicUsize::new(0),
            inner: TaskSpawner::new(Duration::ZERO),
        });
        let mut p = start(spawner.clone(), 1, Duration::from_secs(1));

        // The first item is lost with the crashed worker.
        p.tx.send(work("lost")).unwrap();
        p.tx.send(work("kept")).unwrap();

        let results = collect(&mut p.out, 1).await;
        assert_eq!(results[0].id, "kept");
        assert_eq!(results[0].processor_id, 1);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);

        p.pool.shutdown().await;
    }
}
