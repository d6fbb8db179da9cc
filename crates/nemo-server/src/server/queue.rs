//! The request queue between submitters and Stage-1 workers.
//!
//! A single FIFO shared by every Stage-1 worker. Submission never blocks: the
//! queue is unbounded unless a capacity is configured, in which case a full
//! queue refuses new records with [`Error::QueueFull`]. Consumers dequeue with
//! a bounded wait so they can observe a stop signal between attempts.
//!
//! Besides the number of waiting records the queue tracks *unfinished* work:
//! a record counts from `push` until its consumer calls
//! [`RequestQueue::task_done`], so an idle check never misses a record that was
//! dequeued but not yet stored. Once no consumer is left,
//! [`RequestQueue::abandon`] drops the waiting records and settles the count.

use core::time::Duration;
use nemo_core::{Error, RequestRecord, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};

pub struct RequestQueue {
    tx: mpsc::UnboundedSender<RequestRecord>,
    rx: Mutex<mpsc::UnboundedReceiver<RequestRecord>>,
    depth: AtomicUsize,
    unfinished: AtomicUsize,
    capacity: Option<usize>,
}

impl RequestQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            unfinished: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Enqueues a record.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if the queue is bounded and at capacity.
    /// - [`Error::ChannelError`] if the channel has been closed.
    pub fn push(&self, record: RequestRecord) -> Result<()> {
        // Reserve a slot first so concurrent producers cannot overshoot the
        // capacity.
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                match self.capacity {
                    Some(capacity) if depth >= capacity => None,
                    _ => Some(depth + 1),
                }
            })
            .map_err(|_| Error::QueueFull {
                capacity: self.capacity.unwrap_or_default(),
            })?;
        self.unfinished.fetch_add(1, Ordering::AcqRel);

        self.tx.send(record).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.unfinished.fetch_sub(1, Ordering::AcqRel);
            Error::ChannelError {
                context: format!("Request queue closed: {e}"),
            }
        })
    }

    /// Waits up to `wait` for the next record.
    ///
    /// Returns `None` when nothing arrived in time. Cancel-safe: a record is
    /// never lost if the returned future is dropped.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<RequestRecord> {
        let record = tokio::time::timeout(wait, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(record)
    }

    /// Number of records waiting to be picked up.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks one dequeued record as fully handled.
    pub fn task_done(&self) {
        let _ = self
            .unfinished
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Records pushed but not yet marked done (waiting or in flight).
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Drops every waiting record and forgets the ones in flight, leaving
    /// [`RequestQueue::unfinished`] at zero.
    ///
    /// Only correct once every consumer has stopped, since nobody will mark
    /// the dropped records done. Returns how many waiting records were
    /// dropped.
    pub fn abandon(&self) -> usize {
        let mut dropped = 0;
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {
                let _ = self
                    .depth
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                dropped += 1;
            }
        }
        self.unfinished.store(0, Ordering::Release);
        dropped
    }
}
