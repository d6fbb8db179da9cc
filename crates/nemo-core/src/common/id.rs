//! Request id generation.
//!
//! Ids are monotonic ULIDs rendered in Crockford base32. They are unique for
//! the lifetime of the process and sort lexicographically in submission order,
//! which the result store relies on to list results in the order they were
//! submitted.

use crate::{Error, Result};
use ferroid::{
    base32::Base32UlidExt,
    generator::{IdGenStatus, LockMonoUlidGenerator},
    id::ULID,
    rand::ThreadRandom,
    time::MonotonicClock,
};

/// Thread-safe generator for client-visible request ids.
pub struct RequestIdGenerator {
    inner: LockMonoUlidGenerator<ULID, MonotonicClock, ThreadRandom>,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: LockMonoUlidGenerator::new(MonotonicClock::default(), ThreadRandom::default()),
        }
    }

    /// Returns the next id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdGeneration`] if the underlying generator fails.
    pub fn next_id(&self) -> Result<String> {
        loop {
            match self.inner.try_next_id() {
                Ok(IdGenStatus::Ready { id }) => return Ok(id.encode().to_string()),
                // Random bits for this millisecond are exhausted.
                Ok(IdGenStatus::Pending { .. }) => std::thread::yield_now(),
                Err(e) => return Err(Error::IdGeneration(format!("{e:?}"))),
            }
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
