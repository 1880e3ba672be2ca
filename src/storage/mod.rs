//! Queue storage consumed by the broker core.
//!
//! The core only talks to the [`Store`] capability:
//!
//! - [`Queue`]: priority-tiered list of serialized jobs with blocking pop
//! - [`SortedSet`]: payloads ordered by a timestamp (scheduled and dead jobs)
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests. A networked backend plugs in by implementing the same traits.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ValidationError};

pub use memory::{MemoryQueue, MemorySortedSet, MemoryStore};

pub trait Store: Send + Sync {
    /// Look up a queue by name, creating it on first reference.
    fn get_queue(&self, name: &str) -> Result<Arc<dyn Queue>>;

    /// Visit every known queue. Queues created concurrently may or may not
    /// be visited.
    fn each_queue(&self, f: &mut dyn FnMut(&Arc<dyn Queue>));

    /// Jobs waiting for their scheduled time.
    fn scheduled(&self) -> Arc<dyn SortedSet>;

    /// Entries that could not be delivered and were parked.
    fn dead(&self) -> Arc<dyn SortedSet>;

    /// Empty every queue and every set. Destructive, meant for tests.
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name()).finish()
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    fn push(&self, priority: u8, payload: Vec<u8>) -> Result<()>;

    /// Never blocks. `Ok(None)` when the queue is empty.
    fn pop(&self) -> Result<Option<Vec<u8>>>;

    /// Waits up to the store's fetch timeout for a payload.
    ///
    /// Returns `Err(Cancelled)` as soon as `cancel` fires, `Ok(None)` when
    /// the timeout passes without data.
    async fn bpop(&self, cancel: &CancellationToken) -> Result<Option<Vec<u8>>>;

    /// Visit a snapshot of the contents, most recently pushed first. An
    /// error from `f` stops the traversal and is returned.
    fn each(&self, f: &mut dyn FnMut(usize, &[u8]) -> Result<()>) -> Result<()>;

    /// Remove everything, returning how many payloads were dropped.
    fn clear(&self) -> Result<u64>;
}

pub trait SortedSet: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    fn add(&self, at: DateTime<Utc>, payload: Vec<u8>) -> Result<()>;

    /// Atomically remove and return every entry due at or before `cutoff`,
    /// earliest first.
    fn remove_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Vec<u8>>>;

    /// Visit a snapshot of the entries, earliest first.
    fn each(&self, f: &mut dyn FnMut(DateTime<Utc>, &[u8]) -> Result<()>) -> Result<()>;

    fn clear(&self) -> Result<u64>;
}

/// Queue names are limited to `[A-Za-z0-9_.-]+`.
pub fn validate_queue_name(name: &str) -> std::result::Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::QueueName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_charset() {
        for name in ["A-Za-z0-9_.-", "-", "A", "a", "default", "critical.v2"] {
            assert!(validate_queue_name(name).is_ok(), "{name}");
        }
        for name in [
            "default?page=1",
            "user@example.com",
            "c&c",
            "priority|high",
            "",
            "with space",
            "ünicode",
        ] {
            assert!(validate_queue_name(name).is_err(), "{name}");
        }
    }
}
