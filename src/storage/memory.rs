use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{BrokerConfig, TierOrder};
use crate::error::{BrokerError, Result};
use crate::storage::{validate_queue_name, Queue, SortedSet, Store};

/// In-process [`Store`]. Every queue has its own lock; the queue map has a
/// separate read/write lock so lookups of existing queues do not contend.
#[derive(Debug)]
pub struct MemoryStore {
    tier_order: TierOrder,
    fetch_timeout: Duration,
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
    scheduled: Arc<MemorySortedSet>,
    dead: Arc<MemorySortedSet>,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            tier_order: config.tier_order,
            fetch_timeout: config.fetch_timeout,
            queues: RwLock::new(HashMap::new()),
            scheduled: Arc::new(MemorySortedSet::new("scheduled")),
            dead: Arc::new(MemorySortedSet::bounded("dead", config.dead_set_limit)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::StoreClosed);
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn get_queue(&self, name: &str) -> Result<Arc<dyn Queue>> {
        validate_queue_name(name)?;
        self.ensure_open()?;

        if let Some(queue) = self.queues.read().get(name) {
            return Ok(queue.clone() as Arc<dyn Queue>);
        }

        let mut queues = self.queues.write();
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(queue = name, "Queue created");
                Arc::new(MemoryQueue::new(name, self.tier_order, self.fetch_timeout))
            })
            .clone();
        Ok(queue as Arc<dyn Queue>)
    }

    fn each_queue(&self, f: &mut dyn FnMut(&Arc<dyn Queue>)) {
        // Snapshot first so `f` may call back into the store.
        let snapshot: Vec<Arc<dyn Queue>> = self
            .queues
            .read()
            .values()
            .map(|q| q.clone() as Arc<dyn Queue>)
            .collect();
        for queue in &snapshot {
            f(queue);
        }
    }

    fn scheduled(&self) -> Arc<dyn SortedSet> {
        self.scheduled.clone()
    }

    fn dead(&self) -> Arc<dyn SortedSet> {
        self.dead.clone()
    }

    fn flush(&self) -> Result<()> {
        let mut dropped = 0;
        for queue in self.queues.read().values() {
            dropped += queue.clear()?;
        }
        dropped += self.scheduled.clear()?;
        dropped += self.dead.clear()?;
        tracing::debug!(dropped, "Store flushed");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(queues = self.queues.read().len(), "Store closed");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tiers {
    /// Priority → payloads tagged with their push sequence number.
    lists: BTreeMap<u8, VecDeque<(u64, Vec<u8>)>>,
    next_seq: u64,
    len: u64,
}

/// A named queue with one sub-list per priority, drained highest first.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    order: TierOrder,
    fetch_timeout: Duration,
    tiers: Mutex<Tiers>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, order: TierOrder, fetch_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            order,
            fetch_timeout,
            tiers: Mutex::new(Tiers::default()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.tiers.lock().len
    }

    fn push(&self, priority: u8, payload: Vec<u8>) -> Result<()> {
        {
            let mut tiers = self.tiers.lock();
            let seq = tiers.next_seq;
            tiers.next_seq += 1;
            tiers.len += 1;
            tiers
                .lists
                .entry(priority)
                .or_default()
                .push_back((seq, payload));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn pop(&self) -> Result<Option<Vec<u8>>> {
        let mut tiers = self.tiers.lock();
        let Some(mut top) = tiers.lists.last_entry() else {
            return Ok(None);
        };
        let item = match self.order {
            TierOrder::Lifo => top.get_mut().pop_back(),
            TierOrder::Fifo => top.get_mut().pop_front(),
        };
        if top.get().is_empty() {
            top.remove();
        }
        if item.is_some() {
            tiers.len -= 1;
        }
        Ok(item.map(|(_, payload)| payload))
    }

    async fn bpop(&self, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
        let deadline = Instant::now() + self.fetch_timeout;

        loop {
            // Register interest before checking, so a push between the
            // check and the wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.pop()? {
                return Ok(Some(payload));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }

            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
        }
    }

    fn each(&self, f: &mut dyn FnMut(usize, &[u8]) -> Result<()>) -> Result<()> {
        let mut snapshot: Vec<(u64, Vec<u8>)> = {
            let tiers = self.tiers.lock();
            tiers.lists.values().flatten().cloned().collect()
        };
        snapshot.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (idx, (_, payload)) in snapshot.iter().enumerate() {
            f(idx, payload)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<u64> {
        let mut tiers = self.tiers.lock();
        let removed = tiers.len;
        tiers.lists.clear();
        tiers.len = 0;
        Ok(removed)
    }
}

/// Payloads ordered by timestamp, ties broken by insertion order.
///
/// A bounded set evicts its earliest entries once it grows past the limit.
#[derive(Debug)]
pub struct MemorySortedSet {
    name: String,
    limit: Option<usize>,
    entries: Mutex<SortedEntries>,
}

#[derive(Debug, Default)]
struct SortedEntries {
    map: BTreeMap<(DateTime<Utc>, u64), Vec<u8>>,
    next_seq: u64,
}

impl MemorySortedSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limit: None,
            entries: Mutex::new(SortedEntries::default()),
        }
    }

    pub fn bounded(name: impl Into<String>, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(name)
        }
    }
}

impl SortedSet for MemorySortedSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.entries.lock().map.len() as u64
    }

    fn add(&self, at: DateTime<Utc>, payload: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.lock();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.insert((at, seq), payload);

        if let Some(limit) = self.limit {
            let mut evicted = 0;
            while entries.map.len() > limit && entries.map.pop_first().is_some() {
                evicted += 1;
            }
            if evicted > 0 {
                tracing::debug!(set = %self.name, evicted, limit, "Evicted oldest entries");
            }
        }
        Ok(())
    }

    fn remove_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let later = entries.map.split_off(&(cutoff, u64::MAX));
        let due = std::mem::replace(&mut entries.map, later);
        Ok(due.into_values().collect())
    }

    fn each(&self, f: &mut dyn FnMut(DateTime<Utc>, &[u8]) -> Result<()>) -> Result<()> {
        let snapshot: Vec<(DateTime<Utc>, Vec<u8>)> = self
            .entries
            .lock()
            .map
            .iter()
            .map(|((at, _), payload)| (*at, payload.clone()))
            .collect();
        for (at, payload) in &snapshot {
            f(*at, payload)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<u64> {
        let mut entries = self.entries.lock();
        let removed = entries.map.len() as u64;
        entries.map.clear();
        Ok(removed)
    }
}
