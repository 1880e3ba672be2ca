use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::select_all;
use tokio_util::sync::CancellationToken;

use crate::error::{BrokerError, Result};
use crate::job::{format_time, Job};
use crate::storage::{validate_queue_name, Store};

/// Outcome of one pass over the scheduled set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub promoted: usize,
    /// Entries that could not be enqueued and were moved to the dead set.
    pub parked: usize,
}

/// Single entry point for job intake and dispatch.
///
/// The manager validates and routes jobs but never touches a queue's
/// internals; ordering and blocking belong to the [`Store`].
pub struct Manager {
    store: Arc<dyn Store>,
}

impl Manager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate a job and route it to its queue, or to the scheduled set if
    /// `at` lies in the future. Past or empty `at` means run now.
    ///
    /// On error nothing is written and `job.enqueued_at` is left as it was.
    pub fn push(&self, job: &mut Job) -> Result<()> {
        self.route(job).map_err(|e| e.context("push"))
    }

    fn route(&self, job: &mut Job) -> Result<()> {
        job.validate()?;
        validate_queue_name(&job.queue).map_err(|e| BrokerError::from(e).context("enqueue"))?;

        match job.scheduled_at()? {
            Some(at) if at > Utc::now() => self.schedule(job, at),
            _ => self.enqueue(job),
        }
    }

    fn schedule(&self, job: &Job, at: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.store.scheduled().add(at, payload)?;
        tracing::debug!(jid = %job.jid, queue = %job.queue, at = %at, "Job scheduled");
        Ok(())
    }

    /// Place a job into its ready queue, stamping `enqueued_at`.
    pub fn enqueue(&self, job: &mut Job) -> Result<()> {
        self.enqueue_now(job).map_err(|e| e.context("enqueue"))
    }

    fn enqueue_now(&self, job: &mut Job) -> Result<()> {
        let queue = self.store.get_queue(&job.queue)?;

        let previous = job.enqueued_at.replace(format_time(Utc::now()));
        let pushed = serde_json::to_vec(job)
            .map_err(BrokerError::from)
            .and_then(|payload| queue.push(job.priority, payload));
        if let Err(e) = pushed {
            job.enqueued_at = previous;
            return Err(e);
        }

        tracing::debug!(jid = %job.jid, queue = %job.queue, priority = job.priority, "Job enqueued");
        Ok(())
    }

    /// Hand the next job from `queues` to worker `wid`.
    ///
    /// Queues are swept in the order given. When all are empty, waits once,
    /// bounded by the store's fetch timeout, for a push to any of them and
    /// returns `Ok(None)` if nothing arrives so the caller can re-poll.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        wid: &str,
        queues: &[&str],
    ) -> Result<Option<Job>> {
        self.fetch_next(cancel, wid, queues)
            .await
            .map_err(|e| e.context("fetch"))
    }

    async fn fetch_next(
        &self,
        cancel: &CancellationToken,
        wid: &str,
        queues: &[&str],
    ) -> Result<Option<Job>> {
        if queues.is_empty() {
            return Err(BrokerError::EmptyQueueList);
        }
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        let handles = queues
            .iter()
            .map(|name| self.store.get_queue(name))
            .collect::<Result<Vec<_>>>()?;

        for queue in &handles {
            if let Some(payload) = queue.pop()? {
                return self.decode(wid, queue.name(), payload).map(Some);
            }
        }

        // A pending bpop has not popped anything yet, so dropping the
        // losers of the race cannot lose a payload.
        let waits = handles.iter().map(|queue| queue.bpop(cancel));
        let (result, index, _pending) = select_all(waits).await;
        match result? {
            Some(payload) => self.decode(wid, handles[index].name(), payload).map(Some),
            None => Ok(None),
        }
    }

    fn decode(&self, wid: &str, queue: &str, payload: Vec<u8>) -> Result<Job> {
        match serde_json::from_slice::<Job>(&payload) {
            Ok(job) => {
                tracing::debug!(wid, queue, jid = %job.jid, "Job fetched");
                Ok(job)
            }
            Err(e) => {
                tracing::warn!(wid, queue, error = %e, "Fetched malformed payload, moving it to the dead set");
                self.store.dead().add(Utc::now(), payload)?;
                Err(e.into())
            }
        }
    }

    /// Move every scheduled job due at or before `now` into its queue.
    ///
    /// A bad entry is parked in the dead set; the rest still promote.
    pub fn promote_scheduled(&self, now: DateTime<Utc>) -> Result<PromotionReport> {
        let due = self.store.scheduled().remove_before(now)?;
        let mut report = PromotionReport::default();

        for payload in due {
            match self.promote(&payload) {
                Ok(()) => report.promoted += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Unable to promote scheduled job, moving it to the dead set");
                    self.store.dead().add(now, payload)?;
                    report.parked += 1;
                }
            }
        }

        if report != PromotionReport::default() {
            tracing::debug!(
                promoted = report.promoted,
                parked = report.parked,
                "Scheduled jobs processed"
            );
        }
        Ok(report)
    }

    fn promote(&self, payload: &[u8]) -> Result<()> {
        let mut job: Job = serde_json::from_slice(payload)?;
        job.validate()?;
        job.at = None;
        self.enqueue(&mut job)
    }

    /// Current size of every known queue, sorted by name.
    pub fn queue_sizes(&self) -> Vec<(String, u64)> {
        let mut sizes = Vec::new();
        self.store
            .each_queue(&mut |queue| sizes.push((queue.name().to_string(), queue.size())));
        sizes.sort();
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn manager() -> Manager {
        Manager::new(Arc::new(MemoryStore::default()))
    }

    fn job(job_type: &str) -> Job {
        Job::new(job_type).with_args(vec![json!(1), json!(2), json!(3)])
    }

    #[test]
    fn push_stamps_enqueued_at() {
        let m = manager();
        let mut j = job("ManagerPush");
        m.push(&mut j).unwrap();
        assert!(j.enqueued_at.is_some());
        assert_eq!(m.store().get_queue("default").unwrap().size(), 1);
    }

    #[test]
    fn promotion_moves_due_jobs_only() {
        let m = manager();
        let store = m.store().clone();
        let now = Utc::now();

        let mut soon = job("Soon").at(now + Duration::seconds(30));
        let mut later = job("Later").at(now + Duration::minutes(10));
        m.push(&mut soon).unwrap();
        m.push(&mut later).unwrap();
        assert_eq!(store.scheduled().size(), 2);

        let report = m.promote_scheduled(now + Duration::minutes(1)).unwrap();
        assert_eq!(report, PromotionReport { promoted: 1, parked: 0 });
        assert_eq!(store.scheduled().size(), 1);

        let q = store.get_queue("default").unwrap();
        let payload = q.pop().unwrap().unwrap();
        let promoted: Job = serde_json::from_slice(&payload).unwrap();
        assert_eq!(promoted.jid, soon.jid);
        assert!(promoted.enqueued_at.is_some());
        assert!(promoted.at.is_none());
    }

    #[test]
    fn promotion_isolates_bad_entries() {
        let m = manager();
        let store = m.store().clone();
        let now = Utc::now();

        store
            .scheduled()
            .add(now - Duration::seconds(5), b"not json".to_vec())
            .unwrap();
        let mut bad_queue = job("BadQueue").with_queue("bad@queue");
        bad_queue.at = Some(format_time(now - Duration::seconds(4)));
        store
            .scheduled()
            .add(
                now - Duration::seconds(4),
                serde_json::to_vec(&bad_queue).unwrap(),
            )
            .unwrap();
        let mut good = job("Good").at(now + Duration::seconds(1));
        m.push(&mut good).unwrap();

        let report = m.promote_scheduled(now + Duration::seconds(2)).unwrap();
        assert_eq!(report, PromotionReport { promoted: 1, parked: 2 });
        assert_eq!(store.scheduled().size(), 0);
        assert_eq!(store.dead().size(), 2);
        assert_eq!(store.get_queue("default").unwrap().size(), 1);
    }

    #[test]
    fn queue_sizes_lists_every_queue() {
        let m = manager();
        m.push(&mut job("A").with_queue("email")).unwrap();
        m.push(&mut job("B")).unwrap();
        m.push(&mut job("C")).unwrap();
        assert_eq!(
            m.queue_sizes(),
            vec![("default".to_string(), 2), ("email".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn fetch_parks_malformed_payloads() {
        let m = manager();
        let store = m.store().clone();
        store
            .get_queue("default")
            .unwrap()
            .push(5, b"{broken".to_vec())
            .unwrap();

        let cancel = CancellationToken::new();
        let err = m.fetch(&cancel, "wid", &["default"]).await.unwrap_err();
        assert!(err.to_string().starts_with("fetch:"));
        assert_eq!(store.dead().size(), 1);
        assert_eq!(store.get_queue("default").unwrap().size(), 0);
    }
}
