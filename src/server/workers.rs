use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::server::reply::Reply;

/// Something the registry can force-close. Closing a connection must run
/// its own cleanup, which is what makes the worker's unacknowledged
/// reservations recoverable.
pub trait Closer: Send + Sync {
    fn close(&self);
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to one live transport connection. Clones compare equal;
/// two separately created handles never do.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    closer: Arc<dyn Closer>,
}

impl ConnectionHandle {
    pub fn new(closer: Arc<dyn Closer>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            closer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish()
    }
}

/// Worker lifecycle. Only ever moves forward:
/// `Running -> Quiet -> Terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Alive and fetching.
    #[default]
    Running,
    /// Finish current jobs, fetch nothing new.
    Quiet,
    /// Exit soon.
    Terminate,
}

impl WorkerState {
    /// The state reached by requesting `requested` from `self`, or `None`
    /// if the pair is not an allowed transition.
    pub fn transition(self, requested: WorkerState) -> Option<WorkerState> {
        use WorkerState::*;
        match (self, requested) {
            (Running, Quiet) | (Running, Terminate) | (Quiet, Terminate) => Some(requested),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Quiet => "quiet",
            WorkerState::Terminate => "terminate",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a client sends in its handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientData {
    #[serde(default)]
    pub hostname: String,
    /// Empty for pure producers.
    #[serde(default)]
    pub wid: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, rename = "v")]
    pub version: u8,
}

impl ClientData {
    pub fn from_hello(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Only consumers send heartbeats.
    pub fn is_consumer(&self) -> bool {
        !self.wid.is_empty()
    }
}

#[derive(Debug)]
struct RecordState {
    last_heartbeat: DateTime<Utc>,
    state: WorkerState,
    connections: HashSet<ConnectionHandle>,
}

/// Canonical record of one consumer process, owned by [`Workers`].
#[derive(Debug)]
pub struct WorkerRecord {
    client: ClientData,
    started_at: DateTime<Utc>,
    inner: Mutex<RecordState>,
}

impl WorkerRecord {
    fn new(client: ClientData, now: DateTime<Utc>) -> Self {
        Self {
            client,
            started_at: now,
            inner: Mutex::new(RecordState {
                last_heartbeat: now,
                state: WorkerState::Running,
                connections: HashSet::new(),
            }),
        }
    }

    pub fn client(&self) -> &ClientData {
        &self.client
    }

    pub fn wid(&self) -> &str {
        &self.client.wid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.inner.lock().last_heartbeat
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn is_quiet(&self) -> bool {
        self.state() != WorkerState::Running
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    fn touch(&self, now: DateTime<Utc>, conn: Option<&ConnectionHandle>) {
        let mut inner = self.inner.lock();
        inner.last_heartbeat = now;
        if let Some(conn) = conn {
            inner.connections.insert(conn.clone());
        }
    }

    /// Request a lifecycle change. Returns true if the state moved;
    /// disallowed or repeated requests are ignored.
    pub fn signal(&self, requested: WorkerState) -> bool {
        let mut inner = self.inner.lock();
        match inner.state.transition(requested) {
            Some(next) => {
                tracing::info!(wid = %self.client.wid, from = %inner.state, to = %next, "Worker signalled");
                inner.state = next;
                true
            }
            None => false,
        }
    }

    /// Response to a heartbeat: plain OK while running, otherwise the state
    /// the worker should move to.
    pub fn beat_reply(&self) -> Reply {
        match self.state() {
            WorkerState::Running => Reply::Ok,
            state => Reply::Bulk(Some(
                format!(r#"{{"state":"{}"}}"#, state.as_str()).into_bytes(),
            )),
        }
    }

    fn summary(&self) -> WorkerSummary {
        let inner = self.inner.lock();
        WorkerSummary {
            wid: self.client.wid.clone(),
            hostname: self.client.hostname.clone(),
            pid: self.client.pid,
            labels: self.client.labels.clone(),
            state: inner.state,
            started_at: self.started_at,
            last_heartbeat: inner.last_heartbeat,
            connections: inner.connections.len(),
        }
    }
}

/// Point-in-time view of a worker for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub wid: String,
    pub hostname: String,
    pub pid: u32,
    pub labels: Vec<String>,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub connections: usize,
}

/// Registry of consumer processes keyed by worker id.
#[derive(Debug, Default)]
pub struct Workers {
    heartbeats: RwLock<HashMap<String, Arc<WorkerRecord>>>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.heartbeats.read().len()
    }

    pub fn get(&self, wid: &str) -> Option<Arc<WorkerRecord>> {
        self.heartbeats.read().get(wid).cloned()
    }

    /// Record a heartbeat from `client`.
    ///
    /// A known worker is refreshed. An unknown one is registered only when
    /// it arrives on a live connection; a bare heartbeat from a worker id we
    /// never saw connect returns `None`.
    pub fn heartbeat(
        &self,
        client: &ClientData,
        conn: Option<&ConnectionHandle>,
    ) -> Option<Arc<WorkerRecord>> {
        let now = Utc::now();

        // The record is touched while the map lock is held so a concurrent
        // reap cannot remove it between lookup and refresh.
        {
            let heartbeats = self.heartbeats.read();
            if let Some(record) = heartbeats.get(&client.wid) {
                record.touch(now, conn);
                return Some(record.clone());
            }
        }

        let Some(conn) = conn else {
            tracing::debug!(wid = %client.wid, "Heartbeat received from unknown worker");
            return None;
        };

        let mut heartbeats = self.heartbeats.write();
        let record = heartbeats.entry(client.wid.clone()).or_insert_with(|| {
            tracing::debug!(wid = %client.wid, hostname = %client.hostname, "Registered new worker");
            Arc::new(WorkerRecord::new(client.clone(), now))
        });
        record.touch(now, Some(conn));
        Some(record.clone())
    }

    /// Signal the worker `wid`. Returns false for unknown workers and for
    /// transitions that are not allowed.
    pub fn signal(&self, wid: &str, state: WorkerState) -> bool {
        self.get(wid).is_some_and(|record| record.signal(state))
    }

    /// Detach one connection; the worker record itself stays.
    pub fn remove_connection(&self, conn: &ConnectionHandle) -> bool {
        let heartbeats = self.heartbeats.read();
        heartbeats
            .values()
            .any(|record| record.inner.lock().connections.remove(conn))
    }

    /// Remove every worker whose last heartbeat is strictly before `cutoff`
    /// and close each of its connections. Returns the number of workers
    /// reaped.
    pub fn reap_heartbeats(&self, cutoff: DateTime<Utc>) -> usize {
        let reaped: Vec<Arc<WorkerRecord>> = {
            let mut heartbeats = self.heartbeats.write();
            let stale: Vec<String> = heartbeats
                .iter()
                .filter(|(_, record)| record.last_heartbeat() < cutoff)
                .map(|(wid, _)| wid.clone())
                .collect();
            stale
                .iter()
                .filter_map(|wid| heartbeats.remove(wid))
                .collect()
        };

        // Closing runs connection cleanup, which may call back into the
        // registry, so the map lock is already released here.
        let mut closed = 0;
        for record in &reaped {
            let connections: Vec<ConnectionHandle> =
                record.inner.lock().connections.drain().collect();
            for conn in connections {
                conn.close();
                closed += 1;
            }
        }

        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "Reaped worker heartbeats");
        }
        if closed > 0 {
            tracing::warn!(
                connections = closed,
                "Reaped lingering connections, workers should send a heartbeat every 15 seconds"
            );
        }
        reaped.len()
    }

    /// Summaries of every registered worker, ordered by worker id.
    pub fn snapshot(&self) -> Vec<WorkerSummary> {
        let mut all: Vec<WorkerSummary> = self
            .heartbeats
            .read()
            .values()
            .map(|record| record.summary())
            .collect();
        all.sort_by(|a, b| a.wid.cmp(&b.wid));
        all
    }
}
