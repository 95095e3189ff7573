/// Central pool state
///
/// One `Pool` value owns everything the background tasks share: the session
/// registry, the closed-sessions ring, the job cache, the history rings and
/// the shutdown signal. Tasks get an `Arc<Pool>`; nothing in here is a
/// process-wide singleton. No lock in this module is held across I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;

use crate::algorithm::Algorithm;
use crate::config::Config;
use crate::db::Store;
use crate::jobs::{Job, JobCache};
use crate::node::NodeClient;
use crate::recorder::{DistributionBook, PoolStatus};
use crate::stratum::protocol;
use crate::stratum::session::{ClosedSession, Session};

const CLOSED_RING: usize = 25;
const HISTORY_RING: usize = 50;
const STATUS_RING: usize = 50;

pub struct Pool {
    pub config: Arc<Config>,
    pub store: Store,
    pub node: Arc<NodeClient>,
    pub jobs: JobCache,
    pub distributions: Arc<DistributionBook>,
    sessions: Mutex<Vec<Arc<Session>>>,
    closed: Mutex<VecDeque<ClosedSession>>,
    statuses: Mutex<VecDeque<PoolStatus>>,
    block_history: Mutex<VecDeque<Value>>,
    tx_history: Mutex<VecDeque<Value>>,
    shutdown: watch::Receiver<bool>,
}

impl Pool {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        node: Arc<NodeClient>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let distributions = Arc::new(DistributionBook::new());
        let jobs = JobCache::new(node.clone(), config.clone(), distributions.clone());
        Arc::new(Self {
            config,
            store,
            node,
            jobs,
            distributions,
            sessions: Mutex::new(Vec::new()),
            closed: Mutex::new(VecDeque::with_capacity(CLOSED_RING)),
            statuses: Mutex::new(VecDeque::with_capacity(STATUS_RING)),
            block_history: Mutex::new(VecDeque::with_capacity(HISTORY_RING)),
            tx_history: Mutex::new(VecDeque::with_capacity(HISTORY_RING)),
            shutdown,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    // session registry

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.lock().expect("registry poisoned").push(session);
    }

    pub fn unregister(&self, session: &Arc<Session>) {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .retain(|other| !Arc::ptr_eq(other, session));
    }

    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().expect("registry poisoned").clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("registry poisoned").len()
    }

    /// Fan a request out to every session on `algorithm`. Writes go through
    /// the per-session outbound queues, so the registry lock never waits on
    /// a socket; a session whose queue is gone is skipped, its own handler
    /// tears it down. Returns the number of successful writes.
    pub fn broadcast(&self, method: &str, params: Value, algorithm: Algorithm) -> usize {
        let line = protocol::request_line(method, params);
        let sessions = self.sessions.lock().expect("registry poisoned");
        let mut count = 0;
        for session in sessions.iter() {
            if session.algorithm != algorithm {
                continue;
            }
            if session.send_raw(line.clone()) {
                count += 1;
            }
        }
        count
    }

    // closed-session ring

    pub fn push_closed(&self, closed: ClosedSession) {
        let mut ring = self.closed.lock().expect("closed ring poisoned");
        if ring.len() == CLOSED_RING {
            ring.pop_front();
        }
        ring.push_back(closed);
    }

    /// Take the newest closed session matching the resume request, if any.
    pub fn resume_closed(
        &self,
        subscription_id: &[u8; 32],
        algorithm: Algorithm,
    ) -> Option<ClosedSession> {
        let mut ring = self.closed.lock().expect("closed ring poisoned");
        let index = ring
            .iter()
            .rposition(|old| old.subscription_id == *subscription_id && old.algorithm == algorithm)?;
        ring.remove(index)
    }

    // history rings

    pub fn push_block_event(&self, event: Value) {
        let mut ring = self.block_history.lock().expect("block history poisoned");
        if ring.len() == HISTORY_RING {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn push_tx_event(&self, event: Value) {
        let mut ring = self.tx_history.lock().expect("tx history poisoned");
        if ring.len() == HISTORY_RING {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn block_history_snapshot(&self) -> Vec<Value> {
        self.block_history
            .lock()
            .expect("block history poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn push_status(&self, status: PoolStatus) {
        let mut ring = self.statuses.lock().expect("status ring poisoned");
        if ring.len() == STATUS_RING {
            ring.pop_front();
        }
        ring.push_back(status);
    }

    pub fn latest_status(&self) -> Option<PoolStatus> {
        self.statuses.lock().expect("status ring poisoned").back().cloned()
    }

    /// Convenience over the job cache, the form the notify loop and the
    /// authorize handler use.
    pub async fn add_new_job(&self, algorithm: Algorithm, force_renew: bool) -> Result<Arc<Job>> {
        self.jobs.add_new_job(algorithm, force_renew).await
    }
}
