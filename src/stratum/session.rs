/// Per-connection session state
///
/// Each TCP connection owns one `Session`. The handler task is the only
/// reader of the socket; everyone else (broadcaster, vardiff, the handler
/// itself) writes through the outbound queue, which a dedicated writer task
/// drains. Mutable state sits behind a plain mutex with short critical
/// sections and never crosses an await while held.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::algorithm::Algorithm;
use crate::stratum::protocol::{self, StratumError};

const DIFFICULTY_HISTORY: usize = 5;
const TIME_WORKS: usize = 40;
/// Only work samples from the last 15 minutes feed span and hashrate math.
const SAMPLE_WINDOW_SECS: f64 = 15.0 * 60.0;

pub struct Session {
    pub algorithm: Algorithm,
    pub peer: SocketAddr,
    pub initial_difficulty: f64,
    pub state: Mutex<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    open: AtomicBool,
}

pub struct SessionState {
    /// Rolling difficulty history; the last entry is the live difficulty.
    pub diff_list: VecDeque<f64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub account_id: Option<i64>,
    pub subscription_id: Option<[u8; 32]>,
    pub extranonce1: Option<[u8; 4]>,
    pub version: Option<String>,
    /// `(submit_time, difficulty)` samples of accepted work.
    pub time_works: VecDeque<(f64, f64)>,
    /// Desired seconds between accepted shares.
    pub submit_span: f64,
    pub n_accept: u64,
    pub n_reject: u64,
}

/// What survives a disconnect: enough to resume a returning miner without
/// restarting its difficulty from scratch.
pub struct ClosedSession {
    pub subscription_id: [u8; 32],
    pub algorithm: Algorithm,
    pub diff_list: VecDeque<f64>,
    pub extranonce1: Option<[u8; 4]>,
    pub time_works: VecDeque<(f64, f64)>,
    pub submit_span: f64,
    pub n_accept: u64,
    pub n_reject: u64,
}

impl SessionState {
    pub(crate) fn new(difficulty: f64, submit_span: f64) -> Self {
        let mut diff_list = VecDeque::with_capacity(DIFFICULTY_HISTORY);
        diff_list.push_back(difficulty);
        Self {
            diff_list,
            username: None,
            password: None,
            account_id: None,
            subscription_id: None,
            extranonce1: None,
            version: None,
            time_works: VecDeque::with_capacity(TIME_WORKS),
            submit_span,
            n_accept: 0,
            n_reject: 0,
        }
    }

    /// Live difficulty, the newest history entry.
    pub fn difficulty(&self) -> f64 {
        *self.diff_list.back().expect("difficulty history never empty")
    }

    pub fn push_difficulty(&mut self, difficulty: f64) {
        if self.diff_list.len() == DIFFICULTY_HISTORY {
            self.diff_list.pop_front();
        }
        self.diff_list.push_back(difficulty);
    }

    pub fn min_difficulty(&self) -> f64 {
        self.diff_list.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn average_difficulty(&self) -> f64 {
        self.diff_list.iter().sum::<f64>() / self.diff_list.len() as f64
    }

    pub fn push_time_work(&mut self, time: f64, difficulty: f64) {
        if self.time_works.len() == TIME_WORKS {
            self.time_works.pop_front();
        }
        self.time_works.push_back((time, difficulty));
    }

    /// Index-weighted mean of inter-arrival times over the sample window;
    /// recent gaps count more. None until two windowed samples exist.
    pub fn average_submit_span(&self, now: f64) -> Option<f64> {
        if self.time_works.len() < 2 {
            return None;
        }
        let time_limit = now - SAMPLE_WINDOW_SECS;
        let mut real = 0.0;
        let mut divide = 0usize;
        let mut old_time: Option<f64> = None;
        for (index, (time, _)) in self
            .time_works
            .iter()
            .filter(|(time, _)| *time > time_limit)
            .enumerate()
        {
            let prev = old_time.unwrap_or(*time);
            real += (*time - prev) * index as f64;
            divide += index;
            old_time = Some(*time);
        }
        old_time?;
        if divide == 0 {
            return None;
        }
        Some(real / divide as f64)
    }

    /// Estimated hashrate over the sample window. Needs 20 recorded samples
    /// with at least 3 inside the window; `7158278.8` is max_target over
    /// base_target.
    pub fn hashrate(&self, now: f64, coefficient: f64) -> u64 {
        if self.time_works.len() < 20 {
            return 0;
        }
        let time_limit = now - SAMPLE_WINDOW_SECS;
        let mut count = 0usize;
        let mut sum_diff = 0.0;
        let mut begin_time: Option<f64> = None;
        for (time, diff) in self.time_works.iter().filter(|(time, _)| *time > time_limit) {
            if begin_time.is_none() {
                begin_time = Some(*time);
            }
            sum_diff += diff;
            count += 1;
        }
        if count < 3 {
            return 0;
        }
        let Some(begin_time) = begin_time else { return 0 };
        let end_time = self.time_works.back().expect("len checked").0;
        let span = (end_time - begin_time).max(1.0);
        let normalized = sum_diff * 600.0 / coefficient / span;
        (normalized * crate::recorder::HASHRATE_FACTOR) as u64
    }

    /// Carry over a resumed miner's pacing state.
    pub fn restore(&mut self, old: &ClosedSession) {
        self.time_works = old.time_works.clone();
        self.push_difficulty(*old.diff_list.back().expect("history never empty"));
        self.submit_span = old.submit_span;
        self.extranonce1 = old.extranonce1;
        self.n_accept = old.n_accept;
        self.n_reject = old.n_reject;
    }
}

impl Session {
    pub fn new(
        algorithm: Algorithm,
        difficulty: f64,
        submit_span: f64,
        peer: SocketAddr,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = std::sync::Arc::new(Self {
            algorithm,
            peer,
            initial_difficulty: difficulty,
            state: Mutex::new(SessionState::new(difficulty, submit_span)),
            outbound: Mutex::new(Some(tx)),
            open: AtomicBool::new(true),
        });
        (session, rx)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Drop the outbound sender so the writer task drains and closes the
    /// socket. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.outbound.lock().expect("outbound poisoned").take();
    }

    /// Queue an already-encoded frame; the broadcaster uses this to avoid
    /// re-serializing per session.
    pub fn send_raw(&self, line: String) -> bool {
        let outbound = self.outbound.lock().expect("outbound poisoned");
        match outbound.as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }

    /// Server-to-client request (`id` is null on notifications).
    pub fn send_request(&self, method: &str, params: Value) -> bool {
        self.send_raw(protocol::request_line(method, params))
    }

    pub fn respond_ok(&self, result: Value, id: Value) -> bool {
        self.send_raw(protocol::success_line(result, id))
    }

    pub fn respond_err(&self, error: StratumError, id: Value) -> bool {
        self.send_raw(protocol::failure_line(error, id))
    }

    /// Snapshot for the closed-sessions ring; None when the connection never
    /// completed a subscribe.
    pub fn to_closed(&self) -> Option<ClosedSession> {
        let state = self.state.lock().expect("session state poisoned");
        let subscription_id = state.subscription_id?;
        Some(ClosedSession {
            subscription_id,
            algorithm: self.algorithm,
            diff_list: state.diff_list.clone(),
            extranonce1: state.extranonce1,
            time_works: state.time_works.clone(),
            submit_span: state.submit_span,
            n_accept: state.n_accept,
            n_reject: state.n_reject,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_session() -> (std::sync::Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 45555);
        Session::new(Algorithm::Sha256d, 16.0, 30.0, peer)
    }

    #[test]
    fn difficulty_history_is_bounded_and_never_empty() {
        let mut state = SessionState::new(16.0, 30.0);
        assert_eq!(state.difficulty(), 16.0);
        for i in 0..10 {
            state.push_difficulty(i as f64);
        }
        assert_eq!(state.diff_list.len(), DIFFICULTY_HISTORY);
        assert_eq!(state.difficulty(), 9.0);
        assert_eq!(state.min_difficulty(), 5.0);
        assert!((state.average_difficulty() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn submit_span_weights_recent_gaps() {
        let mut state = SessionState::new(1.0, 30.0);
        let now = 10_000.0;
        // one sample: not enough
        state.push_time_work(now - 50.0, 1.0);
        assert_eq!(state.average_submit_span(now), None);
        // steady 10 s cadence averages to 10 s
        for i in 0..5 {
            state.push_time_work(now - 40.0 + i as f64 * 10.0, 1.0);
        }
        let span = state.average_submit_span(now).unwrap();
        assert!((span - 10.0).abs() < 1e-6, "got {span}");
    }

    #[test]
    fn submit_span_ignores_stale_samples() {
        let mut state = SessionState::new(1.0, 30.0);
        let now = 100_000.0;
        // everything outside the 15-minute window
        state.push_time_work(now - 2000.0, 1.0);
        state.push_time_work(now - 1900.0, 1.0);
        assert_eq!(state.average_submit_span(now), None);
    }

    #[test]
    fn hashrate_needs_enough_samples() {
        let mut state = SessionState::new(1.0, 30.0);
        let now = 50_000.0;
        for i in 0..19 {
            state.push_time_work(now - 600.0 + i as f64 * 30.0, 8.0);
        }
        assert_eq!(state.hashrate(now, 1.0), 0);
        state.push_time_work(now - 5.0, 8.0);
        let rate = state.hashrate(now, 1.0);
        assert!(rate > 0);
        // a higher coefficient deflates the estimate
        assert!(state.hashrate(now, 4.0) < rate);
    }

    #[test]
    fn close_drops_the_outbound_channel() {
        let (session, mut rx) = test_session();
        assert!(session.send_request("client.show_message", serde_json::json!(["hi"])));
        session.close();
        assert!(!session.is_open());
        assert!(!session.send_request("client.show_message", serde_json::json!(["bye"])));
        // the queued line is still drained, then the channel ends
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_snapshot_requires_subscription() {
        let (session, _rx) = test_session();
        assert!(session.to_closed().is_none());
        {
            let mut state = session.state.lock().unwrap();
            state.subscription_id = Some([1u8; 32]);
            state.extranonce1 = Some([2u8; 4]);
            state.n_accept = 3;
        }
        let closed = session.to_closed().unwrap();
        assert_eq!(closed.n_accept, 3);
        assert_eq!(closed.extranonce1, Some([2u8; 4]));

        let mut fresh = SessionState::new(99.0, 10.0);
        fresh.restore(&closed);
        assert_eq!(fresh.extranonce1, Some([2u8; 4]));
        assert_eq!(fresh.difficulty(), 16.0);
        assert_eq!(fresh.n_accept, 3);
    }
}
