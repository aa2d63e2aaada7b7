//! Peer Contact Manager: tracks known peers, contact history, and a
//! decaying forwarding-effectiveness score used as a tiebreaker by the
//! Forwarding Engine — never for admission.

use crate::types::{now_millis, PeerId, PeerRecord, PublicKey};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Exponential decay applied to the effectiveness score on every update, so
/// recent contact history dominates without discarding older history
/// outright.
const EFFECTIVENESS_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
struct RetryState {
    consecutive_failures: u32,
    next_attempt_after: Instant,
}

/// In-memory peer table; persistence of the `peers` table to storage is the
/// caller's responsibility (mirroring how the keyring is persisted), this
/// type owns only the bookkeeping logic and admission policy.
pub struct PeerTable {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
    retries: Mutex<HashMap<PeerId, RetryState>>,
    max_concurrent_sessions: usize,
    active_sessions: Mutex<usize>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            max_concurrent_sessions: 8,
            active_sessions: Mutex::new(0),
        }
    }

    pub fn with_session_cap(max_concurrent_sessions: usize) -> Self {
        Self { max_concurrent_sessions, ..Self::new() }
    }

    pub fn note_contact(&self, peer_id: PeerId, public_key: PublicKey) {
        let now = now_millis();
        let mut records = self.records.write().unwrap();
        records
            .entry(peer_id)
            .and_modify(|r| r.last_contact = now)
            .or_insert_with(|| PeerRecord::new(peer_id, public_key, now));
        self.retries.lock().unwrap().remove(&peer_id);
    }

    pub fn record_delivered_to_us(&self, peer_id: PeerId, now: i64) {
        if let Some(r) = self.records.write().unwrap().get_mut(&peer_id) {
            r.delivered_to_us += 1;
            r.last_contact = now;
        }
    }

    pub fn record_delivered_to_them(&self, peer_id: PeerId, now: i64) {
        let mut records = self.records.write().unwrap();
        let r = records.entry(peer_id).or_insert_with(|| PeerRecord::new(peer_id, peer_id, now));
        r.delivered_to_them += 1;
        r.effectiveness = r.effectiveness * EFFECTIVENESS_DECAY + (1.0 - EFFECTIVENESS_DECAY);
        r.last_contact = now;
    }

    pub fn effectiveness(&self, peer_id: &PeerId) -> f64 {
        self.records.read().unwrap().get(peer_id).map(|r| r.effectiveness).unwrap_or(0.0)
    }

    pub fn record(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.records.read().unwrap().get(peer_id).cloned()
    }

    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }

    /// Whether a new outbound/inbound session with this peer should be
    /// admitted right now: not backing off, and under the concurrent
    /// session cap.
    pub fn may_connect(&self, peer_id: &PeerId) -> bool {
        let under_cap = *self.active_sessions.lock().unwrap() < self.max_concurrent_sessions;
        let not_backing_off = self
            .retries
            .lock()
            .unwrap()
            .get(peer_id)
            .is_none_or(|r| Instant::now() >= r.next_attempt_after);
        under_cap && not_backing_off
    }

    pub fn session_opened(&self) {
        *self.active_sessions.lock().unwrap() += 1;
    }

    pub fn session_closed(&self) {
        let mut n = self.active_sessions.lock().unwrap();
        *n = n.saturating_sub(1);
    }

    /// Record a failed/dropped session attempt, applying exponential
    /// backoff before the same peer is retried.
    pub fn record_failure(&self, peer_id: PeerId) {
        let mut retries = self.retries.lock().unwrap();
        let entry = retries.entry(peer_id).or_insert(RetryState {
            consecutive_failures: 0,
            next_attempt_after: Instant::now(),
        });
        entry.consecutive_failures += 1;
        let backoff_secs = 2u64.saturating_pow(entry.consecutive_failures.min(10)).min(300);
        entry.next_attempt_after = Instant::now() + Duration::from_secs(backoff_secs);
        info!(backoff_secs, "peer session failed, backing off");
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
