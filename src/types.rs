//! Core data model: bundle envelopes, queues, priorities, audiences.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 32-byte content hash (SHA3-256), used for `bundleId` and peer identity.
pub type Hash = [u8; 32];

/// Ed25519 verifying key bytes. Doubles as peer identity: a peer's id is
/// its public key, there is no separate namespace to keep in sync.
pub type PublicKey = [u8; 32];

/// Detached Ed25519 signature bytes.
pub type Signature = [u8; 64];

pub type BundleId = Hash;
pub type PeerId = PublicKey;

/// Forwarding priority, strictly ordered `Emergency > Perishable > Normal > Low`.
///
/// Declaration order doubles as rank order: `Priority::Emergency < Priority::Low`
/// under the derived `Ord`, so sorting candidates ascending by priority already
/// yields "emergency first" without an explicit reversal at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Emergency,
    Perishable,
    Normal,
    Low,
}

impl Priority {
    /// Weight used by the cache evictor's utility score. Higher survives longer.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Emergency => 8.0,
            Priority::Perishable => 4.0,
            Priority::Normal => 2.0,
            Priority::Low => 1.0,
        }
    }
}

/// Producer-declared visibility class, enforced by keyring membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Audience {
    Public,
    Local,
    Trusted,
    Private,
}

/// The six queues a bundle can occupy. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Queue {
    Inbox,
    Outbox,
    Pending,
    Delivered,
    Expired,
    Quarantine,
}

impl Queue {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Queue::Inbox | Queue::Outbox | Queue::Pending | Queue::Delivered
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Queue::Inbox => "inbox",
            Queue::Outbox => "outbox",
            Queue::Pending => "pending",
            Queue::Delivered => "delivered",
            Queue::Expired => "expired",
            Queue::Quarantine => "quarantine",
        }
    }
}

/// One of the four subscribable receipt kinds a producer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReceiptKind {
    Received,
    Forwarded,
    Delivered,
    Expired,
}

pub const RECEIPT_PAYLOAD_TYPE: &str = "trust:Receipt";
pub const KEYRING_EXPORT_PAYLOAD_TYPE: &str = "trust:KeyringExport";

/// Immutable, signed bundle envelope. Once `signature` is set, every other
/// field is frozen — mutation happens only to the out-of-band `BundleMeta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEnvelope {
    pub bundle_id: BundleId,
    pub producer: PublicKey,
    pub created_at: i64,
    pub expires_at: i64,
    pub priority: Priority,
    pub audience: Audience,
    pub topic: String,
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub hop_limit: u32,
    pub receipt_policy: BTreeSet<ReceiptKind>,
    pub signature: Signature,
}

impl BundleEnvelope {
    pub fn payload_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// Mutable, unsigned metadata tracked alongside a bundle. Never part of the
/// signed envelope and never transmitted as part of `DELIVER` payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub queue: Queue,
    pub enqueue_at: i64,
    pub hops_seen: u32,
    pub peers_seen: BTreeSet<PeerId>,
    pub delivered_to: BTreeSet<String>,
    pub last_touched: i64,
    pub expired_at: Option<i64>,
    pub quarantine_reason: Option<String>,
}

impl BundleMeta {
    pub fn fresh(queue: Queue, now: i64) -> Self {
        Self {
            queue,
            enqueue_at: now,
            hops_seen: 0,
            peers_seen: BTreeSet::new(),
            delivered_to: BTreeSet::new(),
            last_touched: now,
            expired_at: None,
            quarantine_reason: None,
        }
    }
}

/// A producer's request to submit a new bundle, before signing.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub priority: Priority,
    pub audience: Audience,
    pub topic: String,
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub ttl: Option<std::time::Duration>,
    pub expires_at: Option<i64>,
    pub hop_limit: Option<u32>,
    pub receipt_policy: BTreeSet<ReceiptKind>,
}

/// A single observed receipt event, as returned by `deliveryStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub kind: ReceiptKind,
    pub node_id: PeerId,
    pub at: i64,
}

/// Peer record persisted in the `peers` table: identity, contact history,
/// and a decaying forwarding-effectiveness score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub first_seen: i64,
    pub last_contact: i64,
    pub delivered_to_us: u64,
    pub delivered_to_them: u64,
    pub effectiveness: f64,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, public_key: PublicKey, now: i64) -> Self {
        Self {
            peer_id,
            public_key,
            first_seen: now,
            last_contact: now,
            delivered_to_us: 0,
            delivered_to_them: 0,
            effectiveness: 0.0,
        }
    }
}

/// Current UTC time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_emergency_first() {
        let mut ps = vec![Priority::Low, Priority::Normal, Priority::Emergency, Priority::Perishable];
        ps.sort();
        assert_eq!(
            ps,
            vec![Priority::Emergency, Priority::Perishable, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn queue_is_live() {
        assert!(Queue::Inbox.is_live());
        assert!(Queue::Delivered.is_live());
        assert!(!Queue::Expired.is_live());
        assert!(!Queue::Quarantine.is_live());
    }
}
