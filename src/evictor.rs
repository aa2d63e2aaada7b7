//! Cache Evictor: enforces a total live-bytes budget across all queues.
//! Runs reactively after every enqueue and proactively on a timer. A bundle
//! that is `emergency` and still within TTL is never evicted while any
//! non-emergency live bundle exists — such bundles can only leave the
//! store via TTL expiry.

use crate::receipts::ReceiptEmitter;
use crate::store::Storage;
use crate::types::{BundleEnvelope, BundleId, BundleMeta, Priority, Queue, ReceiptKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_PAYLOAD_REFERENCE_BYTES: f64 = 1_048_576.0; // 1 MiB, the `maxPayload` normalizer in the utility score

const W_PRI: f64 = 1.0;
const W_AGE: f64 = 1.0;
const W_DEL: f64 = 1.0;
const W_FWD: f64 = 1.0;
const W_SZ: f64 = 0.5;

pub struct Evictor {
    storage: Arc<Storage>,
    receipts: Arc<ReceiptEmitter>,
    budget_bytes: u64,
    period: Duration,
}

impl Evictor {
    pub fn new(storage: Arc<Storage>, receipts: Arc<ReceiptEmitter>, budget_bytes: u64, period: Duration) -> Self {
        Self { storage, receipts, budget_bytes, period }
    }

    /// `shutdown` is checked between ticks only, so a signaled shutdown
    /// always lets an in-flight eviction pass finish before returning.
    pub fn spawn(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once() {
                            warn!(error = %e, "eviction pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Called reactively right after an enqueue, and proactively on a timer.
    pub fn run_once(&self) -> Result<(), crate::store::StoreError> {
        let now = crate::types::now_millis();
        while self.storage.live_bytes() > self.budget_bytes {
            let Some((id, env)) = self.pick_victim(now)? else {
                warn!(live_bytes = self.storage.live_bytes(), budget = self.budget_bytes, "over budget, nothing evictable");
                break;
            };
            self.evict_one(&id, &env, now)?;
        }
        Ok(())
    }

    fn live_candidates(&self) -> Result<Vec<(BundleId, BundleEnvelope, BundleMeta)>, crate::store::StoreError> {
        let mut out = Vec::new();
        for queue in [Queue::Inbox, Queue::Outbox, Queue::Pending, Queue::Delivered] {
            for id in self.storage.list_by_queue(queue, usize::MAX)? {
                if let Some((env, meta)) = self.storage.get(&id)? {
                    out.push((id, env, meta));
                }
            }
        }
        Ok(out)
    }

    fn pick_victim(&self, now: i64) -> Result<Option<(BundleId, BundleEnvelope)>, crate::store::StoreError> {
        let all = self.live_candidates()?;
        let any_non_emergency = all.iter().any(|(_, env, _)| env.priority != Priority::Emergency || env.expires_at <= now);

        let mut scored: Vec<(f64, i64, BundleId, BundleEnvelope)> = all
            .into_iter()
            .filter(|(_, env, _)| {
                let emergency_and_live = env.priority == Priority::Emergency && env.expires_at > now;
                !(emergency_and_live && any_non_emergency)
            })
            .map(|(id, env, meta)| (utility_score(&env, &meta, now), meta.last_touched, id, env))
            .collect();

        // Lowest utility first; ties broken by oldest `lastTouched`.
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));

        Ok(scored.into_iter().next().map(|(_, _, id, env)| (id, env)))
    }

    fn evict_one(&self, id: &BundleId, env: &BundleEnvelope, now: i64) -> Result<(), crate::store::StoreError> {
        let evicted = self.storage.evict(id)?;
        info!(bundle_id = %hex::encode(id), priority = ?env.priority, "evicted under cache pressure");
        if evicted.receipt_policy.contains(&ReceiptKind::Delivered) || evicted.receipt_policy.contains(&ReceiptKind::Expired) {
            // No delivery receipt was emitted for this bundle yet (had it
            // already delivered, eviction would be a no-op for receipt
            // purposes) — emit `expired` with the diagnostic reason.
            self.receipts.emit(&evicted, ReceiptKind::Expired, now)?;
        }
        Ok(())
    }
}

/// `U = w_pri·priorityWeight + w_age·(1 - age/ttl) + w_del·notDelivered +
///      w_fwd·notPropagated - w_sz·payloadBytes/maxPayload`. Lower evicts first.
fn utility_score(env: &BundleEnvelope, meta: &BundleMeta, now: i64) -> f64 {
    let ttl = (env.expires_at - env.created_at).max(1) as f64;
    let age = ((now - env.created_at).max(0) as f64 / ttl).clamp(0.0, 1.0);
    let not_delivered = if meta.delivered_to.is_empty() { 1.0 } else { 0.0 };
    let not_propagated = if meta.hops_seen < env.hop_limit + 1 { 1.0 } else { 0.0 };
    let size_term = env.payload_bytes() as f64 / MAX_PAYLOAD_REFERENCE_BYTES;

    W_PRI * env.priority.weight() + W_AGE * (1.0 - age) + W_DEL * not_delivered + W_FWD * not_propagated - W_SZ * size_term
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use std::collections::BTreeSet;

    fn signed(kp: &Keypair, priority: Priority, created: i64, expires: i64, bytes: usize) -> BundleEnvelope {
        let mut env = BundleEnvelope {
            bundle_id: [0u8; 32],
            producer: *kp.public_key(),
            created_at: created,
            expires_at: expires,
            priority,
            audience: crate::types::Audience::Public,
            topic: "t".into(),
            payload_type: "x".into(),
            payload: vec![0u8; bytes],
            hop_limit: 3,
            receipt_policy: BTreeSet::new(),
            signature: [0u8; 64],
        };
        let canonical = crate::crypto::canonicalize(&env);
        env.bundle_id = crate::crypto::sha3(&canonical);
        env.signature = kp.sign(&canonical);
        env
    }

    fn setup() -> (tempfile::TempDir, Arc<Storage>, Arc<ReceiptEmitter>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let node_key = Keypair::generate();
        let receipts = Arc::new(ReceiptEmitter::new(storage.clone(), node_key));
        (dir, storage, receipts)
    }

    #[test]
    fn evicts_oldest_low_priority_first_under_pressure() {
        let (_dir, storage, receipts) = setup();
        let kp = Keypair::generate();

        for i in 0..10u32 {
            let env = signed(&kp, Priority::Low, i as i64, 1_000_000, 1024);
            storage.enqueue(&env, Queue::Inbox, i as i64).unwrap();
        }
        let evictor = Evictor::new(storage.clone(), receipts, 10 * 1024, Duration::from_secs(1));
        assert_eq!(storage.live_bytes(), 10 * 1024);

        let normal = signed(&kp, Priority::Normal, 100, 1_000_000, 1024);
        storage.enqueue(&normal, Queue::Inbox, 100).unwrap();
        evictor.run_once().unwrap();

        assert!(storage.live_bytes() <= 10 * 1024);
        assert_eq!(storage.queue_len(Queue::Inbox).unwrap(), 10);
    }

    #[test]
    fn emergency_protected_while_non_emergency_exists() {
        let (_dir, storage, receipts) = setup();
        let kp = Keypair::generate();

        let emergency = signed(&kp, Priority::Emergency, 0, 1_000_000, 1024);
        storage.enqueue(&emergency, Queue::Inbox, 0).unwrap();
        for i in 0..10u32 {
            let env = signed(&kp, Priority::Low, i as i64, 1_000_000, 1024);
            storage.enqueue(&env, Queue::Inbox, i as i64).unwrap();
        }

        let evictor = Evictor::new(storage.clone(), receipts, 10 * 1024, Duration::from_secs(1));
        evictor.run_once().unwrap();

        assert!(storage.get(&emergency.bundle_id).unwrap().is_some(), "emergency must survive while low-priority bundles remain");
    }
}
