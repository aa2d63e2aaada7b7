//! TTL Sweeper: periodic task moving expired bundles to `expired`, then
//! purging them after a grace window. Runs as a long-lived background task
//! on a fixed timer; never holds a cross-queue lock longer than one
//! bundle's worth of work.

use crate::receipts::ReceiptEmitter;
use crate::store::Storage;
use crate::types::{Queue, ReceiptKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Sweeper {
    storage: Arc<Storage>,
    receipts: Arc<ReceiptEmitter>,
    period: Duration,
    grace_window: Duration,
}

impl Sweeper {
    pub fn new(storage: Arc<Storage>, receipts: Arc<ReceiptEmitter>, period: Duration, grace_window: Duration) -> Self {
        Self { storage, receipts, period, grace_window }
    }

    /// Spawn the sweeper as a background task; returns its `JoinHandle` so
    /// the caller can await graceful shutdown. `shutdown` is checked between
    /// ticks only, so a signaled shutdown always lets the in-flight tick
    /// finish before the task returns.
    pub fn spawn(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick() {
                            warn!(error = %e, "sweep tick failed");
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

    pub fn tick(&self) -> Result<(), crate::store::StoreError> {
        let now = crate::types::now_millis();
        self.expire_due(now)?;
        self.purge_graced(now)?;
        Ok(())
    }

    fn expire_due(&self, now: i64) -> Result<(), crate::store::StoreError> {
        let expiring = self.storage.list_expiring(now)?;
        for id in expiring {
            let Some((env, meta)) = self.storage.get(&id)? else { continue };
            if !meta.queue.is_live() {
                continue;
            }
            self.storage.move_bundle(&id, meta.queue, Queue::Expired, now)?;
            debug!(bundle_id = %hex::encode(id), from = meta.queue.as_str(), "expired");
            if env.receipt_policy.contains(&ReceiptKind::Expired) {
                self.receipts.emit(&env, ReceiptKind::Expired, now)?;
            }
        }
        Ok(())
    }

    fn purge_graced(&self, now: i64) -> Result<(), crate::store::StoreError> {
        let grace_ms = self.grace_window.as_millis() as i64;
        let cutoff = now - grace_ms;
        let candidates = self.storage.list_expired_since(cutoff)?;
        for id in candidates {
            // Purging is idempotent: if a concurrent purge already removed
            // it, `purge` errors with NotFound and we just move on.
            match self.storage.purge(&id) {
                Ok(()) => info!(bundle_id = %hex::encode(id), "purged after grace window"),
                Err(crate::store::StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::receipts::ReceiptEmitter;
    use crate::types::{Audience, BundleEnvelope, Priority};
    use std::collections::BTreeSet;

    fn signed_envelope(kp: &Keypair, expires_at: i64, policy: BTreeSet<ReceiptKind>) -> BundleEnvelope {
        let mut env = BundleEnvelope {
            bundle_id: [0u8; 32],
            producer: *kp.public_key(),
            created_at: 0,
            expires_at,
            priority: Priority::Normal,
            audience: Audience::Public,
            topic: "t".into(),
            payload_type: "x".into(),
            payload: vec![1, 2, 3],
            hop_limit: 3,
            receipt_policy: policy,
            signature: [0u8; 64],
        };
        let canonical = crate::crypto::canonicalize(&env);
        env.bundle_id = crate::crypto::sha3(&canonical);
        env.signature = kp.sign(&canonical);
        env
    }

    #[test]
    fn expires_and_purges_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let kp = Keypair::generate();
        let node_key = Keypair::generate();
        let receipts = Arc::new(ReceiptEmitter::new(storage.clone(), node_key));

        let env = signed_envelope(&kp, 100, [ReceiptKind::Expired].into_iter().collect());
        storage.enqueue(&env, Queue::Inbox, 0).unwrap();

        let sweeper = Sweeper::new(storage.clone(), receipts, Duration::from_secs(60), Duration::from_millis(500));
        let now = 200;
        sweeper.expire_due(now).unwrap();
        let (_, meta) = storage.get(&env.bundle_id).unwrap().unwrap();
        assert_eq!(meta.queue, Queue::Expired);

        sweeper.purge_graced(now).unwrap();
        assert!(storage.get(&env.bundle_id).unwrap().is_some(), "not past grace yet");

        sweeper.purge_graced(now + 1_000).unwrap();
        assert!(storage.get(&env.bundle_id).unwrap().is_none());
    }
}
