//! Forwarding Engine: selects bundles from the live, forward-eligible
//! queues to offer a given peer, respecting priority, hop limit,
//! per-bundle duplicate suppression, audience visibility, and the node's
//! configured forwarding scope.

use crate::config::ForwardingScope;
use crate::keyring::Keyring;
use crate::peers::PeerTable;
use crate::store::Storage;
use crate::types::{BundleEnvelope, BundleId, PeerId, Priority, PublicKey, Queue};
use std::sync::{Arc, Mutex};

pub struct ForwardingEngine {
    storage: Arc<Storage>,
    keyring: Arc<Mutex<Keyring>>,
    peers: Arc<PeerTable>,
    scope: ForwardingScope,
}

/// Queues scanned for a given scope. `delivered` is forward-eligible in
/// general (SPEC_FULL.md §4.6) — a bundle already delivered to one local
/// subscriber may still need relaying on to other nodes — but the
/// `OutboxAndPending` and `PendingPrioritized` presets intentionally narrow
/// the pool per the role preset table.
fn queues_for_scope(scope: ForwardingScope) -> &'static [Queue] {
    match scope {
        ForwardingScope::OutboxAndPending => &[Queue::Outbox, Queue::Pending],
        ForwardingScope::PendingPrioritized => &[Queue::Pending],
        ForwardingScope::All | ForwardingScope::EmergencyOnly => &[Queue::Outbox, Queue::Pending, Queue::Delivered],
    }
}

impl ForwardingEngine {
    pub fn new(storage: Arc<Storage>, keyring: Arc<Mutex<Keyring>>, peers: Arc<PeerTable>, scope: ForwardingScope) -> Self {
        Self { storage, keyring, peers, scope }
    }

    /// `selectFor(peerId, budgetBytes) -> ordered list of bundleIds`.
    pub fn select_for(
        &self,
        peer_id: PeerId,
        peer_key: &PublicKey,
        budget_bytes: u64,
    ) -> Result<Vec<BundleId>, crate::store::StoreError> {
        let now = crate::types::now_millis();
        let effectiveness_boost = self.peers.effectiveness(&peer_id);
        let keyring = self.keyring.lock().unwrap();

        let mut candidates: Vec<BundleEnvelope> = Vec::new();
        for &queue in queues_for_scope(self.scope) {
            for id in self.storage.list_by_queue(queue, usize::MAX)? {
                let Some((env, meta)) = self.storage.get(&id)? else { continue };

                if self.scope == ForwardingScope::EmergencyOnly && env.priority != Priority::Emergency {
                    continue; // constrained nodes relay emergency traffic only
                }
                if meta.hops_seen >= env.hop_limit + 1 {
                    continue; // rule 1
                }
                if meta.peers_seen.contains(&peer_id) {
                    continue; // rule 2
                }
                if !keyring.can_receive(peer_key, env.audience) {
                    continue; // rule 3
                }
                if env.expires_at <= now {
                    continue; // about to be swept; do not offer a dead bundle
                }
                candidates.push(env);
            }
        }
        drop(keyring);

        // (priority asc == "emergency first", expiresAt asc, effectivenessBoost
        // desc [constant per call, see peers.rs], bundleId asc for
        // cross-implementation-reproducible determinism).
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.expires_at.cmp(&b.expires_at))
                .then(effectiveness_boost.partial_cmp(&effectiveness_boost).unwrap())
                .then(a.bundle_id.cmp(&b.bundle_id))
        });

        let mut out = Vec::new();
        let mut used = 0u64;
        for env in candidates {
            let size = env.payload_bytes() as u64;
            if used + size > budget_bytes {
                continue; // greedy-fill: skip bundles that don't fit, keep trying smaller ones
            }
            used += size;
            out.push(env.bundle_id);
        }
        Ok(out)
    }

    /// `onPeerAcked(peerId, bundleId)`: updates `peersSeen`, increments
    /// effectiveness counters.
    pub fn on_peer_acked(&self, peer_id: PeerId, bundle_id: &BundleId) -> Result<(), crate::store::StoreError> {
        let now = crate::types::now_millis();
        self.storage.update_meta(bundle_id, now, |m| {
            m.peers_seen.insert(peer_id);
        })?;
        self.peers.record_delivered_to_them(peer_id, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::keyring::KeyringName;
    use crate::types::{Audience, Priority};
    use std::collections::BTreeSet;

    fn signed(kp: &Keypair, priority: Priority, audience: Audience, hop_limit: u32) -> BundleEnvelope {
        let mut env = BundleEnvelope {
            bundle_id: [0u8; 32],
            producer: *kp.public_key(),
            created_at: 0,
            expires_at: 1_000_000,
            priority,
            audience,
            topic: "t".into(),
            payload_type: "x".into(),
            payload: vec![1, 2, 3],
            hop_limit,
            receipt_policy: BTreeSet::new(),
            signature: [0u8; 64],
        };
        let canonical = crate::crypto::canonicalize(&env);
        env.bundle_id = crate::crypto::sha3(&canonical);
        env.signature = kp.sign(&canonical);
        env
    }

    fn setup() -> (tempfile::TempDir, Arc<Storage>, Arc<Mutex<Keyring>>, Arc<PeerTable>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let keyring = Arc::new(Mutex::new(Keyring::new()));
        let peers = Arc::new(PeerTable::new());
        (dir, storage, keyring, peers)
    }

    #[test]
    fn excludes_peers_seen_and_hop_exhausted() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring, peers, ForwardingScope::All);
        let peer_key = [9u8; 32];
        let peer_id = peer_key;

        let mut seen = signed(&kp, Priority::Normal, Audience::Public, 3);
        seen.payload = vec![1];
        let canonical = crate::crypto::canonicalize(&seen);
        seen.bundle_id = crate::crypto::sha3(&canonical);
        seen.signature = kp.sign(&canonical);
        storage.enqueue(&seen, Queue::Pending, 0).unwrap();
        storage.update_meta(&seen.bundle_id, 1, |m| { m.peers_seen.insert(peer_id); }).unwrap();

        let mut exhausted = signed(&kp, Priority::Normal, Audience::Public, 0);
        exhausted.payload = vec![2];
        let canonical = crate::crypto::canonicalize(&exhausted);
        exhausted.bundle_id = crate::crypto::sha3(&canonical);
        exhausted.signature = kp.sign(&canonical);
        storage.enqueue(&exhausted, Queue::Pending, 0).unwrap();
        storage.update_meta(&exhausted.bundle_id, 1, |m| { m.hops_seen = 1; }).unwrap();

        let mut fresh = signed(&kp, Priority::Normal, Audience::Public, 3);
        fresh.payload = vec![3];
        let canonical = crate::crypto::canonicalize(&fresh);
        fresh.bundle_id = crate::crypto::sha3(&canonical);
        fresh.signature = kp.sign(&canonical);
        storage.enqueue(&fresh, Queue::Pending, 0).unwrap();

        let selected = engine.select_for(peer_id, &peer_key, 1_000_000).unwrap();
        assert_eq!(selected, vec![fresh.bundle_id]);
    }

    #[test]
    fn emergency_preempts_within_selection() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring, peers, ForwardingScope::All);
        let peer_key = [7u8; 32];

        let low = signed(&kp, Priority::Low, Audience::Public, 3);
        storage.enqueue(&low, Queue::Pending, 0).unwrap();
        let emergency = signed(&kp, Priority::Emergency, Audience::Public, 3);
        storage.enqueue(&emergency, Queue::Pending, 1).unwrap();

        let selected = engine.select_for(peer_key, &peer_key, 1_000_000).unwrap();
        assert_eq!(selected[0], emergency.bundle_id);
    }

    #[test]
    fn audience_filter_excludes_unentitled_peer() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring.clone(), peers, ForwardingScope::All);
        let peer_key = [3u8; 32];

        let private = signed(&kp, Priority::Normal, Audience::Private, 3);
        storage.enqueue(&private, Queue::Pending, 0).unwrap();

        let selected = engine.select_for(peer_key, &peer_key, 1_000_000).unwrap();
        assert!(selected.is_empty());

        keyring.lock().unwrap().add(KeyringName::Verified, peer_key, 0, None).unwrap();
        let selected = engine.select_for(peer_key, &peer_key, 1_000_000).unwrap();
        assert_eq!(selected, vec![private.bundle_id]);
    }

    #[test]
    fn greedy_fill_respects_budget() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring, peers, ForwardingScope::All);
        let peer_key = [2u8; 32];

        for i in 0..5u8 {
            let mut env = signed(&kp, Priority::Normal, Audience::Public, 3);
            env.payload = vec![1, 2, 3, i];
            let canonical = crate::crypto::canonicalize(&env);
            env.bundle_id = crate::crypto::sha3(&canonical);
            env.signature = kp.sign(&canonical);
            storage.enqueue(&env, Queue::Pending, 0).unwrap();
        }
        // Each envelope's payload is 4 bytes; budget of 8 fits exactly 2.
        let selected = engine.select_for(peer_key, &peer_key, 8).unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn delivered_bundles_remain_forward_eligible() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring, peers, ForwardingScope::All);
        let peer_key = [5u8; 32];

        let delivered = signed(&kp, Priority::Normal, Audience::Public, 3);
        storage.enqueue(&delivered, Queue::Inbox, 0).unwrap();
        storage.move_bundle(&delivered.bundle_id, Queue::Inbox, Queue::Delivered, 1).unwrap();

        let selected = engine.select_for(peer_key, &peer_key, 1_000_000).unwrap();
        assert_eq!(selected, vec![delivered.bundle_id]);
    }

    #[test]
    fn emergency_only_scope_filters_out_lower_priority() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring, peers, ForwardingScope::EmergencyOnly);
        let peer_key = [6u8; 32];

        let normal = signed(&kp, Priority::Normal, Audience::Public, 3);
        storage.enqueue(&normal, Queue::Pending, 0).unwrap();
        let emergency = signed(&kp, Priority::Emergency, Audience::Public, 3);
        storage.enqueue(&emergency, Queue::Pending, 1).unwrap();

        let selected = engine.select_for(peer_key, &peer_key, 1_000_000).unwrap();
        assert_eq!(selected, vec![emergency.bundle_id]);
    }

    #[test]
    fn outbox_and_pending_scope_excludes_delivered() {
        let (_dir, storage, keyring, peers) = setup();
        let kp = Keypair::generate();
        let engine = ForwardingEngine::new(storage.clone(), keyring, peers, ForwardingScope::OutboxAndPending);
        let peer_key = [8u8; 32];

        let delivered = signed(&kp, Priority::Normal, Audience::Public, 3);
        storage.enqueue(&delivered, Queue::Inbox, 0).unwrap();
        storage.move_bundle(&delivered.bundle_id, Queue::Inbox, Queue::Delivered, 1).unwrap();

        let selected = engine.select_for(peer_key, &peer_key, 1_000_000).unwrap();
        assert!(selected.is_empty());
    }
}
