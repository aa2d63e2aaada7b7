//! Receipt subsystem: emits signed acknowledgment bundles for requested
//! receipt kinds, and answers `deliveryStatus` from locally observed
//! receipts. Receipts are ordinary bundles with `payloadType =
//! "trust:Receipt"` and a reserved topic `receipt:<hex bundleId>` so
//! `deliveryStatus` can reuse the store's topic index instead of a full
//! queue scan.

use crate::crypto::Keypair;
use crate::store::{Storage, StoreError};
use crate::types::{
    BundleEnvelope, BundleId, PeerId, Priority, Queue, ReceiptKind, ReceiptRecord, RECEIPT_PAYLOAD_TYPE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceiptPayload {
    referenced_bundle_id: BundleId,
    kind: ReceiptKind,
    node_id: PeerId,
    at: i64,
}

pub fn receipt_topic(referenced: &BundleId) -> String {
    format!("receipt:{}", hex::encode(referenced))
}

/// Caps a receipt's priority at `normal` — an `emergency` or `perishable`
/// bundle's receipt never itself preempts as emergency traffic.
fn receipt_priority(original: Priority) -> Priority {
    match original {
        Priority::Emergency | Priority::Perishable => Priority::Normal,
        other => other,
    }
}

pub struct ReceiptEmitter {
    storage: Arc<Storage>,
    node_key: Keypair,
}

impl ReceiptEmitter {
    pub fn new(storage: Arc<Storage>, node_key: Keypair) -> Self {
        Self { storage, node_key }
    }

    pub fn node_id(&self) -> PeerId {
        *self.node_key.public_key()
    }

    /// Emit a receipt of `kind` for bundle `original`, if its `receipt_policy`
    /// requested that kind. No-op (not an error) if it was not requested.
    pub fn emit(&self, original: &BundleEnvelope, kind: ReceiptKind, now: i64) -> Result<(), StoreError> {
        if !original.receipt_policy.contains(&kind) {
            return Ok(());
        }

        let payload = ReceiptPayload {
            referenced_bundle_id: original.bundle_id,
            kind,
            node_id: self.node_id(),
            at: now,
        };
        let payload_bytes = bincode::serialize(&payload).map_err(StoreError::Encoding)?;

        let mut env = BundleEnvelope {
            bundle_id: [0u8; 32],
            producer: *self.node_key.public_key(),
            created_at: now,
            expires_at: now + original.expires_at.saturating_sub(original.created_at).max(60_000),
            priority: receipt_priority(original.priority),
            audience: original.audience,
            topic: receipt_topic(&original.bundle_id),
            payload_type: RECEIPT_PAYLOAD_TYPE.to_string(),
            payload: payload_bytes,
            hop_limit: original.hop_limit.div_ceil(2).max(1),
            receipt_policy: BTreeSet::new(),
            signature: [0u8; 64],
        };
        let canonical = crate::crypto::canonicalize(&env);
        env.bundle_id = crate::crypto::sha3(&canonical);
        env.signature = self.node_key.sign(&canonical);

        match self.storage.enqueue(&env, Queue::Outbox, now) {
            Ok(()) | Err(StoreError::Duplicate) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Assemble `deliveryStatus(bundleId)` from locally observed receipts —
    /// any bundle in this node's store with the reserved receipt topic for
    /// `bundle_id`, decoded back into `(kind, nodeId, at)`.
    pub fn delivery_status(&self, bundle_id: &BundleId) -> Result<Vec<ReceiptRecord>, StoreError> {
        let topic = receipt_topic(bundle_id);
        let mut out = Vec::new();
        for id in self.storage.list_by_topic(&topic, 0)? {
            let Some((env, _meta)) = self.storage.get(&id)? else { continue };
            if env.payload_type != RECEIPT_PAYLOAD_TYPE {
                continue;
            }
            let Ok(payload) = bincode::deserialize::<ReceiptPayload>(&env.payload) else { continue };
            if payload.referenced_bundle_id != *bundle_id {
                continue;
            }
            out.push(ReceiptRecord { kind: payload.kind, node_id: payload.node_id, at: payload.at });
        }
        out.sort_by_key(|r| r.at);
        Ok(out)
    }
}
