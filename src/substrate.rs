//! Local producer/consumer interface (§6): `submit`, `subscribe`, `fetch`,
//! `deliveryStatus`, plus the admission pipeline shared by local submission
//! and bundles arriving from a peer session.

use crate::config::NodeConfig;
use crate::crypto::Keypair;
use crate::error::{AuthError, PolicyError, SubstrateError, ValidationError};
use crate::evictor::Evictor;
use crate::forwarding::ForwardingEngine;
use crate::keyring::Keyring;
use crate::peers::PeerTable;
use crate::receipts::ReceiptEmitter;
use crate::store::{Storage, StoreError};
use crate::sweeper::Sweeper;
use crate::types::{now_millis, BundleEnvelope, BundleId, BundleRequest, Queue, ReceiptKind, ReceiptRecord};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub type DeliveryCallback = Arc<dyn Fn(BundleEnvelope) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

struct Subscription {
    topic_filter: String,
    callback: DeliveryCallback,
}

impl Subscription {
    fn matches(&self, topic: &str) -> bool {
        match self.topic_filter.strip_suffix('*') {
            Some(prefix) => topic.starts_with(prefix),
            None => self.topic_filter == topic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted(Queue),
    Duplicate,
}

const MAX_SUBSCRIBER_RETRIES: u32 = 6;

pub struct Substrate {
    pub storage: Arc<Storage>,
    pub keyring: Arc<Mutex<Keyring>>,
    pub peers: Arc<PeerTable>,
    pub forwarding: Arc<ForwardingEngine>,
    pub receipts: Arc<ReceiptEmitter>,
    pub config: NodeConfig,
    node_key: Arc<Keypair>,
    subscriptions: Mutex<Vec<(String, Subscription)>>,
    next_sub_id: AtomicU64,
    evictor: Arc<Evictor>,
}

impl Substrate {
    pub fn new(storage: Arc<Storage>, node_key: Keypair, config: NodeConfig) -> Arc<Self> {
        let node_key = Arc::new(node_key);
        let keyring = Arc::new(Mutex::new(Keyring::new()));
        let peers = Arc::new(PeerTable::new());
        let forwarding = Arc::new(ForwardingEngine::new(storage.clone(), keyring.clone(), peers.clone(), config.forwarding));
        let receipts = Arc::new(ReceiptEmitter::new(storage.clone(), Keypair::from_secret_bytes(&node_key.secret_bytes())));
        let evictor = Arc::new(Evictor::new(storage.clone(), receipts.clone(), config.cache_budget_bytes, config.evictor_period));

        Arc::new(Self {
            storage,
            keyring,
            peers,
            forwarding,
            receipts,
            config,
            node_key,
            subscriptions: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
            evictor,
        })
    }

    pub fn node_id(&self) -> crate::types::PeerId {
        *self.node_key.public_key()
    }

    /// Starts the sweeper and evictor background tasks, returning their
    /// handles and a shutdown sender. Sending `true` on the sender tells both
    /// tasks to stop after their current tick; the handles only resolve once
    /// that in-flight tick has finished.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> (Vec<tokio::task::JoinHandle<()>>, tokio::sync::watch::Sender<bool>) {
        let sweeper = Arc::new(Sweeper::new(
            self.storage.clone(),
            self.receipts.clone(),
            self.config.sweep_period,
            self.config.grace_window,
        ));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handles = vec![sweeper.spawn(shutdown_rx.clone()), self.evictor.clone().spawn(shutdown_rx)];
        (handles, shutdown_tx)
    }

    /// `submit(bundleRequest)`: sign, compute id, enforce `canProduce`,
    /// write to `outbox`. Exactly one of `ttl`/`expires_at` must be given.
    pub fn submit(&self, request: BundleRequest) -> Result<BundleId, SubstrateError> {
        let now = now_millis();
        let expires_at = match (request.ttl, request.expires_at) {
            (Some(ttl), None) => now + ttl.as_millis() as i64,
            (None, Some(at)) => at,
            _ => return Err(ValidationError::AmbiguousExpiry.into()),
        };
        if expires_at <= now {
            return Err(ValidationError::NonPositiveTtl.into());
        }

        if !self.keyring.lock().unwrap().can_produce(self.node_key.public_key(), request.audience) {
            return Err(AuthError::ProducerNotAuthorizedForAudience.into());
        }

        let mut env = BundleEnvelope {
            bundle_id: [0u8; 32],
            producer: *self.node_key.public_key(),
            created_at: now,
            expires_at,
            priority: request.priority,
            audience: request.audience,
            topic: request.topic,
            payload_type: request.payload_type,
            payload: request.payload,
            hop_limit: request.hop_limit.unwrap_or(DEFAULT_HOP_LIMIT),
            receipt_policy: request.receipt_policy,
            signature: [0u8; 64],
        };
        let canonical = crate::crypto::canonicalize(&env);
        env.bundle_id = crate::crypto::sha3(&canonical);
        env.signature = self.node_key.sign(&canonical);

        self.storage.enqueue(&env, Queue::Outbox, now)?;
        self.evictor.run_once()?;
        info!(bundle_id = %hex::encode(env.bundle_id), "submitted");
        Ok(env.bundle_id)
    }

    pub fn subscribe(self: &Arc<Self>, topic_filter: impl Into<String>, callback: DeliveryCallback) -> String {
        let id = format!("sub-{}", self.next_sub_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .lock()
            .unwrap()
            .push((id.clone(), Subscription { topic_filter: topic_filter.into(), callback }));
        id
    }

    pub fn unsubscribe(&self, sub_id: &str) {
        self.subscriptions.lock().unwrap().retain(|(id, _)| id != sub_id);
    }

    pub fn fetch(&self, id: &BundleId) -> Result<Option<BundleEnvelope>, SubstrateError> {
        Ok(self.storage.get(id)?.map(|(env, _)| env))
    }

    pub fn delivery_status(&self, id: &BundleId) -> Result<Vec<ReceiptRecord>, SubstrateError> {
        Ok(self.receipts.delivery_status(id)?)
    }

    /// Full admission pipeline for a bundle arriving from a peer (§4.9),
    /// in the order specified: size, verify, id match, canProduce,
    /// hop limit, duplicate, (already-purged ids are simply no longer
    /// "already present", so no separate tombstone tracking is needed —
    /// see DESIGN.md).
    pub async fn admit_remote(self: &Arc<Self>, env: BundleEnvelope) -> Result<AdmissionOutcome, SubstrateError> {
        let now = now_millis();

        if env.payload_bytes() as u64 > crate::config::MAX_PAYLOAD_BYTES {
            self.quarantine(env, "payload too large", now)?;
            return Err(PolicyError::PayloadTooLarge.into());
        }
        if let Err(e) = crate::crypto::verify(&env) {
            let reason = format!("integrity: {e}");
            self.quarantine(env, &reason, now)?;
            return Err(e.into());
        }
        if !self.keyring.lock().unwrap().can_produce(&env.producer, env.audience) {
            self.quarantine(env, "producer not authorized for audience", now)?;
            return Err(AuthError::ProducerNotAuthorizedForAudience.into());
        }
        if env.expires_at <= now {
            self.quarantine(env, "expired on arrival", now)?;
            return Err(PolicyError::Expired.into());
        }
        if self.storage.contains(&env.bundle_id)? {
            // Duplicate absorption (§4.7, §8 property 9): stored once, the
            // caller still ACKs so the sender updates `peersSeen`.
            return Ok(AdmissionOutcome::Duplicate);
        }

        let queue = self.route_on_admission(&env);
        self.storage.enqueue(&env, queue, now)?;
        self.evictor.run_once()?;

        if env.receipt_policy.contains(&ReceiptKind::Received) {
            self.receipts.emit(&env, ReceiptKind::Received, now)?;
        }

        if queue == Queue::Inbox {
            self.dispatch_to_subscribers(env.clone()).await;
        }
        Ok(AdmissionOutcome::Admitted(queue))
    }

    fn route_on_admission(&self, _env: &BundleEnvelope) -> Queue {
        // Everything lands in `inbox` first; subscriber matching (below)
        // promotes it to `delivered`, and it remains forward-eligible via
        // `pending` regardless, set once subscriber dispatch completes.
        Queue::Inbox
    }

    async fn dispatch_to_subscribers(self: &Arc<Self>, env: BundleEnvelope) {
        let now = now_millis();
        let matching: Vec<(String, DeliveryCallback)> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter().filter(|(_, s)| s.matches(&env.topic)).map(|(id, s)| (id.clone(), s.callback.clone())).collect()
        };

        if matching.is_empty() {
            // No local subscriber: still forward-eligible.
            if let Err(e) = self.storage.move_bundle(&env.bundle_id, Queue::Inbox, Queue::Pending, now) {
                warn!(error = %e, "failed to move unsubscribed bundle to pending");
            }
            return;
        }

        let mut delivered_ids = Vec::new();
        let mut pending_retry = Vec::new();
        for (sub_id, callback) in matching {
            if callback(env.clone()).await {
                delivered_ids.push(sub_id);
            } else {
                pending_retry.push((sub_id, callback));
            }
        }

        if !delivered_ids.is_empty() {
            let bundle_id = env.bundle_id;
            let sub_ids = delivered_ids.clone();
            if let Err(e) = self.storage.update_meta(&bundle_id, now, |m| {
                m.delivered_to.extend(sub_ids);
            }) {
                warn!(error = %e, "failed to record delivered_to");
            }
            if let Err(e) = self.storage.move_bundle(&bundle_id, Queue::Inbox, Queue::Delivered, now) {
                warn!(error = %e, "failed to move delivered bundle");
            }
            if env.receipt_policy.contains(&ReceiptKind::Delivered) {
                if let Err(e) = self.receipts.emit(&env, ReceiptKind::Delivered, now) {
                    warn!(error = %e, "failed to emit delivered receipt");
                }
            }
        } else if let Err(e) = self.storage.move_bundle(&env.bundle_id, Queue::Inbox, Queue::Pending, now) {
            warn!(error = %e, "failed to move bundle pending subscriber retry");
        }

        for (sub_id, callback) in pending_retry {
            let this = self.clone();
            let env = env.clone();
            tokio::spawn(async move { this.retry_subscriber(sub_id, callback, env).await });
        }
    }

    async fn retry_subscriber(self: Arc<Self>, sub_id: String, callback: DeliveryCallback, env: BundleEnvelope) {
        let mut delay = std::time::Duration::from_millis(500);
        for attempt in 1..=MAX_SUBSCRIBER_RETRIES {
            tokio::time::sleep(delay).await;
            if callback(env.clone()).await {
                let now = now_millis();
                let _ = self.storage.update_meta(&env.bundle_id, now, |m| {
                    m.delivered_to.insert(sub_id.clone());
                });
                if let Ok(Some(meta)) = self.storage.get_meta(&env.bundle_id) {
                    if meta.queue != Queue::Delivered {
                        let _ = self.storage.move_bundle(&env.bundle_id, meta.queue, Queue::Delivered, now);
                    }
                }
                if env.receipt_policy.contains(&ReceiptKind::Delivered) {
                    let _ = self.receipts.emit(&env, ReceiptKind::Delivered, now);
                }
                return;
            }
            warn!(sub_id, attempt, "subscriber callback failed, retrying");
            delay *= 2;
        }
    }

    fn quarantine(self: &Arc<Self>, mut env: BundleEnvelope, reason: &str, now: i64) -> Result<(), SubstrateError> {
        warn!(bundle_id = %hex::encode(env.bundle_id), reason, "quarantined");
        // A bundle that failed verification may carry a forged `bundle_id`;
        // recompute from canonical bytes so duplicate quarantine entries for
        // the same malformed input collapse rather than accumulating.
        let canonical = crate::crypto::canonicalize(&env);
        env.bundle_id = crate::crypto::sha3(&canonical);
        match self.storage.enqueue(&env, Queue::Quarantine, now) {
            Ok(()) => {}
            Err(StoreError::Duplicate) => {}
            Err(e) => return Err(e.into()),
        }
        self.storage.update_meta(&env.bundle_id, now, |m| {
            m.quarantine_reason = Some(reason.to_string());
        })?;
        Ok(())
    }
}

const DEFAULT_HOP_LIMIT: u32 = 8;
