//! Persistent, durable bundle store backed by `sled`. Every queue
//! transition is a single `sled` transaction across the `bundles`, `meta`,
//! and `by_queue` trees, so a crash mid-transition leaves a bundle in its
//! source queue — never nowhere, never both (data model invariant 3).
//!
//! Secondary indexes (`by_expires`, `by_topic`) are maintained outside the
//! transition transaction: their keys are derived purely from a bundle's
//! immutable envelope fields, so they are idempotent to rebuild and their
//! freshness is not part of the crash-safety invariant, only a scan
//! accelerator for the sweeper and topic lookups.

use crate::types::{BundleEnvelope, BundleId, BundleMeta, Queue};
use sled::transaction::{abort, ConflictableTransactionError, TransactionError, Transactional};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("bundle already present")]
    Duplicate,
    #[error("bundle not found")]
    NotFound,
    #[error("queue compare-and-set failed: bundle was not in the expected source queue")]
    QueueMismatch,
    #[error("bundle is not eligible for purge from its current queue")]
    IneligibleForPurge,
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("local encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => StoreError::Sled(e),
        }
    }
}

fn queue_tag(q: Queue) -> u8 {
    match q {
        Queue::Inbox => 0,
        Queue::Outbox => 1,
        Queue::Pending => 2,
        Queue::Delivered => 3,
        Queue::Expired => 4,
        Queue::Quarantine => 5,
    }
}

fn by_queue_key(q: Queue, id: &BundleId) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + 32);
    k.push(queue_tag(q));
    k.extend_from_slice(id);
    k
}

fn by_expires_key(expires_at: i64, id: &BundleId) -> Vec<u8> {
    let mut k = Vec::with_capacity(8 + 32);
    // XOR the sign bit so big-endian byte order matches numeric order for i64.
    k.extend_from_slice(&(expires_at as u64 ^ (1u64 << 63)).to_be_bytes());
    k.extend_from_slice(id);
    k
}

fn by_topic_key(topic: &str, enqueue_at: i64, id: &BundleId) -> Vec<u8> {
    let mut k = Vec::with_capacity(topic.len() + 1 + 8 + 32);
    k.extend_from_slice(topic.as_bytes());
    k.push(0u8);
    k.extend_from_slice(&(enqueue_at as u64 ^ (1u64 << 63)).to_be_bytes());
    k.extend_from_slice(id);
    k
}

pub struct Storage {
    db: sled::Db,
    bundles: sled::Tree,
    meta: sled::Tree,
    by_queue: sled::Tree,
    by_expires: sled::Tree,
    by_topic: sled::Tree,
    live_bytes: Arc<AtomicU64>,
}

impl Storage {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let bundles = db.open_tree("bundles")?;
        let meta = db.open_tree("meta")?;
        let by_queue = db.open_tree("by_queue")?;
        let by_expires = db.open_tree("by_expires")?;
        let by_topic = db.open_tree("by_topic")?;

        let mut live_bytes = 0u64;
        for kv in meta.iter() {
            let (id, raw) = kv?;
            let m: BundleMeta = bincode::deserialize(&raw)?;
            if m.queue.is_live() {
                if let Some(env_raw) = bundles.get(&id)? {
                    let env: BundleEnvelope = bincode::deserialize(&env_raw)?;
                    live_bytes += env.payload_bytes() as u64;
                }
            }
        }

        Ok(Self {
            db,
            bundles,
            meta,
            by_queue,
            by_expires,
            by_topic,
            live_bytes: Arc::new(AtomicU64::new(live_bytes)),
        })
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// `enqueue(bundle, queue) -> ok | duplicate`. Atomic with metadata
    /// initialization.
    pub fn enqueue(&self, env: &BundleEnvelope, queue: Queue, now: i64) -> Result<(), StoreError> {
        let meta = BundleMeta::fresh(queue, now);
        let env_bytes = bincode::serialize(env)?;
        let meta_bytes = bincode::serialize(&meta)?;
        let bq_key = by_queue_key(queue, &env.bundle_id);

        let trees = (&self.bundles, &self.meta, &self.by_queue);
        let result: Result<(), TransactionError<StoreError>> = trees.transaction(|(t_bundles, t_meta, t_bq)| {
            if t_bundles.get(env.bundle_id)?.is_some() {
                return Err(abort(StoreError::Duplicate));
            }
            t_bundles.insert(&env.bundle_id, env_bytes.clone())?;
            t_meta.insert(&env.bundle_id, meta_bytes.clone())?;
            t_bq.insert(bq_key.clone(), &[][..])?;
            Ok(())
        });
        result?;

        self.by_expires.insert(by_expires_key(env.expires_at, &env.bundle_id), &[][..])?;
        self.by_topic
            .insert(by_topic_key(&env.topic, now, &env.bundle_id), &[][..])?;

        if queue.is_live() {
            self.live_bytes.fetch_add(env.payload_bytes() as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    /// `move(bundleId, fromQueue, toQueue)` with compare-and-set on current
    /// queue; fails if a concurrent mover already moved it.
    pub fn move_bundle(&self, id: &BundleId, from: Queue, to: Queue, now: i64) -> Result<(), StoreError> {
        let trees = (&self.bundles, &self.meta, &self.by_queue);
        let payload_len: Arc<std::sync::Mutex<u64>> = Arc::new(std::sync::Mutex::new(0));
        let payload_len_inner = payload_len.clone();

        let result: Result<(), TransactionError<StoreError>> = trees.transaction(move |(t_bundles, t_meta, t_bq)| {
            let raw_meta = t_meta.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let mut m: BundleMeta = bincode::deserialize(&raw_meta).map_err(|e| abort(StoreError::Encoding(e)))?;
            if m.queue != from {
                return Err(abort(StoreError::QueueMismatch));
            }
            let raw_env = t_bundles.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let env: BundleEnvelope = bincode::deserialize(&raw_env).map_err(|e| abort(StoreError::Encoding(e)))?;
            *payload_len_inner.lock().unwrap() = env.payload_bytes() as u64;

            t_bq.remove(by_queue_key(from, id))?;
            t_bq.insert(by_queue_key(to, id), &[][..])?;

            m.queue = to;
            m.last_touched = now;
            if to == Queue::Expired {
                m.expired_at = Some(now);
            }
            let new_meta = bincode::serialize(&m).map_err(|e: bincode::Error| abort(StoreError::Encoding(e)))?;
            t_meta.insert(id, new_meta)?;
            Ok(())
        });
        result?;

        let len = *payload_len.lock().unwrap();
        match (from.is_live(), to.is_live()) {
            (true, false) => {
                self.live_bytes.fetch_sub(len, Ordering::SeqCst);
            }
            (false, true) => {
                self.live_bytes.fetch_add(len, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn get(&self, id: &BundleId) -> Result<Option<(BundleEnvelope, BundleMeta)>, StoreError> {
        let env_raw = match self.bundles.get(id)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let meta_raw = match self.meta.get(id)? {
            Some(v) => v,
            None => return Ok(None),
        };
        Ok(Some((bincode::deserialize(&env_raw)?, bincode::deserialize(&meta_raw)?)))
    }

    pub fn get_meta(&self, id: &BundleId) -> Result<Option<BundleMeta>, StoreError> {
        match self.meta.get(id)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: &BundleId) -> Result<bool, StoreError> {
        Ok(self.bundles.contains_key(id)?)
    }

    /// List bundle ids currently in `queue`, in `by_queue` key order — which
    /// sorts by ascending insertion-time key, not by priority (priority
    /// ordering for selection is the Forwarding Engine's job, over the
    /// envelopes this returns).
    pub fn list_by_queue(&self, queue: Queue, limit: usize) -> Result<Vec<BundleId>, StoreError> {
        let prefix = [queue_tag(queue)];
        let mut out = Vec::with_capacity(limit.min(1024));
        for kv in self.by_queue.scan_prefix(prefix) {
            let (key, _) = kv?;
            let id: BundleId = key[1..33].try_into().expect("by_queue key is tag + 32-byte id");
            out.push(id);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn list_by_topic(&self, topic: &str, since: i64) -> Result<Vec<BundleId>, StoreError> {
        let mut prefix = topic.as_bytes().to_vec();
        prefix.push(0u8);
        let mut out = Vec::new();
        for kv in self.by_topic.scan_prefix(&prefix) {
            let (key, _) = kv?;
            let enc_at = u64::from_be_bytes(key[prefix.len()..prefix.len() + 8].try_into().unwrap());
            let enqueue_at = (enc_at ^ (1u64 << 63)) as i64;
            if enqueue_at < since {
                continue;
            }
            let id: BundleId = key[prefix.len() + 8..prefix.len() + 8 + 32]
                .try_into()
                .expect("by_topic key suffix is a 32-byte id");
            out.push(id);
        }
        Ok(out)
    }

    /// Bundles in any live queue whose `expiresAt < now`, via the
    /// `by_expires` index — O(#expiring this tick), per §4.4's budget note.
    pub fn list_expiring(&self, now: i64) -> Result<Vec<BundleId>, StoreError> {
        let upper = (now as u64 ^ (1u64 << 63)).to_be_bytes();
        let mut out = Vec::new();
        for kv in self.by_expires.range(..upper.to_vec()) {
            let (key, _) = kv?;
            let id: BundleId = key[8..40].try_into().expect("by_expires key suffix is a 32-byte id");
            if let Some(meta) = self.get_meta(&id)? {
                if meta.queue.is_live() {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    pub fn list_expired_since(&self, older_than: i64) -> Result<Vec<BundleId>, StoreError> {
        let mut out = Vec::new();
        for id in self.list_by_queue(Queue::Expired, usize::MAX)? {
            if let Some(meta) = self.get_meta(&id)? {
                if meta.expired_at.is_some_and(|t| t < older_than) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    pub fn update_meta<F: FnOnce(&mut BundleMeta)>(&self, id: &BundleId, now: i64, f: F) -> Result<(), StoreError> {
        let result: Result<(), TransactionError<StoreError>> = (&self.meta,).transaction(|(t_meta,)| {
            let raw = t_meta.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let mut m: BundleMeta = bincode::deserialize(&raw).map_err(|e| abort(StoreError::Encoding(e)))?;
            f(&mut m);
            m.last_touched = now;
            let new_raw = bincode::serialize(&m).map_err(|e: bincode::Error| abort(StoreError::Encoding(e)))?;
            t_meta.insert(id, new_raw)?;
            Ok(())
        });
        result.map_err(Into::into)
    }

    /// `purge(bundleId)`: only permitted from `expired` (after grace) or
    /// `quarantine` (after diagnostic window) — the caller (sweeper /
    /// evictor diagnostic reaper) is responsible for checking the time
    /// window; this only enforces the queue-membership half of the rule.
    pub fn purge(&self, id: &BundleId) -> Result<(), StoreError> {
        let trees = (&self.bundles, &self.meta, &self.by_queue);
        let removed_topic: Arc<std::sync::Mutex<Option<(String, i64)>>> = Arc::new(std::sync::Mutex::new(None));
        let removed_topic_inner = removed_topic.clone();
        let removed_expiry: Arc<std::sync::Mutex<Option<i64>>> = Arc::new(std::sync::Mutex::new(None));
        let removed_expiry_inner = removed_expiry.clone();

        let result: Result<(), TransactionError<StoreError>> = trees.transaction(move |(t_bundles, t_meta, t_bq)| {
            let raw_meta = t_meta.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let m: BundleMeta = bincode::deserialize(&raw_meta).map_err(|e| abort(StoreError::Encoding(e)))?;
            if !matches!(m.queue, Queue::Expired | Queue::Quarantine) {
                return Err(abort(StoreError::IneligibleForPurge));
            }
            let raw_env = t_bundles.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let env: BundleEnvelope = bincode::deserialize(&raw_env).map_err(|e| abort(StoreError::Encoding(e)))?;

            *removed_topic_inner.lock().unwrap() = Some((env.topic.clone(), m.enqueue_at));
            *removed_expiry_inner.lock().unwrap() = Some(env.expires_at);

            t_bq.remove(by_queue_key(m.queue, id))?;
            t_meta.remove(id)?;
            t_bundles.remove(id)?;
            Ok(())
        });
        result?;

        if let Some(expires_at) = *removed_expiry.lock().unwrap() {
            self.by_expires.remove(by_expires_key(expires_at, id))?;
        }
        if let Some((topic, enqueue_at)) = removed_topic.lock().unwrap().clone() {
            self.by_topic.remove(by_topic_key(&topic, enqueue_at, id))?;
        }
        Ok(())
    }

    /// Unconditionally remove a bundle regardless of its current queue —
    /// used only by the cache evictor, which drops bundles directly rather
    /// than routing them through `expired` first. Returns the envelope so
    /// the caller can emit a `deleted`/`expired:evicted` diagnostic.
    pub fn evict(&self, id: &BundleId) -> Result<BundleEnvelope, StoreError> {
        let trees = (&self.bundles, &self.meta, &self.by_queue);
        let removed: Arc<std::sync::Mutex<Option<(BundleEnvelope, Queue, i64)>>> = Arc::new(std::sync::Mutex::new(None));
        let removed_inner = removed.clone();

        let result: Result<(), TransactionError<StoreError>> = trees.transaction(move |(t_bundles, t_meta, t_bq)| {
            let raw_meta = t_meta.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let m: BundleMeta = bincode::deserialize(&raw_meta).map_err(|e| abort(StoreError::Encoding(e)))?;
            let raw_env = t_bundles.get(id)?.ok_or_else(|| abort(StoreError::NotFound))?;
            let env: BundleEnvelope = bincode::deserialize(&raw_env).map_err(|e| abort(StoreError::Encoding(e)))?;

            t_bq.remove(by_queue_key(m.queue, id))?;
            t_meta.remove(id)?;
            t_bundles.remove(id)?;
            *removed_inner.lock().unwrap() = Some((env, m.queue, m.enqueue_at));
            Ok(())
        });
        result?;

        let (env, was_queue, enqueue_at) = removed.lock().unwrap().take().expect("transaction set this on success");
        self.by_expires.remove(by_expires_key(env.expires_at, id))?;
        self.by_topic.remove(by_topic_key(&env.topic, enqueue_at, id)).ok();

        if was_queue.is_live() {
            self.live_bytes.fetch_sub(env.payload_bytes() as u64, Ordering::SeqCst);
        }
        Ok(env)
    }

    pub fn queue_len(&self, queue: Queue) -> Result<usize, StoreError> {
        Ok(self.by_queue.scan_prefix([queue_tag(queue)]).count())
    }
}
