//! Peer Sync Protocol session engine (§4.7): symmetric HELLO, then two
//! half-duplex offer/want/deliver rounds (lower peer id offers first, tie
//! broken so both sides never block waiting to speak at once), then BYE.
//! Transport-agnostic: works over any `AsyncRead + AsyncWrite`.

use crate::config::PROTOCOL_VERSION;
use crate::net::message::{Message, NackReason, OfferItem, OfferItems, WantItems};
use crate::net::serde_safe::{from_bytes, to_bytes, BoundedVec, MAX_OFFER_ITEMS};
use crate::substrate::{AdmissionOutcome, Substrate};
use crate::types::{now_millis, BundleId, PeerId, PublicKey};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("frame exceeds size limit: {0} bytes")]
    FrameTooLarge(usize),
    #[error("expected HELLO as first message")]
    HelloExpected,
    #[error("peer speaks an incompatible protocol version: {0}")]
    IncompatibleVersion(u32),
    #[error("peer identity in HELLO did not match the expected peer")]
    PeerMismatch,
    #[error("session ended by peer")]
    ClosedByPeer,
}

const MAX_FRAME_BYTES: usize = crate::net::message::MESSAGE_SIZE_LIMIT + crate::net::message::FRAME_KIND_BYTES;

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), SessionError> {
    let body = to_bytes(msg)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(msg.kind_tag());
    frame.extend_from_slice(&body);
    w.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, SessionError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(SessionError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame).await?;

    let msg: Message = from_bytes(&frame[1..])?;
    if !msg.validate_size(frame.len() - 1) {
        return Err(SessionError::FrameTooLarge(frame.len()));
    }
    Ok(msg)
}

fn nack_reason_for(e: &crate::error::SubstrateError) -> NackReason {
    use crate::error::SubstrateError::*;
    match e {
        Auth(_) => NackReason::Audience,
        Integrity(_) => NackReason::Signature,
        Policy(crate::error::PolicyError::PayloadTooLarge) => NackReason::TooLarge,
        Policy(crate::error::PolicyError::HopLimitExceeded) => NackReason::HopLimit,
        Policy(crate::error::PolicyError::Expired) => NackReason::Expired,
        DuplicateId => NackReason::Duplicate,
        Resource(_) => NackReason::QueueFull,
        _ => NackReason::QueueFull,
    }
}

/// Run one Peer Sync Protocol session to completion over `stream`.
/// `expected_peer` pins the session to a specific dialed peer; `None` when
/// accepting an inbound connection with identity learned from HELLO.
pub async fn run_session<S>(
    mut stream: S,
    substrate: Arc<Substrate>,
    expected_peer: Option<PeerId>,
    budget_bytes: u64,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let our_id = substrate.node_id();
    let our_key: PublicKey = our_id;

    write_frame(
        &mut stream,
        &Message::Hello {
            peer_id: our_id,
            public_key: our_key,
            protocol_version: PROTOCOL_VERSION,
            now: now_millis(),
            available_bytes: budget_bytes,
        },
    )
    .await?;

    let (peer_id, peer_key) = match read_frame(&mut stream).await? {
        Message::Hello { peer_id, public_key, protocol_version, .. } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(SessionError::IncompatibleVersion(protocol_version));
            }
            if let Some(expected) = expected_peer {
                if expected != peer_id {
                    return Err(SessionError::PeerMismatch);
                }
            }
            (peer_id, public_key)
        }
        _ => return Err(SessionError::HelloExpected),
    };

    substrate.peers.note_contact(peer_id, peer_key);
    substrate.peers.session_opened();
    info!(peer = %hex::encode(peer_id), "session established");

    let result = run_rounds(&mut stream, &substrate, peer_id, peer_key, budget_bytes).await;

    substrate.peers.session_closed();
    match &result {
        Ok(()) => info!(peer = %hex::encode(peer_id), "session closed cleanly"),
        Err(e) => {
            warn!(peer = %hex::encode(peer_id), error = %e, "session closed with error");
            substrate.peers.record_failure(peer_id);
        }
    }
    result
}

async fn run_rounds<S>(
    stream: &mut S,
    substrate: &Arc<Substrate>,
    peer_id: PeerId,
    peer_key: PublicKey,
    budget_bytes: u64,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Deterministic ordering avoids both sides waiting to read an `OFFER`
    // that neither has sent: the numerically lower peer id offers first.
    let we_offer_first = substrate.node_id() < peer_id;

    if we_offer_first {
        offer_phase(stream, substrate, peer_id, peer_key, budget_bytes).await?;
        want_phase(stream, substrate, peer_id).await?;
    } else {
        want_phase(stream, substrate, peer_id).await?;
        offer_phase(stream, substrate, peer_id, peer_key, budget_bytes).await?;
    }

    write_frame(stream, &Message::Bye).await?;
    match read_frame(stream).await? {
        Message::Bye => Ok(()),
        _ => Ok(()), // a peer that pipelines another OFFER round instead of BYE is tolerated, not an error
    }
}

/// We hold bundles; advertise them, then deliver whatever the peer wants.
async fn offer_phase<S>(
    stream: &mut S,
    substrate: &Arc<Substrate>,
    peer_id: PeerId,
    peer_key: PublicKey,
    budget_bytes: u64,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let candidates = substrate
        .forwarding
        .select_for(peer_id, &peer_key, budget_bytes)
        .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;

    if candidates.len() > MAX_OFFER_ITEMS {
        warn!(peer = %hex::encode(peer_id), total = candidates.len(), cap = MAX_OFFER_ITEMS, "more forward candidates than one offer can carry, truncating");
    }
    let mut items = Vec::with_capacity(candidates.len().min(MAX_OFFER_ITEMS));
    for id in candidates.iter().take(MAX_OFFER_ITEMS) {
        if let Ok(Some((env, _))) = substrate.storage.get(id) {
            items.push(OfferItem { bundle_id: *id, priority: env.priority, size: env.payload_bytes() as u64, topic: env.topic });
        }
    }
    let offer: OfferItems = BoundedVec::new_unchecked(items);
    debug!(peer = %hex::encode(peer_id), count = offer.len(), "offering");
    write_frame(stream, &Message::Offer(offer)).await?;

    let wanted: Vec<BundleId> = match read_frame(stream).await? {
        Message::Want(items) => items.into_inner(),
        Message::Bye => return Ok(()),
        _ => return Err(SessionError::HelloExpected),
    };

    for id in wanted {
        let Ok(Some((env, _))) = substrate.storage.get(&id) else { continue };
        write_frame(stream, &Message::Deliver(Box::new(env))).await?;
        match read_frame(stream).await? {
            Message::Ack(acked_id) if acked_id == id => {
                substrate
                    .forwarding
                    .on_peer_acked(peer_id, &id)
                    .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
                let now = now_millis();
                substrate
                    .storage
                    .update_meta(&id, now, |m| m.hops_seen += 1)
                    .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
            }
            Message::Nack { reason, .. } => {
                debug!(peer = %hex::encode(peer_id), bundle_id = %hex::encode(id), ?reason, "peer nacked delivery");
            }
            _ => return Err(SessionError::HelloExpected),
        }
    }
    Ok(())
}

/// Peer holds bundles; receive their offer, want what we lack, admit each
/// delivery, and ack/nack it.
async fn want_phase<S>(stream: &mut S, substrate: &Arc<Substrate>, peer_id: PeerId) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let offered: Vec<OfferItem> = match read_frame(stream).await? {
        Message::Offer(items) => items.into_inner(),
        Message::Bye => return Ok(()),
        _ => return Err(SessionError::HelloExpected),
    };

    let mut wanted = Vec::new();
    for item in &offered {
        if !substrate.storage.contains(&item.bundle_id).unwrap_or(false) {
            wanted.push(item.bundle_id);
        }
    }
    debug!(peer = %hex::encode(peer_id), offered = offered.len(), wanting = wanted.len(), "want phase");
    // `offered` was already capped at `MAX_OFFER_ITEMS` by the sender, and
    // `MAX_WANT_ITEMS == MAX_OFFER_ITEMS`, so `wanted` always fits.
    let want: WantItems = BoundedVec::new_unchecked(wanted.clone());
    write_frame(stream, &Message::Want(want)).await?;

    for _ in 0..wanted.len() {
        match read_frame(stream).await? {
            Message::Deliver(env) => {
                let bundle_id = env.bundle_id;
                match substrate.admit_remote(*env).await {
                    Ok(AdmissionOutcome::Admitted(_)) | Ok(AdmissionOutcome::Duplicate) => {
                        write_frame(stream, &Message::Ack(bundle_id)).await?;
                    }
                    Err(e) => {
                        let reason = nack_reason_for(&e);
                        write_frame(stream, &Message::Nack { bundle_id, reason }).await?;
                    }
                }
            }
            Message::Bye => break,
            _ => return Err(SessionError::HelloExpected),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::crypto::Keypair;
    use crate::types::{Audience, BundleRequest, Priority};
    use std::collections::BTreeSet;

    fn node() -> (tempfile::TempDir, Arc<Substrate>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(crate::store::Storage::open(dir.path()).unwrap());
        let key = Keypair::generate();
        let config = NodeConfig::default_with_data_dir(dir.path().to_path_buf());
        (dir, Substrate::new(storage, key, config))
    }

    #[tokio::test]
    async fn full_session_transfers_public_bundle() {
        let (_dir_a, a) = node();
        let (_dir_b, b) = node();

        a.submit(BundleRequest {
            priority: Priority::Normal,
            audience: Audience::Public,
            topic: "chat".into(),
            payload_type: "text/plain".into(),
            payload: b"hi".to_vec(),
            ttl: Some(std::time::Duration::from_secs(3600)),
            expires_at: None,
            hop_limit: None,
            receipt_policy: BTreeSet::new(),
        })
        .unwrap();

        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
        let a_id = a.node_id();
        let b_id = b.node_id();
        let task_a = tokio::spawn(async move { run_session(stream_a, a, Some(b_id), 1 << 20).await });
        let task_b = tokio::spawn(async move { run_session(stream_b, b, Some(a_id), 1 << 20).await });

        let (ra, rb) = tokio::join!(task_a, task_b);
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();
    }
}
