//! Peer Sync Protocol message types (§4.7). Bounded collections throughout
//! (defense-in-depth): a peer cannot force an unbounded allocation through
//! a malformed `OFFER`/`WANT` before the per-kind size limit is checked.

use super::serde_safe::{BoundedVec, MAX_OFFER_ITEMS, MAX_PAYLOAD_BYTES, MAX_WANT_ITEMS};
use crate::types::{BundleEnvelope, BundleId, PeerId, Priority, PublicKey};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// `uint32 length || uint8 kind || bytes body`, per §6. The length field
/// covers `kind` plus `body`, so a receiver can size its read buffer before
/// touching the postcard decoder.
pub const FRAME_LENGTH_PREFIX_BYTES: usize = 4;
pub const FRAME_KIND_BYTES: usize = 1;
pub const MESSAGE_SIZE_LIMIT: usize = MAX_PAYLOAD_BYTES + 4_096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferItem {
    pub bundle_id: BundleId,
    pub priority: Priority,
    pub size: u64,
    pub topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    Signature,
    Audience,
    Duplicate,
    TooLarge,
    HopLimit,
    Expired,
    QueueFull,
}

pub type OfferItems = BoundedVec<OfferItem, MAX_OFFER_ITEMS>;
pub type WantItems = BoundedVec<BundleId, MAX_WANT_ITEMS>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Hello { peer_id: PeerId, public_key: PublicKey, protocol_version: u32, now: i64, available_bytes: u64 },
    Offer(OfferItems),
    Want(WantItems),
    Deliver(Box<BundleEnvelope>),
    Ack(BundleId),
    Nack { bundle_id: BundleId, reason: NackReason },
    Bye,
}

impl Message {
    pub fn kind_tag(&self) -> u8 {
        match self {
            Message::Hello { .. } => 0,
            Message::Offer(_) => 1,
            Message::Want(_) => 2,
            Message::Deliver(_) => 3,
            Message::Ack(_) => 4,
            Message::Nack { .. } => 5,
            Message::Bye => 6,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Offer(_) => "offer",
            Message::Want(_) => "want",
            Message::Deliver(_) => "deliver",
            Message::Ack(_) => "ack",
            Message::Nack { .. } => "nack",
            Message::Bye => "bye",
        }
    }

    /// `HELLO` must be the first message on a session; anything else first
    /// is a protocol violation and the session closes (§6).
    pub fn is_hello(&self) -> bool {
        matches!(self, Message::Hello { .. })
    }

    pub fn max_size_for_command(command: &str) -> usize {
        match command {
            "hello" => 256,
            "offer" => 64 + MAX_OFFER_ITEMS * 300,
            "want" => 64 + MAX_WANT_ITEMS * 32,
            "deliver" => MESSAGE_SIZE_LIMIT,
            "ack" | "nack" => 128,
            "bye" => 16,
            _ => MESSAGE_SIZE_LIMIT,
        }
    }

    pub fn validate_size(&self, actual_size: usize) -> bool {
        actual_size <= Self::max_size_for_command(self.command())
    }
}
