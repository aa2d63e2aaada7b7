//! Error taxonomy surfaced at the ingress/egress boundary (§7). Internal
//! code uses `?` against these variants; `sled`, signature, and
//! (de)serialization errors convert in via `#[from]` rather than being
//! exposed directly, so callers only ever match on the six named kinds.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("negative or zero ttl")]
    NonPositiveTtl,
    #[error("both ttl and expires_at given, or neither")]
    AmbiguousExpiry,
    #[error("unknown priority value")]
    UnknownPriority,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("producer not authorized for audience")]
    ProducerNotAuthorizedForAudience,
    #[error("peer not entitled to receive this audience")]
    PeerNotEntitled,
}

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("signature does not verify")]
    BadSignature,
    #[error("bundle id does not match canonical hash")]
    IdMismatch,
    #[error("canonicalization failed: {0}")]
    CanonicalizationError(String),
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("hop limit exceeded")]
    HopLimitExceeded,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("bundle already expired on arrival")]
    Expired,
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("cache budget exhausted and nothing evictable")]
    QueueFull,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

#[derive(Error, Debug)]
pub enum TransientError {
    #[error("transport reset")]
    TransportReset,
    #[error("operation timed out")]
    Timeout,
}

/// Top-level boundary error composing the six kinds from §7. Internal
/// modules return the specific kind; callers that only care about routing
/// (quarantine vs. reject vs. retry) can match on this instead.
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error("duplicate bundle id")]
    DuplicateId,
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("local storage encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("wire encoding error: {0}")]
    WireEncoding(#[from] postcard::Error),
}

impl From<crate::store::StoreError> for SubstrateError {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError::*;
        match e {
            Duplicate => SubstrateError::DuplicateId,
            NotFound => ResourceError::StorageUnavailable("bundle not found".into()).into(),
            QueueMismatch | IneligibleForPurge => TransientError::TransportReset.into(),
            Sled(inner) => SubstrateError::Storage(inner),
            Encoding(inner) => SubstrateError::Encoding(inner),
        }
    }
}

impl From<crate::crypto::CryptoError> for SubstrateError {
    fn from(e: crate::crypto::CryptoError) -> Self {
        use crate::crypto::CryptoError::*;
        match e {
            BadSignature | InvalidPublicKey => IntegrityError::BadSignature.into(),
            IdMismatch => IntegrityError::IdMismatch.into(),
            CanonicalizationError(msg) => IntegrityError::CanonicalizationError(msg).into(),
            KeyMissing => ValidationError::MissingField("signing key").into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SubstrateError>;
