//! Signing, verification, and canonicalization of bundle envelopes.
//!
//! Canonical bytes never include `bundleId` (it is derived *from* these bytes,
//! including it would be circular) or `signature` (it is computed *over* these
//! bytes). Every other envelope field appears in a fixed lexical order with
//! fixed-width integers and length-prefixed strings/bytes, so two
//! implementations that agree on field values agree on `bundleId` and on
//! signature validity.

use crate::types::{BundleEnvelope, Hash, PublicKey, Signature};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha3::{Digest, Sha3_256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("no signing key loaded")]
    KeyMissing,
    #[error("canonicalization failed: {0}")]
    CanonicalizationError(String),
    #[error("signature does not verify")]
    BadSignature,
    #[error("bundle id does not match hash of canonical form")]
    IdMismatch,
    #[error("malformed public key")]
    InvalidPublicKey,
}

pub struct Keypair {
    signing_key: SigningKey,
    pub public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let public = signing_key.verifying_key().to_bytes();
        Self { signing_key, public }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let public = signing_key.verifying_key().to_bytes();
        Self { signing_key, public }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// `sign(envelopeWithoutSignature) -> signature`. Never fails once a key
    /// is loaded; the `KeyMissing` case is handled at the call site (no key
    /// configured at all), not here.
    pub fn sign(&self, canonical: &[u8]) -> Signature {
        self.signing_key.sign(canonical).to_bytes()
    }
}

/// Deterministically serialize the signable fields of an envelope: fixed
/// field order, big-endian fixed-width integers, length-prefixed UTF-8
/// strings, length-prefixed byte strings, and sorted sets.
pub fn canonicalize(env: &BundleEnvelope) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + env.topic.len() + env.payload_type.len() + env.payload.len());

    out.extend_from_slice(&env.producer);
    out.extend_from_slice(&env.created_at.to_be_bytes());
    out.extend_from_slice(&env.expires_at.to_be_bytes());
    out.push(priority_tag(env.priority));
    out.push(audience_tag(env.audience));
    push_string(&mut out, &env.topic);
    push_string(&mut out, &env.payload_type);
    push_bytes(&mut out, &env.payload);
    out.extend_from_slice(&env.hop_limit.to_be_bytes());

    // receipt_policy is a BTreeSet, already in sorted (ascending variant) order
    out.push(env.receipt_policy.len() as u8);
    for kind in &env.receipt_policy {
        out.push(receipt_kind_tag(*kind));
    }

    out
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn push_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u64).to_be_bytes());
    out.extend_from_slice(b);
}

fn priority_tag(p: crate::types::Priority) -> u8 {
    use crate::types::Priority::*;
    match p {
        Emergency => 0,
        Perishable => 1,
        Normal => 2,
        Low => 3,
    }
}

fn audience_tag(a: crate::types::Audience) -> u8 {
    use crate::types::Audience::*;
    match a {
        Public => 0,
        Local => 1,
        Trusted => 2,
        Private => 3,
    }
}

fn receipt_kind_tag(k: crate::types::ReceiptKind) -> u8 {
    use crate::types::ReceiptKind::*;
    match k {
        Received => 0,
        Forwarded => 1,
        Delivered => 2,
        Expired => 3,
    }
}

/// `computeBundleId(envelope) -> id`. Same canonicalization as `sign`.
pub fn compute_bundle_id(env: &BundleEnvelope) -> Hash {
    sha3(&canonicalize(env))
}

/// `verify(envelope) -> ok | err`. Recomputes canonical bytes and checks the
/// signature against `producer`, then checks `bundleId` against the hash.
pub fn verify(env: &BundleEnvelope) -> Result<(), CryptoError> {
    let canonical = canonicalize(env);

    let vk = VerifyingKey::from_bytes(&env.producer).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(&env.signature);
    vk.verify(&canonical, &sig).map_err(|_| CryptoError::BadSignature)?;

    if compute_bundle_id_from_canonical(&canonical) != env.bundle_id {
        return Err(CryptoError::IdMismatch);
    }
    Ok(())
}

fn compute_bundle_id_from_canonical(canonical: &[u8]) -> Hash {
    sha3(canonical)
}

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

pub fn sha3_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}
