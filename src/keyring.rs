//! Keyring / audience filter: four named keyrings, each granting a trust
//! level, answering "may P read/produce a bundle of audience A?".

use crate::types::{Audience, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyringName {
    Public,
    Local,
    Trusted,
    Verified,
}

impl KeyringName {
    pub fn trust_level(self) -> u8 {
        match self {
            KeyringName::Public => 0,
            KeyringName::Local => 1,
            KeyringName::Trusted => 2,
            KeyringName::Verified => 3,
        }
    }

    pub const ALL: [KeyringName; 4] = [
        KeyringName::Public,
        KeyringName::Local,
        KeyringName::Trusted,
        KeyringName::Verified,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringEntry {
    pub public_key: PublicKey,
    pub added_at: i64,
    pub note: Option<String>,
}

#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("key already present in keyring")]
    AlreadyPresent,
    #[error("key not found in keyring")]
    NotFound,
}

/// In-memory keyring set, persisted to the `keyrings` table by the caller
/// (the store owns durability; this type owns the membership logic).
#[derive(Debug, Default)]
pub struct Keyring {
    rings: HashMap<KeyringName, HashMap<PublicKey, KeyringEntry>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self { rings: HashMap::new() }
    }

    pub fn add(&mut self, name: KeyringName, key: PublicKey, now: i64, note: Option<String>) -> Result<(), KeyringError> {
        let ring = self.rings.entry(name).or_default();
        if ring.contains_key(&key) {
            return Err(KeyringError::AlreadyPresent);
        }
        ring.insert(key, KeyringEntry { public_key: key, added_at: now, note });
        Ok(())
    }

    pub fn remove(&mut self, name: KeyringName, key: &PublicKey) -> Result<(), KeyringError> {
        match self.rings.get_mut(&name) {
            Some(ring) if ring.remove(key).is_some() => Ok(()),
            _ => Err(KeyringError::NotFound),
        }
    }

    pub fn contains(&self, name: KeyringName, key: &PublicKey) -> bool {
        self.rings.get(&name).is_some_and(|r| r.contains_key(key))
    }

    /// Highest trust level across any keyring containing this key, default 0.
    pub fn trust_level(&self, key: &PublicKey) -> u8 {
        KeyringName::ALL
            .iter()
            .filter(|n| self.contains(**n, key))
            .map(|n| n.trust_level())
            .max()
            .unwrap_or(0)
    }

    /// "May a principal holding this key receive a bundle of this audience?"
    pub fn can_receive(&self, principal: &PublicKey, audience: Audience) -> bool {
        match audience {
            Audience::Public => true,
            Audience::Local => {
                self.contains(KeyringName::Local, principal)
                    || self.contains(KeyringName::Trusted, principal)
                    || self.contains(KeyringName::Verified, principal)
            }
            Audience::Trusted => {
                self.contains(KeyringName::Trusted, principal) || self.contains(KeyringName::Verified, principal)
            }
            Audience::Private => self.contains(KeyringName::Verified, principal),
        }
    }

    /// "May a producer holding this key produce a bundle of this audience?"
    /// Same table as `can_receive`, applied to the producer.
    pub fn can_produce(&self, producer: &PublicKey, audience: Audience) -> bool {
        self.can_receive(producer, audience)
    }

    pub fn export(&self, name: KeyringName) -> Vec<KeyringEntry> {
        self.rings
            .get(&name)
            .map(|r| {
                let mut v: Vec<_> = r.values().cloned().collect();
                v.sort_by(|a, b| a.public_key.cmp(&b.public_key));
                v
            })
            .unwrap_or_default()
    }

    /// Merge an imported set of entries into a keyring, ignoring entries
    /// already present rather than erroring (import is idempotent).
    pub fn import(&mut self, name: KeyringName, entries: Vec<KeyringEntry>) {
        let ring = self.rings.entry(name).or_default();
        for entry in entries {
            ring.entry(entry.public_key).or_insert(entry);
        }
    }

    pub fn members(&self, name: KeyringName) -> HashSet<PublicKey> {
        self.rings.get(&name).map(|r| r.keys().copied().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKey {
        [byte; 32]
    }

    #[test]
    fn public_audience_always_receivable() {
        let kr = Keyring::new();
        assert!(kr.can_receive(&key(1), Audience::Public));
    }

    #[test]
    fn local_requires_local_or_above() {
        let mut kr = Keyring::new();
        kr.add(KeyringName::Local, key(1), 0, None).unwrap();
        assert!(kr.can_receive(&key(1), Audience::Local));
        assert!(!kr.can_receive(&key(2), Audience::Local));
    }

    #[test]
    fn private_requires_verified() {
        let mut kr = Keyring::new();
        kr.add(KeyringName::Trusted, key(1), 0, None).unwrap();
        kr.add(KeyringName::Verified, key(2), 0, None).unwrap();
        assert!(!kr.can_receive(&key(1), Audience::Private));
        assert!(kr.can_receive(&key(2), Audience::Private));
    }

    #[test]
    fn trust_level_is_max_across_rings() {
        let mut kr = Keyring::new();
        kr.add(KeyringName::Public, key(1), 0, None).unwrap();
        kr.add(KeyringName::Verified, key(1), 0, None).unwrap();
        assert_eq!(kr.trust_level(&key(1)), 3);
        assert_eq!(kr.trust_level(&key(9)), 0);
    }

    #[test]
    fn export_import_round_trip() {
        let mut a = Keyring::new();
        a.add(KeyringName::Trusted, key(1), 10, Some("friend".into())).unwrap();
        let exported = a.export(KeyringName::Trusted);

        let mut b = Keyring::new();
        b.import(KeyringName::Trusted, exported);
        assert!(b.contains(KeyringName::Trusted, &key(1)));
    }

    #[test]
    fn add_duplicate_errors() {
        let mut kr = Keyring::new();
        kr.add(KeyringName::Local, key(1), 0, None).unwrap();
        assert!(matches!(kr.add(KeyringName::Local, key(1), 0, None), Err(KeyringError::AlreadyPresent)));
    }
}
