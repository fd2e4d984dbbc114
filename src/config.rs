//! # Config Snapshots and Persistence
//!
//! A [`ConfigSnapshot`] is a canonical, signable capture of a principal's
//! public state: public key, ordered properties, and peer set, carrying a
//! [`Verity`] (freshness nonce + signature). Snapshots are ephemeral value
//! copies: rebuilt on every signing, never mutated in place afterwards.
//!
//! ## Digest Contract
//!
//! The signed digest is the concatenation, in fixed order, of:
//!
//! 1. the public-key bytes
//! 2. the canonical JSON serialization of the properties (insertion order)
//! 3. the nonce bytes
//!
//! The order is part of the contract: verifiers reconstruct the identical
//! byte sequence. Peers are stored in the snapshot but do not participate
//! in the digest. An empty nonce makes digest computation fail with
//! [`IntegrityError::MissingNonce`]; signing and verification never
//! silently proceed without one.
//!
//! ## Persistence
//!
//! The [`ConfigStore`] trait is the persistence boundary: whole-snapshot
//! get/set, full overwrite. [`FileStore`] backs it with a JSON file;
//! [`MemoryStore`] keeps it in memory for tests and ephemeral principals.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::crypto::{verify_with_domain, PublicKey, SignatureError, CONFIG_SIGNATURE_DOMAIN};
use crate::peer::Props;

// ============================================================================
// Error Types
// ============================================================================

/// Failures of the snapshot integrity protocol: the digest cannot be
/// computed, the signing material is unavailable, or verification failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// The snapshot carries no nonce; signing and verification both refuse
    /// to proceed.
    MissingNonce,
    /// The randomness source failed; a stale nonce is never reused in its
    /// place.
    Randomness(String),
    /// Canonical serialization of the properties failed.
    Serialization(String),
    /// The snapshot signature did not verify.
    Signature(SignatureError),
    /// The snapshot's declared public key is not this principal's key.
    KeyMismatch,
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityError::MissingNonce => write!(f, "snapshot has no nonce"),
            IntegrityError::Randomness(e) => write!(f, "randomness source failed: {e}"),
            IntegrityError::Serialization(e) => write!(f, "canonical serialization failed: {e}"),
            IntegrityError::Signature(e) => write!(f, "snapshot signature invalid: {e}"),
            IntegrityError::KeyMismatch => {
                write!(f, "snapshot public key does not match this principal")
            }
        }
    }
}

impl std::error::Error for IntegrityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IntegrityError::Signature(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures of the persistence boundary.
#[derive(Debug)]
pub enum PersistenceError {
    /// No store has been attached to the principal.
    NoStore,
    /// Nothing has been stored yet.
    Missing,
    /// Underlying I/O failed.
    Io(std::io::Error),
    /// The stored bytes did not parse as a snapshot.
    Malformed(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::NoStore => write!(f, "no config store attached"),
            PersistenceError::Missing => write!(f, "no snapshot stored"),
            PersistenceError::Io(e) => write!(f, "config store i/o failed: {e}"),
            PersistenceError::Malformed(e) => write!(f, "stored snapshot is malformed: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Verity
// ============================================================================

/// The nonce + signature pair attached to a signed snapshot.
///
/// Both fields are hex-encoded in JSON. A fresh nonce is generated on every
/// signing; two different signed states never share one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verity {
    #[serde(with = "hexblob")]
    pub nonce: Vec<u8>,
    #[serde(rename = "sig", with = "hexblob")]
    pub signature: Vec<u8>,
}

mod hexblob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// ConfigSnapshot
// ============================================================================

/// A signed, serializable capture of a principal's public state.
///
/// Field names mirror the stored JSON form: `pub`, `props`, `peers`, `ver`.
/// The peer map is keyed by hex public key; each value is that peer's
/// property bag (with derived properties expanded for human readers;
/// they are stripped again on load).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(rename = "pub")]
    pub public_key: PublicKey,
    #[serde(default)]
    pub props: Props,
    #[serde(default)]
    pub peers: IndexMap<PublicKey, Props>,
    #[serde(rename = "ver", default)]
    pub verity: Verity,
}

impl ConfigSnapshot {
    /// Compute the byte sequence that is signed.
    ///
    /// Fails when the nonce is missing or the properties cannot be
    /// canonically serialized; it never silently produces a digest over an
    /// empty nonce.
    pub fn digest(&self) -> Result<Vec<u8>, IntegrityError> {
        if self.verity.nonce.is_empty() {
            return Err(IntegrityError::MissingNonce);
        }

        let props = serde_json::to_vec(&self.props)
            .map_err(|e| IntegrityError::Serialization(e.to_string()))?;

        let mut digest = Vec::with_capacity(32 + props.len() + self.verity.nonce.len());
        digest.extend_from_slice(self.public_key.as_bytes());
        digest.extend_from_slice(&props);
        digest.extend_from_slice(&self.verity.nonce);
        Ok(digest)
    }

    /// Verify the snapshot's signature against its declared public key.
    ///
    /// Recomputes the digest exactly as [`digest`](Self::digest) and checks
    /// the domain-separated signature. No side effects.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let digest = self.digest()?;
        verify_with_domain(
            &self.public_key,
            CONFIG_SIGNATURE_DOMAIN,
            &digest,
            &self.verity.signature,
        )
        .map_err(IntegrityError::Signature)
    }
}

// ============================================================================
// ConfigStore Providers
// ============================================================================

/// The persistence boundary for config snapshots: whole-snapshot get/set.
///
/// `set` replaces any prior stored snapshot in full; stores are never
/// patched incrementally.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> Result<ConfigSnapshot, PersistenceError>;
    async fn set(&self, snapshot: &ConfigSnapshot) -> Result<(), PersistenceError>;
}

/// File-backed config store: one JSON document, fully overwritten on every
/// save.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self) -> Result<ConfigSnapshot, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::Missing)
            }
            Err(e) => return Err(PersistenceError::Io(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Malformed(e.to_string()))
    }

    async fn set(&self, snapshot: &ConfigSnapshot) -> Result<(), PersistenceError> {
        let mut bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| PersistenceError::Malformed(e.to_string()))?;
        bytes.push(b'\n');
        tokio::fs::write(&self.path, &bytes)
            .await
            .map_err(PersistenceError::Io)
    }
}

/// In-memory config store for tests and ephemeral principals.
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<Option<ConfigSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self) -> Result<ConfigSnapshot, PersistenceError> {
        self.inner
            .lock()
            .await
            .clone()
            .ok_or(PersistenceError::Missing)
    }

    async fn set(&self, snapshot: &ConfigSnapshot) -> Result<(), PersistenceError> {
        *self.inner.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn sample_snapshot() -> ConfigSnapshot {
        let mut props = Props::new();
        props.insert("zeta".to_string(), "last".to_string());
        props.insert("alpha".to_string(), "first".to_string());
        ConfigSnapshot {
            public_key: Keypair::generate().public_key(),
            props,
            peers: IndexMap::new(),
            verity: Verity {
                nonce: vec![7u8; 16],
                signature: vec![],
            },
        }
    }

    #[test]
    fn digest_requires_nonce() {
        let mut snapshot = sample_snapshot();
        snapshot.verity.nonce.clear();
        assert_eq!(snapshot.digest().unwrap_err(), IntegrityError::MissingNonce);
        assert_eq!(snapshot.verify().unwrap_err(), IntegrityError::MissingNonce);
    }

    #[test]
    fn digest_is_deterministic() {
        let snapshot = sample_snapshot();
        assert_eq!(snapshot.digest().unwrap(), snapshot.digest().unwrap());
    }

    #[test]
    fn digest_covers_props_in_insertion_order() {
        let snapshot = sample_snapshot();
        let mut reordered = snapshot.clone();
        reordered.props = Props::new();
        reordered
            .props
            .insert("alpha".to_string(), "first".to_string());
        reordered
            .props
            .insert("zeta".to_string(), "last".to_string());
        // Same entries, different insertion order: different byte sequence.
        assert_ne!(snapshot.digest().unwrap(), reordered.digest().unwrap());
    }

    #[test]
    fn verity_json_is_hex() {
        let verity = Verity {
            nonce: vec![0xab, 0xcd],
            signature: vec![0x01, 0x02],
        };
        let json = serde_json::to_string(&verity).unwrap();
        assert!(json.contains("\"abcd\""));
        assert!(json.contains("\"sig\":\"0102\""));
        let back: Verity = serde_json::from_str(&json).unwrap();
        assert_eq!(verity, back);
    }

    #[test]
    fn snapshot_json_round_trip_preserves_order() {
        let snapshot = sample_snapshot();
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        let back: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public_key, snapshot.public_key);
        let keys: Vec<&str> = back.props.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(back.digest().unwrap(), snapshot.digest().unwrap());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get().await.unwrap_err(),
            PersistenceError::Missing
        ));

        let snapshot = sample_snapshot();
        store.set(&snapshot).await.unwrap();
        let loaded = store.get().await.unwrap();
        assert_eq!(loaded.public_key, snapshot.public_key);
        assert_eq!(loaded.verity, snapshot.verity);
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("config.json"));
        assert!(matches!(
            store.get().await.unwrap_err(),
            PersistenceError::Missing
        ));

        let snapshot = sample_snapshot();
        store.set(&snapshot).await.unwrap();
        let loaded = store.get().await.unwrap();
        assert_eq!(loaded.public_key, snapshot.public_key);
        assert_eq!(loaded.props, snapshot.props);

        // A second set fully replaces the first.
        let mut second = snapshot.clone();
        second.props.insert("extra".to_string(), "yes".to_string());
        store.set(&second).await.unwrap();
        let loaded = store.get().await.unwrap();
        assert_eq!(loaded.props.len(), 3);
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = FileStore::new(path);
        assert!(matches!(
            store.get().await.unwrap_err(),
            PersistenceError::Malformed(_)
        ));
    }
}
