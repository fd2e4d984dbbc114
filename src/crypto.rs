//! # Cryptographic Primitives
//!
//! This module wraps the asymmetric-key capability the rest of the crate
//! consumes:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PublicKey`]: 32-byte public key serving as a principal's identity
//! - Domain-separated signing and verification helpers
//!
//! ## Identity Model
//!
//! A principal IS its Ed25519 public key. Possession of the matching secret
//! key proves identity; no external CA is involved. Everything above this
//! module treats the keypair as an opaque capability: `sign(data)`,
//! `verify(key, data, sig)`.
//!
//! ## Domain Separation
//!
//! Every signed structure in verity uses a unique domain prefix so a
//! signature produced in one context can never be replayed in another.
//! Config snapshots and wire messages each get their own prefix.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
/// Used for both wire messages and config snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for config snapshot signatures.
pub const CONFIG_SIGNATURE_DOMAIN: &[u8] = b"verity-config-v1:";

/// Domain separation prefix for wire message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"verity-message-v1:";

/// Length in bytes of the freshness nonce attached to every signed
/// structure.
pub const NONCE_LEN: usize = 16;

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new keypair from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PublicKey
// ============================================================================

/// A 32-byte Ed25519 public key.
///
/// Serialized as lowercase hex in every textual form (snapshot JSON, PEM
/// headers), so it can double as a JSON object key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// True when the key parses as a valid Ed25519 point and is not one of
    /// the trivially bogus all-zero / all-0xFF patterns.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl serde::de::Visitor<'_> for HexVisitor {
            type Value = PublicKey;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a 64-character hex-encoded public key")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<PublicKey, E> {
                PublicKey::from_hex(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing, preventing
/// cross-protocol signature replay.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature
/// against the claimed public key.
pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(public_key.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
