//! # Verity - Cryptographic Principals and Trust Handshakes
//!
//! Verity manages cryptographic identities ("principals") that can prove
//! their identity to peers, maintain a signed, tamper-evident address book,
//! and exchange trust-establishing handshake messages over UDP.
//!
//! - **Identity**: Ed25519-based principals (32-byte public keys)
//! - **Integrity**: signed config snapshots with freshness nonces
//! - **Handshake**: concurrent `ASSERTION`/`ACK` envelope exchange
//! - **Persistence**: pluggable config stores (file, memory)
//!
//! ## Architecture
//!
//! Concurrent state follows the actor pattern: the [`Principal`] is owned
//! by one task behind a cheap-to-clone [`PrincipalHandle`], and all
//! peer-set mutation, signing, and persistence are processed sequentially
//! there. The [`Spool`] moves envelopes between the socket and bounded
//! queues; each inbound envelope is handled as an independent task.
//!
//! ## Module Overview
//!
//! | Module     | Purpose                                               |
//! |------------|-------------------------------------------------------|
//! | `crypto`   | Keypair and public key types, domain-separated sign/verify |
//! | `identity` | `Principal`, identity file form, single-writer actor  |
//! | `peer`     | `Peer` records, grip / nickname / art utilities       |
//! | `config`   | Config snapshots, digests, persistence providers      |
//! | `messages` | Signed wire messages and the PEM envelope codec       |
//! | `spool`    | Concurrent UDP envelope exchange engine               |

mod config;
mod crypto;
mod identity;
mod messages;
mod peer;
mod spool;

pub use config::{
    ConfigSnapshot, ConfigStore, FileStore, IntegrityError, MemoryStore, PersistenceError, Verity,
};
pub use crypto::{Keypair, PublicKey, SignatureError, NONCE_LEN};
pub use identity::{IdentityError, PemError, Principal, PrincipalHandle, TrustMode};
pub use messages::{
    AssertionBody, DecodeError, Message, HEADER_REPLY_TO, SUBJECT_ACK, SUBJECT_ASSERTION,
};
pub use peer::{art, grip, nickname, Peer, Props, PROP_ADDR};
pub use spool::{Envelope, Spool, SpoolError, MAX_DATAGRAM_SIZE};
