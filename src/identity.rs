//! # Principals
//!
//! A [`Principal`] is the unit of "self": an Ed25519 keypair plus an
//! ordered property bag and an address book of known [`Peer`]s. It produces
//! tamper-evident [`ConfigSnapshot`]s of its public state and reloads that
//! state at startup.
//!
//! ## Ownership Model
//!
//! The keypair is held as an opaque capability; the principal exposes
//! identity-level operations (compose, export, save) that delegate to it
//! rather than exposing the keypair's surface.
//!
//! The injected randomness source is used only for freshness nonces. A
//! failed read fails the signing operation; a nonce is never reused across
//! two signed states.
//!
//! ## Single-Writer Discipline
//!
//! Peer-set mutation, signing, and persistence are funneled through one
//! actor task that owns the `Principal`. The public face is a
//! cheap-to-clone [`PrincipalHandle`]; commands are processed sequentially,
//! which serializes saves and closes the concurrent-save lost-update
//! window. Dispatch tasks hold only handles, never the principal itself.
//!
//! ## Identity File Form
//!
//! A principal round-trips through a PEM block (`VERITY PRIVATE KEY`):
//! contents are the 32-byte secret key, headers are the properties. The
//! public key is always DERIVED from the secret key on load; a `pubkey`
//! header is written for human readers and cross-checked, never trusted on
//! its own. Derived properties (`grip`, `nick`) are stripped on load and
//! recomputed on demand.

use std::sync::Arc;

use indexmap::IndexMap;
use rand::rngs::OsRng;
use rand_core::CryptoRngCore;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::{ConfigSnapshot, ConfigStore, IntegrityError, PersistenceError, Verity};
use crate::crypto::{sign_with_domain, Keypair, PublicKey, CONFIG_SIGNATURE_DOMAIN, NONCE_LEN};
use crate::messages::{AssertionBody, Message, SUBJECT_ASSERTION};
use crate::peer::{strip_derived, Peer, Props};

/// PEM tag for a stored principal.
const PRINCIPAL_PEM_TAG: &str = "VERITY PRIVATE KEY";

/// Header carrying the redundant human-readable public key.
const HEADER_PUBKEY: &str = "pubkey";

/// Depth of the actor command queue.
const COMMAND_DEPTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by principal operations, both direct and through the
/// actor handle.
#[derive(Debug)]
pub enum IdentityError {
    /// The peer is already in the address book. Expected and non-fatal on
    /// repeated handshakes.
    PeerExists,
    /// Signing or verification of principal state failed.
    Integrity(IntegrityError),
    /// The config store failed.
    Persistence(PersistenceError),
    /// The principal actor has shut down.
    ActorClosed,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::PeerExists => write!(f, "peer already exists"),
            IdentityError::Integrity(e) => write!(f, "{e}"),
            IdentityError::Persistence(e) => write!(f, "{e}"),
            IdentityError::ActorClosed => write!(f, "principal actor closed"),
        }
    }
}

impl std::error::Error for IdentityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IdentityError::Integrity(e) => Some(e),
            IdentityError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IntegrityError> for IdentityError {
    fn from(e: IntegrityError) -> Self {
        IdentityError::Integrity(e)
    }
}

impl From<PersistenceError> for IdentityError {
    fn from(e: PersistenceError) -> Self {
        IdentityError::Persistence(e)
    }
}

/// Failures reading or writing the PEM identity file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PemError {
    NotPem(String),
    WrongTag(String),
    /// The block contents are not a 32-byte secret key.
    BadKeyLength(usize),
    /// The `pubkey` header is present but is not valid hex.
    BadHex,
    /// The `pubkey` header disagrees with the key derived from the secret
    /// key material.
    PubkeyMismatch,
}

impl std::fmt::Display for PemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PemError::NotPem(e) => write!(f, "not a pem block: {e}"),
            PemError::WrongTag(tag) => write!(f, "unexpected pem tag {tag:?}"),
            PemError::BadKeyLength(n) => {
                write!(f, "secret key must be 32 bytes, found {n}")
            }
            PemError::BadHex => write!(f, "pubkey header is not valid hex"),
            PemError::PubkeyMismatch => {
                write!(f, "pubkey header disagrees with the derived public key")
            }
        }
    }
}

impl std::error::Error for PemError {}

/// How much to trust a snapshot being loaded into live state.
///
/// There is no implicit default: callers decide explicitly whether the
/// snapshot's signature is verified before any state is adopted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustMode {
    /// Verify the snapshot signature first; adopt nothing on failure.
    VerifyFirst,
    /// Adopt the snapshot without verification. The caller vouches for it.
    TrustCaller,
}

// ============================================================================
// Principal
// ============================================================================

pub struct Principal {
    keypair: Keypair,
    props: Props,
    peers: IndexMap<PublicKey, Peer>,
    rng: Box<dyn CryptoRngCore + Send>,
    store: Option<Arc<dyn ConfigStore>>,
}

impl Principal {
    /// A fresh principal with a newly generated keypair and the operating
    /// system's CSPRNG as randomness source.
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        Self {
            keypair,
            props: Props::new(),
            peers: IndexMap::new(),
            rng: Box::new(OsRng),
            store: None,
        }
    }

    /// Replace the randomness source. Nonce generation reads from it; a
    /// failing source makes signing fail rather than reuse a nonce.
    pub fn with_rng(mut self, rng: Box<dyn CryptoRngCore + Send>) -> Self {
        self.rng = rng;
        self
    }

    /// Attach the shared persistence provider used by [`save`](Self::save).
    pub fn attach_store(&mut self, store: Arc<dyn ConfigStore>) {
        self.store = Some(store);
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn props(&self) -> &Props {
        &self.props
    }

    pub fn set_prop(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    /// This principal's public face: key plus current properties.
    pub fn as_peer(&self) -> Peer {
        Peer::with_props(self.public_key(), self.props.clone())
    }

    // ------------------------------------------------------------------
    // Address book
    // ------------------------------------------------------------------

    /// True iff a peer with the same public key is in the address book.
    pub fn has_peer(&self, key: &PublicKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Add a peer to the address book.
    ///
    /// Fails with [`IdentityError::PeerExists`] when a peer with the same
    /// public key is already present; callers expecting repeated adds must
    /// check first. Does not persist: persistence is a distinct,
    /// explicit step, so the handshake can batch state changes before
    /// committing one signed snapshot.
    pub fn add_peer(&mut self, peer: Peer) -> Result<(), IdentityError> {
        if self.has_peer(&peer.key) {
            return Err(IdentityError::PeerExists);
        }
        self.peers.insert(peer.key, peer);
        Ok(())
    }

    /// Remove a peer matching by public key. No-op when absent.
    pub fn drop_peer(&mut self, key: &PublicKey) {
        self.peers.shift_remove(key);
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ------------------------------------------------------------------
    // Config integrity protocol
    // ------------------------------------------------------------------

    fn fresh_nonce(&mut self) -> Result<Vec<u8>, IntegrityError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| IntegrityError::Randomness(e.to_string()))?;
        Ok(nonce.to_vec())
    }

    /// Value-copy of the current public state, unsigned. Later mutation of
    /// the principal does not reach into an already-built snapshot.
    fn snapshot(&self) -> ConfigSnapshot {
        let mut peers = IndexMap::new();
        for (key, peer) in &self.peers {
            peers.insert(*key, peer.expanded_props());
        }
        ConfigSnapshot {
            public_key: self.public_key(),
            props: self.props.clone(),
            peers,
            verity: Verity::default(),
        }
    }

    /// Build and sign a fresh snapshot of the current state.
    ///
    /// Generates a new nonce on every call; two exports never share one.
    pub fn export(&mut self) -> Result<ConfigSnapshot, IntegrityError> {
        let mut snapshot = self.snapshot();
        snapshot.verity.nonce = self.fresh_nonce()?;
        let digest = snapshot.digest()?;
        snapshot.verity.signature =
            sign_with_domain(&self.keypair, CONFIG_SIGNATURE_DOMAIN, &digest);
        Ok(snapshot)
    }

    /// Sign the current state and persist it through the attached store,
    /// replacing any prior stored snapshot in full.
    pub async fn save(&mut self) -> Result<(), IdentityError> {
        let store = self
            .store
            .clone()
            .ok_or(IdentityError::Persistence(PersistenceError::NoStore))?;
        let snapshot = self.export()?;
        store.set(&snapshot).await?;
        Ok(())
    }

    /// Reconstitute properties and peers from a stored snapshot.
    ///
    /// Loading is separate from verification; `mode` says explicitly
    /// whether the signature is checked before any state is adopted. A
    /// snapshot belonging to a different key is rejected in either mode.
    /// Derived properties are stripped from everything adopted.
    pub fn load(&mut self, snapshot: ConfigSnapshot, mode: TrustMode) -> Result<(), IntegrityError> {
        if snapshot.public_key != self.public_key() {
            return Err(IntegrityError::KeyMismatch);
        }
        if mode == TrustMode::VerifyFirst {
            snapshot.verify()?;
        }

        let mut props = snapshot.props;
        strip_derived(&mut props);
        self.props = props;

        self.peers.clear();
        for (key, peer_props) in snapshot.peers {
            self.peers.insert(key, Peer::with_props(key, peer_props));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Compose and sign a message from this principal.
    pub fn compose(
        &mut self,
        subject: impl Into<String>,
        recipient: Option<PublicKey>,
        headers: Props,
        body: Vec<u8>,
    ) -> Result<Message, IntegrityError> {
        let nonce = self.fresh_nonce()?;
        let mut message = Message::new(subject, self.public_key(), recipient, body, nonce);
        message.headers = headers;
        message.sign(&self.keypair)?;
        Ok(message)
    }

    /// Compose a signed self-attestation: subject `ASSERTION`, body
    /// carrying the declaration sentence and the current properties.
    pub fn assert_self(&mut self) -> Result<Message, IntegrityError> {
        let body = serde_json::to_vec(&AssertionBody::new(self.props.clone()))
            .map_err(|e| IntegrityError::Serialization(e.to_string()))?;
        self.compose(SUBJECT_ASSERTION, None, Props::new(), body)
    }

    // ------------------------------------------------------------------
    // Identity file form
    // ------------------------------------------------------------------

    /// Encode to the PEM identity file form.
    pub fn to_pem(&self) -> String {
        let mut block = pem::Pem::new(
            PRINCIPAL_PEM_TAG.to_string(),
            self.keypair.secret_key_bytes().to_vec(),
        );
        let _ = block
            .headers_mut()
            .add(HEADER_PUBKEY, &self.public_key().to_hex());
        for (k, v) in &self.props {
            if k != HEADER_PUBKEY {
                let _ = block.headers_mut().add(k, v);
            }
        }
        pem::encode(&block)
    }

    /// Decode from the PEM identity file form.
    ///
    /// The public key is derived from the secret key material; a `pubkey`
    /// header that disagrees is rejected rather than believed.
    pub fn from_pem(bytes: &[u8]) -> Result<Self, PemError> {
        let block = pem::parse(bytes).map_err(|e| PemError::NotPem(e.to_string()))?;
        if block.tag() != PRINCIPAL_PEM_TAG {
            return Err(PemError::WrongTag(block.tag().to_string()));
        }

        let contents = block.contents();
        let secret: [u8; 32] = contents
            .try_into()
            .map_err(|_| PemError::BadKeyLength(contents.len()))?;
        let keypair = Keypair::from_secret_key_bytes(&secret);
        let derived = keypair.public_key();

        if let Some(claimed) = block.headers().get(HEADER_PUBKEY) {
            let claimed = PublicKey::from_hex(claimed).map_err(|_| PemError::BadHex)?;
            if claimed != derived {
                return Err(PemError::PubkeyMismatch);
            }
        }

        let mut props = Props::new();
        for (k, v) in block.headers().iter() {
            if k != HEADER_PUBKEY {
                props.insert(k.to_string(), v.to_string());
            }
        }
        strip_derived(&mut props);

        let mut principal = Self::from_keypair(keypair);
        principal.props = props;
        Ok(principal)
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("public_key", &self.public_key())
            .field("props", &self.props.len())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Principal Actor (single-writer discipline)
// ============================================================================

enum Command {
    HasPeer {
        key: PublicKey,
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    AddPeer {
        peer: Peer,
        reply: oneshot::Sender<Result<(), IdentityError>>,
    },
    DropPeer {
        key: PublicKey,
        reply: oneshot::Sender<()>,
    },
    Export {
        reply: oneshot::Sender<Result<ConfigSnapshot, IdentityError>>,
    },
    Save {
        reply: oneshot::Sender<Result<(), IdentityError>>,
    },
    Compose {
        subject: String,
        recipient: Option<PublicKey>,
        headers: Props,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<Message, IdentityError>>,
    },
    AssertSelf {
        reply: oneshot::Sender<Result<Message, IdentityError>>,
    },
}

/// Handle to the principal actor. Cheap to clone.
///
/// All peer-set mutation, signing, and persistence flow through the actor
/// and are processed sequentially: one logical owner of the principal's
/// state, no concurrent map mutation, saves serialized.
#[derive(Clone)]
pub struct PrincipalHandle {
    cmd_tx: mpsc::Sender<Command>,
    public_key: PublicKey,
}

impl std::fmt::Debug for PrincipalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalHandle")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl PrincipalHandle {
    /// Move the principal into its actor task and return a handle to it.
    pub fn spawn(principal: Principal) -> Self {
        let public_key = principal.public_key();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_DEPTH);
        tokio::spawn(run_actor(principal, cmd_rx));
        Self { cmd_tx, public_key }
    }

    /// The principal's public key. Immutable, so no actor round-trip.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub async fn has_peer(&self, key: PublicKey) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::HasPeer { key, reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn peers(&self) -> Vec<Peer> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Peers { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn add_peer(&self, peer: Peer) -> Result<(), IdentityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddPeer { peer, reply: reply_tx })
            .await
            .map_err(|_| IdentityError::ActorClosed)?;
        reply_rx.await.map_err(|_| IdentityError::ActorClosed)?
    }

    pub async fn drop_peer(&self, key: PublicKey) -> Result<(), IdentityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::DropPeer { key, reply: reply_tx })
            .await
            .map_err(|_| IdentityError::ActorClosed)?;
        reply_rx.await.map_err(|_| IdentityError::ActorClosed)
    }

    pub async fn export(&self) -> Result<ConfigSnapshot, IdentityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Export { reply: reply_tx })
            .await
            .map_err(|_| IdentityError::ActorClosed)?;
        reply_rx.await.map_err(|_| IdentityError::ActorClosed)?
    }

    pub async fn save(&self) -> Result<(), IdentityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Save { reply: reply_tx })
            .await
            .map_err(|_| IdentityError::ActorClosed)?;
        reply_rx.await.map_err(|_| IdentityError::ActorClosed)?
    }

    pub async fn compose(
        &self,
        subject: impl Into<String>,
        recipient: Option<PublicKey>,
        headers: Props,
        body: Vec<u8>,
    ) -> Result<Message, IdentityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Compose {
                subject: subject.into(),
                recipient,
                headers,
                body,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IdentityError::ActorClosed)?;
        reply_rx.await.map_err(|_| IdentityError::ActorClosed)?
    }

    pub async fn assert_self(&self) -> Result<Message, IdentityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AssertSelf { reply: reply_tx })
            .await
            .map_err(|_| IdentityError::ActorClosed)?;
        reply_rx.await.map_err(|_| IdentityError::ActorClosed)?
    }
}

async fn run_actor(mut principal: Principal, mut cmd_rx: mpsc::Receiver<Command>) {
    debug!(public_key = %principal.public_key(), "principal actor started");
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::HasPeer { key, reply } => {
                let _ = reply.send(principal.has_peer(&key));
            }
            Command::Peers { reply } => {
                let _ = reply.send(principal.peers().cloned().collect());
            }
            Command::AddPeer { peer, reply } => {
                let _ = reply.send(principal.add_peer(peer));
            }
            Command::DropPeer { key, reply } => {
                principal.drop_peer(&key);
                let _ = reply.send(());
            }
            Command::Export { reply } => {
                let _ = reply.send(principal.export().map_err(IdentityError::from));
            }
            Command::Save { reply } => {
                let _ = reply.send(principal.save().await);
            }
            Command::Compose {
                subject,
                recipient,
                headers,
                body,
                reply,
            } => {
                let result = principal
                    .compose(subject, recipient, headers, body)
                    .map_err(IdentityError::from);
                let _ = reply.send(result);
            }
            Command::AssertSelf { reply } => {
                let _ = reply.send(principal.assert_self().map_err(IdentityError::from));
            }
        }
    }
    debug!(public_key = %principal.public_key(), "principal actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::peer::{PROP_GRIP, PROP_NICK};

    fn peer_for(principal: &Principal) -> Peer {
        principal.as_peer()
    }

    #[test]
    fn export_then_verify() {
        let mut alice = Principal::generate();
        alice.set_prop("hometown", "wonderland");
        let snapshot = alice.export().expect("export must succeed");
        snapshot.verify().expect("fresh snapshot must verify");
    }

    #[test]
    fn every_export_gets_a_fresh_nonce() {
        let mut alice = Principal::generate();
        let first = alice.export().unwrap();
        let second = alice.export().unwrap();
        assert_ne!(first.verity.nonce, second.verity.nonce);
    }

    #[test]
    fn tampered_snapshot_fails_verification() {
        let mut alice = Principal::generate();
        alice.set_prop("hometown", "wonderland");
        let mut snapshot = alice.export().unwrap();
        snapshot
            .props
            .insert("hometown".to_string(), "oz".to_string());
        assert!(matches!(
            snapshot.verify().unwrap_err(),
            IntegrityError::Signature(_)
        ));
    }

    #[test]
    fn address_book_semantics() {
        let mut alice = Principal::generate();
        let bob = Principal::generate();
        let eve = Principal::generate();

        alice.add_peer(peer_for(&bob)).expect("first add succeeds");
        assert!(alice.has_peer(&bob.public_key()));

        let err = alice.add_peer(peer_for(&bob)).unwrap_err();
        assert!(matches!(err, IdentityError::PeerExists));
        assert_eq!(alice.peer_count(), 1);

        // Dropping an absent peer is a no-op, not an error.
        alice.drop_peer(&eve.public_key());
        assert_eq!(alice.peer_count(), 1);

        alice.drop_peer(&bob.public_key());
        assert_eq!(alice.peer_count(), 0);
    }

    #[test]
    fn load_verify_first_accepts_own_snapshot() {
        let mut alice = Principal::generate();
        alice.set_prop("hometown", "wonderland");
        let bob = Principal::generate();
        alice.add_peer(peer_for(&bob)).unwrap();

        let snapshot = alice.export().unwrap();

        let mut restored = Principal::from_keypair(Keypair::from_secret_key_bytes(
            &alice.keypair.secret_key_bytes(),
        ));
        restored
            .load(snapshot, TrustMode::VerifyFirst)
            .expect("verified load must succeed");
        assert_eq!(
            restored.props().get("hometown").map(|s| s.as_str()),
            Some("wonderland")
        );
        assert!(restored.has_peer(&bob.public_key()));
        // Derived properties in the stored peer map do not survive loading.
        let loaded_peer = restored.peers().next().unwrap();
        assert!(loaded_peer.props.get(PROP_GRIP).is_none());
        assert!(loaded_peer.props.get(PROP_NICK).is_none());
    }

    #[test]
    fn load_verify_first_rejects_tampering() {
        let mut alice = Principal::generate();
        alice.set_prop("hometown", "wonderland");
        let mut snapshot = alice.export().unwrap();
        snapshot
            .props
            .insert("hometown".to_string(), "oz".to_string());

        let err = alice
            .load(snapshot.clone(), TrustMode::VerifyFirst)
            .unwrap_err();
        assert!(matches!(err, IntegrityError::Signature(_)));
        // The caller can still adopt it explicitly.
        alice.load(snapshot, TrustMode::TrustCaller).unwrap();
        assert_eq!(alice.props().get("hometown").map(|s| s.as_str()), Some("oz"));
    }

    #[test]
    fn load_rejects_foreign_snapshot() {
        let mut mallory = Principal::generate();
        let snapshot = mallory.export().unwrap();

        let mut alice = Principal::generate();
        let err = alice.load(snapshot, TrustMode::TrustCaller).unwrap_err();
        assert_eq!(err, IntegrityError::KeyMismatch);
    }

    #[test]
    fn pem_round_trip() {
        let mut alice = Principal::generate();
        alice.set_prop("hometown", "wonderland");

        let encoded = alice.to_pem();
        assert!(encoded.contains("BEGIN VERITY PRIVATE KEY"));

        let restored = Principal::from_pem(encoded.as_bytes()).expect("round trip must decode");
        assert_eq!(restored.public_key(), alice.public_key());
        assert_eq!(
            restored.keypair.secret_key_bytes(),
            alice.keypair.secret_key_bytes()
        );
        assert_eq!(
            restored.props().get("hometown").map(|s| s.as_str()),
            Some("wonderland")
        );
    }

    #[test]
    fn pem_strips_derived_props() {
        let mut alice = Principal::generate();
        alice.set_prop(PROP_GRIP, "stale");
        alice.set_prop(PROP_NICK, "stale");
        let restored = Principal::from_pem(alice.to_pem().as_bytes()).unwrap();
        assert!(restored.props().get(PROP_GRIP).is_none());
        assert!(restored.props().get(PROP_NICK).is_none());
    }

    #[test]
    fn pem_rejects_forged_pubkey_header() {
        let alice = Principal::generate();
        let mallory = Principal::generate();

        let mut block = pem::Pem::new(
            PRINCIPAL_PEM_TAG.to_string(),
            alice.keypair.secret_key_bytes().to_vec(),
        );
        let _ = block
            .headers_mut()
            .add(HEADER_PUBKEY, &mallory.public_key().to_hex());
        let forged = pem::encode(&block);

        assert_eq!(
            Principal::from_pem(forged.as_bytes()).unwrap_err(),
            PemError::PubkeyMismatch
        );
    }

    #[test]
    fn pem_rejects_garbage() {
        assert!(matches!(
            Principal::from_pem(b"nope").unwrap_err(),
            PemError::NotPem(_)
        ));

        let block = pem::Pem::new("VERITY PRIVATE KEY".to_string(), vec![1u8; 7]);
        let short = pem::encode(&block);
        assert_eq!(
            Principal::from_pem(short.as_bytes()).unwrap_err(),
            PemError::BadKeyLength(7)
        );

        let block = pem::Pem::new("SOMETHING ELSE".to_string(), vec![1u8; 32]);
        let wrong = pem::encode(&block);
        assert!(matches!(
            Principal::from_pem(wrong.as_bytes()).unwrap_err(),
            PemError::WrongTag(_)
        ));
    }

    /// A randomness source that always fails, for exercising the
    /// no-stale-nonce rule.
    struct NoEntropy;

    impl rand_core::RngCore for NoEntropy {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {}
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
            Err(rand_core::Error::new("entropy source unavailable"))
        }
    }

    impl rand_core::CryptoRng for NoEntropy {}

    #[test]
    fn failing_randomness_fails_signing() {
        let mut alice = Principal::generate().with_rng(Box::new(NoEntropy));
        let err = alice.export().unwrap_err();
        assert!(matches!(err, IntegrityError::Randomness(_)));

        let err = alice.assert_self().unwrap_err();
        assert!(matches!(err, IntegrityError::Randomness(_)));
    }

    #[tokio::test]
    async fn save_and_reload_through_store() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Principal::generate();
        alice.set_prop("hometown", "wonderland");
        alice.attach_store(store.clone());
        let bob = Principal::generate();
        alice.add_peer(peer_for(&bob)).unwrap();

        alice.save().await.expect("save must succeed");

        let stored = store.get().await.unwrap();
        stored.verify().expect("stored snapshot must verify");

        let mut restored = Principal::from_pem(alice.to_pem().as_bytes()).unwrap();
        restored.load(stored, TrustMode::VerifyFirst).unwrap();
        assert!(restored.has_peer(&bob.public_key()));
    }

    #[tokio::test]
    async fn save_without_store_fails() {
        let mut alice = Principal::generate();
        let err = alice.save().await.unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Persistence(PersistenceError::NoStore)
        ));
    }

    #[tokio::test]
    async fn actor_serializes_peer_mutation() {
        let store = Arc::new(MemoryStore::new());
        let mut principal = Principal::generate();
        principal.attach_store(store.clone());
        let handle = PrincipalHandle::spawn(principal);

        let bob = Principal::generate().as_peer();

        // Two concurrent adds of the same peer: exactly one wins.
        let (first, second) = tokio::join!(
            handle.add_peer(bob.clone()),
            handle.add_peer(bob.clone())
        );
        assert_ne!(first.is_ok(), second.is_ok());
        assert!(handle.has_peer(bob.key).await);
        assert_eq!(handle.peers().await.len(), 1);

        handle.save().await.expect("save through actor");
        let stored = store.get().await.unwrap();
        assert_eq!(stored.peers.len(), 1);

        handle.drop_peer(bob.key).await.unwrap();
        assert!(!handle.has_peer(bob.key).await);
    }

    #[tokio::test]
    async fn actor_composes_verifiable_assertions() {
        let mut principal = Principal::generate();
        principal.set_prop("hometown", "wonderland");
        let handle = PrincipalHandle::spawn(principal);

        let message = handle.assert_self().await.expect("assertion composes");
        assert_eq!(message.subject, SUBJECT_ASSERTION);
        message.verify().expect("assertion must verify");

        let body: AssertionBody = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(
            body.props.get("hometown").map(|s| s.as_str()),
            Some("wonderland")
        );
    }
}
