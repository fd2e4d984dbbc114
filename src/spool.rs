//! # Spool: Concurrent Envelope Exchange Engine
//!
//! The spool operates the long-lived trust-handshake daemon over a UDP
//! socket. Each envelope moves through the states
//! `received → parsed → validated → dispatched → {acknowledged | rejected}`.
//!
//! ## Task Topology
//!
//! Three long-lived tasks communicate over bounded queues; per-envelope
//! work is spawned fire-and-forget so a slow persistence operation on one
//! handshake never blocks receipt of the next datagram:
//!
//! ```text
//! socket ──recv──▶ inbox ──dispatch──▶ (task per envelope) ──▶ outbox ──send──▶ socket
//!                                │                                │
//!                                └────────── errors ◀─────────────┘
//! ```
//!
//! All principal state (peer set, config store) is reached only through
//! the [`PrincipalHandle`] actor, so envelope tasks never share mutable
//! state. No ordering is guaranteed between envelopes; within one
//! envelope the pipeline is strictly validate → dispatch → mutate →
//! persist → respond.
//!
//! ## Failure Semantics
//!
//! One bad packet never halts the daemon. Decode failures, signature
//! failures, duplicate peers, persistence failures, and unknown subjects
//! are all reported on the error channel and processing continues.
//! Persistence failures do not roll back the in-memory peer addition; the
//! inconsistency window is accepted and reported.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{PublicKey, SignatureError};
use crate::identity::{IdentityError, PrincipalHandle};
use crate::messages::{
    AssertionBody, DecodeError, Message, HEADER_REPLY_TO, SUBJECT_ACK, SUBJECT_ASSERTION,
};
use crate::peer::{strip_derived, Peer, Props, PROP_ADDR};

/// Fixed read-buffer size per datagram. Anything larger is truncated on
/// read, fails to decode, and lands on the error channel: a known
/// limitation, not a crash condition.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

const INBOX_DEPTH: usize = 256;
const OUTBOX_DEPTH: usize = 256;
const ERROR_DEPTH: usize = 256;
const ACK_DEPTH: usize = 64;

/// A receiver that can be taken exactly once via `.take()`.
/// Used for channels that should only have one consumer.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Envelope
// ============================================================================

/// A signed message plus its transport routing metadata. The addresses are
/// not part of the signed payload.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub message: Message,
    pub sender_addr: SocketAddr,
    pub recipient_addr: SocketAddr,
}

// ============================================================================
// Spool Errors
// ============================================================================

/// Everything the spool reports on its error channel. Per-envelope and
/// never fatal to the daemon.
#[derive(Debug)]
pub enum SpoolError {
    /// A datagram did not decode into a message.
    Decode {
        addr: SocketAddr,
        bytes: usize,
        reason: DecodeError,
    },
    /// A decoded message failed its structural validity check.
    Invalid {
        addr: SocketAddr,
        reason: DecodeError,
    },
    /// A message's signature did not verify against its claimed sender.
    Signature {
        addr: SocketAddr,
        reason: SignatureError,
    },
    /// A handshake arrived from an already-known peer. Expected on
    /// repeated handshakes; reported distinctly from real failures.
    PeerExists { key: PublicKey },
    /// Persisting or composing through the principal failed.
    Identity(IdentityError),
    /// A validated message carried a subject this protocol does not
    /// define. The envelope is dropped without state change.
    UnrecognizedSubject { subject: String, addr: SocketAddr },
    /// The socket itself failed on a read or write.
    Transport(std::io::Error),
}

impl std::fmt::Display for SpoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpoolError::Decode { addr, bytes, reason } => {
                write!(f, "undecodable datagram ({bytes} bytes) from {addr}: {reason}")
            }
            SpoolError::Invalid { addr, reason } => {
                write!(f, "invalid message from {addr}: {reason}")
            }
            SpoolError::Signature { addr, reason } => {
                write!(f, "unverifiable message from {addr}: {reason}")
            }
            SpoolError::PeerExists { key } => write!(f, "peer {key} already known"),
            SpoolError::Identity(e) => write!(f, "{e}"),
            SpoolError::UnrecognizedSubject { subject, addr } => {
                write!(f, "unrecognized subject {subject:?} from {addr}")
            }
            SpoolError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for SpoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpoolError::Decode { reason, .. } => Some(reason),
            SpoolError::Invalid { reason, .. } => Some(reason),
            SpoolError::Signature { reason, .. } => Some(reason),
            SpoolError::Identity(e) => Some(e),
            SpoolError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Report an error without ever blocking the pipeline. When the channel is
/// full or no longer consumed, the error is logged instead.
fn report(error_tx: &mpsc::Sender<SpoolError>, error: SpoolError) {
    if let Err(send_err) = error_tx.try_send(error) {
        let dropped = match send_err {
            mpsc::error::TrySendError::Full(e) => e,
            mpsc::error::TrySendError::Closed(e) => e,
        };
        debug!(error = %dropped, "error channel unavailable, dropping report");
    }
}

// ============================================================================
// Spool
// ============================================================================

pub struct Spool {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    principal: PrincipalHandle,
    outbox_tx: mpsc::Sender<Envelope>,
    errors_rx: TakeOnce<SpoolError>,
    acks_rx: TakeOnce<Envelope>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Spool {
    /// Bind a UDP socket and start the receive, dispatch, and send tasks.
    pub async fn bind(addr: SocketAddr, principal: PrincipalHandle) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind udp socket on {addr}"))?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().context("failed to read local address")?;

        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Envelope>(INBOX_DEPTH);
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Envelope>(OUTBOX_DEPTH);
        let (error_tx, error_rx) = mpsc::channel::<SpoolError>(ERROR_DEPTH);
        let (ack_tx, ack_rx) = mpsc::channel::<Envelope>(ACK_DEPTH);

        let mut tasks = Vec::with_capacity(3);

        // Receive task: socket → inbox. Blocks only on the socket read.
        {
            let socket = socket.clone();
            let error_tx = error_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let (n, addr) = match socket.recv_from(&mut buf).await {
                        Ok(read) => read,
                        Err(e) => {
                            report(&error_tx, SpoolError::Transport(e));
                            continue;
                        }
                    };
                    match Message::from_pem(&buf[..n]) {
                        Ok(message) => {
                            let envelope = Envelope {
                                message,
                                sender_addr: addr,
                                recipient_addr: local_addr,
                            };
                            if inbox_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(reason) => report(
                            &error_tx,
                            SpoolError::Decode {
                                addr,
                                bytes: n,
                                reason,
                            },
                        ),
                    }
                }
            }));
        }

        // Dispatch task: inbox → one task per envelope.
        {
            let principal = principal.clone();
            let outbox_tx = outbox_tx.clone();
            let error_tx = error_tx.clone();
            let ack_tx = ack_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = inbox_rx.recv().await {
                    let principal = principal.clone();
                    let outbox_tx = outbox_tx.clone();
                    let error_tx = error_tx.clone();
                    let ack_tx = ack_tx.clone();
                    tokio::spawn(async move {
                        handle_envelope(envelope, principal, local_addr, outbox_tx, ack_tx, error_tx)
                            .await;
                    });
                }
            }));
        }

        // Send task: outbox → socket. Blocks only on the socket write.
        {
            let socket = socket.clone();
            let error_tx = error_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = outbox_rx.recv().await {
                    let wire = envelope.message.to_pem();
                    if let Err(e) = socket.send_to(wire.as_bytes(), envelope.recipient_addr).await {
                        report(&error_tx, SpoolError::Transport(e));
                    } else {
                        debug!(
                            to = %envelope.recipient_addr,
                            subject = %envelope.message.subject,
                            "sent envelope"
                        );
                    }
                }
            }));
        }

        info!(addr = %local_addr, "spool listening");

        Ok(Self {
            socket,
            local_addr,
            principal,
            outbox_tx,
            errors_rx: tokio::sync::Mutex::new(Some(error_rx)),
            acks_rx: tokio::sync::Mutex::new(Some(ack_rx)),
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The principal this spool mutates and signs with.
    pub fn principal(&self) -> &PrincipalHandle {
        &self.principal
    }

    /// Take the error channel receiver. Returns `None` after the first
    /// call: the channel has exactly one consumer.
    pub async fn errors(&self) -> Option<mpsc::Receiver<SpoolError>> {
        self.errors_rx.lock().await.take()
    }

    /// Take the acknowledgment receiver: verified inbound `ACK` envelopes.
    /// Returns `None` after the first call.
    pub async fn acks(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.acks_rx.lock().await.take()
    }

    /// Compose a signed self-attestation and enqueue it to the recipient's
    /// transport address. The client half of the handshake: the recipient's
    /// key is not yet known, only its address.
    pub async fn send_assertion(&self, to: SocketAddr) -> Result<()> {
        let message = self
            .principal
            .assert_self()
            .await
            .context("failed to compose assertion")?;
        let envelope = Envelope {
            message,
            sender_addr: self.local_addr,
            recipient_addr: to,
        };
        self.outbox_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("spool send task stopped"))?;
        debug!(to = %to, "assertion enqueued");
        Ok(())
    }

    /// Stop all spool tasks. Dropping the spool does the same.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool")
            .field("local_addr", &self.local_addr)
            .field("socket", &self.socket.local_addr())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Envelope Handling
// ============================================================================

/// Validate and dispatch one envelope. Runs as its own task.
async fn handle_envelope(
    envelope: Envelope,
    principal: PrincipalHandle,
    local_addr: SocketAddr,
    outbox_tx: mpsc::Sender<Envelope>,
    ack_tx: mpsc::Sender<Envelope>,
    error_tx: mpsc::Sender<SpoolError>,
) {
    if let Err(reason) = envelope.message.validate() {
        report(
            &error_tx,
            SpoolError::Invalid {
                addr: envelope.sender_addr,
                reason,
            },
        );
        return;
    }

    if let Err(reason) = envelope.message.verify() {
        report(
            &error_tx,
            SpoolError::Signature {
                addr: envelope.sender_addr,
                reason,
            },
        );
        return;
    }

    let subject = envelope.message.subject.clone();
    match subject.as_str() {
        SUBJECT_ASSERTION => {
            handle_assertion(envelope, principal, local_addr, outbox_tx, error_tx).await;
        }
        SUBJECT_ACK => {
            debug!(from = %envelope.sender_addr, "acknowledgment received");
            if ack_tx.try_send(envelope).is_err() {
                debug!("ack channel unavailable, dropping acknowledgment");
            }
        }
        _ => {
            report(
                &error_tx,
                SpoolError::UnrecognizedSubject {
                    subject,
                    addr: envelope.sender_addr,
                },
            );
        }
    }
}

/// Handle a verified `ASSERTION`: learn the peer, persist, acknowledge.
async fn handle_assertion(
    envelope: Envelope,
    principal: PrincipalHandle,
    local_addr: SocketAddr,
    outbox_tx: mpsc::Sender<Envelope>,
    error_tx: mpsc::Sender<SpoolError>,
) {
    let sender_key = envelope.message.sender;

    // The declared properties ride inside the signed body. The peer's
    // reachable address is taken from the datagram, never from the body:
    // a peer cannot lie about where it can be reached.
    let mut props = match serde_json::from_slice::<AssertionBody>(&envelope.message.body) {
        Ok(body) => body.props,
        Err(e) => {
            report(
                &error_tx,
                SpoolError::Invalid {
                    addr: envelope.sender_addr,
                    reason: DecodeError::Body(e.to_string()),
                },
            );
            return;
        }
    };
    strip_derived(&mut props);
    props.insert(PROP_ADDR.to_string(), envelope.sender_addr.to_string());
    let peer = Peer::with_props(sender_key, props);

    match principal.add_peer(peer).await {
        Ok(()) => {
            info!(peer = %sender_key, addr = %envelope.sender_addr, "peer added");
        }
        Err(IdentityError::PeerExists) => {
            // Expected on repeated handshakes: re-save and re-acknowledge.
            report(&error_tx, SpoolError::PeerExists { key: sender_key });
        }
        Err(e) => {
            report(&error_tx, SpoolError::Identity(e));
            return;
        }
    }

    // A persistence failure is reported but does not roll back the
    // in-memory addition; the acknowledgment still goes out.
    if let Err(e) = principal.save().await {
        warn!(error = %e, "failed to persist address book");
        report(&error_tx, SpoolError::Identity(e));
    }

    let mut headers = Props::new();
    headers.insert(HEADER_REPLY_TO.to_string(), local_addr.to_string());
    let ack = match principal
        .compose(SUBJECT_ACK, Some(sender_key), headers, b"acknowledged".to_vec())
        .await
    {
        Ok(message) => message,
        Err(e) => {
            report(&error_tx, SpoolError::Identity(e));
            return;
        }
    };

    let out = Envelope {
        message: ack,
        sender_addr: local_addr,
        recipient_addr: envelope.sender_addr,
    };
    if outbox_tx.send(out).await.is_err() {
        debug!("outbox closed, dropping acknowledgment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn spool_error_display_carries_context() {
        let addr: SocketAddr = "127.0.0.1:5656".parse().unwrap();
        let err = SpoolError::Decode {
            addr,
            bytes: 2048,
            reason: DecodeError::NotPem("no boundary".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("2048"));
        assert!(text.contains("127.0.0.1:5656"));

        let err = SpoolError::UnrecognizedSubject {
            subject: "GOSSIP".to_string(),
            addr,
        };
        assert!(err.to_string().contains("GOSSIP"));

        let err = SpoolError::PeerExists {
            key: Keypair::generate().public_key(),
        };
        assert!(err.to_string().contains("already known"));
    }
}
