//! # Wire Protocol Messages
//!
//! This module defines the signed [`Message`] exchanged between principals
//! and its wire form: a self-delimiting PEM text block with a decodable
//! boundary, suitable for a single UDP datagram.
//!
//! ## Wire Form
//!
//! ```text
//! -----BEGIN VERITY MESSAGE-----
//! subject: ASSERTION
//! sender: <64 hex chars>
//! recipient: <64 hex chars, omitted when unaddressed>
//! nonce: <hex>
//! sig: <hex>
//! <free-form headers>
//!
//! <base64 body>
//! -----END VERITY MESSAGE-----
//! ```
//!
//! ## What Is Signed
//!
//! The digest covers, in fixed order: subject, sender, recipient (empty
//! when unaddressed), body, nonce. Headers ride OUTSIDE the digest;
//! anything whose integrity matters belongs in the body. The `ASSERTION`
//! body carries the sender's declared properties for exactly that reason.

use serde::{Deserialize, Serialize};

use crate::config::IntegrityError;
use crate::crypto::{
    sign_with_domain, verify_with_domain, Keypair, PublicKey, SignatureError,
    MESSAGE_SIGNATURE_DOMAIN,
};
use crate::peer::Props;

/// The self-attestation handshake subject. The body is an
/// [`AssertionBody`]: a declaration sentence plus the sender's properties.
pub const SUBJECT_ASSERTION: &str = "ASSERTION";

/// The acknowledgment subject sent in response to an assertion.
pub const SUBJECT_ACK: &str = "ACK";

/// Free-form header on acknowledgments carrying the responder's own
/// reachable address.
pub const HEADER_REPLY_TO: &str = "reply-to";

/// PEM tag for wire messages.
const MESSAGE_PEM_TAG: &str = "VERITY MESSAGE";

/// Header names reserved for the envelope fields themselves.
const RESERVED_HEADERS: &[&str] = &["subject", "sender", "recipient", "nonce", "sig"];

// ============================================================================
// Decode Errors
// ============================================================================

/// Failures turning raw datagram bytes into a structurally valid message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not a parseable PEM block.
    NotPem(String),
    /// The PEM block carries the wrong tag.
    WrongTag(String),
    /// A required envelope field is absent or empty.
    MissingField(&'static str),
    /// A hex-encoded envelope field did not decode.
    BadHex(&'static str),
    /// The message body did not parse for its declared subject.
    Body(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::NotPem(e) => write!(f, "not a pem block: {e}"),
            DecodeError::WrongTag(tag) => write!(f, "unexpected pem tag {tag:?}"),
            DecodeError::MissingField(field) => write!(f, "missing field {field:?}"),
            DecodeError::BadHex(field) => write!(f, "field {field:?} is not valid hex"),
            DecodeError::Body(e) => write!(f, "malformed body: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Message
// ============================================================================

/// A signed message: subject, sender, optional recipient, free-form
/// headers, body, and a verity-style nonce + signature.
#[derive(Clone, Debug)]
pub struct Message {
    pub subject: String,
    pub sender: PublicKey,
    /// Absent on assertions: the sender does not yet know the recipient's
    /// key, only its transport address.
    pub recipient: Option<PublicKey>,
    /// Unsigned routing/courtesy metadata. Not covered by the digest.
    pub headers: Props,
    pub body: Vec<u8>,
    pub nonce: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    /// A new unsigned message. The nonce is supplied by the composer (the
    /// principal owns the randomness source).
    pub fn new(
        subject: impl Into<String>,
        sender: PublicKey,
        recipient: Option<PublicKey>,
        body: Vec<u8>,
        nonce: Vec<u8>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sender,
            recipient,
            headers: Props::new(),
            body,
            nonce,
            signature: vec![],
        }
    }

    /// The byte sequence that is signed: subject, sender, recipient (empty
    /// when unaddressed), body, nonce, concatenated in that order. Headers
    /// are deliberately excluded.
    pub fn digest(&self) -> Result<Vec<u8>, IntegrityError> {
        if self.nonce.is_empty() {
            return Err(IntegrityError::MissingNonce);
        }
        let mut digest = Vec::with_capacity(
            self.subject.len() + 64 + self.body.len() + self.nonce.len(),
        );
        digest.extend_from_slice(self.subject.as_bytes());
        digest.extend_from_slice(self.sender.as_bytes());
        if let Some(recipient) = &self.recipient {
            digest.extend_from_slice(recipient.as_bytes());
        }
        digest.extend_from_slice(&self.body);
        digest.extend_from_slice(&self.nonce);
        Ok(digest)
    }

    /// Sign the message with the sender's keypair.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), IntegrityError> {
        let digest = self.digest()?;
        self.signature = sign_with_domain(keypair, MESSAGE_SIGNATURE_DOMAIN, &digest);
        Ok(())
    }

    /// Verify the signature against the claimed sender key over the
    /// recomputed digest. A message without a nonce cannot verify.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let digest = self
            .digest()
            .map_err(|_| SignatureError::VerificationFailed)?;
        verify_with_domain(
            &self.sender,
            MESSAGE_SIGNATURE_DOMAIN,
            &digest,
            &self.signature,
        )
    }

    /// Structural validity: the fields every envelope must carry before
    /// signature verification is even attempted.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.subject.is_empty() {
            return Err(DecodeError::MissingField("subject"));
        }
        if self.nonce.is_empty() {
            return Err(DecodeError::MissingField("nonce"));
        }
        if self.signature.is_empty() {
            return Err(DecodeError::MissingField("sig"));
        }
        Ok(())
    }

    /// Encode to the PEM wire form.
    pub fn to_pem(&self) -> String {
        let mut block = pem::Pem::new(MESSAGE_PEM_TAG.to_string(), self.body.clone());
        let headers = block.headers_mut();
        let _ = headers.add("subject", &self.subject);
        let _ = headers.add("sender", &self.sender.to_hex());
        if let Some(recipient) = &self.recipient {
            let _ = headers.add("recipient", &recipient.to_hex());
        }
        let _ = headers.add("nonce", &hex::encode(&self.nonce));
        let _ = headers.add("sig", &hex::encode(&self.signature));
        for (k, v) in &self.headers {
            if !RESERVED_HEADERS.contains(&k.as_str()) {
                let _ = headers.add(k, v);
            }
        }
        pem::encode(&block)
    }

    /// Decode from the PEM wire form. The error carries enough detail for
    /// the spool's error channel; it never panics on hostile input.
    pub fn from_pem(bytes: &[u8]) -> Result<Self, DecodeError> {
        let block = pem::parse(bytes).map_err(|e| DecodeError::NotPem(e.to_string()))?;
        if block.tag() != MESSAGE_PEM_TAG {
            return Err(DecodeError::WrongTag(block.tag().to_string()));
        }

        let get = |name: &'static str| -> Result<String, DecodeError> {
            block
                .headers()
                .get(name)
                .map(|v| v.to_string())
                .ok_or(DecodeError::MissingField(name))
        };

        let subject = get("subject")?;
        let sender =
            PublicKey::from_hex(&get("sender")?).map_err(|_| DecodeError::BadHex("sender"))?;
        let recipient = match block.headers().get("recipient") {
            Some(v) => {
                Some(PublicKey::from_hex(v).map_err(|_| DecodeError::BadHex("recipient"))?)
            }
            None => None,
        };
        let nonce = hex::decode(get("nonce")?).map_err(|_| DecodeError::BadHex("nonce"))?;
        let signature = hex::decode(get("sig")?).map_err(|_| DecodeError::BadHex("sig"))?;

        let mut headers = Props::new();
        for (k, v) in block.headers().iter() {
            if !RESERVED_HEADERS.contains(&k) {
                headers.insert(k.to_string(), v.to_string());
            }
        }

        Ok(Self {
            subject,
            sender,
            recipient,
            headers,
            body: block.contents().to_vec(),
            nonce,
            signature,
        })
    }
}

// ============================================================================
// Assertion Body
// ============================================================================

/// Body payload of an `ASSERTION` message.
///
/// Carrying the sender's declared properties inside the body puts them
/// under the message signature; headers would not be.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssertionBody {
    pub msg: String,
    #[serde(default)]
    pub props: Props,
}

impl AssertionBody {
    /// The canonical self-attestation sentence.
    pub const DECLARATION: &'static str = "I assert that I am me";

    pub fn new(props: Props) -> Self {
        Self {
            msg: Self::DECLARATION.to_string(),
            props,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keypair, NONCE_LEN};

    fn signed_message(keypair: &Keypair, recipient: Option<PublicKey>) -> Message {
        let mut msg = Message::new(
            SUBJECT_ASSERTION,
            keypair.public_key(),
            recipient,
            b"hello".to_vec(),
            vec![9u8; NONCE_LEN],
        );
        msg.sign(keypair).expect("signing must succeed");
        msg
    }

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let msg = signed_message(&keypair, None);
        msg.verify().expect("fresh signature must verify");
    }

    #[test]
    fn tampered_body_fails() {
        let keypair = Keypair::generate();
        let mut msg = signed_message(&keypair, None);
        msg.body = b"hello!".to_vec();
        assert_eq!(msg.verify().unwrap_err(), SignatureError::VerificationFailed);
    }

    #[test]
    fn wrong_claimed_sender_fails() {
        let keypair = Keypair::generate();
        let mut msg = signed_message(&keypair, None);
        msg.sender = Keypair::generate().public_key();
        assert_eq!(msg.verify().unwrap_err(), SignatureError::VerificationFailed);
    }

    #[test]
    fn headers_are_not_signed() {
        let keypair = Keypair::generate();
        let mut msg = signed_message(&keypair, None);
        msg.headers
            .insert("weather".to_string(), "sideways".to_string());
        // Mutating headers after signing must not invalidate the message.
        msg.verify().expect("headers ride outside the digest");
    }

    #[test]
    fn missing_nonce_refuses_to_sign() {
        let keypair = Keypair::generate();
        let mut msg = Message::new(
            SUBJECT_ASSERTION,
            keypair.public_key(),
            None,
            b"hello".to_vec(),
            vec![],
        );
        assert_eq!(
            msg.sign(&keypair).unwrap_err(),
            IntegrityError::MissingNonce
        );
    }

    #[test]
    fn pem_round_trip() {
        let keypair = Keypair::generate();
        let recipient = Keypair::generate().public_key();
        let mut msg = signed_message(&keypair, Some(recipient));
        msg.headers
            .insert(HEADER_REPLY_TO.to_string(), "127.0.0.1:5656".to_string());

        let wire = msg.to_pem();
        assert!(wire.contains("BEGIN VERITY MESSAGE"));

        let back = Message::from_pem(wire.as_bytes()).expect("round trip must decode");
        assert_eq!(back.subject, msg.subject);
        assert_eq!(back.sender, msg.sender);
        assert_eq!(back.recipient, Some(recipient));
        assert_eq!(back.body, msg.body);
        assert_eq!(back.nonce, msg.nonce);
        assert_eq!(back.signature, msg.signature);
        assert_eq!(
            back.headers.get(HEADER_REPLY_TO).map(|s| s.as_str()),
            Some("127.0.0.1:5656")
        );
        back.verify().expect("decoded message must still verify");
    }

    #[test]
    fn pem_round_trip_without_recipient() {
        let keypair = Keypair::generate();
        let msg = signed_message(&keypair, None);
        let back = Message::from_pem(msg.to_pem().as_bytes()).unwrap();
        assert_eq!(back.recipient, None);
        back.verify().expect("decoded message must still verify");
    }

    #[test]
    fn garbage_is_not_pem() {
        assert!(matches!(
            Message::from_pem(b"definitely not pem").unwrap_err(),
            DecodeError::NotPem(_)
        ));
    }

    #[test]
    fn truncated_pem_does_not_decode() {
        let keypair = Keypair::generate();
        let wire = signed_message(&keypair, None).to_pem();
        let truncated = &wire.as_bytes()[..wire.len() / 2];
        assert!(Message::from_pem(truncated).is_err());
    }

    #[test]
    fn foreign_tag_rejected() {
        let block = pem::Pem::new("SOMETHING ELSE".to_string(), b"x".to_vec());
        let wire = pem::encode(&block);
        assert!(matches!(
            Message::from_pem(wire.as_bytes()).unwrap_err(),
            DecodeError::WrongTag(_)
        ));
    }

    #[test]
    fn validate_spots_missing_fields() {
        let keypair = Keypair::generate();
        let mut msg = signed_message(&keypair, None);
        msg.validate().expect("signed message is well formed");

        msg.signature.clear();
        assert_eq!(msg.validate().unwrap_err(), DecodeError::MissingField("sig"));

        let unsigned = Message::new("", keypair.public_key(), None, vec![], vec![1]);
        assert_eq!(
            unsigned.validate().unwrap_err(),
            DecodeError::MissingField("subject")
        );
    }

    #[test]
    fn assertion_body_round_trip() {
        let mut props = Props::new();
        props.insert("hometown".to_string(), "wonderland".to_string());
        let body = AssertionBody::new(props);
        let bytes = serde_json::to_vec(&body).unwrap();
        let back: AssertionBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.msg, AssertionBody::DECLARATION);
        assert_eq!(
            back.props.get("hometown").map(|s| s.as_str()),
            Some("wonderland")
        );
    }
}
