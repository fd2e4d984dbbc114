//! # Peers and Identification Utilities
//!
//! A [`Peer`] is another principal's public identity as known locally: a
//! public key plus an ordered property bag. No private material.
//!
//! This module also carries the human-facing identification utilities, all
//! pure functions of the public-key bytes:
//!
//! - [`grip`]: short checksum fingerprint for eyeballing
//! - [`nickname`]: deterministic pseudo-word alias
//! - [`art`]: drunken-bishop ASCII visualization
//!
//! None of these carry a security guarantee. They supplement signature
//! verification; they never replace it.

use indexmap::IndexMap;

use crate::crypto::PublicKey;

/// Ordered key-value properties. Insertion order is significant: properties
/// are serialized verbatim into signed digests, so ordering must be
/// deterministic and reproducible across processes.
pub type Props = IndexMap<String, String>;

/// Property key for the short checksum fingerprint. Derived, never adopted
/// from a serialized form.
pub const PROP_GRIP: &str = "grip";

/// Property key for the deterministic pseudo-word alias. Derived, never
/// adopted from a serialized form.
pub const PROP_NICK: &str = "nick";

/// Property key for a peer's last observed transport address.
pub const PROP_ADDR: &str = "addr";

/// PEM tag for an exported public peer record.
const PEER_PEM_TAG: &str = "VERITY PUBLIC KEY";

/// Strip derived properties from a property bag. Applied to every property
/// bag adopted from a serialized form; derived values are recomputed from
/// the key bytes on demand.
pub(crate) fn strip_derived(props: &mut Props) {
    props.shift_remove(PROP_GRIP);
    props.shift_remove(PROP_NICK);
}

// ============================================================================
// Peer
// ============================================================================

/// Another principal's public identity: key plus properties.
///
/// Equality is public-key equality only; properties do not participate.
#[derive(Clone, Debug)]
pub struct Peer {
    pub key: PublicKey,
    pub props: Props,
}

impl Peer {
    pub fn new(key: PublicKey) -> Self {
        Self {
            key,
            props: Props::new(),
        }
    }

    pub fn with_props(key: PublicKey, mut props: Props) -> Self {
        strip_derived(&mut props);
        Self { key, props }
    }

    pub fn grip(&self) -> String {
        grip(&self.key)
    }

    pub fn nickname(&self) -> String {
        nickname(&self.key)
    }

    pub fn art(&self) -> String {
        art(&self.key)
    }

    /// Last observed transport address, when one has been learned.
    pub fn addr(&self) -> Option<&str> {
        self.props.get(PROP_ADDR).map(|s| s.as_str())
    }

    /// Property bag with the derived `grip`/`nick` entries filled in and
    /// moved to the front. Used when serializing for human readers.
    pub fn expanded_props(&self) -> Props {
        let mut props = Props::new();
        props.insert(PROP_GRIP.to_string(), self.grip());
        props.insert(PROP_NICK.to_string(), self.nickname());
        for (k, v) in &self.props {
            if k != PROP_GRIP && k != PROP_NICK {
                props.insert(k.clone(), v.clone());
            }
        }
        props
    }

    /// Export this peer as a public PEM block: key bytes as contents,
    /// expanded properties as headers.
    pub fn to_pem(&self) -> String {
        let mut block = pem::Pem::new(PEER_PEM_TAG.to_string(), self.key.as_bytes().to_vec());
        for (k, v) in self.expanded_props() {
            // Header syntax errors only arise from malformed keys; skip those
            // entries rather than fail a display-oriented export.
            let _ = block.headers_mut().add(&k, &v);
        }
        pem::encode(&block)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Peer {}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.nickname(), self.grip())
    }
}

// ============================================================================
// Identification Utilities
// ============================================================================

/// Short checksum fingerprint of a public key: the CRC32 of the key bytes
/// as 8 lowercase hex characters.
///
/// Stable and collision-tolerant for human eyeballing only. Explicitly not
/// collision-resistant.
pub fn grip(key: &PublicKey) -> String {
    format!("{:08x}", crc32fast::hash(key.as_bytes()))
}

/// Deterministic pseudo-word alias for a public key.
///
/// Seeded from a BLAKE3 hash of the key bytes; the same key always yields
/// the same nickname, across calls and across processes. A memorable alias
/// with no security guarantee.
pub fn nickname(key: &PublicKey) -> String {
    const CONSONANTS: &[u8] = b"bdfgklmnprstvz";
    const VOWELS: &[u8] = b"aeiou";

    let hash = blake3::hash(key.as_bytes());
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&hash.as_bytes()[..8]);
    let mut seed = u64::from_le_bytes(eight);

    let mut name = String::with_capacity(6);
    for _ in 0..3 {
        name.push(CONSONANTS[(seed % CONSONANTS.len() as u64) as usize] as char);
        seed /= CONSONANTS.len() as u64;
        name.push(VOWELS[(seed % VOWELS.len() as u64) as usize] as char);
        seed /= VOWELS.len() as u64;
    }
    name
}

/// Grid width for the key art. Matches the OpenSSH randomart dimensions.
const ART_WIDTH: usize = 17;
const ART_HEIGHT: usize = 9;

/// Visit-count symbols, in increasing order of visits.
const ART_SYMBOLS: &[u8] = b" .o+=*BOX@%&#";

/// Deterministic ASCII-art visualization of a public key.
///
/// A drunken-bishop walk over a fixed grid, seeded solely by the key
/// bytes: each byte drives four diagonal steps (two bits each, low bits
/// first), incrementing a visit counter per cell. Identical keys always
/// render identical art, enabling visual fingerprint comparison.
pub fn art(key: &PublicKey) -> String {
    let mut grid = [[0u8; ART_WIDTH]; ART_HEIGHT];
    let start = (ART_WIDTH / 2, ART_HEIGHT / 2);
    let (mut x, mut y) = start;

    for byte in key.as_bytes() {
        let mut b = *byte;
        for _ in 0..4 {
            x = if b & 0x1 != 0 {
                (x + 1).min(ART_WIDTH - 1)
            } else {
                x.saturating_sub(1)
            };
            y = if b & 0x2 != 0 {
                (y + 1).min(ART_HEIGHT - 1)
            } else {
                y.saturating_sub(1)
            };
            if (grid[y][x] as usize) < ART_SYMBOLS.len() - 1 {
                grid[y][x] += 1;
            }
            b >>= 2;
        }
    }
    let end = (x, y);

    let title = format!(" {} ", grip(key));
    let dashes = ART_WIDTH.saturating_sub(title.len());
    let mut out = String::new();
    out.push('+');
    out.push_str(&"-".repeat(dashes / 2));
    out.push_str(&title);
    out.push_str(&"-".repeat(dashes - dashes / 2));
    out.push_str("+\n");
    for (row, cells) in grid.iter().enumerate() {
        out.push('|');
        for (col, count) in cells.iter().enumerate() {
            if (col, row) == start {
                out.push('S');
            } else if (col, row) == end {
                out.push('E');
            } else {
                out.push(ART_SYMBOLS[*count as usize] as char);
            }
        }
        out.push_str("|\n");
    }
    out.push('+');
    out.push_str(&"-".repeat(ART_WIDTH));
    out.push('+');
    out
}
