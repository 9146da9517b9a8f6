//! Textual address codec for identity keys.
//!
//! Raw 32-byte public keys are rendered as bech32 strings with a
//! human-readable prefix per identity namespace, so a signing address can
//! never be mistaken for an encryption address in transit or in logs.

use bech32::{Bech32, Hrp};

/// Error type for address encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("not a valid address: {0}")]
    Malformed(String),
    #[error("address namespace mismatch: expected {expected}, got {got}")]
    WrongNamespace { expected: &'static str, got: String },
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),
}

/// The identity namespace an address belongs to.
///
/// Both namespaces carry 32 raw bytes; the prefix is the only thing that
/// distinguishes them in textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Ed25519 signing identities ("csig1...").
    Signing,
    /// X25519 encryption identities ("cenc1...").
    Encryption,
}

const SIGNING_HRP: Hrp = Hrp::parse_unchecked("csig");
const ENCRYPTION_HRP: Hrp = Hrp::parse_unchecked("cenc");

impl Namespace {
    fn hrp(self) -> Hrp {
        match self {
            Namespace::Signing => SIGNING_HRP,
            Namespace::Encryption => ENCRYPTION_HRP,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Namespace::Signing => "csig",
            Namespace::Encryption => "cenc",
        }
    }
}

/// Encode 32 raw key bytes as a textual address in the given namespace.
pub fn encode(namespace: Namespace, key: &[u8; 32]) -> String {
    // A 32-byte payload is always within the bech32 90-character limit.
    bech32::encode::<Bech32>(namespace.hrp(), key).unwrap()
}

/// Decode a textual address, requiring the given namespace.
///
/// Round-trips exactly with [`encode`]; an address carrying the other
/// namespace's prefix is rejected rather than reinterpreted.
pub fn decode(namespace: Namespace, addr: &str) -> Result<[u8; 32], AddressError> {
    let (hrp, data) = bech32::decode(addr).map_err(|e| AddressError::Malformed(e.to_string()))?;
    if hrp != namespace.hrp() {
        return Err(AddressError::WrongNamespace {
            expected: namespace.label(),
            got: hrp.to_string(),
        });
    }
    let key: [u8; 32] = data
        .as_slice()
        .try_into()
        .map_err(|_| AddressError::InvalidKeyLength(data.len()))?;
    Ok(key)
}
