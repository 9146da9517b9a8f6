//! Identity key material and the two identity namespaces.
//!
//! Every participant holds two unrelated keys: an Ed25519 key that
//! authorizes ledger transactions and an X25519 key that payloads are
//! encrypted to. The mapping between them is published on the ledger and
//! looked up, never derived.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::{self, AddressError, Namespace};

/// Error type for identity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid identity length: expected 32, got {0}")]
    InvalidLength(usize),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// A participant's public key in the signing namespace (Ed25519).
///
/// This is the primary registry key: registrations and contact records are
/// stored under it, and ledger transactions are authorized by its holder.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SigningIdentity([u8; 32]);

/// A participant's public key in the encryption namespace (X25519).
///
/// Used only for sealing and opening signaling payloads. Shares the raw
/// 32-byte shape with [`SigningIdentity`]; the distinct type keeps the two
/// namespaces from being conflated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptionIdentity([u8; 32]);

macro_rules! identity_impl {
    ($ty:ident, $ns:expr) => {
        impl $ty {
            /// Wrap raw public key bytes, checking the length.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Render as a textual address in this namespace.
            pub fn to_text(&self) -> String {
                address::encode($ns, &self.0)
            }

            /// Parse a textual address of this namespace.
            pub fn from_text(addr: &str) -> Result<Self, AddressError> {
                Ok(Self(address::decode($ns, addr)?))
            }
        }

        impl From<[u8; 32]> for $ty {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.to_text())
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_text())
            }
        }
    };
}

identity_impl!(SigningIdentity, Namespace::Signing);
identity_impl!(EncryptionIdentity, Namespace::Encryption);

/// A participant's private key material: one signing key, one encryption
/// key, independent of each other. Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    /// Ed25519 signing private key
    #[zeroize(skip)] // SigningKey implements Zeroize internally
    sign_key: SigningKey,
    /// X25519 encryption private key
    #[zeroize(skip)] // StaticSecret implements Zeroize internally
    encr_key: StaticSecret,
}

impl Identity {
    /// Generate a new random identity using a secure random source.
    pub fn generate() -> Self {
        Self {
            sign_key: SigningKey::generate(&mut OsRng),
            encr_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Reconstruct an identity from stored 32-byte seeds.
    pub fn from_bytes(sign_seed: &[u8; 32], encr_seed: &[u8; 32]) -> Self {
        Self {
            sign_key: SigningKey::from_bytes(sign_seed),
            encr_key: StaticSecret::from(*encr_seed),
        }
    }

    /// The public half of the signing key.
    pub fn signing_identity(&self) -> SigningIdentity {
        SigningIdentity(self.sign_key.verifying_key().to_bytes())
    }

    /// The public half of the encryption key.
    pub fn encryption_identity(&self) -> EncryptionIdentity {
        EncryptionIdentity(*X25519PublicKey::from(&self.encr_key).as_bytes())
    }

    /// Sign a message using Ed25519. Returns a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// The X25519 secret, for sealed-box operations.
    pub(crate) fn encr_secret(&self) -> &StaticSecret {
        &self.encr_key
    }
}

/// Verify an Ed25519 signature against a signing identity.
pub fn verify(
    signer: &SigningIdentity,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), IdentityError> {
    let key =
        VerifyingKey::from_bytes(signer.as_bytes()).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    key.verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_are_independent_key_material() {
        let identity = Identity::generate();
        assert_ne!(
            identity.signing_identity().as_bytes(),
            identity.encryption_identity().as_bytes()
        );
    }

    #[test]
    fn test_from_bytes_is_deterministic() {
        let a = Identity::from_bytes(&[1u8; 32], &[2u8; 32]);
        let b = Identity::from_bytes(&[1u8; 32], &[2u8; 32]);
        assert_eq!(a.signing_identity(), b.signing_identity());
        assert_eq!(a.encryption_identity(), b.encryption_identity());
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let identity = Identity::generate();
        let message = b"submit this transaction";
        let signature = identity.sign(message);
        assert!(verify(&identity.signing_identity(), message, &signature).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let signature = identity.sign(b"message");
        assert!(matches!(
            verify(&other.signing_identity(), b"message", &signature),
            Err(IdentityError::InvalidSignature)
        ));
    }

    #[test]
    fn test_identity_text_round_trip() {
        let identity = Identity::generate();
        let signing = identity.signing_identity();
        let encryption = identity.encryption_identity();
        assert_eq!(
            SigningIdentity::from_text(&signing.to_text()).unwrap(),
            signing
        );
        assert_eq!(
            EncryptionIdentity::from_text(&encryption.to_text()).unwrap(),
            encryption
        );
    }

    #[test]
    fn test_from_raw_array() {
        let raw = [9u8; 32];
        let signing = SigningIdentity::from(raw);
        assert_eq!(signing.as_bytes(), &raw);
        assert_eq!(EncryptionIdentity::from(raw).as_bytes(), &raw);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            SigningIdentity::from_bytes(&[0u8; 31]),
            Err(IdentityError::InvalidLength(31))
        ));
        assert!(matches!(
            EncryptionIdentity::from_bytes(&[0u8; 33]),
            Err(IdentityError::InvalidLength(33))
        ));
    }
}
