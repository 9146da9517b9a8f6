//! Sealed-box encryption for signaling payloads.
//!
//! Seals a payload from one long-lived X25519 key to another:
//! static-static Diffie-Hellman, HKDF-SHA256, ChaCha20-Poly1305. The random
//! 24-byte header nonce doubles as the HKDF salt and is carried in front of
//! the ciphertext, so a sealed blob is `nonce24 || aead_ciphertext`.
//!
//! Both directions use the same shared secret, which is what lets the
//! recipient of a broadcast event open a blob knowing only the sender's
//! published encryption identity - and lets a participant seal records to
//! itself for the self-encrypted contact book.

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::identity::{EncryptionIdentity, Identity};

/// Header nonce length. Also the minimum size of any sealed blob.
pub const NONCE_LEN: usize = 24;

/// AEAD tag length appended by ChaCha20-Poly1305.
pub const TAG_LEN: usize = 16;

/// Fixed size overhead of a sealed blob over its plaintext.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Error type for sealed-box operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealedError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("sealed blob too short: {0} bytes")]
    Truncated(usize),
}

fn kdf_key_nonce(shared_secret: &[u8; 32], salt: &[u8]) -> ([u8; 32], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

    let mut key = [0u8; 32];
    hk.expand(b"chainline_seal_key", &mut key).unwrap(); // Output size matches digest size, infallible

    let mut nonce = [0u8; 12];
    hk.expand(b"chainline_seal_nonce", &mut nonce).unwrap(); // Output size < digest size, infallible

    (key, nonce)
}

fn shared_secret(local: &Identity, remote: &EncryptionIdentity) -> [u8; 32] {
    let remote_pub = X25519PublicKey::from(*remote.as_bytes());
    *local.encr_secret().diffie_hellman(&remote_pub).as_bytes()
}

/// Seal `plaintext` to `recipient` with the sender's own encryption key.
pub fn seal(
    plaintext: &[u8],
    recipient: &EncryptionIdentity,
    sender: &Identity,
) -> Result<Vec<u8>, SealedError> {
    let mut nonce24 = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce24).map_err(|_| SealedError::EncryptFailed)?;

    let shared = shared_secret(sender, recipient);
    let (key32, nonce12) = kdf_key_nonce(&shared, &nonce24);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key32));
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce12), plaintext)
        .map_err(|_| SealedError::EncryptFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce24);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed blob produced by `sender`, with the recipient's own
/// encryption key.
///
/// Fails with a typed error on truncation or on any key mismatch; the
/// caller decides whether that is noise (inbound broadcast) or a bug
/// (outbound flow).
pub fn open(
    sealed: &[u8],
    sender: &EncryptionIdentity,
    recipient: &Identity,
) -> Result<Bytes, SealedError> {
    if sealed.len() < OVERHEAD {
        return Err(SealedError::Truncated(sealed.len()));
    }
    let (nonce24, ct) = sealed.split_at(NONCE_LEN);

    let shared = shared_secret(recipient, sender);
    let (key32, nonce12) = kdf_key_nonce(&shared, nonce24);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key32));
    let pt = cipher
        .decrypt(Nonce::from_slice(&nonce12), ct)
        .map_err(|_| SealedError::DecryptFailed)?;

    Ok(Bytes::from(pt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seal_open_round_trip() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let sealed = seal(b"SDP-OFFER-1", &bob.encryption_identity(), &alice).unwrap();
        let opened = open(&sealed, &alice.encryption_identity(), &bob).unwrap();
        assert_eq!(opened.as_ref(), b"SDP-OFFER-1");
    }

    #[test]
    fn test_self_seal_round_trip() {
        // Contact-book mode: owner seals to its own encryption identity.
        let owner = Identity::generate();
        let sealed = seal(b"carol", &owner.encryption_identity(), &owner).unwrap();
        let opened = open(&sealed, &owner.encryption_identity(), &owner).unwrap();
        assert_eq!(opened.as_ref(), b"carol");
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();

        let sealed = seal(b"secret", &bob.encryption_identity(), &alice).unwrap();
        assert_eq!(
            open(&sealed, &alice.encryption_identity(), &eve),
            Err(SealedError::DecryptFailed)
        );
    }

    #[test]
    fn test_wrong_claimed_sender_fails() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();

        let sealed = seal(b"secret", &bob.encryption_identity(), &alice).unwrap();
        assert_eq!(
            open(&sealed, &eve.encryption_identity(), &bob),
            Err(SealedError::DecryptFailed)
        );
    }

    #[test]
    fn test_truncated_blob() {
        assert_eq!(
            open(
                &[0u8; OVERHEAD - 1],
                &Identity::generate().encryption_identity(),
                &Identity::generate()
            ),
            Err(SealedError::Truncated(OVERHEAD - 1))
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let mut sealed = seal(b"secret", &bob.encryption_identity(), &alice).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert_eq!(
            open(&sealed, &alice.encryption_identity(), &bob),
            Err(SealedError::DecryptFailed)
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let alice = Identity::from_bytes(&[3u8; 32], &[4u8; 32]);
            let bob = Identity::from_bytes(&[5u8; 32], &[6u8; 32]);

            let sealed = seal(&payload, &bob.encryption_identity(), &alice).unwrap();
            prop_assert_eq!(sealed.len(), payload.len() + OVERHEAD);
            let opened = open(&sealed, &alice.encryption_identity(), &bob).unwrap();
            prop_assert_eq!(opened.as_ref(), payload.as_slice());
        }
    }
}
