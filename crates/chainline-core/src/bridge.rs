//! Resolution between the signing and encryption identity namespaces.
//!
//! The two namespaces are independent key material; the only mapping
//! between them is the registration record stored by the ledger. The
//! bridge owns that lookup, plus packing and unpacking of the username
//! wire field. Absence resolves to `None`, never an error; callers must
//! not encrypt against an absent key.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use chainline_crypto::identity::{EncryptionIdentity, SigningIdentity};

use crate::errors::EngineError;
use crate::ledger::{LedgerClient, LedgerError};
use crate::wire::{WireBuf, WireError};

/// Maximum username length in bytes (one length-prefix byte on the wire).
pub const MAX_USERNAME_LEN: usize = 20;

/// Capacity of the packed username field: prefix plus maximum name.
pub const USERNAME_BUF_CAP: usize = 1 + MAX_USERNAME_LEN;

/// Pack a username as its wire field: `u8` length + UTF-8 bytes.
pub fn pack_username(name: &str) -> Result<Bytes, EngineError> {
    if name.len() > MAX_USERNAME_LEN {
        return Err(EngineError::FieldTooLong {
            field: "username",
            max: MAX_USERNAME_LEN,
        });
    }
    let mut buf = WireBuf::with_capacity(USERNAME_BUF_CAP);
    buf.put_u8(name.len() as u8)?;
    buf.put_str(name)?;
    Ok(buf.into_written())
}

/// Decode a stored username field.
pub fn unpack_username(field: &[u8]) -> Result<String, WireError> {
    let mut buf = WireBuf::from_bytes(field);
    let len = buf.get_u8()? as usize;
    buf.get_str(len)
}

/// Maps between the two identity namespaces via the ledger's
/// registration store.
pub struct IdentityBridge {
    client: Arc<dyn LedgerClient>,
}

impl IdentityBridge {
    pub fn new(client: Arc<dyn LedgerClient>) -> Self {
        Self { client }
    }

    /// The encryption identity registered for a signing identity, or
    /// `None` if unregistered.
    pub async fn encryption_identity_of(
        &self,
        signing: &SigningIdentity,
    ) -> Result<Option<EncryptionIdentity>, LedgerError> {
        Ok(self
            .client
            .registration_of(signing)
            .await?
            .map(|record| record.encryption_identity))
    }

    /// The signing identity registered under a username, or `None`.
    pub async fn signing_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<SigningIdentity>, EngineError> {
        let field = pack_username(username)?;
        Ok(self.client.signing_identity_by_username(&field).await?)
    }

    /// The username registered for a signing identity, or `None`.
    ///
    /// A stored username field that fails to decode is reported as
    /// absent, not as an error; the write path already enforces the
    /// length bound, so a bad field means a corrupt record.
    pub async fn username_of(
        &self,
        signing: &SigningIdentity,
    ) -> Result<Option<String>, LedgerError> {
        let Some(record) = self.client.registration_of(signing).await? else {
            return Ok(None);
        };
        match unpack_username(&record.username_field) {
            Ok(name) => Ok(Some(name)),
            Err(e) => {
                debug!(%signing, error = %e, "dropping corrupt username field");
                Ok(None)
            }
        }
    }
}
