//! Ledger client abstraction.
//!
//! The ledger is an external collaborator: a broadcast-and-storage service
//! providing key-value registration state, per-owner contact storage, an
//! ordered event stream, and signed transaction submission with inclusion
//! notifications. The core consumes it through the [`LedgerClient`] trait;
//! [`MemoryLedger`] is the in-process implementation used by tests and the
//! harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use chainline_crypto::identity::{self, EncryptionIdentity, Identity, SigningIdentity};

use crate::wire::{WireBuf, WireError};

/// Errors reported by a ledger client.
#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// A registration record as stored by the ledger, keyed by signing
/// identity and separately indexed by the packed username field.
#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    /// The published encryption identity of the registrant.
    pub encryption_identity: EncryptionIdentity,
    /// `u8` length + UTF-8 bytes, at most 20 of them.
    pub username_field: Bytes,
}

/// A contact record owned by one signing identity. Both fields are
/// `u16`-length-prefixed ciphertext sealed to the owner's own encryption
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub address_field: Bytes,
    pub name_field: Bytes,
}

/// A broadcast event, raw field bytes exactly as carried by the ledger.
/// Ephemeral: never persisted after decoding.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Offer {
        /// `u16`-prefixed ciphertext.
        payload: Bytes,
        /// Sender's raw signing identity bytes.
        from: Bytes,
        /// Recipient's raw encryption identity bytes.
        to: Bytes,
        /// `u8`-prefixed welcome message.
        welcome: Bytes,
    },
    Answer {
        payload: Bytes,
        from: Bytes,
        to: Bytes,
    },
}

/// Events are delivered in ordered batches.
pub type EventBatch = Vec<LedgerEvent>;

/// Transaction status notifications. Callers resolve on the first
/// `Included` and ignore anything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Broadcast,
    Included,
    Failed(String),
}

/// The submit paths of the signaling palette, with pre-packed wire fields.
#[derive(Debug, Clone)]
pub enum LedgerCall {
    Register {
        username_field: Bytes,
        encryption_identity: EncryptionIdentity,
    },
    UpsertContact {
        name_field: Bytes,
        address_field: Bytes,
    },
    Offer {
        welcome_field: Bytes,
        payload_field: Bytes,
        to: EncryptionIdentity,
    },
    Answer {
        payload_field: Bytes,
        to: EncryptionIdentity,
    },
}

impl LedgerCall {
    fn tag(&self) -> u8 {
        match self {
            LedgerCall::Register { .. } => 1,
            LedgerCall::UpsertContact { .. } => 2,
            LedgerCall::Offer { .. } => 3,
            LedgerCall::Answer { .. } => 4,
        }
    }

    fn fields(&self) -> Vec<&[u8]> {
        match self {
            LedgerCall::Register {
                username_field,
                encryption_identity,
            } => vec![
                username_field.as_ref(),
                encryption_identity.as_bytes().as_slice(),
            ],
            LedgerCall::UpsertContact {
                name_field,
                address_field,
            } => vec![name_field.as_ref(), address_field.as_ref()],
            LedgerCall::Offer {
                welcome_field,
                payload_field,
                to,
            } => vec![
                welcome_field.as_ref(),
                payload_field.as_ref(),
                to.as_bytes().as_slice(),
            ],
            LedgerCall::Answer { payload_field, to } => {
                vec![payload_field.as_ref(), to.as_bytes().as_slice()]
            }
        }
    }

    /// Canonical bytes a submitter signs to authorize this call: the call
    /// tag followed by each field with a `u16` length prefix.
    pub fn authorizing_bytes(&self) -> Result<Bytes, WireError> {
        let fields = self.fields();
        let cap = 1 + fields.iter().map(|f| 2 + f.len()).sum::<usize>();
        let mut buf = WireBuf::with_capacity(cap);
        buf.put_u8(self.tag())?;
        for field in fields {
            buf.put_u16(field.len() as u16)?;
            buf.put_bytes(field)?;
        }
        Ok(buf.into_written())
    }
}

/// Async interface to the ledger.
///
/// All methods are non-blocking from the caller's perspective; `submit`
/// returns a status stream whose first `Included` element marks inclusion.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Perform the transport handshake against `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<(), LedgerError>;

    /// Look up the registration record stored under a signing identity.
    async fn registration_of(
        &self,
        signing: &SigningIdentity,
    ) -> Result<Option<RegistrationRecord>, LedgerError>;

    /// Look up the signing identity registered under a packed username
    /// field.
    async fn signing_identity_by_username(
        &self,
        username_field: &[u8],
    ) -> Result<Option<SigningIdentity>, LedgerError>;

    /// All contact records owned by `owner`.
    async fn contacts_of(&self, owner: &SigningIdentity) -> Result<Vec<ContactRecord>, LedgerError>;

    /// Sign `call` with `signer` and submit it. The returned stream
    /// carries status notifications; inclusion carries no payload beyond
    /// the fact of inclusion.
    async fn submit(
        &self,
        signer: &Identity,
        call: LedgerCall,
    ) -> Result<mpsc::Receiver<TxStatus>, LedgerError>;

    /// Subscribe to the broadcast event stream. Batches arrive in ledger
    /// order; events within a batch are ordered.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<EventBatch>, LedgerError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct LedgerState {
    registrations: HashMap<SigningIdentity, RegistrationRecord>,
    usernames: HashMap<Vec<u8>, SigningIdentity>,
    contacts: HashMap<SigningIdentity, Vec<ContactRecord>>,
}

/// In-process ledger for tests and the harness.
///
/// Enforces the chain's rules in miniature: transactions must verify
/// against the origin's signing key, and a username maps to at most one
/// signing identity. Offer and Answer submissions fan out to every event
/// subscriber as single-event batches, in submission order.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    subscribers: Mutex<Vec<mpsc::Sender<EventBatch>>>,
    /// Test hook: when set, submissions broadcast but never report
    /// inclusion.
    hold_inclusions: AtomicBool,
    /// Keeps status senders of held submissions alive, so their streams
    /// stay open without ever resolving.
    held: Mutex<Vec<mpsc::Sender<TxStatus>>>,
    event_buffer: usize,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            subscribers: Mutex::new(Vec::new()),
            hold_inclusions: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            event_buffer: 64,
        }
    }

    /// When `true`, subsequent submissions never report inclusion. Lets
    /// tests exercise the submit timeout path.
    pub fn hold_inclusions(&self, hold: bool) {
        self.hold_inclusions.store(hold, Ordering::SeqCst);
    }

    /// Push a raw event batch to every subscriber, bypassing `submit`.
    /// Lets tests deliver malformed or foreign events.
    pub async fn inject(&self, batch: EventBatch) {
        let targets: Vec<mpsc::Sender<EventBatch>> = self.lock_subscribers().clone();
        for tx in targets {
            let _ = tx.send(batch.clone()).await;
        }
        self.lock_subscribers().retain(|tx| !tx.is_closed());
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<EventBatch>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a verified call to the state, returning the event to
    /// broadcast, if any.
    fn apply(&self, origin: SigningIdentity, call: LedgerCall) -> Result<Option<LedgerEvent>, String> {
        let mut state = self.lock_state();
        match call {
            LedgerCall::Register {
                username_field,
                encryption_identity,
            } => {
                let key = username_field.to_vec();
                if let Some(holder) = state.usernames.get(&key) {
                    if *holder != origin {
                        return Err("username already registered".into());
                    }
                }
                let previous_key = state
                    .registrations
                    .get(&origin)
                    .map(|r| r.username_field.to_vec());
                if let Some(previous_key) = previous_key {
                    state.usernames.remove(&previous_key);
                }
                state.usernames.insert(key, origin);
                state.registrations.insert(
                    origin,
                    RegistrationRecord {
                        encryption_identity,
                        username_field,
                    },
                );
                Ok(None)
            }
            LedgerCall::UpsertContact {
                name_field,
                address_field,
            } => {
                let record = ContactRecord {
                    address_field,
                    name_field,
                };
                let contacts = state.contacts.entry(origin).or_default();
                match contacts
                    .iter_mut()
                    .find(|c| c.address_field == record.address_field)
                {
                    Some(existing) => *existing = record,
                    None => contacts.push(record),
                }
                Ok(None)
            }
            LedgerCall::Offer {
                welcome_field,
                payload_field,
                to,
            } => Ok(Some(LedgerEvent::Offer {
                payload: payload_field,
                from: Bytes::copy_from_slice(origin.as_bytes()),
                to: Bytes::copy_from_slice(to.as_bytes()),
                welcome: welcome_field,
            })),
            LedgerCall::Answer { payload_field, to } => Ok(Some(LedgerEvent::Answer {
                payload: payload_field,
                from: Bytes::copy_from_slice(origin.as_bytes()),
                to: Bytes::copy_from_slice(to.as_bytes()),
            })),
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn connect(&self, endpoint: &str) -> Result<(), LedgerError> {
        debug!(endpoint, "memory ledger connected");
        Ok(())
    }

    async fn registration_of(
        &self,
        signing: &SigningIdentity,
    ) -> Result<Option<RegistrationRecord>, LedgerError> {
        Ok(self.lock_state().registrations.get(signing).cloned())
    }

    async fn signing_identity_by_username(
        &self,
        username_field: &[u8],
    ) -> Result<Option<SigningIdentity>, LedgerError> {
        Ok(self.lock_state().usernames.get(username_field).copied())
    }

    async fn contacts_of(&self, owner: &SigningIdentity) -> Result<Vec<ContactRecord>, LedgerError> {
        Ok(self
            .lock_state()
            .contacts
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit(
        &self,
        signer: &Identity,
        call: LedgerCall,
    ) -> Result<mpsc::Receiver<TxStatus>, LedgerError> {
        let origin = signer.signing_identity();
        let (tx, rx) = mpsc::channel(4);

        // The same admission rule a node applies: the call bytes must
        // verify against the origin's signing key.
        let bytes = call
            .authorizing_bytes()
            .map_err(|e| LedgerError::Rejected(format!("unencodable call: {e}")))?;
        let signature = signer.sign(&bytes);
        if identity::verify(&origin, &bytes, &signature).is_err() {
            let _ = tx.try_send(TxStatus::Failed("bad signature".into()));
            return Ok(rx);
        }

        let _ = tx.try_send(TxStatus::Broadcast);
        match self.apply(origin, call) {
            Ok(event) => {
                if let Some(event) = event {
                    self.inject(vec![event]).await;
                }
                if self.hold_inclusions.load(Ordering::SeqCst) {
                    self.held
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(tx.clone());
                } else {
                    let _ = tx.try_send(TxStatus::Included);
                }
            }
            Err(reason) => {
                let _ = tx.try_send(TxStatus::Failed(reason));
            }
        }
        Ok(rx)
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<EventBatch>, LedgerError> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        self.lock_subscribers().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn username_field(name: &str) -> Bytes {
        let mut buf = WireBuf::with_capacity(1 + name.len());
        buf.put_u8(name.len() as u8).unwrap();
        buf.put_str(name).unwrap();
        buf.into_written()
    }

    async fn first_terminal(rx: &mut mpsc::Receiver<TxStatus>) -> TxStatus {
        while let Some(status) = rx.recv().await {
            if status != TxStatus::Broadcast {
                return status;
            }
        }
        panic!("status stream closed without terminal status");
    }

    #[tokio::test]
    async fn test_register_and_query_back() {
        let ledger = MemoryLedger::new();
        let alice = Identity::generate();

        let mut status = ledger
            .submit(
                &alice,
                LedgerCall::Register {
                    username_field: username_field("alice"),
                    encryption_identity: alice.encryption_identity(),
                },
            )
            .await
            .unwrap();
        assert_eq!(first_terminal(&mut status).await, TxStatus::Included);

        let record = ledger
            .registration_of(&alice.signing_identity())
            .await
            .unwrap()
            .expect("registered");
        assert_eq!(record.encryption_identity, alice.encryption_identity());

        let resolved = ledger
            .signing_identity_by_username(&username_field("alice"))
            .await
            .unwrap();
        assert_eq!(resolved, Some(alice.signing_identity()));
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected_for_other_origin() {
        let ledger = MemoryLedger::new();
        let alice = Identity::generate();
        let mallory = Identity::generate();

        let mut status = ledger
            .submit(
                &alice,
                LedgerCall::Register {
                    username_field: username_field("alice"),
                    encryption_identity: alice.encryption_identity(),
                },
            )
            .await
            .unwrap();
        assert_eq!(first_terminal(&mut status).await, TxStatus::Included);

        let mut status = ledger
            .submit(
                &mallory,
                LedgerCall::Register {
                    username_field: username_field("alice"),
                    encryption_identity: mallory.encryption_identity(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            first_terminal(&mut status).await,
            TxStatus::Failed(_)
        ));

        // The index still points at the first registrant.
        let resolved = ledger
            .signing_identity_by_username(&username_field("alice"))
            .await
            .unwrap();
        assert_eq!(resolved, Some(alice.signing_identity()));
    }

    #[tokio::test]
    async fn test_reregistration_moves_username_index() {
        let ledger = MemoryLedger::new();
        let alice = Identity::generate();

        for name in ["alice", "alicia"] {
            let mut status = ledger
                .submit(
                    &alice,
                    LedgerCall::Register {
                        username_field: username_field(name),
                        encryption_identity: alice.encryption_identity(),
                    },
                )
                .await
                .unwrap();
            assert_eq!(first_terminal(&mut status).await, TxStatus::Included);
        }

        assert_eq!(
            ledger
                .signing_identity_by_username(&username_field("alice"))
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            ledger
                .signing_identity_by_username(&username_field("alicia"))
                .await
                .unwrap(),
            Some(alice.signing_identity())
        );
    }

    #[tokio::test]
    async fn test_offer_submission_reaches_subscribers() {
        let ledger = MemoryLedger::new();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut events = ledger.subscribe_events().await.unwrap();

        ledger
            .submit(
                &alice,
                LedgerCall::Offer {
                    welcome_field: Bytes::from_static(b"\x02hi"),
                    payload_field: Bytes::from_static(b"\x03\x00abc"),
                    to: bob.encryption_identity(),
                },
            )
            .await
            .unwrap();

        let batch = events.recv().await.expect("event batch");
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            LedgerEvent::Offer { from, to, .. } => {
                assert_eq!(from.as_ref(), alice.signing_identity().as_bytes());
                assert_eq!(to.as_ref(), bob.encryption_identity().as_bytes());
            }
            other => panic!("expected offer event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hold_inclusions_suppresses_terminal_status() {
        let ledger = MemoryLedger::new();
        ledger.hold_inclusions(true);
        let alice = Identity::generate();

        let mut status = ledger
            .submit(
                &alice,
                LedgerCall::Register {
                    username_field: username_field("alice"),
                    encryption_identity: alice.encryption_identity(),
                },
            )
            .await
            .unwrap();

        assert_eq!(status.recv().await, Some(TxStatus::Broadcast));
        // The stream stays open without ever resolving.
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), status.recv()).await;
        assert!(next.is_err());
    }

    #[test]
    fn test_authorizing_bytes_are_canonical() {
        let alice = Identity::generate();
        let call = LedgerCall::Answer {
            payload_field: Bytes::from_static(b"\x01\x00z"),
            to: alice.encryption_identity(),
        };
        let a = call.authorizing_bytes().unwrap();
        let b = call.authorizing_bytes().unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], 4);
    }
}
