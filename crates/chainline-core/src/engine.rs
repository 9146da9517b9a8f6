//! The signaling engine.
//!
//! Orchestrates call signaling over the ledger: subscribes to the
//! broadcast event stream, decodes and decrypts Offer and Answer events
//! addressed to the local identity, and fans decoded notices out to
//! subscribers; outbound operations pack and encrypt payloads and submit
//! them as signed transactions.
//!
//! Inbound and outbound follow opposite error policies. The broadcast
//! channel is public, so events that fail to parse, resolve, or decrypt
//! are noise: each gets a tagged disposition at debug level and processing
//! continues with the next event. Outbound failures always surface to the
//! caller as an [`EngineError`].

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use chainline_crypto::identity::{EncryptionIdentity, Identity, SigningIdentity};
use chainline_crypto::sealed;

use crate::bridge::{pack_username, IdentityBridge};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::handlers::HandlerPool;
use crate::ledger::{
    ContactRecord, EventBatch, LedgerCall, LedgerClient, LedgerError, LedgerEvent, TxStatus,
};
use crate::ready::ReadyGate;
use crate::wire::WireBuf;

/// Capacity of the packed welcome-message field (`u8` prefix + text).
const WELCOME_BUF_CAP: usize = 300;
/// Capacity of a packed offer or answer field (`u16` prefix + ciphertext).
const OFFER_BUF_CAP: usize = 2048;
/// Capacity of a packed contact field (`u16` prefix + ciphertext).
const CONTACT_BUF_CAP: usize = 1000;

/// Maximum welcome-message length in bytes (one length-prefix byte).
pub const MAX_WELCOME_LEN: usize = u8::MAX as usize;

/// Engine lifecycle. All public operations are gated behind `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Transport handshake in progress.
    Connecting,
    /// Handshake done, installing the event subscription.
    Subscribing,
    /// Subscription installed; operations flow.
    Live,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Connecting => write!(f, "connecting"),
            EngineState::Subscribing => write!(f, "subscribing"),
            EngineState::Live => write!(f, "live"),
        }
    }
}

/// A decoded offer, delivered to `on_offer` subscribers.
#[derive(Debug, Clone)]
pub struct OfferNotice {
    pub from_signing: SigningIdentity,
    pub from_encryption: EncryptionIdentity,
    pub offer: String,
    pub welcome: String,
}

/// A decoded answer, delivered to `on_answer` subscribers.
#[derive(Debug, Clone)]
pub struct AnswerNotice {
    pub from: SigningIdentity,
    pub answer: String,
}

/// A decrypted entry of the self-encrypted contact book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub address: SigningIdentity,
    pub name: String,
}

/// Outcome of processing one inbound event.
enum Disposition {
    Delivered,
    Discarded(&'static str),
}

/// One engine instance per process: owns the identity key material, the
/// readiness gate, the handler pools, and the inbound loop.
pub struct SignalingEngine {
    identity: Identity,
    client: Arc<dyn LedgerClient>,
    bridge: IdentityBridge,
    config: EngineConfig,
    gate: ReadyGate,
    state: Mutex<EngineState>,
    offer_handlers: HandlerPool<OfferNotice>,
    answer_handlers: HandlerPool<AnswerNotice>,
    shutdown_tx: watch::Sender<bool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingEngine {
    /// Create an engine in the `Connecting` state. Takes ownership of the
    /// credentials; nothing runs until [`start`](Self::start).
    pub fn new(
        identity: Identity,
        client: Arc<dyn LedgerClient>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            bridge: IdentityBridge::new(client.clone()),
            identity,
            client,
            config,
            gate: ReadyGate::new(),
            state: Mutex::new(EngineState::Connecting),
            offer_handlers: HandlerPool::new("offer"),
            answer_handlers: HandlerPool::new("answer"),
            shutdown_tx,
            loop_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signing_identity(&self) -> SigningIdentity {
        self.identity.signing_identity()
    }

    pub fn encryption_identity(&self) -> EncryptionIdentity {
        self.identity.encryption_identity()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(%state, "engine state");
    }

    /// Connect, install the event subscription, spawn the inbound loop,
    /// and open the gate. Operations requested earlier run now, in order.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        self.client.connect(&self.config.endpoint).await?;
        self.set_state(EngineState::Subscribing);

        let mut events = self.client.subscribe_events().await?;
        let engine = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    batch = events.recv() => {
                        match batch {
                            Some(batch) => engine.process_batch(batch).await,
                            None => {
                                info!("event stream closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        *self
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        self.set_state(EngineState::Live);
        self.gate.open();
        info!("signaling engine live");
        Ok(())
    }

    /// Stop the inbound loop and release the subscription.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Subscribe to decoded offers. No unregistration.
    pub fn on_offer(&self, handler: impl Fn(&OfferNotice) + Send + Sync + 'static) {
        self.offer_handlers.push(handler);
    }

    /// Subscribe to decoded answers. No unregistration.
    pub fn on_answer(&self, handler: impl Fn(&AnswerNotice) + Send + Sync + 'static) {
        self.answer_handlers.push(handler);
    }

    // -------------------------------------------------------------------------
    // Inbound path
    // -------------------------------------------------------------------------

    /// Process one batch, strictly in delivery order.
    async fn process_batch(&self, batch: EventBatch) {
        for event in batch {
            self.process_event(event).await;
        }
    }

    async fn process_event(&self, event: LedgerEvent) {
        let kind = match &event {
            LedgerEvent::Offer { .. } => "offer",
            LedgerEvent::Answer { .. } => "answer",
        };
        let disposition = match event {
            LedgerEvent::Offer {
                payload,
                from,
                to,
                welcome,
            } => self.process_offer(payload, from, to, welcome).await,
            LedgerEvent::Answer { payload, from, to } => {
                self.process_answer(payload, from, to).await
            }
        };
        match disposition {
            Disposition::Delivered => debug!(kind, "event delivered"),
            Disposition::Discarded(reason) => debug!(kind, reason, "event discarded"),
        }
    }

    async fn process_offer(
        &self,
        payload: Bytes,
        from: Bytes,
        to: Bytes,
        welcome: Bytes,
    ) -> Disposition {
        let Ok(to) = EncryptionIdentity::from_bytes(&to) else {
            return Disposition::Discarded("malformed recipient field");
        };
        if to != self.identity.encryption_identity() {
            return Disposition::Discarded("not addressed to this identity");
        }
        let Ok(from_signing) = SigningIdentity::from_bytes(&from) else {
            return Disposition::Discarded("malformed sender field");
        };

        let from_encryption = match self.bridge.encryption_identity_of(&from_signing).await {
            Ok(Some(key)) => key,
            Ok(None) => return Disposition::Discarded("sender not registered"),
            Err(e) => {
                debug!(sender = %hex::encode(&from), error = %e, "registration lookup failed");
                return Disposition::Discarded("registration lookup failed");
            }
        };

        let Some(offer) = self.open_text(&payload, &from_encryption) else {
            return Disposition::Discarded("payload did not decrypt");
        };

        let mut buf = WireBuf::from_bytes(&welcome);
        let welcome = match buf.get_u8().and_then(|len| buf.get_str(len as usize)) {
            Ok(text) => text,
            Err(_) => return Disposition::Discarded("malformed welcome field"),
        };

        self.offer_handlers.run(&OfferNotice {
            from_signing,
            from_encryption,
            offer,
            welcome,
        });
        Disposition::Delivered
    }

    async fn process_answer(&self, payload: Bytes, from: Bytes, to: Bytes) -> Disposition {
        let Ok(to) = EncryptionIdentity::from_bytes(&to) else {
            return Disposition::Discarded("malformed recipient field");
        };
        if to != self.identity.encryption_identity() {
            return Disposition::Discarded("not addressed to this identity");
        }
        let Ok(from) = SigningIdentity::from_bytes(&from) else {
            return Disposition::Discarded("malformed sender field");
        };

        // The answer returns to whoever sent the original offer, so the
        // sender's encryption key is resolved by signing-identity lookup
        // rather than carried in the event.
        let sender_encryption = match self.bridge.encryption_identity_of(&from).await {
            Ok(Some(key)) => key,
            Ok(None) => return Disposition::Discarded("sender not registered"),
            Err(e) => {
                debug!(sender = %from, error = %e, "registration lookup failed");
                return Disposition::Discarded("registration lookup failed");
            }
        };

        let Some(answer) = self.open_text(&payload, &sender_encryption) else {
            return Disposition::Discarded("payload did not decrypt");
        };

        self.answer_handlers.run(&AnswerNotice { from, answer });
        Disposition::Delivered
    }

    /// Decode a `u16`-prefixed ciphertext field and open it as UTF-8 text.
    fn open_text(&self, field: &[u8], sender: &EncryptionIdentity) -> Option<String> {
        String::from_utf8(self.open_field(field, sender)?.to_vec()).ok()
    }

    fn open_field(&self, field: &[u8], sender: &EncryptionIdentity) -> Option<Bytes> {
        let mut buf = WireBuf::from_bytes(field);
        let len = buf.get_u16().ok()? as usize;
        let ciphertext = buf.get_bytes(len).ok()?;
        sealed::open(&ciphertext, sender, &self.identity).ok()
    }

    // -------------------------------------------------------------------------
    // Outbound operations
    // -------------------------------------------------------------------------

    /// Publish this participant's registration record: username plus the
    /// given encryption identity, keyed by the local signing identity.
    pub async fn register(
        &self,
        username: &str,
        encryption: &EncryptionIdentity,
    ) -> Result<(), EngineError> {
        self.gate.wait().await;
        let username_field = pack_username(username)?;
        debug!(username, "registering");
        self.submit_and_wait(LedgerCall::Register {
            username_field,
            encryption_identity: *encryption,
        })
        .await
    }

    /// The username registered for a signing identity, or `None`.
    pub async fn username_of(
        &self,
        signing: &SigningIdentity,
    ) -> Result<Option<String>, EngineError> {
        self.gate.wait().await;
        Ok(self.bridge.username_of(signing).await?)
    }

    /// The signing identity registered under `username`.
    pub async fn address_of(&self, username: &str) -> Result<SigningIdentity, EngineError> {
        self.gate.wait().await;
        self.bridge
            .signing_identity_by_username(username)
            .await?
            .ok_or_else(|| EngineError::NotFound(username.to_string()))
    }

    /// The encryption identity registered for a signing identity.
    pub async fn encryption_identity_of(
        &self,
        signing: &SigningIdentity,
    ) -> Result<EncryptionIdentity, EngineError> {
        self.gate.wait().await;
        self.bridge
            .encryption_identity_of(signing)
            .await?
            .ok_or_else(|| EngineError::NotFound(signing.to_text()))
    }

    /// Decrypt the local contact book, best-effort: records that fail to
    /// parse, decrypt, or decode are dropped from the listing, never fatal.
    pub async fn contact_list(&self) -> Result<Vec<Contact>, EngineError> {
        self.gate.wait().await;
        let records = self
            .client
            .contacts_of(&self.identity.signing_identity())
            .await?;
        let mut contacts = Vec::with_capacity(records.len());
        for record in &records {
            match self.decode_contact(record) {
                Some(contact) => contacts.push(contact),
                None => debug!("dropping undecryptable contact record"),
            }
        }
        Ok(contacts)
    }

    fn decode_contact(&self, record: &ContactRecord) -> Option<Contact> {
        let own = self.identity.encryption_identity();
        let address_plain = self.open_field(&record.address_field, &own)?;
        let address = SigningIdentity::from_bytes(&address_plain).ok()?;
        let name = self.open_text(&record.name_field, &own)?;
        Some(Contact { address, name })
    }

    /// Store a contact: the resolved address and the display name, each
    /// sealed to the local encryption identity.
    pub async fn add_contact(&self, username: &str, name: &str) -> Result<(), EngineError> {
        self.gate.wait().await;
        let address = self
            .bridge
            .signing_identity_by_username(username)
            .await?
            .ok_or_else(|| EngineError::NotFound(username.to_string()))?;

        let own = self.identity.encryption_identity();
        let address_field = self.seal_field(address.as_bytes(), &own, CONTACT_BUF_CAP)?;
        let name_field = self.seal_field(name.as_bytes(), &own, CONTACT_BUF_CAP)?;
        debug!(username, "storing contact");
        self.submit_and_wait(LedgerCall::UpsertContact {
            name_field,
            address_field,
        })
        .await
    }

    /// Send a call offer to the participant behind `to`: resolve their
    /// encryption identity, seal the offer to it, and broadcast. The
    /// recipient's raw encryption identity rides along as the routing
    /// field so they can match on it without a lookup.
    pub async fn create_offer(
        &self,
        to: &SigningIdentity,
        offer: &str,
        welcome: &str,
    ) -> Result<(), EngineError> {
        self.gate.wait().await;
        if welcome.len() > MAX_WELCOME_LEN {
            return Err(EngineError::FieldTooLong {
                field: "welcome message",
                max: MAX_WELCOME_LEN,
            });
        }
        let recipient = self
            .bridge
            .encryption_identity_of(to)
            .await?
            .ok_or_else(|| EngineError::NotFound(to.to_text()))?;

        let payload_field = self.seal_field(offer.as_bytes(), &recipient, OFFER_BUF_CAP)?;

        let mut buf = WireBuf::with_capacity(WELCOME_BUF_CAP);
        buf.put_u8(welcome.len() as u8)?;
        buf.put_str(welcome)?;
        let welcome_field = buf.into_written();

        debug!(to = %to, "submitting offer");
        self.submit_and_wait(LedgerCall::Offer {
            welcome_field,
            payload_field,
            to: recipient,
        })
        .await
    }

    /// Send an answer back to an offer's sender. `to` is already an
    /// encryption identity, handed over by the received offer; no lookup.
    pub async fn create_answer(
        &self,
        to: &EncryptionIdentity,
        answer: &str,
    ) -> Result<(), EngineError> {
        self.gate.wait().await;
        let payload_field = self.seal_field(answer.as_bytes(), to, OFFER_BUF_CAP)?;
        debug!(to = %to, "submitting answer");
        self.submit_and_wait(LedgerCall::Answer {
            payload_field,
            to: *to,
        })
        .await
    }

    /// Seal `plaintext` to `recipient` and pack it as a `u16`-prefixed
    /// wire field of at most `cap` bytes.
    fn seal_field(
        &self,
        plaintext: &[u8],
        recipient: &EncryptionIdentity,
        cap: usize,
    ) -> Result<Bytes, EngineError> {
        let ciphertext = sealed::seal(plaintext, recipient, &self.identity)?;
        let len = u16::try_from(ciphertext.len()).map_err(|_| EngineError::FieldTooLong {
            field: "ciphertext",
            max: u16::MAX as usize,
        })?;
        let mut buf = WireBuf::with_capacity(cap);
        buf.put_u16(len)?;
        buf.put_bytes(&ciphertext)?;
        Ok(buf.into_written())
    }

    /// Submit a signed call and wait for the first inclusion notification.
    /// Later notifications for the same transaction are ignored. The wait
    /// is bounded by `tx_timeout`; the underlying ledger may otherwise
    /// leave a dropped transaction pending forever.
    async fn submit_and_wait(&self, call: LedgerCall) -> Result<(), EngineError> {
        let mut status = self.client.submit(&self.identity, call).await?;
        let wait = async {
            while let Some(notification) = status.recv().await {
                match notification {
                    TxStatus::Included => return Ok(()),
                    TxStatus::Failed(reason) => {
                        return Err(EngineError::Ledger(LedgerError::Rejected(reason)))
                    }
                    TxStatus::Broadcast => {}
                }
            }
            Err(EngineError::Ledger(LedgerError::Rejected(
                "status stream closed before inclusion".into(),
            )))
        };
        match tokio::time::timeout(self.config.tx_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn test_engine() -> (Arc<MemoryLedger>, Arc<SignalingEngine>) {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = SignalingEngine::new(
            Identity::generate(),
            ledger.clone() as Arc<dyn LedgerClient>,
            EngineConfig::default(),
        );
        (ledger, engine)
    }

    #[tokio::test]
    async fn test_start_transitions_to_live() {
        let (_ledger, engine) = test_engine();
        assert_eq!(engine.state(), EngineState::Connecting);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Live);
    }

    #[tokio::test]
    async fn test_operations_queue_until_live() {
        let (_ledger, engine) = test_engine();

        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.register("alice", &engine.encryption_identity()).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        engine.start().await.unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_register_then_resolve_round_trip() {
        let (_ledger, engine) = test_engine();
        engine.start().await.unwrap();

        engine
            .register("alice", &engine.encryption_identity())
            .await
            .unwrap();

        let signing = engine.signing_identity();
        assert_eq!(engine.address_of("alice").await.unwrap(), signing);
        assert_eq!(
            engine.encryption_identity_of(&signing).await.unwrap(),
            engine.encryption_identity()
        );
        assert_eq!(
            engine.username_of(&signing).await.unwrap(),
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_username_is_not_found() {
        let (_ledger, engine) = test_engine();
        engine.start().await.unwrap();

        assert!(matches!(
            engine.address_of("ghost").await,
            Err(EngineError::NotFound(name)) if name == "ghost"
        ));
        assert!(matches!(
            engine.add_contact("ghost", "Ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_to_unregistered_recipient_fails() {
        let (_ledger, engine) = test_engine();
        engine.start().await.unwrap();

        let stranger = Identity::generate();
        assert!(matches!(
            engine
                .create_offer(&stranger.signing_identity(), "SDP", "hi")
                .await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_welcome_rejected() {
        let (_ledger, engine) = test_engine();
        engine.start().await.unwrap();
        engine
            .register("alice", &engine.encryption_identity())
            .await
            .unwrap();

        let long = "x".repeat(MAX_WELCOME_LEN + 1);
        assert!(matches!(
            engine
                .create_offer(&engine.signing_identity(), "SDP", &long)
                .await,
            Err(EngineError::FieldTooLong { field: "welcome message", .. })
        ));
    }

    #[tokio::test]
    async fn test_contact_round_trip() {
        let (ledger, engine) = test_engine();
        engine.start().await.unwrap();
        engine
            .register("alice", &engine.encryption_identity())
            .await
            .unwrap();

        let bob = Identity::generate();
        let mut status = ledger
            .submit(
                &bob,
                LedgerCall::Register {
                    username_field: pack_username("bob").unwrap(),
                    encryption_identity: bob.encryption_identity(),
                },
            )
            .await
            .unwrap();
        while status.recv().await.is_some() {}

        engine.add_contact("bob", "Bob B.").await.unwrap();

        let contacts = engine.contact_list().await.unwrap();
        assert_eq!(
            contacts,
            vec![Contact {
                address: bob.signing_identity(),
                name: "Bob B.".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_submit_timeout_surfaces() {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = SignalingEngine::new(
            Identity::generate(),
            ledger.clone() as Arc<dyn LedgerClient>,
            EngineConfig {
                tx_timeout: std::time::Duration::from_millis(50),
                ..EngineConfig::default()
            },
        );
        engine.start().await.unwrap();
        ledger.hold_inclusions(true);

        assert!(matches!(
            engine.register("alice", &engine.encryption_identity()).await,
            Err(EngineError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_username_surfaces_as_rejection() {
        let (ledger, engine) = test_engine();
        engine.start().await.unwrap();

        let holder = Identity::generate();
        let mut status = ledger
            .submit(
                &holder,
                LedgerCall::Register {
                    username_field: pack_username("alice").unwrap(),
                    encryption_identity: holder.encryption_identity(),
                },
            )
            .await
            .unwrap();
        while status.recv().await.is_some() {}

        assert!(matches!(
            engine.register("alice", &engine.encryption_identity()).await,
            Err(EngineError::Ledger(LedgerError::Rejected(_)))
        ));
    }
}
