//! Test harness for chainline core functionality.
//!
//! Helpers for wiring engines to a shared in-memory ledger and running
//! the signaling flow end-to-end.

use std::sync::Arc;
use std::time::Duration;

use getrandom::getrandom;
use tokio::sync::mpsc;

use chainline_crypto::identity::Identity;

use crate::config::EngineConfig;
use crate::engine::{AnswerNotice, OfferNotice, SignalingEngine};
use crate::errors::EngineError;
use crate::ledger::{LedgerClient, MemoryLedger};

/// Generate a random 32-byte array.
pub fn rand32() -> [u8; 32] {
    let mut b = [0u8; 32];
    getrandom(&mut b).expect("rng");
    b
}

/// Build and start an engine with a fresh identity over `ledger`.
pub async fn start_engine(
    ledger: &Arc<MemoryLedger>,
) -> Result<Arc<SignalingEngine>, EngineError> {
    let engine = SignalingEngine::new(
        Identity::generate(),
        Arc::clone(ledger) as Arc<dyn LedgerClient>,
        EngineConfig::default(),
    );
    engine.start().await?;
    Ok(engine)
}

/// Run a complete signaling flow between two engines on one ledger:
/// 1. Both parties register
/// 2. Bob resolves alice's address by username
/// 3. Bob sends an offer; alice's engine decodes and delivers it
/// 4. Alice answers; bob's engine decodes and delivers it
pub async fn run_call_flow() -> Result<(), EngineError> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = start_engine(&ledger).await?;
    let bob = start_engine(&ledger).await?;

    alice.register("alice", &alice.encryption_identity()).await?;
    bob.register("bob", &bob.encryption_identity()).await?;

    let (offer_tx, mut offer_rx) = mpsc::channel::<OfferNotice>(1);
    alice.on_offer(move |notice| {
        let _ = offer_tx.try_send(notice.clone());
    });
    let (answer_tx, mut answer_rx) = mpsc::channel::<AnswerNotice>(1);
    bob.on_answer(move |notice| {
        let _ = answer_tx.try_send(notice.clone());
    });

    let alice_address = bob.address_of("alice").await?;
    bob.create_offer(&alice_address, "SDP-OFFER-1", "hi").await?;

    let offer = tokio::time::timeout(Duration::from_secs(5), offer_rx.recv())
        .await
        .expect("offer should arrive")
        .expect("offer channel open");
    assert_eq!(offer.offer, "SDP-OFFER-1");
    assert_eq!(offer.welcome, "hi");
    assert_eq!(offer.from_signing, bob.signing_identity());
    assert_eq!(offer.from_encryption, bob.encryption_identity());

    alice
        .create_answer(&offer.from_encryption, "SDP-ANSWER-1")
        .await?;

    let answer = tokio::time::timeout(Duration::from_secs(5), answer_rx.recv())
        .await
        .expect("answer should arrive")
        .expect("answer channel open");
    assert_eq!(answer.answer, "SDP-ANSWER-1");
    assert_eq!(answer.from, alice.signing_identity());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_flow() {
        run_call_flow().await.expect("call flow should succeed");
    }

    #[test]
    fn test_rand32_varies() {
        assert_ne!(rand32(), rand32());
    }
}
