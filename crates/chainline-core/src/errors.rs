//! Unified error type for engine operations.
//!
//! Inbound decode and decrypt failures never appear here: a public
//! broadcast channel is expected to carry events irrelevant to this
//! identity, so the inbound path discards them with a debug log. Every
//! outbound failure, by contrast, surfaces as an `EngineError`.

use thiserror::Error;

use chainline_crypto::sealed::SealedError;

use crate::ledger::LedgerError;
use crate::wire::WireError;

/// Errors surfaced by outbound signaling operations.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// A wire-format bound was violated while packing a field. Indicates
    /// a framing bug or an oversized payload; not retried.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// The ledger client reported a failed query or a rejected
    /// transaction.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A lookup yielded no registration record.
    #[error("not registered: {0}")]
    NotFound(String),

    /// An input exceeds its wire-format bound.
    #[error("{field} exceeds {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },

    /// No inclusion notification arrived within the configured window.
    #[error("timed out waiting for transaction inclusion")]
    Timeout,

    /// Encryption failed on the outbound path against a resolved key.
    /// Should not happen; indicates an internal key-handling error.
    #[error("outbound crypto failure: {0}")]
    Crypto(#[from] SealedError),
}
