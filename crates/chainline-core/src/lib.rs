//! chainline-core - call signaling over a public ledger's event log.
//!
//! This crate implements:
//! - The fixed-capacity wire buffer used by every message field
//! - A one-shot readiness gate deferring operations until the transport
//!   is live
//! - Ordered multi-subscriber handler pools for decoded notices
//! - The ledger client abstraction and an in-memory implementation
//! - Resolution between the signing and encryption identity namespaces
//! - The signaling engine: inbound event decoding and decryption,
//!   outbound register/lookup/contact/offer/answer operations

#![forbid(unsafe_code)]

// Protocol engine
pub mod engine;

// Services
pub mod bridge;
pub mod ledger;

// Wire format
pub mod wire;

// Concurrency primitives
pub mod handlers;
pub mod ready;

// Supporting modules
pub mod config;
pub mod errors;
pub mod harness;
