//! chainline-crypto - key material and payload encryption for chainline.
//!
//! This crate implements:
//! - The dual identity model: an Ed25519 signing identity and an
//!   independent X25519 encryption identity per participant
//! - Textual address encoding for both identity namespaces
//! - Sealed-box asymmetric encryption for signaling payloads

#![forbid(unsafe_code)]

pub mod address;
pub mod identity;
pub mod sealed;
