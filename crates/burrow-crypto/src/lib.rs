//! Cryptographic primitives for burrow.
//!
//! Provides the Ed25519 keys that sign repository commits and a streaming SHA-256
//! hasher for blob uploads.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;
pub mod signer;

pub use hasher::BlobHasher;
pub use signer::{Signature, SignatureError, SigningKey, VerifyingKey};
