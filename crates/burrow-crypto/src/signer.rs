//! Repository commit keys.
//!
//! Each account holds one Ed25519 key. The commit pipeline signs the
//! DAG-CBOR encoding of every unsigned commit with it, and readers check
//! the 64-byte `sig` field of a commit block against the account's public
//! key. Keys travel as lowercase hex in configuration and CLI output.

use ed25519_dalek::{Signer, Verifier};

const SECRET_LEN: usize = 32;
const PUBLIC_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// Errors from key parsing and commit signature checks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature does not match the commit bytes under this key.
    #[error("commit signature does not verify")]
    InvalidSignature,
    /// Key material could not be decoded.
    #[error("invalid {kind}: {reason}")]
    InvalidKey { kind: &'static str, reason: String },
    /// A commit's `sig` field has the wrong length.
    #[error("signature must be 64 bytes, got {0}")]
    BadSignatureLength(usize),
}

/// Secret half of an account's commit key.
///
/// Stored in the account row as its raw 32 bytes.
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    /// A fresh key for a new account.
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::thread_rng()))
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    /// Key given on the command line, e.g. `create-account --key`.
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        decode_hex::<SECRET_LEN>(s, "signing key").map(Self::from_bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    /// Sign unsigned commit bytes. Ed25519 is deterministic, so re-signing
    /// the same commit yields the same block.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self::from_bytes(*self.as_bytes())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Public half of an account's commit key.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

impl VerifyingKey {
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = decode_hex::<PUBLIC_LEN>(s, "public key")?;
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|e| SignatureError::InvalidKey {
                kind: "public key",
                reason: e.to_string(),
            })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Check a commit signature. Uses strict verification, which rejects
    /// malleable and small-order signatures.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0
            .verify_strict(message, &signature.0)
            .map_err(|_| SignatureError::InvalidSignature)
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyingKey({})", self.to_hex())
    }
}

/// Signature as carried in a commit block's `sig` field.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Parse the raw bytes of a commit's `sig` field.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let raw: [u8; SIGNATURE_LEN] = bytes
            .try_into()
            .map_err(|_| SignatureError::BadSignatureLength(bytes.len()))?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&raw)))
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.to_bytes()[..6]))
    }
}

fn decode_hex<const N: usize>(s: &str, kind: &'static str) -> Result<[u8; N], SignatureError> {
    let bytes = hex::decode(s.trim()).map_err(|e| SignatureError::InvalidKey {
        kind,
        reason: e.to_string(),
    })?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| SignatureError::InvalidKey {
        kind,
        reason: format!("expected {N} bytes, got {len}"),
    })
}
