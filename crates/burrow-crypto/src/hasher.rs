use burrow_types::cid::{cid_from_digest, RAW};
use burrow_types::Cid;
use sha2::{Digest, Sha256};

/// Incremental SHA-256 over a blob stream.
///
/// The resulting CID depends only on the concatenated bytes, never on how
/// they were split into chunks.
#[derive(Clone, Default)]
pub struct BlobHasher {
    inner: Sha256,
    len: u64,
}

impl BlobHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Total bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw-codec CIDv1 of everything hashed.
    pub fn finalize(self) -> Cid {
        cid_from_digest(RAW, self.inner.finalize().into())
    }
}
