use std::sync::Arc;

use burrow_crypto::BlobHasher;
use burrow_types::{BlobRef, Cid, Did, TidClock};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::models::BlobRow;
use crate::traits::Storage;

/// Nominal size of a stored blob part.
pub const BLOB_CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Chunked blob storage.
///
/// Uploads are written part by part as they arrive and addressed by the
/// SHA-256 of the whole stream once complete. Reference counts are only
/// ever incremented, by repository commits.
pub struct BlobStore {
    storage: Arc<dyn Storage>,
    clock: Arc<TidClock>,
    max_size: u64,
}

impl BlobStore {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<TidClock>) -> Self {
        Self {
            storage,
            clock,
            max_size: u64::MAX,
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Create the blob row and return a handle for streaming chunks into it.
    pub fn begin_upload(&self, did: &Did, mime_type: Option<&str>) -> StoreResult<BlobUpload> {
        let mime_type = match mime_type {
            Some(m) if !m.trim().is_empty() => m.trim().to_string(),
            _ => DEFAULT_MIME_TYPE.to_string(),
        };
        let id = self.storage.create_blob(did, &mime_type, self.clock.next())?;
        debug!(%did, blob_id = id, %mime_type, "blob upload started");
        Ok(BlobUpload {
            storage: Arc::clone(&self.storage),
            id,
            did: did.clone(),
            mime_type,
            next_idx: 0,
            hasher: BlobHasher::new(),
            ended: false,
            max_size: self.max_size,
        })
    }

    /// Reassemble a finished blob.
    pub fn get(&self, did: &Did, cid: &Cid) -> StoreResult<(BlobRow, Vec<u8>)> {
        let row = self
            .storage
            .blob(did, cid)?
            .ok_or_else(|| StoreError::NotFound(format!("blob {cid} for {did}")))?;
        let data = self.storage.blob_parts(row.id)?.concat();
        if data.len() as u64 != row.size {
            return Err(StoreError::Backend(format!(
                "blob {cid} has {} bytes, expected {}",
                data.len(),
                row.size
            )));
        }
        Ok((row, data))
    }

    pub fn list(&self, did: &Did, cursor: Option<u64>, limit: usize) -> StoreResult<Vec<BlobRow>> {
        self.storage.list_blobs(did, cursor, limit)
    }
}

/// An in-progress upload.
///
/// Dropping an upload without finishing leaves an unfinished row that is
/// never returned by reads.
pub struct BlobUpload {
    storage: Arc<dyn Storage>,
    id: u64,
    did: Did,
    mime_type: String,
    next_idx: u32,
    hasher: BlobHasher,
    ended: bool,
    max_size: u64,
}

impl BlobUpload {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bytes accepted so far.
    pub fn size(&self) -> u64 {
        self.hasher.len()
    }

    /// Persist the next part.
    ///
    /// Parts are at most [`BLOB_CHUNK_SIZE`] bytes. A shorter part is the
    /// last one; an empty write marks end-of-stream without writing a part.
    /// Writes after the end are rejected.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> StoreResult<()> {
        if self.ended {
            return Err(StoreError::InvalidOperation(format!("blob {} stream already ended", self.id)));
        }
        if chunk.is_empty() {
            self.ended = true;
            return Ok(());
        }
        if chunk.len() > BLOB_CHUNK_SIZE {
            return Err(StoreError::InvalidOperation(format!(
                "chunk of {} bytes exceeds {BLOB_CHUNK_SIZE}",
                chunk.len()
            )));
        }
        if self.hasher.len() + chunk.len() as u64 > self.max_size {
            return Err(StoreError::InvalidOperation(format!(
                "blob exceeds maximum size of {} bytes",
                self.max_size
            )));
        }
        self.storage.put_blob_part(self.id, self.next_idx, chunk)?;
        self.hasher.update(chunk);
        self.next_idx += 1;
        if chunk.len() < BLOB_CHUNK_SIZE {
            self.ended = true;
        }
        Ok(())
    }

    /// Compute the content CID and mark the blob finished.
    pub fn finish(self) -> StoreResult<BlobRef> {
        let size = self.hasher.len();
        let cid = self.hasher.finalize();
        self.storage.finish_blob(self.id, &cid, size)?;
        info!(did = %self.did, %cid, size, parts = self.next_idx, "blob stored");
        Ok(BlobRef {
            cid,
            mime_type: self.mime_type,
            size,
        })
    }
}

/// Splits an arbitrary byte stream into [`BLOB_CHUNK_SIZE`] parts.
pub struct ChunkedWriter {
    upload: BlobUpload,
    buf: Vec<u8>,
}

impl ChunkedWriter {
    pub fn new(upload: BlobUpload) -> Self {
        Self {
            upload,
            buf: Vec::with_capacity(BLOB_CHUNK_SIZE),
        }
    }

    pub fn write(&mut self, mut data: &[u8]) -> StoreResult<()> {
        while !data.is_empty() {
            let take = (BLOB_CHUNK_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == BLOB_CHUNK_SIZE {
                self.upload.write_chunk(&self.buf)?;
                self.buf.clear();
            }
        }
        Ok(())
    }

    /// Flush the final short part, if any, and finish the upload.
    pub fn finish(mut self) -> StoreResult<BlobRef> {
        if !self.buf.is_empty() {
            self.upload.write_chunk(&self.buf)?;
        }
        self.upload.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStorage;
    use crate::traits::BlobStorage;
    use burrow_types::cid_for_raw;
    use proptest::prelude::*;

    fn setup() -> (Arc<InMemoryStorage>, BlobStore, Did) {
        let storage = Arc::new(InMemoryStorage::new());
        let store = BlobStore::new(storage.clone(), Arc::new(TidClock::new(1)));
        (storage, store, Did::parse("did:example:alice").unwrap())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunked_roundtrip() {
        let (storage, store, did) = setup();
        let data = pattern(3 * BLOB_CHUNK_SIZE + 1000);

        let mut writer = ChunkedWriter::new(store.begin_upload(&did, Some("image/png")).unwrap());
        for piece in data.chunks(7000) {
            writer.write(piece).unwrap();
        }
        let blob = writer.finish().unwrap();

        assert_eq!(blob.cid, cid_for_raw(&data));
        assert_eq!(blob.size, data.len() as u64);
        assert_eq!(blob.mime_type, "image/png");

        let (row, bytes) = store.get(&did, &blob.cid).unwrap();
        assert_eq!(bytes, data);
        assert_eq!(row.ref_count, 0);
        let parts = storage.blob_parts(row.id).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].len(), 1000);
    }

    #[test]
    fn default_mime_type() {
        let (_, store, did) = setup();
        let mut up = store.begin_upload(&did, None).unwrap();
        up.write_chunk(b"abc").unwrap();
        assert_eq!(up.finish().unwrap().mime_type, DEFAULT_MIME_TYPE);
    }

    #[test]
    fn unfinished_blob_is_not_readable() {
        let (_, store, did) = setup();
        let mut up = store.begin_upload(&did, None).unwrap();
        up.write_chunk(b"partial").unwrap();
        let err = store.get(&did, &cid_for_raw(b"partial")).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.list(&did, None, 10).unwrap().is_empty());
    }

    #[test]
    fn short_chunk_ends_stream() {
        let (_, store, did) = setup();
        let mut up = store.begin_upload(&did, None).unwrap();
        up.write_chunk(b"short").unwrap();
        assert!(matches!(up.write_chunk(b"more"), Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn empty_write_is_end_of_stream() {
        let (storage, store, did) = setup();
        let mut up = store.begin_upload(&did, None).unwrap();
        up.write_chunk(&pattern(BLOB_CHUNK_SIZE)).unwrap();
        up.write_chunk(&[]).unwrap();
        assert!(up.write_chunk(b"late").is_err());
        let id = up.id();
        let blob = up.finish().unwrap();
        assert_eq!(blob.size, BLOB_CHUNK_SIZE as u64);
        assert_eq!(storage.blob_parts(id).unwrap().len(), 1);
    }

    #[test]
    fn empty_blob() {
        let (_, store, did) = setup();
        let blob = ChunkedWriter::new(store.begin_upload(&did, None).unwrap()).finish().unwrap();
        assert_eq!(blob.cid, cid_for_raw(b""));
        assert_eq!(store.get(&did, &blob.cid).unwrap().1, Vec::<u8>::new());
    }

    #[test]
    fn oversized_chunk_rejected() {
        let (_, store, did) = setup();
        let mut up = store.begin_upload(&did, None).unwrap();
        assert!(up.write_chunk(&pattern(BLOB_CHUNK_SIZE + 1)).is_err());
    }

    #[test]
    fn max_size_enforced() {
        let (storage, _, did) = setup();
        let store = BlobStore::new(storage, Arc::new(TidClock::new(1))).with_max_size(100);
        let mut writer = ChunkedWriter::new(store.begin_upload(&did, None).unwrap());
        writer.write(&pattern(101)).unwrap();
        assert!(matches!(writer.finish(), Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn finish_is_once_only() {
        let (storage, store, did) = setup();
        let mut up = store.begin_upload(&did, None).unwrap();
        up.write_chunk(b"x").unwrap();
        let id = up.id();
        let blob = up.finish().unwrap();
        assert!(storage.finish_blob(id, &blob.cid, 1).is_err());
    }

    #[test]
    fn list_is_per_owner() {
        let (_, store, did) = setup();
        let other = Did::parse("did:example:bob").unwrap();
        for (owner, data) in [(&did, &b"a"[..]), (&other, &b"b"[..]), (&did, &b"c"[..])] {
            let mut up = store.begin_upload(owner, None).unwrap();
            up.write_chunk(data).unwrap();
            up.finish().unwrap();
        }
        let mine = store.list(&did, None, 10).unwrap();
        assert_eq!(mine.len(), 2);
        let after = store.list(&did, Some(mine[0].id), 10).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].cid, Some(cid_for_raw(b"c")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn cid_independent_of_write_boundaries(len in 0usize..(2 * BLOB_CHUNK_SIZE + 10), split in 1usize..20_000) {
            let (_, store, did) = setup();
            let data = pattern(len);
            let mut writer = ChunkedWriter::new(store.begin_upload(&did, None).unwrap());
            for piece in data.chunks(split) {
                writer.write(piece).unwrap();
            }
            let blob = writer.finish().unwrap();
            prop_assert_eq!(blob.cid, cid_for_raw(&data));
            prop_assert_eq!(store.get(&did, &blob.cid).unwrap().1, data);
        }
    }
}
