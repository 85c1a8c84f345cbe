use std::sync::Arc;

use burrow_types::{verify_cid, Cid, Did, Tid};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::{Block, RepoHead};
use crate::traits::Storage;

/// Per-owner view of the block table used while building a commit.
///
/// Every `put` is appended to an in-memory log. In write mode the block is
/// also persisted immediately; in read-only mode it is only staged, so a
/// commit can be computed, inspected and exported before anything touches
/// durable state. Staged blocks are not visible to `get`.
///
/// Every block written through a store is stamped with the revision the
/// store was created for, which is the revision of the commit being built.
pub struct Blockstore {
    storage: Arc<dyn Storage>,
    did: Did,
    rev: Tid,
    read_only: bool,
    inserts: Vec<Block>,
}

impl Blockstore {
    /// Store that persists every write.
    pub fn new(storage: Arc<dyn Storage>, did: Did, rev: Tid) -> Self {
        Self {
            storage,
            did,
            rev,
            read_only: false,
            inserts: Vec::new(),
        }
    }

    /// Store that only stages writes until [`replay`](Self::replay).
    pub fn read_only(storage: Arc<dyn Storage>, did: Did, rev: Tid) -> Self {
        Self {
            read_only: true,
            ..Self::new(storage, did, rev)
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn rev(&self) -> Tid {
        self.rev
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Exact stored bytes of a block. The caller verifies the hash.
    pub fn get(&self, cid: &Cid) -> StoreResult<Vec<u8>> {
        self.storage
            .get_block(&self.did, cid)?
            .map(|b| b.bytes)
            .ok_or_else(|| StoreError::NotFound(format!("block {cid} for {}", self.did)))
    }

    /// Like [`get`](Self::get), failing with `HashMismatch` if the bytes do
    /// not hash to `cid`.
    pub fn get_verified(&self, cid: &Cid) -> StoreResult<Vec<u8>> {
        let bytes = self.get(cid)?;
        if !verify_cid(cid, &bytes) {
            return Err(StoreError::HashMismatch(cid.to_string()));
        }
        Ok(bytes)
    }

    /// Stage a block, persisting it as well unless read-only.
    pub fn put(&mut self, cid: Cid, bytes: Vec<u8>) -> StoreResult<()> {
        let block = Block {
            cid,
            rev: self.rev,
            bytes,
        };
        if !self.read_only {
            self.storage.put_block(&self.did, &block)?;
        }
        self.inserts.push(block);
        Ok(())
    }

    /// Persist every staged block.
    ///
    /// Only valid on a read-only store. Write mode is entered for the
    /// duration of the replay and read-only mode is restored afterwards,
    /// whether or not the replay succeeded.
    pub fn replay(&mut self) -> StoreResult<()> {
        if !self.read_only {
            return Err(StoreError::InvalidOperation("blockstore was not read-only".into()));
        }
        self.read_only = false;
        let result = self.storage.put_blocks(&self.did, &self.inserts);
        self.read_only = true;
        debug!(did = %self.did, blocks = self.inserts.len(), ok = result.is_ok(), "replayed staged blocks");
        result
    }

    /// Overwrite the owner's head.
    pub fn update_head(&self, root: Cid, rev: Tid) -> StoreResult<()> {
        self.storage.set_head(&self.did, &RepoHead { root, rev })
    }

    /// Every block staged through this store, in insertion order.
    pub fn log(&self) -> &[Block] {
        &self.inserts
    }

    pub fn into_log(self) -> Vec<Block> {
        self.inserts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStorage;
    use crate::traits::{AccountStorage, BlockStorage};
    use burrow_types::cid_for_cbor;

    fn setup() -> (Arc<InMemoryStorage>, Did) {
        (Arc::new(InMemoryStorage::new()), Did::parse("did:example:alice").unwrap())
    }

    #[test]
    fn write_mode_persists_and_logs() {
        let (storage, did) = setup();
        let mut bs = Blockstore::new(storage.clone(), did.clone(), Tid::from_parts(5, 0));
        let cid = cid_for_cbor(b"one");
        bs.put(cid, b"one".to_vec()).unwrap();

        assert_eq!(bs.get(&cid).unwrap(), b"one");
        assert_eq!(bs.log().len(), 1);
        assert_eq!(storage.get_block(&did, &cid).unwrap().unwrap().rev, Tid::from_parts(5, 0));
    }

    #[test]
    fn missing_block_is_not_found() {
        let (storage, did) = setup();
        let bs = Blockstore::new(storage, did, Tid::from_parts(1, 0));
        let err = bs.get(&cid_for_cbor(b"absent")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn staged_blocks_are_invisible_until_replay() {
        let (storage, did) = setup();
        let mut bs = Blockstore::read_only(storage.clone(), did.clone(), Tid::from_parts(7, 0));
        let cid = cid_for_cbor(b"staged");
        bs.put(cid, b"staged".to_vec()).unwrap();

        assert!(bs.get(&cid).unwrap_err().is_not_found());
        assert_eq!(bs.log()[0].cid, cid);
        assert_eq!(storage.block_count(), 0);

        bs.replay().unwrap();
        assert!(bs.is_read_only());
        assert_eq!(bs.get_verified(&cid).unwrap(), b"staged");
        assert_eq!(storage.get_block(&did, &cid).unwrap().unwrap().rev, Tid::from_parts(7, 0));
    }

    #[test]
    fn replay_requires_read_only() {
        let (storage, did) = setup();
        let mut bs = Blockstore::new(storage, did, Tid::from_parts(1, 0));
        assert!(matches!(bs.replay(), Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn rewrite_keeps_bytes_and_moves_rev() {
        let (storage, did) = setup();
        let cid = cid_for_cbor(b"same");
        Blockstore::new(storage.clone(), did.clone(), Tid::from_parts(1, 0))
            .put(cid, b"same".to_vec())
            .unwrap();
        Blockstore::new(storage.clone(), did.clone(), Tid::from_parts(2, 0))
            .put(cid, b"same".to_vec())
            .unwrap();

        let block = storage.get_block(&did, &cid).unwrap().unwrap();
        assert_eq!(block.bytes, b"same");
        assert_eq!(block.rev, Tid::from_parts(2, 0));
        assert_eq!(storage.block_count(), 1);
    }

    #[test]
    fn corrupted_block_fails_verification() {
        let (storage, did) = setup();
        let cid = cid_for_cbor(b"good");
        let mut bs = Blockstore::new(storage, did, Tid::from_parts(1, 0));
        bs.put(cid, b"evil".to_vec()).unwrap();
        assert!(matches!(bs.get_verified(&cid), Err(StoreError::HashMismatch(_))));
    }

    #[test]
    fn update_head_overwrites() {
        let (storage, did) = setup();
        let bs = Blockstore::new(storage.clone(), did.clone(), Tid::from_parts(1, 0));
        bs.update_head(cid_for_cbor(b"a"), Tid::from_parts(1, 0)).unwrap();
        bs.update_head(cid_for_cbor(b"b"), Tid::from_parts(2, 0)).unwrap();
        let head = storage.head(&did).unwrap().unwrap();
        assert_eq!(head.root, cid_for_cbor(b"b"));
        assert_eq!(head.rev, Tid::from_parts(2, 0));
    }

    #[test]
    fn owners_are_isolated() {
        let (storage, did) = setup();
        let other = Did::parse("did:example:bob").unwrap();
        let cid = cid_for_cbor(b"mine");
        Blockstore::new(storage.clone(), did, Tid::from_parts(1, 0))
            .put(cid, b"mine".to_vec())
            .unwrap();
        let bs = Blockstore::new(storage, other, Tid::from_parts(1, 0));
        assert!(bs.get(&cid).unwrap_err().is_not_found());
    }
}
