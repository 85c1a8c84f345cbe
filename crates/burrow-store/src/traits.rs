use burrow_types::{Cid, Did, Handle, Nsid, RecordKey, Tid};

use crate::error::StoreResult;
use crate::models::{Account, Block, BlobRow, CommitBatch, ListQuery, RecordRow, RepoHead};

/// Per-owner content-addressed block rows.
///
/// Blocks are keyed by `(did, cid)` and never deleted. Concurrent reads are
/// always safe.
pub trait BlockStorage: Send + Sync {
    /// Read a block. Returns `Ok(None)` if the owner has no such block.
    fn get_block(&self, did: &Did, cid: &Cid) -> StoreResult<Option<Block>>;

    /// Insert or overwrite a block row.
    fn put_block(&self, did: &Did, block: &Block) -> StoreResult<()>;

    /// Write multiple blocks.
    ///
    /// Default implementation calls `put_block()` for each block. Backends
    /// may override to use a single transaction.
    fn put_blocks(&self, did: &Did, blocks: &[Block]) -> StoreResult<()> {
        blocks.iter().try_for_each(|b| self.put_block(did, b))
    }

    /// Every block of an owner, ordered by revision.
    fn blocks_for(&self, did: &Did) -> StoreResult<Vec<Block>>;
}

/// Accounts, handles and repository heads.
pub trait AccountStorage: Send + Sync {
    /// Insert a new account. Fails with `AlreadyExists` if the DID or the
    /// handle is taken.
    fn create_account(&self, account: &Account) -> StoreResult<()>;

    /// Remove an account that never got a head, freeing its DID and handle.
    /// Missing accounts are ignored; an account with a head is refused with
    /// `InvalidOperation`.
    fn remove_headless_account(&self, did: &Did) -> StoreResult<()>;

    fn account(&self, did: &Did) -> StoreResult<Option<Account>>;

    fn account_by_handle(&self, handle: &Handle) -> StoreResult<Option<Account>>;

    /// Rebind an account's handle. Fails with `AlreadyExists` if another
    /// account holds it.
    fn set_handle(&self, did: &Did, handle: &Handle) -> StoreResult<()>;

    fn head(&self, did: &Did) -> StoreResult<Option<RepoHead>>;

    /// Unconditionally overwrite an owner's head.
    fn set_head(&self, did: &Did, head: &RepoHead) -> StoreResult<()>;

    /// Heads ordered by DID, starting after `cursor`.
    fn list_heads(&self, cursor: Option<&Did>, limit: usize) -> StoreResult<Vec<(Did, RepoHead)>>;
}

/// Read side of the record index. Rows are written only through
/// [`Storage::apply_commit`].
pub trait RecordStorage: Send + Sync {
    fn get_record(&self, did: &Did, collection: &Nsid, rkey: &RecordKey) -> StoreResult<Option<RecordRow>>;

    fn list_records(&self, did: &Did, collection: &Nsid, query: &ListQuery) -> StoreResult<Vec<RecordRow>>;

    /// Collections holding at least one record.
    fn collections(&self, did: &Did) -> StoreResult<Vec<Nsid>>;
}

/// Blob metadata and chunk rows.
pub trait BlobStorage: Send + Sync {
    /// Create an unfinished blob row with a zero reference count.
    fn create_blob(&self, did: &Did, mime_type: &str, created_at: Tid) -> StoreResult<u64>;

    fn put_blob_part(&self, blob_id: u64, idx: u32, data: &[u8]) -> StoreResult<()>;

    /// Record the final CID and size. A blob can be finished only once.
    fn finish_blob(&self, blob_id: u64, cid: &Cid, size: u64) -> StoreResult<()>;

    /// Finished blob by content. Unfinished uploads are never returned.
    fn blob(&self, did: &Did, cid: &Cid) -> StoreResult<Option<BlobRow>>;

    /// Parts of a blob in index order.
    fn blob_parts(&self, blob_id: u64) -> StoreResult<Vec<Vec<u8>>>;

    /// Finished blobs ordered by id, starting after `cursor`.
    fn list_blobs(&self, did: &Did, cursor: Option<u64>, limit: usize) -> StoreResult<Vec<BlobRow>>;
}

/// Complete storage backend for the server.
pub trait Storage: BlockStorage + AccountStorage + RecordStorage + BlobStorage {
    /// Apply a commit atomically: blocks, record rows, blob reference
    /// increments and the new head all land, or none do.
    ///
    /// Fails with `HeadMismatch` if the owner's head root is no longer
    /// `batch.expected_root`, and with `NotFound` if the owner has no head.
    fn apply_commit(&self, batch: &CommitBatch) -> StoreResult<()>;
}
