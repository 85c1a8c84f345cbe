use burrow_types::{Cid, Did, Handle, Nsid, RecordKey, Tid};

/// One content-addressed block of an owner's repository.
///
/// `rev` is the revision of the commit that last wrote the block. Writing the
/// same content again keeps the bytes and overwrites `rev`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub rev: Tid,
    pub bytes: Vec<u8>,
}

/// Indexed copy of a record for lookup and listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordRow {
    pub collection: Nsid,
    pub rkey: RecordKey,
    pub cid: Cid,
    pub value: Vec<u8>,
    /// Server-clock TID assigned when the row was written; listing cursor.
    pub indexed_at: Tid,
}

/// Current root commit and revision of a repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoHead {
    pub root: Cid,
    pub rev: Tid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub did: Did,
    pub handle: Handle,
    pub signing_key: [u8; 32],
    pub created_at: Tid,
}

/// Metadata row of an uploaded blob.
///
/// `cid` and `size` are unset while the upload is in progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRow {
    pub id: u64,
    pub did: Did,
    pub cid: Option<Cid>,
    pub mime_type: String,
    pub size: u64,
    pub ref_count: u64,
    pub created_at: Tid,
}

/// Paging for record listings.
///
/// Rows are ordered by `indexed_at`, newest first unless `reverse` is set.
/// `cursor` is the `indexed_at` of the last row of the previous page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: usize,
    pub cursor: Option<Tid>,
    pub reverse: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            cursor: None,
            reverse: false,
        }
    }
}

/// Everything one repository commit writes, applied atomically.
///
/// The batch only applies if the owner's head root still equals
/// `expected_root`.
#[derive(Clone, Debug)]
pub struct CommitBatch {
    pub did: Did,
    pub expected_root: Cid,
    pub head: RepoHead,
    pub blocks: Vec<Block>,
    pub upserts: Vec<RecordRow>,
    pub deletes: Vec<(Nsid, RecordKey)>,
    /// One entry per increment; a CID may repeat when several records
    /// reference the same blob.
    pub blob_refs: Vec<Cid>,
}
