use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use burrow_types::{Cid, Did, Handle, Nsid, RecordKey, Tid};

use crate::error::{StoreError, StoreResult};
use crate::models::{Account, Block, BlobRow, CommitBatch, ListQuery, RecordRow, RepoHead};
use crate::traits::{AccountStorage, BlobStorage, BlockStorage, RecordStorage, Storage};

#[derive(Default)]
struct Tables {
    blocks: HashMap<(Did, Cid), Block>,
    accounts: BTreeMap<Did, Account>,
    handles: HashMap<Handle, Did>,
    heads: BTreeMap<Did, RepoHead>,
    records: BTreeMap<(Did, Nsid, RecordKey), RecordRow>,
    blobs: BTreeMap<u64, BlobRow>,
    blob_index: HashMap<(Did, Cid), u64>,
    blob_parts: BTreeMap<(u64, u32), Vec<u8>>,
    next_blob_id: u64,
}

/// In-memory storage backend.
///
/// Intended for tests and ephemeral servers. All tables sit behind a single
/// `RwLock`, so [`Storage::apply_commit`] is trivially atomic.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_blob_id: 1,
                ..Tables::default()
            }),
        }
    }

    /// Total number of block rows across all owners.
    pub fn block_count(&self) -> usize {
        self.tables.read().expect("lock poisoned").blocks.len()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStorage for InMemoryStorage {
    fn get_block(&self, did: &Did, cid: &Cid) -> StoreResult<Option<Block>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables.blocks.get(&(did.clone(), *cid)).cloned())
    }

    fn put_block(&self, did: &Did, block: &Block) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        tables.blocks.insert((did.clone(), block.cid), block.clone());
        Ok(())
    }

    fn blocks_for(&self, did: &Did) -> StoreResult<Vec<Block>> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut blocks: Vec<Block> = tables
            .blocks
            .iter()
            .filter(|((owner, _), _)| owner == did)
            .map(|(_, b)| b.clone())
            .collect();
        blocks.sort_by(|a, b| (a.rev, a.cid.to_bytes()).cmp(&(b.rev, b.cid.to_bytes())));
        Ok(blocks)
    }
}

impl AccountStorage for InMemoryStorage {
    fn create_account(&self, account: &Account) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        if tables.accounts.contains_key(&account.did) {
            return Err(StoreError::AlreadyExists(account.did.to_string()));
        }
        if tables.handles.contains_key(&account.handle) {
            return Err(StoreError::AlreadyExists(account.handle.to_string()));
        }
        tables.handles.insert(account.handle.clone(), account.did.clone());
        tables.accounts.insert(account.did.clone(), account.clone());
        Ok(())
    }

    fn remove_headless_account(&self, did: &Did) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        if tables.heads.contains_key(did) {
            return Err(StoreError::InvalidOperation(format!("{did} has a repository head")));
        }
        if let Some(account) = tables.accounts.remove(did) {
            tables.handles.remove(&account.handle);
        }
        Ok(())
    }

    fn account(&self, did: &Did) -> StoreResult<Option<Account>> {
        Ok(self.tables.read().expect("lock poisoned").accounts.get(did).cloned())
    }

    fn account_by_handle(&self, handle: &Handle) -> StoreResult<Option<Account>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables
            .handles
            .get(handle)
            .and_then(|did| tables.accounts.get(did))
            .cloned())
    }

    fn set_handle(&self, did: &Did, handle: &Handle) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        match tables.handles.get(handle) {
            Some(owner) if owner != did => return Err(StoreError::AlreadyExists(handle.to_string())),
            _ => {}
        }
        let account = tables
            .accounts
            .get_mut(did)
            .ok_or_else(|| StoreError::NotFound(did.to_string()))?;
        let old = std::mem::replace(&mut account.handle, handle.clone());
        tables.handles.remove(&old);
        tables.handles.insert(handle.clone(), did.clone());
        Ok(())
    }

    fn head(&self, did: &Did) -> StoreResult<Option<RepoHead>> {
        Ok(self.tables.read().expect("lock poisoned").heads.get(did).cloned())
    }

    fn set_head(&self, did: &Did, head: &RepoHead) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        tables.heads.insert(did.clone(), head.clone());
        Ok(())
    }

    fn list_heads(&self, cursor: Option<&Did>, limit: usize) -> StoreResult<Vec<(Did, RepoHead)>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables
            .heads
            .iter()
            .filter(|(did, _)| cursor.map_or(true, |c| *did > c))
            .take(limit)
            .map(|(d, h)| (d.clone(), h.clone()))
            .collect())
    }
}

impl RecordStorage for InMemoryStorage {
    fn get_record(&self, did: &Did, collection: &Nsid, rkey: &RecordKey) -> StoreResult<Option<RecordRow>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables
            .records
            .get(&(did.clone(), collection.clone(), rkey.clone()))
            .cloned())
    }

    fn list_records(&self, did: &Did, collection: &Nsid, query: &ListQuery) -> StoreResult<Vec<RecordRow>> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut rows: Vec<RecordRow> = tables
            .records
            .iter()
            .filter(|((d, c, _), _)| d == did && c == collection)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|r| r.indexed_at);
        if !query.reverse {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .filter(|r| match query.cursor {
                Some(c) if query.reverse => r.indexed_at > c,
                Some(c) => r.indexed_at < c,
                None => true,
            })
            .take(query.limit)
            .collect())
    }

    fn collections(&self, did: &Did) -> StoreResult<Vec<Nsid>> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut out: Vec<Nsid> = Vec::new();
        for (d, c, _) in tables.records.keys() {
            if d == did && out.last() != Some(c) {
                out.push(c.clone());
            }
        }
        Ok(out)
    }
}

impl BlobStorage for InMemoryStorage {
    fn create_blob(&self, did: &Did, mime_type: &str, created_at: Tid) -> StoreResult<u64> {
        let mut tables = self.tables.write().expect("lock poisoned");
        let id = tables.next_blob_id;
        tables.next_blob_id += 1;
        tables.blobs.insert(
            id,
            BlobRow {
                id,
                did: did.clone(),
                cid: None,
                mime_type: mime_type.to_string(),
                size: 0,
                ref_count: 0,
                created_at,
            },
        );
        Ok(id)
    }

    fn put_blob_part(&self, blob_id: u64, idx: u32, data: &[u8]) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        if !tables.blobs.contains_key(&blob_id) {
            return Err(StoreError::NotFound(format!("blob {blob_id}")));
        }
        tables.blob_parts.insert((blob_id, idx), data.to_vec());
        Ok(())
    }

    fn finish_blob(&self, blob_id: u64, cid: &Cid, size: u64) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        let row = tables
            .blobs
            .get_mut(&blob_id)
            .ok_or_else(|| StoreError::NotFound(format!("blob {blob_id}")))?;
        if row.cid.is_some() {
            return Err(StoreError::InvalidOperation(format!("blob {blob_id} already finished")));
        }
        row.cid = Some(*cid);
        row.size = size;
        let key = (row.did.clone(), *cid);
        tables.blob_index.insert(key, blob_id);
        Ok(())
    }

    fn blob(&self, did: &Did, cid: &Cid) -> StoreResult<Option<BlobRow>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables
            .blob_index
            .get(&(did.clone(), *cid))
            .and_then(|id| tables.blobs.get(id))
            .cloned())
    }

    fn blob_parts(&self, blob_id: u64) -> StoreResult<Vec<Vec<u8>>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables
            .blob_parts
            .range((blob_id, 0)..=(blob_id, u32::MAX))
            .map(|(_, data)| data.clone())
            .collect())
    }

    fn list_blobs(&self, did: &Did, cursor: Option<u64>, limit: usize) -> StoreResult<Vec<BlobRow>> {
        let tables = self.tables.read().expect("lock poisoned");
        let start = cursor.map_or(0, |c| c.saturating_add(1));
        Ok(tables
            .blobs
            .range(start..)
            .map(|(_, row)| row)
            .filter(|row| &row.did == did && row.cid.is_some())
            .take(limit)
            .cloned()
            .collect())
    }
}

impl Storage for InMemoryStorage {
    fn apply_commit(&self, batch: &CommitBatch) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        let current = tables
            .heads
            .get(&batch.did)
            .ok_or_else(|| StoreError::NotFound(format!("repo head for {}", batch.did)))?;
        if current.root != batch.expected_root {
            return Err(StoreError::HeadMismatch {
                did: batch.did.to_string(),
                expected: batch.expected_root.to_string(),
                actual: current.root.to_string(),
            });
        }

        for block in &batch.blocks {
            tables.blocks.insert((batch.did.clone(), block.cid), block.clone());
        }
        for row in &batch.upserts {
            let key = (batch.did.clone(), row.collection.clone(), row.rkey.clone());
            tables.records.insert(key, row.clone());
        }
        for (collection, rkey) in &batch.deletes {
            tables
                .records
                .remove(&(batch.did.clone(), collection.clone(), rkey.clone()));
        }
        for cid in &batch.blob_refs {
            let id = tables.blob_index.get(&(batch.did.clone(), *cid)).copied();
            if let Some(row) = id.and_then(|id| tables.blobs.get_mut(&id)) {
                row.ref_count += 1;
            }
        }
        tables.heads.insert(batch.did.clone(), batch.head.clone());
        Ok(())
    }
}
