use std::ops::Bound;
use std::path::Path;

use burrow_types::cid::cid_from_bytes;
use burrow_types::{Cid, Did, Handle, Nsid, RecordKey, Tid};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::models::{Account, Block, BlobRow, CommitBatch, ListQuery, RecordRow, RepoHead};
use crate::traits::{AccountStorage, BlobStorage, BlockStorage, RecordStorage, Storage};

// (did, cid) -> StoredBlock
const BLOCKS: TableDefinition<(&str, &[u8]), &[u8]> = TableDefinition::new("blocks-1");
// (did, rev, cid) -> ()
const BLOCKS_BY_REV: TableDefinition<(&str, &str, &[u8]), ()> = TableDefinition::new("blocks-by-rev-1");
// did -> StoredAccount
const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts-1");
// handle -> did
const HANDLES: TableDefinition<&str, &str> = TableDefinition::new("handles-1");
// did -> StoredHead
const HEADS: TableDefinition<&str, &[u8]> = TableDefinition::new("heads-1");
// (did, collection, rkey) -> StoredRecord
const RECORDS: TableDefinition<(&str, &str, &str), &[u8]> = TableDefinition::new("records-1");
// (did, collection, indexed_at) -> rkey
const RECORDS_BY_TIME: TableDefinition<(&str, &str, &str), &str> = TableDefinition::new("records-by-time-1");
// id -> StoredBlob
const BLOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("blobs-1");
// (did, cid) -> id
const BLOB_INDEX: TableDefinition<(&str, &[u8]), u64> = TableDefinition::new("blob-index-1");
// (blob id, idx) -> bytes
const BLOB_PARTS: TableDefinition<(u64, u32), &[u8]> = TableDefinition::new("blob-parts-1");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta-1");

type RecordKeyTuple = (&'static str, &'static str, &'static str);

const NEXT_BLOB_ID: &str = "next-blob-id";
// Sorts after every TID character.
const TID_UPPER: &str = "~";

#[derive(Serialize, Deserialize)]
struct StoredBlock {
    rev: String,
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredAccount {
    handle: String,
    signing_key: [u8; 32],
    created_at: String,
}

#[derive(Serialize, Deserialize)]
struct StoredHead {
    root: Vec<u8>,
    rev: String,
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    cid: Vec<u8>,
    value: Vec<u8>,
    indexed_at: String,
}

#[derive(Serialize, Deserialize)]
struct StoredBlob {
    did: String,
    cid: Option<Vec<u8>>,
    mime_type: String,
    size: u64,
    ref_count: u64,
    created_at: String,
}

/// Durable storage backed by a single redb database file.
///
/// Every logical write runs in one write transaction; a commit batch runs
/// in exactly one, so a crash leaves either all of it or none of it.
#[derive(Debug)]
pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    pub fn persistent(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening repository database");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::builder().create(path)?;
        Self::open(db)
    }

    pub fn in_memory() -> StoreResult<Self> {
        debug!("using in-memory repository database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> StoreResult<Self> {
        let tx = db.begin_write()?;
        {
            tx.open_table(BLOCKS)?;
            tx.open_table(BLOCKS_BY_REV)?;
            tx.open_table(ACCOUNTS)?;
            tx.open_table(HANDLES)?;
            tx.open_table(HEADS)?;
            tx.open_table(RECORDS)?;
            tx.open_table(RECORDS_BY_TIME)?;
            tx.open_table(BLOBS)?;
            tx.open_table(BLOB_INDEX)?;
            tx.open_table(BLOB_PARTS)?;
            tx.open_table(META)?;
        }
        tx.commit()?;
        Ok(Self { db })
    }
}

fn write_block(tx: &WriteTransaction, did: &Did, block: &Block) -> StoreResult<()> {
    let cid = block.cid.to_bytes();
    let rev = block.rev.to_string();
    let mut blocks = tx.open_table(BLOCKS)?;
    let mut by_rev = tx.open_table(BLOCKS_BY_REV)?;
    let previous = match blocks.get((did.as_str(), cid.as_slice()))? {
        Some(guard) => Some(bincode::deserialize::<StoredBlock>(guard.value())?.rev),
        None => None,
    };
    if let Some(old_rev) = previous {
        by_rev.remove((did.as_str(), old_rev.as_str(), cid.as_slice()))?;
    }
    let stored = bincode::serialize(&StoredBlock {
        rev: rev.clone(),
        bytes: block.bytes.clone(),
    })?;
    blocks.insert((did.as_str(), cid.as_slice()), stored.as_slice())?;
    by_rev.insert((did.as_str(), rev.as_str(), cid.as_slice()), ())?;
    Ok(())
}

fn decode_head(bytes: &[u8]) -> StoreResult<RepoHead> {
    let stored: StoredHead = bincode::deserialize(bytes)?;
    Ok(RepoHead {
        root: cid_from_bytes(&stored.root)?,
        rev: Tid::parse(&stored.rev)?,
    })
}

fn encode_head(head: &RepoHead) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(&StoredHead {
        root: head.root.to_bytes(),
        rev: head.rev.to_string(),
    })?)
}

fn decode_account(did: &str, bytes: &[u8]) -> StoreResult<Account> {
    let stored: StoredAccount = bincode::deserialize(bytes)?;
    Ok(Account {
        did: Did::parse(did)?,
        handle: Handle::parse(stored.handle)?,
        signing_key: stored.signing_key,
        created_at: Tid::parse(&stored.created_at)?,
    })
}

fn decode_record(collection: &str, rkey: &str, bytes: &[u8]) -> StoreResult<RecordRow> {
    let stored: StoredRecord = bincode::deserialize(bytes)?;
    Ok(RecordRow {
        collection: Nsid::parse(collection)?,
        rkey: RecordKey::parse(rkey)?,
        cid: cid_from_bytes(&stored.cid)?,
        value: stored.value,
        indexed_at: Tid::parse(&stored.indexed_at)?,
    })
}

fn decode_blob(id: u64, bytes: &[u8]) -> StoreResult<BlobRow> {
    let stored: StoredBlob = bincode::deserialize(bytes)?;
    Ok(BlobRow {
        id,
        did: Did::parse(stored.did)?,
        cid: stored.cid.as_deref().map(cid_from_bytes).transpose()?,
        mime_type: stored.mime_type,
        size: stored.size,
        ref_count: stored.ref_count,
        created_at: Tid::parse(&stored.created_at)?,
    })
}

fn encode_blob(row: &BlobRow) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(&StoredBlob {
        did: row.did.to_string(),
        cid: row.cid.map(|c| c.to_bytes()),
        mime_type: row.mime_type.clone(),
        size: row.size,
        ref_count: row.ref_count,
        created_at: row.created_at.to_string(),
    })?)
}

fn upsert_record(
    records: &mut Table<'_, RecordKeyTuple, &'static [u8]>,
    by_time: &mut Table<'_, RecordKeyTuple, &'static str>,
    did: &Did,
    row: &RecordRow,
) -> StoreResult<()> {
    let key = (did.as_str(), row.collection.as_str(), row.rkey.as_str());
    remove_record(records, by_time, did, &row.collection, &row.rkey)?;
    let indexed_at = row.indexed_at.to_string();
    let stored = bincode::serialize(&StoredRecord {
        cid: row.cid.to_bytes(),
        value: row.value.clone(),
        indexed_at: indexed_at.clone(),
    })?;
    records.insert(key, stored.as_slice())?;
    by_time.insert((did.as_str(), row.collection.as_str(), indexed_at.as_str()), row.rkey.as_str())?;
    Ok(())
}

fn remove_record(
    records: &mut Table<'_, RecordKeyTuple, &'static [u8]>,
    by_time: &mut Table<'_, RecordKeyTuple, &'static str>,
    did: &Did,
    collection: &Nsid,
    rkey: &RecordKey,
) -> StoreResult<()> {
    let removed = match records.remove((did.as_str(), collection.as_str(), rkey.as_str()))? {
        Some(guard) => Some(bincode::deserialize::<StoredRecord>(guard.value())?),
        None => None,
    };
    if let Some(old) = removed {
        by_time.remove((did.as_str(), collection.as_str(), old.indexed_at.as_str()))?;
    }
    Ok(())
}

impl BlockStorage for RedbStorage {
    fn get_block(&self, did: &Did, cid: &Cid) -> StoreResult<Option<Block>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(BLOCKS)?;
        let cid_bytes = cid.to_bytes();
        let Some(guard) = table.get((did.as_str(), cid_bytes.as_slice()))? else {
            return Ok(None);
        };
        let stored: StoredBlock = bincode::deserialize(guard.value())?;
        Ok(Some(Block {
            cid: *cid,
            rev: Tid::parse(&stored.rev)?,
            bytes: stored.bytes,
        }))
    }

    fn put_block(&self, did: &Did, block: &Block) -> StoreResult<()> {
        self.put_blocks(did, std::slice::from_ref(block))
    }

    fn put_blocks(&self, did: &Did, blocks: &[Block]) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        for block in blocks {
            write_block(&tx, did, block)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn blocks_for(&self, did: &Did) -> StoreResult<Vec<Block>> {
        let tx = self.db.begin_read()?;
        let by_rev = tx.open_table(BLOCKS_BY_REV)?;
        let blocks = tx.open_table(BLOCKS)?;
        let mut out = Vec::new();
        let start: (&str, &str, &[u8]) = (did.as_str(), "", &[]);
        for entry in by_rev.range(start..)? {
            let (key, _) = entry?;
            let (owner, _, cid_bytes) = key.value();
            if owner != did.as_str() {
                break;
            }
            let Some(guard) = blocks.get((owner, cid_bytes))? else {
                continue;
            };
            let stored: StoredBlock = bincode::deserialize(guard.value())?;
            out.push(Block {
                cid: cid_from_bytes(cid_bytes)?,
                rev: Tid::parse(&stored.rev)?,
                bytes: stored.bytes,
            });
        }
        Ok(out)
    }
}

impl AccountStorage for RedbStorage {
    fn create_account(&self, account: &Account) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut accounts = tx.open_table(ACCOUNTS)?;
            let mut handles = tx.open_table(HANDLES)?;
            if accounts.get(account.did.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(account.did.to_string()));
            }
            if handles.get(account.handle.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(account.handle.to_string()));
            }
            let stored = bincode::serialize(&StoredAccount {
                handle: account.handle.to_string(),
                signing_key: account.signing_key,
                created_at: account.created_at.to_string(),
            })?;
            accounts.insert(account.did.as_str(), stored.as_slice())?;
            handles.insert(account.handle.as_str(), account.did.as_str())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_headless_account(&self, did: &Did) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            if tx.open_table(HEADS)?.get(did.as_str())?.is_some() {
                return Err(StoreError::InvalidOperation(format!("{did} has a repository head")));
            }
            let mut accounts = tx.open_table(ACCOUNTS)?;
            let removed = match accounts.remove(did.as_str())? {
                Some(guard) => Some(decode_account(did.as_str(), guard.value())?),
                None => None,
            };
            if let Some(account) = removed {
                tx.open_table(HANDLES)?.remove(account.handle.as_str())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn account(&self, did: &Did) -> StoreResult<Option<Account>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ACCOUNTS)?;
        match table.get(did.as_str())? {
            Some(guard) => Ok(Some(decode_account(did.as_str(), guard.value())?)),
            None => Ok(None),
        }
    }

    fn account_by_handle(&self, handle: &Handle) -> StoreResult<Option<Account>> {
        let tx = self.db.begin_read()?;
        let handles = tx.open_table(HANDLES)?;
        let did = handles.get(handle.as_str())?.map(|g| g.value().to_string());
        match did {
            Some(did) => self.account(&Did::parse(did)?),
            None => Ok(None),
        }
    }

    fn set_handle(&self, did: &Did, handle: &Handle) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut accounts = tx.open_table(ACCOUNTS)?;
            let mut handles = tx.open_table(HANDLES)?;
            if let Some(owner) = handles.get(handle.as_str())? {
                if owner.value() != did.as_str() {
                    return Err(StoreError::AlreadyExists(handle.to_string()));
                }
            }
            let mut account = match accounts.get(did.as_str())? {
                Some(guard) => decode_account(did.as_str(), guard.value())?,
                None => return Err(StoreError::NotFound(did.to_string())),
            };
            handles.remove(account.handle.as_str())?;
            account.handle = handle.clone();
            let stored = bincode::serialize(&StoredAccount {
                handle: account.handle.to_string(),
                signing_key: account.signing_key,
                created_at: account.created_at.to_string(),
            })?;
            accounts.insert(did.as_str(), stored.as_slice())?;
            handles.insert(handle.as_str(), did.as_str())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn head(&self, did: &Did) -> StoreResult<Option<RepoHead>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(HEADS)?;
        match table.get(did.as_str())? {
            Some(guard) => Ok(Some(decode_head(guard.value())?)),
            None => Ok(None),
        }
    }

    fn set_head(&self, did: &Did, head: &RepoHead) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(HEADS)?;
            table.insert(did.as_str(), encode_head(head)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_heads(&self, cursor: Option<&Did>, limit: usize) -> StoreResult<Vec<(Did, RepoHead)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(HEADS)?;
        let lower = match cursor {
            Some(c) => Bound::Excluded(c.as_str()),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for entry in table.range::<&str>((lower, Bound::Unbounded))? {
            if out.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            out.push((Did::parse(key.value())?, decode_head(value.value())?));
        }
        Ok(out)
    }
}

impl RecordStorage for RedbStorage {
    fn get_record(&self, did: &Did, collection: &Nsid, rkey: &RecordKey) -> StoreResult<Option<RecordRow>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS)?;
        match table.get((did.as_str(), collection.as_str(), rkey.as_str()))? {
            Some(guard) => Ok(Some(decode_record(collection.as_str(), rkey.as_str(), guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_records(&self, did: &Did, collection: &Nsid, query: &ListQuery) -> StoreResult<Vec<RecordRow>> {
        let tx = self.db.begin_read()?;
        let by_time = tx.open_table(RECORDS_BY_TIME)?;
        let records = tx.open_table(RECORDS)?;

        let (d, c) = (did.as_str(), collection.as_str());
        let cursor = query.cursor.map(|t| t.to_string());
        let lower = match (&cursor, query.reverse) {
            (Some(cur), true) => Bound::Excluded((d, c, cur.as_str())),
            _ => Bound::Included((d, c, "")),
        };
        let upper = match (&cursor, query.reverse) {
            (Some(cur), false) => Bound::Excluded((d, c, cur.as_str())),
            _ => Bound::Included((d, c, TID_UPPER)),
        };

        let range = by_time.range::<(&str, &str, &str)>((lower, upper))?;
        let entries: Box<dyn Iterator<Item = _> + '_> = if query.reverse {
            Box::new(range)
        } else {
            Box::new(range.rev())
        };

        let mut out = Vec::new();
        for entry in entries.take(query.limit) {
            let (_, rkey) = entry?;
            let rkey = rkey.value();
            if let Some(guard) = records.get((d, c, rkey))? {
                out.push(decode_record(c, rkey, guard.value())?);
            }
        }
        Ok(out)
    }

    fn collections(&self, did: &Did) -> StoreResult<Vec<Nsid>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS)?;
        let mut out: Vec<Nsid> = Vec::new();
        let start: (&str, &str, &str) = (did.as_str(), "", "");
        for entry in table.range(start..)? {
            let (key, _) = entry?;
            let (owner, collection, _) = key.value();
            if owner != did.as_str() {
                break;
            }
            if out.last().map(|n| n.as_str()) != Some(collection) {
                out.push(Nsid::parse(collection)?);
            }
        }
        Ok(out)
    }
}

impl BlobStorage for RedbStorage {
    fn create_blob(&self, did: &Did, mime_type: &str, created_at: Tid) -> StoreResult<u64> {
        let tx = self.db.begin_write()?;
        let id = {
            let mut meta = tx.open_table(META)?;
            let id = meta.get(NEXT_BLOB_ID)?.map_or(1, |g| g.value());
            meta.insert(NEXT_BLOB_ID, id + 1)?;
            let row = BlobRow {
                id,
                did: did.clone(),
                cid: None,
                mime_type: mime_type.to_string(),
                size: 0,
                ref_count: 0,
                created_at,
            };
            let mut blobs = tx.open_table(BLOBS)?;
            blobs.insert(id, encode_blob(&row)?.as_slice())?;
            id
        };
        tx.commit()?;
        Ok(id)
    }

    fn put_blob_part(&self, blob_id: u64, idx: u32, data: &[u8]) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            let blobs = tx.open_table(BLOBS)?;
            if blobs.get(blob_id)?.is_none() {
                return Err(StoreError::NotFound(format!("blob {blob_id}")));
            }
            let mut parts = tx.open_table(BLOB_PARTS)?;
            parts.insert((blob_id, idx), data)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn finish_blob(&self, blob_id: u64, cid: &Cid, size: u64) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut blobs = tx.open_table(BLOBS)?;
            let mut row = match blobs.get(blob_id)? {
                Some(guard) => decode_blob(blob_id, guard.value())?,
                None => return Err(StoreError::NotFound(format!("blob {blob_id}"))),
            };
            if row.cid.is_some() {
                return Err(StoreError::InvalidOperation(format!("blob {blob_id} already finished")));
            }
            row.cid = Some(*cid);
            row.size = size;
            blobs.insert(blob_id, encode_blob(&row)?.as_slice())?;
            let mut index = tx.open_table(BLOB_INDEX)?;
            let cid_bytes = cid.to_bytes();
            index.insert((row.did.as_str(), cid_bytes.as_slice()), blob_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn blob(&self, did: &Did, cid: &Cid) -> StoreResult<Option<BlobRow>> {
        let tx = self.db.begin_read()?;
        let index = tx.open_table(BLOB_INDEX)?;
        let cid_bytes = cid.to_bytes();
        let Some(id) = index.get((did.as_str(), cid_bytes.as_slice()))?.map(|g| g.value()) else {
            return Ok(None);
        };
        let blobs = tx.open_table(BLOBS)?;
        match blobs.get(id)? {
            Some(guard) => Ok(Some(decode_blob(id, guard.value())?)),
            None => Ok(None),
        }
    }

    fn blob_parts(&self, blob_id: u64) -> StoreResult<Vec<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let parts = tx.open_table(BLOB_PARTS)?;
        let mut out = Vec::new();
        for entry in parts.range((blob_id, 0u32)..=(blob_id, u32::MAX))? {
            let (_, data) = entry?;
            out.push(data.value().to_vec());
        }
        Ok(out)
    }

    fn list_blobs(&self, did: &Did, cursor: Option<u64>, limit: usize) -> StoreResult<Vec<BlobRow>> {
        let tx = self.db.begin_read()?;
        let blobs = tx.open_table(BLOBS)?;
        let start = cursor.map_or(0, |c| c.saturating_add(1));
        let mut out = Vec::new();
        for entry in blobs.range(start..)? {
            if out.len() >= limit {
                break;
            }
            let (id, value) = entry?;
            let row = decode_blob(id.value(), value.value())?;
            if &row.did == did && row.cid.is_some() {
                out.push(row);
            }
        }
        Ok(out)
    }
}

impl Storage for RedbStorage {
    fn apply_commit(&self, batch: &CommitBatch) -> StoreResult<()> {
        let did = batch.did.as_str();
        let tx = self.db.begin_write()?;
        {
            let mut heads = tx.open_table(HEADS)?;
            let current = match heads.get(did)? {
                Some(guard) => decode_head(guard.value())?,
                None => return Err(StoreError::NotFound(format!("repo head for {did}"))),
            };
            if current.root != batch.expected_root {
                return Err(StoreError::HeadMismatch {
                    did: did.to_string(),
                    expected: batch.expected_root.to_string(),
                    actual: current.root.to_string(),
                });
            }

            for block in &batch.blocks {
                write_block(&tx, &batch.did, block)?;
            }

            let mut records = tx.open_table(RECORDS)?;
            let mut by_time = tx.open_table(RECORDS_BY_TIME)?;
            for row in &batch.upserts {
                upsert_record(&mut records, &mut by_time, &batch.did, row)?;
            }
            for (collection, rkey) in &batch.deletes {
                remove_record(&mut records, &mut by_time, &batch.did, collection, rkey)?;
            }

            let index = tx.open_table(BLOB_INDEX)?;
            let mut blobs = tx.open_table(BLOBS)?;
            for cid in &batch.blob_refs {
                let cid_bytes = cid.to_bytes();
                let Some(id) = index.get((did, cid_bytes.as_slice()))?.map(|g| g.value()) else {
                    debug!(%did, %cid, "commit references unknown blob");
                    continue;
                };
                let row = match blobs.get(id)? {
                    Some(guard) => Some(decode_blob(id, guard.value())?),
                    None => None,
                };
                if let Some(mut row) = row {
                    row.ref_count += 1;
                    blobs.insert(id, encode_blob(&row)?.as_slice())?;
                }
            }

            heads.insert(did, encode_head(&batch.head)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }
}
