use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use burrow_crypto::SigningKey;
use burrow_firehose::{
    AccountEvent, CommitEvent, EventBody, EventBus, HandleEvent, IdentityEvent, OpAction, RepoOp,
};
use burrow_store::{
    Account, AccountStorage, BlockStorage, Blockstore, CommitBatch, ListQuery, RecordRow, RecordStorage, RepoHead,
    Storage,
};
use burrow_types::value::{decode_dag_cbor, find_blob_refs};
use burrow_types::{AtUri, Cid, Did, Handle, Ipld, Nsid, RecordKey, RecordPath, Tid, TidClock};
use tracing::{debug, info, warn};

use crate::car::CarWriter;
use crate::error::{RepoError, RepoResult};
use crate::ops::{CommitRef, RepoDescription, RepoStatus, RepoSummary, WriteAction, WriteOp, WriteResult};
use crate::tree::{DiffKind, Repo};

/// Commit events with more ops than this are published without blocks.
pub const MAX_EVENT_OPS: usize = 200;
/// Commit events whose export stream exceeds this are published without
/// blocks.
pub const MAX_EVENT_BLOCKS_BYTES: usize = 1_000_000;

/// A write after validation.
struct ResolvedWrite {
    action: WriteAction,
    collection: Nsid,
    rkey: RecordKey,
    value: Option<Ipld>,
}

/// Orchestrates repository mutations and reads.
///
/// Commits for one owner are serialised by an in-process lock and guarded
/// by a compare-and-swap on the stored head, so a commit built on a stale
/// head never lands. Commits for different owners run in parallel. Storage
/// calls are synchronous; async callers run them on the blocking pool.
pub struct RepoManager {
    storage: Arc<dyn Storage>,
    bus: Arc<EventBus>,
    clock: Arc<TidClock>,
    locks: Mutex<HashMap<Did, Arc<Mutex<()>>>>,
}

impl RepoManager {
    pub fn new(storage: Arc<dyn Storage>, bus: Arc<EventBus>, clock: Arc<TidClock>) -> Self {
        Self {
            storage,
            bus,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<TidClock> {
        &self.clock
    }

    /// Run `f` holding the owner's commit lock.
    ///
    /// Lock entries exist only while some caller holds or waits for them:
    /// clones are handed out under the map lock, so a count of two (map plus
    /// this caller) afterwards means nobody else is queued.
    fn with_owner_lock<T>(&self, did: &Did, f: impl FnOnce() -> RepoResult<T>) -> RepoResult<T> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock poisoned");
            Arc::clone(locks.entry(did.clone()).or_default())
        };
        let result = {
            let _guard = lock.lock().expect("lock poisoned");
            f()
        };
        let mut locks = self.locks.lock().expect("lock poisoned");
        if Arc::strong_count(&lock) == 2 {
            locks.remove(did);
        }
        result
    }

    /// Number of owners with a live commit lock.
    pub fn active_locks(&self) -> usize {
        self.locks.lock().expect("lock poisoned").len()
    }

    fn account(&self, did: &Did) -> RepoResult<Account> {
        self.storage
            .account(did)?
            .ok_or_else(|| RepoError::NotFound(format!("repo {did}")))
    }

    fn head(&self, did: &Did) -> RepoResult<RepoHead> {
        self.storage
            .head(did)?
            .ok_or_else(|| RepoError::NotFound(format!("repo {did}")))
    }

    // ---- Mutations ----

    /// Create an account and its genesis commit over an empty tree.
    ///
    /// The account row is written first, then the staged blocks, then the
    /// head, so a crash at any point leaves no head pointing at missing
    /// blocks. If a later step fails the account row is removed again, so
    /// the DID and handle can be retried.
    pub fn create_repo(&self, did: &Did, handle: &Handle, key: &SigningKey) -> RepoResult<CommitRef> {
        let (root, rev) = self.with_owner_lock(did, || {
            let rev = self.clock.next();
            self.storage.create_account(&Account {
                did: did.clone(),
                handle: handle.clone(),
                signing_key: *key.as_bytes(),
                created_at: rev,
            })?;
            match self.write_genesis(did, key, rev) {
                Ok(root) => Ok((root, rev)),
                Err(e) => {
                    warn!(%did, error = %e, "genesis commit failed, removing account");
                    self.storage.remove_headless_account(did)?;
                    Err(e)
                }
            }
        })?;
        info!(%did, %handle, %root, %rev, "repository created");

        self.bus.publish(EventBody::Identity(IdentityEvent {
            did: did.clone(),
            handle: Some(handle.clone()),
        }));
        self.bus.publish(EventBody::Account(AccountEvent {
            did: did.clone(),
            active: true,
            status: None,
        }));
        Ok(CommitRef { cid: root, rev })
    }

    fn write_genesis(&self, did: &Did, key: &SigningKey, rev: Tid) -> RepoResult<Cid> {
        let mut repo = Repo::create(Blockstore::read_only(Arc::clone(&self.storage), did.clone(), rev));
        let root = repo.commit(rev, key)?;
        let mut bs = repo.into_blockstore();
        bs.replay()?;
        bs.update_head(root, rev)?;
        Ok(root)
    }

    /// Apply a batch of writes as one signed commit.
    ///
    /// If `swap_commit` is given the batch only applies while it is still
    /// the repository head. Nothing durable changes unless the whole commit
    /// lands; the firehose event is published only after it has.
    pub fn apply_writes(
        &self,
        did: &Did,
        writes: &[WriteOp],
        swap_commit: Option<&Cid>,
    ) -> RepoResult<Vec<WriteResult>> {
        if writes.is_empty() {
            return Err(RepoError::InvalidOperation("no writes in batch".into()));
        }
        let resolved = writes
            .iter()
            .map(|w| self.resolve(w))
            .collect::<RepoResult<Vec<_>>>()?;
        let account = self.account(did)?;
        let key = SigningKey::from_bytes(account.signing_key);

        self.with_owner_lock(did, || {
            let (results, event) = self.commit_locked(did, &resolved, &key, swap_commit)?;
            // Still under the lock, so events for one owner leave in commit order.
            let event = self.bus.publish(EventBody::Commit(event));
            debug!(%did, seq = event.seq, "commit event published");
            Ok(results)
        })
    }

    /// Build, sign and land one commit. The caller holds the owner lock.
    fn commit_locked(
        &self,
        did: &Did,
        resolved: &[ResolvedWrite],
        key: &SigningKey,
        swap_commit: Option<&Cid>,
    ) -> RepoResult<(Vec<WriteResult>, CommitEvent)> {
        let head = self.head(did)?;
        if let Some(swap) = swap_commit {
            if *swap != head.root {
                return Err(RepoError::CommitConflict(format!(
                    "head of {did} is {}, not {swap}",
                    head.root
                )));
            }
        }
        let rev = self.clock.next_after(&head.rev);

        let bs = Blockstore::read_only(Arc::clone(&self.storage), did.clone(), rev);
        let mut repo = Repo::open(bs, head.root)?;

        let mut applied = Vec::with_capacity(resolved.len());
        for w in resolved {
            let action = match w.action {
                WriteAction::Upsert if repo.record_cid(&w.collection, &w.rkey).is_some() => WriteAction::Update,
                WriteAction::Upsert => WriteAction::Create,
                action => action,
            };
            let cid = match action {
                WriteAction::Create | WriteAction::Upsert => Some(repo.put_record(&w.collection, &w.rkey, value_of(w)?)?),
                WriteAction::Update => Some(repo.update_record(&w.collection, &w.rkey, value_of(w)?)?),
                WriteAction::Delete => {
                    repo.delete_record(&w.collection, &w.rkey)?;
                    None
                }
            };
            applied.push((action, cid));
        }

        let root = repo.commit(rev, key)?;
        let diff = repo.diff_since(Some(&head.root))?;

        let mut car = CarWriter::new(&root)?;
        for op in &diff {
            if let Some(new) = &op.new {
                car.write_block(new, &repo.block(new)?)?;
            }
        }
        for block in repo.blockstore().log() {
            car.write_block(&block.cid, &block.bytes)?;
        }
        let blocks = car.finish();

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        let mut blob_refs = Vec::new();
        let mut event_ops = Vec::with_capacity(diff.len());
        for op in &diff {
            let action = match op.kind {
                DiffKind::Add => OpAction::Create,
                DiffKind::Mutate => OpAction::Update,
                DiffKind::Delete => OpAction::Delete,
            };
            match op.new {
                Some(cid) => {
                    let value = repo.block(&cid)?;
                    blob_refs.extend(find_blob_refs(&decode_dag_cbor(&value)?));
                    upserts.push(RecordRow {
                        collection: op.path.collection.clone(),
                        rkey: op.path.rkey.clone(),
                        cid,
                        value,
                        indexed_at: self.clock.next(),
                    });
                }
                None => deletes.push((op.path.collection.clone(), op.path.rkey.clone())),
            }
            event_ops.push(RepoOp {
                action,
                path: op.path.to_string(),
                cid: op.new,
            });
        }

        let mut event_blobs: Vec<Cid> = Vec::new();
        for cid in &blob_refs {
            if !event_blobs.contains(cid) {
                event_blobs.push(*cid);
            }
        }

        let batch = CommitBatch {
            did: did.clone(),
            expected_root: head.root,
            head: RepoHead { root, rev },
            blocks: repo.into_blockstore().into_log(),
            upserts,
            deletes,
            blob_refs,
        };
        self.storage.apply_commit(&batch)?;
        info!(
            %did,
            %root,
            %rev,
            ops = event_ops.len(),
            blocks = batch.blocks.len(),
            "commit applied"
        );

        let too_big = event_ops.len() > MAX_EVENT_OPS || blocks.len() > MAX_EVENT_BLOCKS_BYTES;
        if too_big {
            debug!(%did, ops = event_ops.len(), bytes = blocks.len(), "commit event too big for inline blocks");
        }
        let event = CommitEvent {
            repo: did.clone(),
            commit: root,
            rev,
            since: Some(head.rev),
            blocks: if too_big { Vec::new() } else { blocks },
            ops: event_ops,
            blobs: event_blobs,
            too_big,
        };

        let commit = CommitRef { cid: root, rev };
        let results = resolved
            .iter()
            .zip(applied)
            .map(|(w, (action, cid))| WriteResult {
                action,
                uri: AtUri {
                    did: did.clone(),
                    path: RecordPath::new(w.collection.clone(), w.rkey.clone()),
                },
                cid,
                commit,
            })
            .collect();
        Ok((results, event))
    }

    fn resolve(&self, write: &WriteOp) -> RepoResult<ResolvedWrite> {
        let collection = Nsid::parse(write.collection.as_str())
            .map_err(|e| RepoError::InvalidOperation(e.to_string()))?;
        let rkey = match (&write.rkey, write.action) {
            (Some(rkey), _) => RecordKey::parse(rkey.as_str()).map_err(|e| RepoError::InvalidKey(e.to_string()))?,
            (None, WriteAction::Create) => RecordKey::from(self.clock.next()),
            (None, action) => {
                return Err(RepoError::InvalidOperation(format!("{action} of {collection} requires a record key")))
            }
        };
        let value = match write.action {
            WriteAction::Delete => None,
            action => Some(write.value.clone().ok_or_else(|| {
                RepoError::InvalidOperation(format!("{action} of {collection}/{rkey} requires a value"))
            })?),
        };
        Ok(ResolvedWrite {
            action: write.action,
            collection,
            rkey,
            value,
        })
    }

    /// Rebind an account's handle.
    pub fn update_handle(&self, did: &Did, handle: &Handle) -> RepoResult<()> {
        self.account(did)?;
        self.storage.set_handle(did, handle)?;
        info!(%did, %handle, "handle updated");
        self.bus.publish(EventBody::Handle(HandleEvent {
            did: did.clone(),
            handle: handle.clone(),
        }));
        self.bus.publish(EventBody::Identity(IdentityEvent {
            did: did.clone(),
            handle: Some(handle.clone()),
        }));
        Ok(())
    }

    // ---- Reads ----

    pub fn get_record(&self, did: &Did, collection: &Nsid, rkey: &RecordKey) -> RepoResult<RecordRow> {
        self.head(did)?;
        self.storage
            .get_record(did, collection, rkey)?
            .ok_or_else(|| RepoError::NotFound(format!("record at://{did}/{collection}/{rkey}")))
    }

    /// A page of records and the cursor for the next page, if the page is
    /// full.
    pub fn list_records(
        &self,
        did: &Did,
        collection: &Nsid,
        query: &ListQuery,
    ) -> RepoResult<(Vec<RecordRow>, Option<Tid>)> {
        self.head(did)?;
        let rows = self.storage.list_records(did, collection, query)?;
        let cursor = if query.limit > 0 && rows.len() == query.limit {
            rows.last().map(|r| r.indexed_at)
        } else {
            None
        };
        Ok((rows, cursor))
    }

    pub fn describe_repo(&self, did: &Did) -> RepoResult<RepoDescription> {
        let account = self.account(did)?;
        Ok(RepoDescription {
            did: account.did,
            handle: account.handle,
            collections: self.storage.collections(did)?,
        })
    }

    pub fn resolve_handle(&self, handle: &Handle) -> RepoResult<Did> {
        self.storage
            .account_by_handle(handle)?
            .map(|a| a.did)
            .ok_or_else(|| RepoError::NotFound(format!("handle {handle}")))
    }

    pub fn latest_commit(&self, did: &Did) -> RepoResult<CommitRef> {
        let head = self.head(did)?;
        Ok(CommitRef {
            cid: head.root,
            rev: head.rev,
        })
    }

    pub fn repo_status(&self, did: &Did) -> RepoResult<RepoStatus> {
        let head = self.head(did)?;
        Ok(RepoStatus {
            did: did.clone(),
            active: true,
            rev: head.rev,
        })
    }

    pub fn list_repos(&self, cursor: Option<&Did>, limit: usize) -> RepoResult<Vec<RepoSummary>> {
        Ok(self
            .storage
            .list_heads(cursor, limit)?
            .into_iter()
            .map(|(did, head)| RepoSummary {
                did,
                head: head.root,
                rev: head.rev,
                active: true,
            })
            .collect())
    }

    // ---- Export ----

    /// Every block of the repository as an export stream, oldest revision
    /// first.
    pub fn export_repo(&self, did: &Did) -> RepoResult<Vec<u8>> {
        let head = self.head(did)?;
        let mut car = CarWriter::new(&head.root)?;
        for block in self.storage.blocks_for(did)? {
            car.write_block(&block.cid, &block.bytes)?;
        }
        debug!(%did, blocks = car.len(), "repository exported");
        Ok(car.finish())
    }

    /// The requested blocks as an export stream rooted at the head.
    pub fn get_blocks(&self, did: &Did, cids: &[Cid]) -> RepoResult<Vec<u8>> {
        let head = self.head(did)?;
        let mut car = CarWriter::new(&head.root)?;
        for cid in cids {
            let block = self
                .storage
                .get_block(did, cid)?
                .ok_or_else(|| RepoError::NotFound(format!("block {cid}")))?;
            car.write_block(cid, &block.bytes)?;
        }
        Ok(car.finish())
    }

    /// Export stream of the blocks proving a record's presence or absence.
    pub fn record_proof(&self, did: &Did, collection: &Nsid, rkey: &RecordKey) -> RepoResult<Vec<u8>> {
        let head = self.head(did)?;
        let repo = Repo::open(
            Blockstore::read_only(Arc::clone(&self.storage), did.clone(), head.rev),
            head.root,
        )?;
        let mut car = CarWriter::new(&head.root)?;
        for (cid, bytes) in repo.record_proof(collection, rkey)? {
            car.write_block(&cid, &bytes)?;
        }
        Ok(car.finish())
    }
}

fn value_of(write: &ResolvedWrite) -> RepoResult<&Ipld> {
    write
        .value
        .as_ref()
        .ok_or_else(|| RepoError::InvalidOperation(format!("{} requires a value", write.action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use burrow_firehose::{decode_frame, encode_frame, EventFilter, EventKind};
    use burrow_store::{Block, BlobRow, BlobStorage, CommitBatch, InMemoryStorage, StoreError, StoreResult};
    use burrow_types::value::{encode_dag_cbor, ipld_from_json};
    use burrow_types::{cid_for_cbor, cid_for_raw, BlobRef};
    use serde_json::json;

    use crate::car::CarReader;
    use crate::tree::SignedCommit;

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        manager: Arc<RepoManager>,
        did: Did,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let manager = Arc::new(RepoManager::new(
            storage.clone(),
            Arc::new(EventBus::default()),
            Arc::new(TidClock::new(3)),
        ));
        let did = Did::parse("did:example:1").unwrap();
        manager
            .create_repo(&did, &Handle::parse("one.test").unwrap(), &SigningKey::generate())
            .unwrap();
        Fixture { storage, manager, did }
    }

    /// In-memory storage whose block writes can be made to fail.
    struct FailingBlocks {
        inner: InMemoryStorage,
        fail: AtomicBool,
    }

    impl FailingBlocks {
        fn check(&self) -> StoreResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }
    }

    impl BlockStorage for FailingBlocks {
        fn get_block(&self, did: &Did, cid: &Cid) -> StoreResult<Option<Block>> {
            self.inner.get_block(did, cid)
        }
        fn put_block(&self, did: &Did, block: &Block) -> StoreResult<()> {
            self.check()?;
            self.inner.put_block(did, block)
        }
        fn put_blocks(&self, did: &Did, blocks: &[Block]) -> StoreResult<()> {
            self.check()?;
            self.inner.put_blocks(did, blocks)
        }
        fn blocks_for(&self, did: &Did) -> StoreResult<Vec<Block>> {
            self.inner.blocks_for(did)
        }
    }

    impl AccountStorage for FailingBlocks {
        fn create_account(&self, account: &Account) -> StoreResult<()> {
            self.inner.create_account(account)
        }
        fn remove_headless_account(&self, did: &Did) -> StoreResult<()> {
            self.inner.remove_headless_account(did)
        }
        fn account(&self, did: &Did) -> StoreResult<Option<Account>> {
            self.inner.account(did)
        }
        fn account_by_handle(&self, handle: &Handle) -> StoreResult<Option<Account>> {
            self.inner.account_by_handle(handle)
        }
        fn set_handle(&self, did: &Did, handle: &Handle) -> StoreResult<()> {
            self.inner.set_handle(did, handle)
        }
        fn head(&self, did: &Did) -> StoreResult<Option<RepoHead>> {
            self.inner.head(did)
        }
        fn set_head(&self, did: &Did, head: &RepoHead) -> StoreResult<()> {
            self.inner.set_head(did, head)
        }
        fn list_heads(&self, cursor: Option<&Did>, limit: usize) -> StoreResult<Vec<(Did, RepoHead)>> {
            self.inner.list_heads(cursor, limit)
        }
    }

    impl RecordStorage for FailingBlocks {
        fn get_record(&self, did: &Did, collection: &Nsid, rkey: &RecordKey) -> StoreResult<Option<RecordRow>> {
            self.inner.get_record(did, collection, rkey)
        }
        fn list_records(&self, did: &Did, collection: &Nsid, query: &ListQuery) -> StoreResult<Vec<RecordRow>> {
            self.inner.list_records(did, collection, query)
        }
        fn collections(&self, did: &Did) -> StoreResult<Vec<Nsid>> {
            self.inner.collections(did)
        }
    }

    impl BlobStorage for FailingBlocks {
        fn create_blob(&self, did: &Did, mime_type: &str, created_at: Tid) -> StoreResult<u64> {
            self.inner.create_blob(did, mime_type, created_at)
        }
        fn put_blob_part(&self, blob_id: u64, idx: u32, data: &[u8]) -> StoreResult<()> {
            self.inner.put_blob_part(blob_id, idx, data)
        }
        fn finish_blob(&self, blob_id: u64, cid: &Cid, size: u64) -> StoreResult<()> {
            self.inner.finish_blob(blob_id, cid, size)
        }
        fn blob(&self, did: &Did, cid: &Cid) -> StoreResult<Option<BlobRow>> {
            self.inner.blob(did, cid)
        }
        fn blob_parts(&self, blob_id: u64) -> StoreResult<Vec<Vec<u8>>> {
            self.inner.blob_parts(blob_id)
        }
        fn list_blobs(&self, did: &Did, cursor: Option<u64>, limit: usize) -> StoreResult<Vec<BlobRow>> {
            self.inner.list_blobs(did, cursor, limit)
        }
    }

    impl Storage for FailingBlocks {
        fn apply_commit(&self, batch: &CommitBatch) -> StoreResult<()> {
            self.inner.apply_commit(batch)
        }
    }

    fn record(v: serde_json::Value) -> Ipld {
        ipld_from_json(&v).unwrap()
    }

    fn nsid(s: &str) -> Nsid {
        Nsid::parse(s).unwrap()
    }

    fn rkey(s: &str) -> RecordKey {
        RecordKey::parse(s).unwrap()
    }

    #[test]
    fn create_then_read() {
        let f = fixture();
        let value = record(json!({"x": 1}));
        let results = f
            .manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("abc"), value.clone())], None)
            .unwrap();

        let expected = cid_for_cbor(&encode_dag_cbor(&value).unwrap());
        assert_eq!(results[0].cid, Some(expected));
        assert_eq!(results[0].uri.to_string(), "at://did:example:1/app.test/abc");

        let row = f.manager.get_record(&f.did, &nsid("app.test"), &rkey("abc")).unwrap();
        assert_eq!(row.cid, expected);
        assert_eq!(decode_dag_cbor(&row.value).unwrap(), value);
    }

    #[test]
    fn genesis_commit_is_signed_and_published() {
        let storage = Arc::new(InMemoryStorage::new());
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe(EventFilter::default());
        let manager = RepoManager::new(storage.clone(), bus, Arc::new(TidClock::new(1)));
        let did = Did::parse("did:example:2").unwrap();
        let key = SigningKey::generate();

        let commit = manager.create_repo(&did, &Handle::parse("two.test").unwrap(), &key).unwrap();
        let head = storage.head(&did).unwrap().unwrap();
        assert_eq!(head.root, commit.cid);

        let block = storage.get_block(&did, &commit.cid).unwrap().unwrap();
        let signed = SignedCommit::from_ipld(&decode_dag_cbor(&block.bytes).unwrap()).unwrap();
        signed.verify(&key.verifying_key()).unwrap();

        assert_eq!(sub.try_recv().unwrap().kind(), EventKind::Identity);
        assert_eq!(sub.try_recv().unwrap().kind(), EventKind::Account);

        let again = manager.create_repo(&did, &Handle::parse("other.test").unwrap(), &key);
        assert!(matches!(again, Err(RepoError::InvalidOperation(_))));
    }

    #[test]
    fn revisions_strictly_increase() {
        let f = fixture();
        let mut last = f.manager.latest_commit(&f.did).unwrap().rev;
        for i in 0..5 {
            let results = f
                .manager
                .apply_writes(&f.did, &[WriteOp::create("app.test", None, record(json!({ "i": i })))], None)
                .unwrap();
            assert!(results[0].commit.rev > last);
            last = results[0].commit.rev;
        }
        assert_eq!(f.manager.latest_commit(&f.did).unwrap().rev, last);
    }

    #[test]
    fn staged_blocks_are_all_durable_and_verified() {
        let f = fixture();
        f.manager
            .apply_writes(
                &f.did,
                &[
                    WriteOp::create("app.test.post", Some("a"), record(json!({"t": "a"}))),
                    WriteOp::create("app.test.like", Some("b"), record(json!({"t": "b"}))),
                ],
                None,
            )
            .unwrap();

        let head = f.storage.head(&f.did).unwrap().unwrap();
        let reopened = Repo::open(
            Blockstore::new(f.storage.clone(), f.did.clone(), head.rev),
            head.root,
        )
        .unwrap();
        assert_eq!(reopened.records().len(), 2);
        for block in f.storage.blocks_for(&f.did).unwrap() {
            assert!(burrow_types::verify_cid(&block.cid, &block.bytes));
        }
    }

    #[test]
    fn commit_event_carries_diff_and_blocks() {
        let f = fixture();
        f.manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("a"), record(json!({"v": 1})))], None)
            .unwrap();

        let mut sub = f.manager.bus().subscribe(EventFilter::default());
        let results = f
            .manager
            .apply_writes(
                &f.did,
                &[
                    WriteOp::update("app.test", "a", record(json!({"v": 2}))),
                    WriteOp::create("app.test", Some("b"), record(json!({"v": 3}))),
                ],
                None,
            )
            .unwrap();

        let event = sub.try_recv().unwrap();
        let EventBody::Commit(commit) = &event.body else {
            panic!("expected a commit event");
        };
        assert_eq!(commit.commit, results[0].commit.cid);
        let paths: Vec<(&str, OpAction)> = commit.ops.iter().map(|o| (o.path.as_str(), o.action)).collect();
        assert_eq!(paths, vec![("app.test/a", OpAction::Update), ("app.test/b", OpAction::Create)]);

        let car = CarReader::parse(&commit.blocks).unwrap();
        assert_eq!(car.roots(), &[commit.commit]);
        assert!(car.get(&commit.commit).is_some());
        for op in &commit.ops {
            assert!(car.get(&op.cid.unwrap()).is_some());
        }

        let (header, _) = decode_frame(&encode_frame(&event).unwrap()).unwrap();
        assert_eq!(header.t.as_deref(), Some("#commit"));
    }

    #[test]
    fn firehose_subscribe_timing() {
        let f = fixture();
        f.manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("early"), record(json!({})))], None)
            .unwrap();

        let mut sub = f.manager.bus().subscribe(EventFilter::default());
        assert!(sub.try_recv().is_none());

        f.manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("late"), record(json!({})))], None)
            .unwrap();
        let EventBody::Commit(commit) = sub.try_recv().unwrap().body else {
            panic!("expected a commit event");
        };
        assert_eq!(commit.repo, f.did);
        assert_eq!(commit.ops[0].path, "app.test/late");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn swap_commit_mismatch_is_a_conflict() {
        let f = fixture();
        let genesis = f.manager.latest_commit(&f.did).unwrap();
        f.manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("a"), record(json!({})))], Some(&genesis.cid))
            .unwrap();

        let stale = f.manager.apply_writes(
            &f.did,
            &[WriteOp::create("app.test", Some("b"), record(json!({})))],
            Some(&genesis.cid),
        );
        assert!(matches!(stale, Err(RepoError::CommitConflict(_))));
        assert!(f.manager.get_record(&f.did, &nsid("app.test"), &rkey("b")).unwrap_err().is_not_found());
    }

    #[test]
    fn concurrent_commits_all_land_in_order() {
        let f = fixture();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&f.manager);
                let did = f.did.clone();
                thread::spawn(move || {
                    manager
                        .apply_writes(&did, &[WriteOp::create("app.test", Some(&format!("k{i}")), record(json!({ "i": i })))], None)
                        .unwrap()
                })
            })
            .collect();
        let mut revs: Vec<Tid> = handles
            .into_iter()
            .map(|h| h.join().unwrap()[0].commit.rev)
            .collect();
        revs.sort();
        revs.dedup();
        assert_eq!(revs.len(), 8);

        let (rows, _) = f
            .manager
            .list_records(&f.did, &nsid("app.test"), &ListQuery::default())
            .unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(f.manager.latest_commit(&f.did).unwrap().rev, *revs.last().unwrap());
    }

    #[test]
    fn validation_errors() {
        let f = fixture();
        let apply = |op: WriteOp| f.manager.apply_writes(&f.did, &[op], None);

        assert!(matches!(f.manager.apply_writes(&f.did, &[], None), Err(RepoError::InvalidOperation(_))));
        assert!(matches!(
            apply(WriteOp::create("app.test", Some("bad key!"), record(json!({})))),
            Err(RepoError::InvalidKey(_))
        ));
        assert!(matches!(
            apply(WriteOp::create("not an nsid", None, record(json!({})))),
            Err(RepoError::InvalidOperation(_))
        ));
        let mut no_key = WriteOp::delete("app.test", "x");
        no_key.rkey = None;
        assert!(matches!(apply(no_key), Err(RepoError::InvalidOperation(_))));
        let mut no_value = WriteOp::update("app.test", "x", record(json!({})));
        no_value.value = None;
        assert!(matches!(apply(no_value), Err(RepoError::InvalidOperation(_))));
        assert!(apply(WriteOp::delete("app.test", "missing")).unwrap_err().is_not_found());

        let unknown = Did::parse("did:example:nobody").unwrap();
        let err = f
            .manager
            .apply_writes(&unknown, &[WriteOp::create("app.test", None, record(json!({})))], None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let f = fixture();
        let before = f.manager.latest_commit(&f.did).unwrap();
        let blocks_before = f.storage.block_count();

        let result = f.manager.apply_writes(
            &f.did,
            &[
                WriteOp::create("app.test", Some("a"), record(json!({}))),
                WriteOp::delete("app.test", "missing"),
            ],
            None,
        );
        assert!(result.is_err());
        assert_eq!(f.manager.latest_commit(&f.did).unwrap(), before);
        assert_eq!(f.storage.block_count(), blocks_before);
    }

    #[test]
    fn blob_refs_counted_once_per_record() {
        let f = fixture();
        let id = f.storage.create_blob(&f.did, "image/png", Tid::from_parts(1, 0)).unwrap();
        let blob = BlobRef {
            cid: cid_for_raw(b"png"),
            mime_type: "image/png".into(),
            size: 3,
        };
        f.storage.finish_blob(id, &blob.cid, 3).unwrap();

        let with_two_refs = record(json!({
            "avatar": blob.to_json(),
            "embed": {"images": [{"image": blob.to_json()}]},
        }));
        f.manager
            .apply_writes(
                &f.did,
                &[
                    WriteOp::create("app.test", Some("a"), with_two_refs.clone()),
                    WriteOp::create("app.test", Some("b"), with_two_refs),
                    WriteOp::create("app.test", Some("c"), record(json!({"text": "none"}))),
                ],
                None,
            )
            .unwrap();
        assert_eq!(f.storage.blob(&f.did, &blob.cid).unwrap().unwrap().ref_count, 2);

        f.manager
            .apply_writes(&f.did, &[WriteOp::delete("app.test", "a")], None)
            .unwrap();
        assert_eq!(f.storage.blob(&f.did, &blob.cid).unwrap().unwrap().ref_count, 2);
    }

    #[test]
    fn listing_and_description() {
        let f = fixture();
        for k in ["a", "b", "c"] {
            f.manager
                .apply_writes(&f.did, &[WriteOp::create("app.test.post", Some(k), record(json!({})))], None)
                .unwrap();
        }
        let query = ListQuery {
            limit: 2,
            ..Default::default()
        };
        let (page, cursor) = f.manager.list_records(&f.did, &nsid("app.test.post"), &query).unwrap();
        assert_eq!(page.iter().map(|r| r.rkey.as_str()).collect::<Vec<_>>(), vec!["c", "b"]);
        let query = ListQuery { cursor, ..query };
        let (rest, cursor) = f.manager.list_records(&f.did, &nsid("app.test.post"), &query).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(cursor, None);

        let desc = f.manager.describe_repo(&f.did).unwrap();
        assert_eq!(desc.handle.as_str(), "one.test");
        assert_eq!(desc.collections, vec![nsid("app.test.post")]);
        assert_eq!(f.manager.resolve_handle(&desc.handle).unwrap(), f.did);
    }

    #[test]
    fn export_and_proofs() {
        let f = fixture();
        let results = f
            .manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("a"), record(json!({"x": 1})))], None)
            .unwrap();
        let head = results[0].commit;

        let full = CarReader::parse(&f.manager.export_repo(&f.did).unwrap()).unwrap();
        assert_eq!(full.roots(), &[head.cid]);
        assert_eq!(full.blocks().len(), f.storage.blocks_for(&f.did).unwrap().len());

        let proof = CarReader::parse(&f.manager.record_proof(&f.did, &nsid("app.test"), &rkey("a")).unwrap()).unwrap();
        assert_eq!(proof.blocks().len(), 4);
        assert!(proof.get(&results[0].cid.unwrap()).is_some());

        let picked = f.manager.get_blocks(&f.did, &[head.cid]).unwrap();
        assert_eq!(CarReader::parse(&picked).unwrap().blocks().len(), 1);
        let missing = f.manager.get_blocks(&f.did, &[cid_for_cbor(b"nope")]);
        assert!(missing.unwrap_err().is_not_found());

        let status = f.manager.repo_status(&f.did).unwrap();
        assert_eq!(status.rev, head.rev);
        let repos = f.manager.list_repos(None, 10).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].head, head.cid);
    }

    #[test]
    fn handle_update_publishes_events() {
        let f = fixture();
        let mut sub = f.manager.bus().subscribe(EventFilter::default());
        let handle = Handle::parse("renamed.test").unwrap();
        f.manager.update_handle(&f.did, &handle).unwrap();

        assert_eq!(sub.try_recv().unwrap().kind(), EventKind::Handle);
        assert_eq!(sub.try_recv().unwrap().kind(), EventKind::Identity);
        assert_eq!(f.manager.describe_repo(&f.did).unwrap().handle, handle);
        assert!(f
            .manager
            .update_handle(&Did::parse("did:example:nobody").unwrap(), &handle)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn failed_genesis_can_be_retried() {
        let storage = Arc::new(FailingBlocks {
            inner: InMemoryStorage::new(),
            fail: AtomicBool::new(true),
        });
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe(EventFilter::default());
        let manager = RepoManager::new(storage.clone(), bus, Arc::new(TidClock::new(5)));
        let did = Did::parse("did:example:retry").unwrap();
        let handle = Handle::parse("retry.test").unwrap();
        let key = SigningKey::generate();

        let err = manager.create_repo(&did, &handle, &key).unwrap_err();
        assert!(matches!(err, RepoError::Storage(_)));
        assert!(storage.account(&did).unwrap().is_none());
        assert!(storage.account_by_handle(&handle).unwrap().is_none());
        assert!(storage.head(&did).unwrap().is_none());
        assert!(sub.try_recv().is_none());

        storage.fail.store(false, Ordering::SeqCst);
        let commit = manager.create_repo(&did, &handle, &key).unwrap();
        assert_eq!(manager.latest_commit(&did).unwrap(), commit);
        assert_eq!(manager.resolve_handle(&handle).unwrap(), did);
        manager
            .apply_writes(&did, &[WriteOp::create("app.test", Some("a"), record(json!({})))], None)
            .unwrap();
        assert_eq!(manager.active_locks(), 0);
    }

    #[test]
    fn owner_locks_are_released() {
        let f = fixture();
        assert_eq!(f.manager.active_locks(), 0);
        f.manager
            .apply_writes(&f.did, &[WriteOp::create("app.test", Some("a"), record(json!({})))], None)
            .unwrap();
        assert_eq!(f.manager.active_locks(), 0);

        let failed = f.manager.apply_writes(&f.did, &[WriteOp::delete("app.test", "missing")], None);
        assert!(failed.is_err());
        assert_eq!(f.manager.active_locks(), 0);

        let workers: Vec<_> = (0..6)
            .map(|i| {
                let manager = Arc::clone(&f.manager);
                let did = Did::parse(format!("did:example:owner{i}")).unwrap();
                thread::spawn(move || {
                    let handle = Handle::parse(format!("owner{i}.test")).unwrap();
                    manager.create_repo(&did, &handle, &SigningKey::generate()).unwrap();
                    for n in 0..3 {
                        manager
                            .apply_writes(&did, &[WriteOp::create("app.test", None, record(json!({ "n": n })))], None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(f.manager.active_locks(), 0);
    }

    #[test]
    fn commit_blocks_rebuild_every_changed_path() {
        let f = fixture();
        f.manager
            .apply_writes(
                &f.did,
                &[
                    WriteOp::create("app.test.post", Some("a"), record(json!({"text": "first"}))),
                    WriteOp::create("app.test.post", Some("keep"), record(json!({"text": "untouched"}))),
                    WriteOp::create("app.test.like", Some("x"), record(json!({"subject": "a"}))),
                ],
                None,
            )
            .unwrap();
        let previous = f.storage.blocks_for(&f.did).unwrap();

        let mut sub = f.manager.bus().subscribe(EventFilter::default());
        f.manager
            .apply_writes(
                &f.did,
                &[
                    WriteOp::update("app.test.post", "a", record(json!({"text": "edited"}))),
                    WriteOp::create("app.test.post", Some("b"), record(json!({"text": "second"}))),
                    WriteOp::delete("app.test.like", "x"),
                    WriteOp::create("app.test.follow", Some("f"), record(json!({"subject": "did:example:2"}))),
                ],
                None,
            )
            .unwrap();
        let EventBody::Commit(commit) = sub.try_recv().unwrap().body else {
            panic!("expected a commit event");
        };
        assert!(!commit.too_big);

        // Only the previous state plus the event's blocks.
        let replica = Arc::new(InMemoryStorage::new());
        replica.put_blocks(&f.did, &previous).unwrap();
        let car = CarReader::parse(&commit.blocks).unwrap();
        let shipped: Vec<Block> = car
            .blocks()
            .iter()
            .map(|(cid, bytes)| Block {
                cid: *cid,
                rev: commit.rev,
                bytes: bytes.clone(),
            })
            .collect();
        replica.put_blocks(&f.did, &shipped).unwrap();

        let rebuilt = Repo::open(Blockstore::read_only(replica, f.did.clone(), commit.rev), commit.commit).unwrap();
        assert_eq!(rebuilt.collections(), vec![nsid("app.test.follow"), nsid("app.test.post")]);
        assert_eq!(rebuilt.records().len(), 4);

        let paths: Vec<&str> = commit.ops.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["app.test.follow/f", "app.test.like/x", "app.test.post/a", "app.test.post/b"]
        );
        for op in &commit.ops {
            let (collection, key) = op.path.split_once('/').unwrap();
            let found = rebuilt.get_record(&nsid(collection), &rkey(key)).unwrap();
            match op.cid {
                Some(cid) => {
                    let (got, value) = found.unwrap();
                    assert_eq!(got, cid);
                    assert_eq!(cid_for_cbor(&encode_dag_cbor(&value).unwrap()), cid);
                }
                None => assert!(found.is_none()),
            }
        }
        let (_, edited) = rebuilt.get_record(&nsid("app.test.post"), &rkey("a")).unwrap().unwrap();
        assert_eq!(edited, record(json!({"text": "edited"})));
    }

    #[test]
    fn upsert_decides_under_the_lock() {
        let f = fixture();
        let first = f
            .manager
            .apply_writes(&f.did, &[WriteOp::upsert("app.test", "self", record(json!({"v": 0})))], None)
            .unwrap();
        assert_eq!(first[0].action, WriteAction::Create);

        let second = f
            .manager
            .apply_writes(&f.did, &[WriteOp::upsert("app.test", "self", record(json!({"v": 1})))], None)
            .unwrap();
        assert_eq!(second[0].action, WriteAction::Update);

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&f.manager);
                let did = f.did.clone();
                thread::spawn(move || {
                    manager
                        .apply_writes(&did, &[WriteOp::upsert("app.test", "shared", record(json!({ "i": i })))], None)
                        .unwrap()[0]
                        .action
                })
            })
            .collect();
        let actions: Vec<WriteAction> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(actions.iter().filter(|a| **a == WriteAction::Create).count(), 1);
        assert_eq!(actions.iter().filter(|a| **a == WriteAction::Update).count(), 7);

        let mut no_key = WriteOp::upsert("app.test", "x", record(json!({})));
        no_key.rkey = None;
        assert!(matches!(
            f.manager.apply_writes(&f.did, &[no_key], None),
            Err(RepoError::InvalidOperation(_))
        ));
    }
}
