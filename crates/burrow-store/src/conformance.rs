//! Behaviour every storage backend must share. Each backend's test module
//! runs these against a fresh instance.

use burrow_types::{cid_for_cbor, cid_for_raw, Did, Handle, Nsid, RecordKey, Tid};

use crate::error::StoreError;
use crate::models::{Account, Block, CommitBatch, ListQuery, RecordRow, RepoHead};
use crate::traits::Storage;

fn did(s: &str) -> Did {
    Did::parse(s).unwrap()
}

fn block(data: &[u8], rev: u64) -> Block {
    Block {
        cid: cid_for_cbor(data),
        rev: Tid::from_parts(rev, 0),
        bytes: data.to_vec(),
    }
}

fn head(data: &[u8], rev: u64) -> RepoHead {
    RepoHead {
        root: cid_for_cbor(data),
        rev: Tid::from_parts(rev, 0),
    }
}

fn record(collection: &str, rkey: &str, indexed_at: u64) -> RecordRow {
    let value = format!("{collection}/{rkey}").into_bytes();
    RecordRow {
        collection: Nsid::parse(collection).unwrap(),
        rkey: RecordKey::parse(rkey).unwrap(),
        cid: cid_for_cbor(&value),
        value,
        indexed_at: Tid::from_parts(indexed_at, 0),
    }
}

fn batch(owner: &Did, expected: &RepoHead, next: RepoHead) -> CommitBatch {
    CommitBatch {
        did: owner.clone(),
        expected_root: expected.root,
        head: next,
        blocks: Vec::new(),
        upserts: Vec::new(),
        deletes: Vec::new(),
        blob_refs: Vec::new(),
    }
}

pub fn blocks(store: &dyn Storage) {
    let alice = did("did:example:alice");
    let bob = did("did:example:bob");

    store.put_blocks(&alice, &[block(b"b", 2), block(b"a", 1)]).unwrap();
    store.put_block(&bob, &block(b"c", 1)).unwrap();

    let a = block(b"a", 1);
    assert_eq!(store.get_block(&alice, &a.cid).unwrap(), Some(a.clone()));
    assert_eq!(store.get_block(&bob, &a.cid).unwrap(), None);

    let revs: Vec<u64> = store
        .blocks_for(&alice)
        .unwrap()
        .iter()
        .map(|b| b.rev.timestamp_micros())
        .collect();
    assert_eq!(revs, vec![1, 2]);

    // Same content again: bytes unchanged, rev overwritten, no duplicate row.
    store.put_block(&alice, &block(b"a", 3)).unwrap();
    let all = store.blocks_for(&alice).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].cid, a.cid);
    assert_eq!(all[1].rev, Tid::from_parts(3, 0));
    assert_eq!(all[1].bytes, b"a");
}

pub fn accounts_and_heads(store: &dyn Storage) {
    let alice = did("did:example:alice");
    let account = Account {
        did: alice.clone(),
        handle: Handle::parse("alice.test").unwrap(),
        signing_key: [1u8; 32],
        created_at: Tid::from_parts(1, 0),
    };
    store.create_account(&account).unwrap();
    assert!(matches!(store.create_account(&account), Err(StoreError::AlreadyExists(_))));

    let clash = Account {
        did: did("did:example:mallory"),
        ..account.clone()
    };
    assert!(matches!(store.create_account(&clash), Err(StoreError::AlreadyExists(_))));

    assert_eq!(store.account(&alice).unwrap(), Some(account.clone()));
    let by_handle = store.account_by_handle(&account.handle).unwrap().unwrap();
    assert_eq!(by_handle.did, alice);

    let renamed = Handle::parse("alice2.test").unwrap();
    store.set_handle(&alice, &renamed).unwrap();
    assert!(store.account_by_handle(&account.handle).unwrap().is_none());
    assert_eq!(store.account(&alice).unwrap().unwrap().handle, renamed);

    assert_eq!(store.head(&alice).unwrap(), None);
    let bob = Account {
        did: did("did:example:bob"),
        handle: Handle::parse("bob.test").unwrap(),
        ..account.clone()
    };
    store.create_account(&bob).unwrap();
    store.remove_headless_account(&bob.did).unwrap();
    assert_eq!(store.account(&bob.did).unwrap(), None);
    assert!(store.account_by_handle(&bob.handle).unwrap().is_none());
    store.create_account(&bob).unwrap();
    store.remove_headless_account(&did("did:example:nobody")).unwrap();

    for (i, name) in ["did:example:c", "did:example:a", "did:example:b"].iter().enumerate() {
        store.set_head(&did(name), &head(name.as_bytes(), i as u64 + 1)).unwrap();
    }
    let page = store.list_heads(None, 2).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].0.as_str(), "did:example:a");
    let rest = store.list_heads(Some(&page[1].0), 10).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].0.as_str(), "did:example:c");

    store.set_head(&bob.did, &head(b"bob", 1)).unwrap();
    assert!(matches!(
        store.remove_headless_account(&bob.did),
        Err(StoreError::InvalidOperation(_))
    ));
    assert!(store.account(&bob.did).unwrap().is_some());
}

pub fn record_listing(store: &dyn Storage) {
    let alice = did("did:example:alice");
    let genesis = head(b"genesis", 1);
    store.set_head(&alice, &genesis).unwrap();

    let mut b = batch(&alice, &genesis, head(b"second", 2));
    b.upserts = vec![
        record("app.test.post", "a", 10),
        record("app.test.post", "b", 20),
        record("app.test.post", "c", 30),
        record("app.test.like", "z", 40),
    ];
    store.apply_commit(&b).unwrap();

    let post = Nsid::parse("app.test.post").unwrap();
    let keys = |rows: Vec<RecordRow>| rows.into_iter().map(|r| r.rkey.to_string()).collect::<Vec<_>>();

    let newest = store.list_records(&alice, &post, &ListQuery { limit: 2, ..Default::default() }).unwrap();
    assert_eq!(keys(newest.clone()), vec!["c", "b"]);

    let next = ListQuery {
        limit: 2,
        cursor: Some(newest[1].indexed_at),
        reverse: false,
    };
    assert_eq!(keys(store.list_records(&alice, &post, &next).unwrap()), vec!["a"]);

    let oldest = ListQuery {
        limit: 10,
        cursor: Some(Tid::from_parts(10, 0)),
        reverse: true,
    };
    assert_eq!(keys(store.list_records(&alice, &post, &oldest).unwrap()), vec!["b", "c"]);

    let collections: Vec<String> = store.collections(&alice).unwrap().iter().map(|c| c.to_string()).collect();
    assert_eq!(collections, vec!["app.test.like", "app.test.post"]);

    // Update moves the row in time order; delete removes it.
    let current = store.head(&alice).unwrap().unwrap();
    let mut b = batch(&alice, &current, head(b"third", 3));
    b.upserts = vec![record("app.test.post", "a", 50)];
    b.deletes = vec![(post.clone(), RecordKey::parse("c").unwrap())];
    store.apply_commit(&b).unwrap();

    let all = store.list_records(&alice, &post, &ListQuery::default()).unwrap();
    assert_eq!(keys(all), vec!["a", "b"]);
    assert!(store
        .get_record(&alice, &post, &RecordKey::parse("c").unwrap())
        .unwrap()
        .is_none());
}

pub fn blobs(store: &dyn Storage) {
    let alice = did("did:example:alice");
    let id = store.create_blob(&alice, "image/png", Tid::from_parts(1, 0)).unwrap();
    store.put_blob_part(id, 1, b"world").unwrap();
    store.put_blob_part(id, 0, b"hello ").unwrap();
    assert!(store.put_blob_part(id + 100, 0, b"x").unwrap_err().is_not_found());

    let cid = cid_for_raw(b"hello world");
    assert!(store.blob(&alice, &cid).unwrap().is_none());
    store.finish_blob(id, &cid, 11).unwrap();

    let row = store.blob(&alice, &cid).unwrap().unwrap();
    assert_eq!(row.id, id);
    assert_eq!(row.size, 11);
    assert_eq!(row.ref_count, 0);
    assert_eq!(store.blob_parts(id).unwrap().concat(), b"hello world");
    assert!(store.blob(&did("did:example:bob"), &cid).unwrap().is_none());
}

pub fn commit_is_guarded_by_head(store: &dyn Storage) {
    let alice = did("did:example:alice");
    let genesis = head(b"genesis", 1);

    assert!(store
        .apply_commit(&batch(&alice, &genesis, head(b"x", 2)))
        .unwrap_err()
        .is_not_found());

    store.set_head(&alice, &genesis).unwrap();
    let blob_id = store.create_blob(&alice, "image/png", Tid::from_parts(1, 0)).unwrap();
    let blob_cid = cid_for_raw(b"img");
    store.finish_blob(blob_id, &blob_cid, 3).unwrap();

    let mut first = batch(&alice, &genesis, head(b"first", 2));
    first.blocks = vec![block(b"first", 2)];
    first.blob_refs = vec![blob_cid, blob_cid, cid_for_raw(b"unknown")];
    store.apply_commit(&first).unwrap();
    assert_eq!(store.head(&alice).unwrap(), Some(head(b"first", 2)));
    assert_eq!(store.blob(&alice, &blob_cid).unwrap().unwrap().ref_count, 2);

    // A second writer still holding the genesis root loses.
    let mut stale = batch(&alice, &genesis, head(b"stale", 3));
    stale.blocks = vec![block(b"stale", 3)];
    stale.blob_refs = vec![blob_cid];
    let err = store.apply_commit(&stale).unwrap_err();
    assert!(matches!(err, StoreError::HeadMismatch { .. }));

    assert_eq!(store.head(&alice).unwrap(), Some(head(b"first", 2)));
    assert!(store.get_block(&alice, &cid_for_cbor(b"stale")).unwrap().is_none());
    assert_eq!(store.blob(&alice, &blob_cid).unwrap().unwrap().ref_count, 2);
}
