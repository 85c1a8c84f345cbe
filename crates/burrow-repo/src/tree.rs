//! The signed record tree of one repository.
//!
//! Layout, top down:
//!
//! ```text
//! commit      {did, version: 3, data, rev, prev: null, sig}
//! data node   {collections: {<nsid>: link}}
//! collection  {entries: {<rkey>: link}}
//! record      the record value
//! ```
//!
//! Every node is a DAG-CBOR block addressed by its CID, so the commit CID
//! authenticates the whole repository. Blocks read from storage are
//! hash-verified.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use burrow_crypto::{Signature, SigningKey, VerifyingKey};
use burrow_store::Blockstore;
use burrow_types::value::{decode_dag_cbor, encode_block, encode_dag_cbor};
use burrow_types::{Cid, Did, Ipld, Nsid, RecordKey, RecordPath, Tid};
use tracing::debug;

use crate::error::{RepoError, RepoResult};

/// Commit format version written by this implementation.
pub const COMMIT_VERSION: i64 = 3;

/// A decoded commit block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedCommit {
    pub did: Did,
    pub version: i64,
    /// Root of the data node.
    pub data: Cid,
    pub rev: Tid,
    pub prev: Option<Cid>,
    pub sig: Vec<u8>,
}

impl SignedCommit {
    fn unsigned_fields(&self) -> BTreeMap<String, Ipld> {
        let mut map = BTreeMap::new();
        map.insert("did".to_string(), Ipld::String(self.did.to_string()));
        map.insert("version".to_string(), Ipld::Integer(i128::from(self.version)));
        map.insert("data".to_string(), Ipld::Link(self.data));
        map.insert("rev".to_string(), Ipld::String(self.rev.to_string()));
        map.insert("prev".to_string(), self.prev.map_or(Ipld::Null, Ipld::Link));
        map
    }

    /// The bytes covered by the signature: the commit without `sig`.
    pub fn unsigned_bytes(&self) -> RepoResult<Vec<u8>> {
        Ok(encode_dag_cbor(&Ipld::Map(self.unsigned_fields()))?)
    }

    pub fn to_ipld(&self) -> Ipld {
        let mut map = self.unsigned_fields();
        map.insert("sig".to_string(), Ipld::Bytes(self.sig.clone()));
        Ipld::Map(map)
    }

    pub fn from_ipld(value: &Ipld) -> RepoResult<Self> {
        let map = as_map(value, "commit")?;
        let version = match field(map, "version")? {
            Ipld::Integer(v) => i64::try_from(*v).map_err(|_| RepoError::Encoding("commit version out of range".into()))?,
            _ => return Err(RepoError::Encoding("commit version is not an integer".into())),
        };
        let prev = match field(map, "prev")? {
            Ipld::Null => None,
            other => Some(as_link(other, "prev")?),
        };
        let sig = match field(map, "sig")? {
            Ipld::Bytes(b) => b.clone(),
            _ => return Err(RepoError::Encoding("commit sig is not bytes".into())),
        };
        Ok(Self {
            did: Did::parse(as_str(field(map, "did")?, "did")?).map_err(|e| RepoError::Encoding(e.to_string()))?,
            version,
            data: as_link(field(map, "data")?, "data")?,
            rev: Tid::parse(as_str(field(map, "rev")?, "rev")?).map_err(|e| RepoError::Encoding(e.to_string()))?,
            prev,
            sig,
        })
    }

    /// Check the signature against the account's public key.
    pub fn verify(&self, key: &VerifyingKey) -> RepoResult<()> {
        let sig = Signature::from_slice(&self.sig).map_err(|e| RepoError::Encoding(e.to_string()))?;
        key.verify(&self.unsigned_bytes()?, &sig)
            .map_err(|e| RepoError::Encoding(format!("commit signature: {e}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    Add,
    Mutate,
    Delete,
}

/// One record-level difference between two repository roots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffOp {
    pub path: RecordPath,
    pub kind: DiffKind,
    pub old: Option<Cid>,
    pub new: Option<Cid>,
}

#[derive(Clone, Debug, Default)]
struct Collection {
    /// CID of the stored node; `None` while the entries have uncommitted
    /// changes.
    cid: Option<Cid>,
    entries: BTreeMap<RecordKey, Cid>,
}

/// A repository opened over a [`Blockstore`].
///
/// New blocks go through the blockstore and are also kept in a local cache,
/// so a tree built over a read-only store can read back what it staged.
pub struct Repo {
    bs: Blockstore,
    staged: HashMap<Cid, Vec<u8>>,
    head: Option<(Cid, SignedCommit)>,
    collections: BTreeMap<Nsid, Collection>,
}

impl Repo {
    /// An empty repository with no commit yet.
    pub fn create(bs: Blockstore) -> Self {
        Self {
            bs,
            staged: HashMap::new(),
            head: None,
            collections: BTreeMap::new(),
        }
    }

    /// Open the repository whose commit block is `root`.
    pub fn open(bs: Blockstore, root: Cid) -> RepoResult<Self> {
        let mut repo = Self::create(bs);
        let commit = repo.read_commit(&root)?;
        if &commit.did != repo.bs.did() {
            return Err(RepoError::Encoding(format!(
                "commit {root} belongs to {}, not {}",
                commit.did,
                repo.bs.did()
            )));
        }
        repo.collections = repo.load_collections(&commit.data)?;
        repo.head = Some((root, commit));
        Ok(repo)
    }

    pub fn did(&self) -> &Did {
        self.bs.did()
    }

    /// CID of the latest commit made or opened.
    pub fn root(&self) -> Option<Cid> {
        self.head.as_ref().map(|(cid, _)| *cid)
    }

    pub fn commit_info(&self) -> Option<&SignedCommit> {
        self.head.as_ref().map(|(_, c)| c)
    }

    pub fn blockstore(&self) -> &Blockstore {
        &self.bs
    }

    pub fn blockstore_mut(&mut self) -> &mut Blockstore {
        &mut self.bs
    }

    pub fn into_blockstore(self) -> Blockstore {
        self.bs
    }

    /// Raw bytes of a block reachable from this session.
    pub fn block(&self, cid: &Cid) -> RepoResult<Vec<u8>> {
        if let Some(bytes) = self.staged.get(cid) {
            return Ok(bytes.clone());
        }
        Ok(self.bs.get_verified(cid)?)
    }

    /// Collections holding at least one record.
    pub fn collections(&self) -> Vec<Nsid> {
        self.collections
            .iter()
            .filter(|(_, c)| !c.entries.is_empty())
            .map(|(nsid, _)| nsid.clone())
            .collect()
    }

    pub fn record_cid(&self, collection: &Nsid, rkey: &RecordKey) -> Option<Cid> {
        self.collections
            .get(collection)
            .and_then(|c| c.entries.get(rkey))
            .copied()
    }

    pub fn get_record(&self, collection: &Nsid, rkey: &RecordKey) -> RepoResult<Option<(Cid, Ipld)>> {
        match self.record_cid(collection, rkey) {
            Some(cid) => Ok(Some((cid, decode_dag_cbor(&self.block(&cid)?)?))),
            None => Ok(None),
        }
    }

    /// Every record path with its CID.
    pub fn records(&self) -> BTreeMap<RecordPath, Cid> {
        self.collections
            .iter()
            .flat_map(|(nsid, c)| {
                c.entries
                    .iter()
                    .map(move |(rkey, cid)| (RecordPath::new(nsid.clone(), rkey.clone()), *cid))
            })
            .collect()
    }

    /// Insert a new record. Fails if the path is taken.
    pub fn put_record(&mut self, collection: &Nsid, rkey: &RecordKey, value: &Ipld) -> RepoResult<Cid> {
        if self.record_cid(collection, rkey).is_some() {
            return Err(RepoError::InvalidOperation(format!("record {collection}/{rkey} already exists")));
        }
        self.write_record(collection, rkey, value)
    }

    /// Replace an existing record.
    pub fn update_record(&mut self, collection: &Nsid, rkey: &RecordKey, value: &Ipld) -> RepoResult<Cid> {
        if self.record_cid(collection, rkey).is_none() {
            return Err(RepoError::NotFound(format!("record {collection}/{rkey}")));
        }
        self.write_record(collection, rkey, value)
    }

    /// Remove a record, returning the CID it had.
    pub fn delete_record(&mut self, collection: &Nsid, rkey: &RecordKey) -> RepoResult<Cid> {
        let coll = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| RepoError::NotFound(format!("record {collection}/{rkey}")))?;
        let old = coll
            .entries
            .remove(rkey)
            .ok_or_else(|| RepoError::NotFound(format!("record {collection}/{rkey}")))?;
        coll.cid = None;
        Ok(old)
    }

    fn write_record(&mut self, collection: &Nsid, rkey: &RecordKey, value: &Ipld) -> RepoResult<Cid> {
        if !matches!(value, Ipld::Map(_)) {
            return Err(RepoError::InvalidOperation("record value must be an object".into()));
        }
        let cid = self.put_node(value)?;
        let coll = self.collections.entry(collection.clone()).or_default();
        coll.entries.insert(rkey.clone(), cid);
        coll.cid = None;
        Ok(cid)
    }

    /// Write every changed node, then a new signed commit. Returns the new
    /// root.
    pub fn commit(&mut self, rev: Tid, key: &SigningKey) -> RepoResult<Cid> {
        if let Some((_, prev)) = &self.head {
            if rev <= prev.rev {
                return Err(RepoError::InvalidOperation(format!(
                    "revision {rev} does not follow {}",
                    prev.rev
                )));
            }
        }

        let dirty: Vec<Nsid> = self
            .collections
            .iter()
            .filter(|(_, c)| c.cid.is_none())
            .map(|(nsid, _)| nsid.clone())
            .collect();
        for nsid in dirty {
            let node = match self.collections.get(&nsid) {
                Some(c) if !c.entries.is_empty() => collection_node(&c.entries),
                _ => {
                    self.collections.remove(&nsid);
                    continue;
                }
            };
            let cid = self.put_node(&node)?;
            if let Some(c) = self.collections.get_mut(&nsid) {
                c.cid = Some(cid);
            }
        }

        let links = self
            .collections
            .iter()
            .filter_map(|(nsid, c)| c.cid.map(|cid| (nsid.to_string(), Ipld::Link(cid))))
            .collect();
        let mut data_node = BTreeMap::new();
        data_node.insert("collections".to_string(), Ipld::Map(links));
        let data = self.put_node(&Ipld::Map(data_node))?;

        let mut commit = SignedCommit {
            did: self.did().clone(),
            version: COMMIT_VERSION,
            data,
            rev,
            prev: None,
            sig: Vec::new(),
        };
        commit.sig = key.sign(&commit.unsigned_bytes()?).to_bytes().to_vec();
        let root = self.put_node(&commit.to_ipld())?;
        debug!(did = %commit.did, %root, %rev, "repository committed");
        self.head = Some((root, commit));
        Ok(root)
    }

    /// Record-level changes from `old_root` to the current state, ordered by
    /// path. `None` diffs against an empty repository.
    pub fn diff_since(&self, old_root: Option<&Cid>) -> RepoResult<Vec<DiffOp>> {
        let old = match old_root {
            Some(root) => {
                let commit = self.read_commit(root)?;
                self.load_collections(&commit.data)?
            }
            None => BTreeMap::new(),
        };

        let empty = BTreeMap::new();
        let names: BTreeSet<&Nsid> = old.keys().chain(self.collections.keys()).collect();
        let mut ops = Vec::new();
        for nsid in names {
            let before = old.get(nsid);
            let after = self.collections.get(nsid);
            if let (Some(b), Some(a)) = (before, after) {
                if b.cid.is_some() && b.cid == a.cid {
                    continue;
                }
            }
            let before = before.map_or(&empty, |c| &c.entries);
            let after = after.map_or(&empty, |c| &c.entries);
            let keys: BTreeSet<&RecordKey> = before.keys().chain(after.keys()).collect();
            for rkey in keys {
                let (old, new) = (before.get(rkey).copied(), after.get(rkey).copied());
                let kind = match (old, new) {
                    (None, Some(_)) => DiffKind::Add,
                    (Some(_), None) => DiffKind::Delete,
                    (Some(o), Some(n)) if o != n => DiffKind::Mutate,
                    _ => continue,
                };
                ops.push(DiffOp {
                    path: RecordPath::new(nsid.clone(), rkey.clone()),
                    kind,
                    old,
                    new,
                });
            }
        }
        Ok(ops)
    }

    /// Blocks proving the presence or absence of a record under the current
    /// commit: commit, data node, collection node and record, as far as
    /// they exist.
    pub fn record_proof(&self, collection: &Nsid, rkey: &RecordKey) -> RepoResult<Vec<(Cid, Vec<u8>)>> {
        let (root, commit) = self
            .head
            .as_ref()
            .ok_or_else(|| RepoError::NotFound(format!("repository {} has no commit", self.did())))?;
        let mut cids = vec![*root, commit.data];
        if let Some(coll) = self.collections.get(collection) {
            let node = coll
                .cid
                .ok_or_else(|| RepoError::InvalidOperation("repository has uncommitted changes".into()))?;
            cids.push(node);
            if let Some(record) = coll.entries.get(rkey) {
                cids.push(*record);
            }
        }
        cids.into_iter()
            .map(|cid| Ok((cid, self.block(&cid)?)))
            .collect()
    }

    fn put_node(&mut self, value: &Ipld) -> RepoResult<Cid> {
        let (cid, bytes) = encode_block(value)?;
        self.bs.put(cid, bytes.clone())?;
        self.staged.insert(cid, bytes);
        Ok(cid)
    }

    fn read_node(&self, cid: &Cid) -> RepoResult<Ipld> {
        Ok(decode_dag_cbor(&self.block(cid)?)?)
    }

    fn read_commit(&self, root: &Cid) -> RepoResult<SignedCommit> {
        SignedCommit::from_ipld(&self.read_node(root)?)
    }

    fn load_collections(&self, data: &Cid) -> RepoResult<BTreeMap<Nsid, Collection>> {
        let node = self.read_node(data)?;
        let links = as_map(field(as_map(&node, "data node")?, "collections")?, "collections")?;
        let mut out = BTreeMap::new();
        for (name, link) in links {
            let nsid = Nsid::parse(name.as_str()).map_err(|e| RepoError::Encoding(e.to_string()))?;
            let cid = as_link(link, "collection")?;
            let node = self.read_node(&cid)?;
            let mut entries = BTreeMap::new();
            for (key, link) in as_map(field(as_map(&node, "collection node")?, "entries")?, "entries")? {
                let rkey = RecordKey::parse(key.as_str()).map_err(|e| RepoError::Encoding(e.to_string()))?;
                entries.insert(rkey, as_link(link, "record")?);
            }
            out.insert(nsid, Collection { cid: Some(cid), entries });
        }
        Ok(out)
    }
}

fn collection_node(entries: &BTreeMap<RecordKey, Cid>) -> Ipld {
    let links = entries
        .iter()
        .map(|(rkey, cid)| (rkey.to_string(), Ipld::Link(*cid)))
        .collect();
    let mut node = BTreeMap::new();
    node.insert("entries".to_string(), Ipld::Map(links));
    Ipld::Map(node)
}

fn as_map<'a>(value: &'a Ipld, what: &str) -> RepoResult<&'a BTreeMap<String, Ipld>> {
    match value {
        Ipld::Map(map) => Ok(map),
        _ => Err(RepoError::Encoding(format!("{what} is not a map"))),
    }
}

fn field<'a>(map: &'a BTreeMap<String, Ipld>, key: &str) -> RepoResult<&'a Ipld> {
    map.get(key)
        .ok_or_else(|| RepoError::Encoding(format!("missing field {key}")))
}

fn as_link(value: &Ipld, what: &str) -> RepoResult<Cid> {
    match value {
        Ipld::Link(cid) => Ok(*cid),
        _ => Err(RepoError::Encoding(format!("{what} is not a link"))),
    }
}

fn as_str<'a>(value: &'a Ipld, what: &str) -> RepoResult<&'a str> {
    match value {
        Ipld::String(s) => Ok(s),
        _ => Err(RepoError::Encoding(format!("{what} is not a string"))),
    }
}
