use burrow_types::{AtUri, Cid, Did, Handle, Ipld, Nsid, Tid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
    /// Create, or update if the key is taken. Decided under the owner lock;
    /// results report the action actually taken.
    Upsert,
}

impl std::fmt::Display for WriteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Upsert => "upsert",
        };
        write!(f, "{s}")
    }
}

/// One requested mutation of a repository.
///
/// Collection and key are kept as received; they are validated when the
/// batch is applied so that errors map to the right category.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteOp {
    pub action: WriteAction,
    pub collection: String,
    /// Required for update, upsert and delete. A create without one gets a
    /// TID.
    pub rkey: Option<String>,
    /// Required for everything but delete.
    pub value: Option<Ipld>,
}

impl WriteOp {
    pub fn create(collection: impl Into<String>, rkey: Option<&str>, value: Ipld) -> Self {
        Self {
            action: WriteAction::Create,
            collection: collection.into(),
            rkey: rkey.map(str::to_string),
            value: Some(value),
        }
    }

    pub fn update(collection: impl Into<String>, rkey: impl Into<String>, value: Ipld) -> Self {
        Self {
            action: WriteAction::Update,
            collection: collection.into(),
            rkey: Some(rkey.into()),
            value: Some(value),
        }
    }

    pub fn upsert(collection: impl Into<String>, rkey: impl Into<String>, value: Ipld) -> Self {
        Self {
            action: WriteAction::Upsert,
            collection: collection.into(),
            rkey: Some(rkey.into()),
            value: Some(value),
        }
    }

    pub fn delete(collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            action: WriteAction::Delete,
            collection: collection.into(),
            rkey: Some(rkey.into()),
            value: None,
        }
    }
}

/// A commit by CID and revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitRef {
    pub cid: Cid,
    pub rev: Tid,
}

/// Outcome of one [`WriteOp`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub action: WriteAction,
    pub uri: AtUri,
    /// `None` for deletes.
    pub cid: Option<Cid>,
    pub commit: CommitRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoDescription {
    pub did: Did,
    pub handle: Handle,
    pub collections: Vec<Nsid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoStatus {
    pub did: Did,
    pub active: bool,
    pub rev: Tid,
}

/// Entry of a repository listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoSummary {
    pub did: Did,
    pub head: Cid,
    pub rev: Tid,
    pub active: bool,
}
