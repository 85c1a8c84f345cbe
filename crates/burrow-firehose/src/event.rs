use std::collections::BTreeMap;

use burrow_types::{Cid, Did, Handle, Ipld, Tid};

/// Classification of firehose events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A repository commit.
    Commit,
    /// An account changed its handle.
    Handle,
    /// An account's identity document may have changed.
    Identity,
    /// An account's hosting status changed.
    Account,
    /// An account was removed.
    Tombstone,
    /// Informational message from the server.
    Info,
    /// An account moved to another server.
    Migrate,
    /// In-band error frame.
    Error,
}

impl EventKind {
    /// Message type tag carried in the frame header. Error frames carry
    /// none.
    pub fn type_tag(&self) -> Option<&'static str> {
        Some(match self {
            Self::Commit => "#commit",
            Self::Handle => "#handle",
            Self::Identity => "#identity",
            Self::Account => "#account",
            Self::Tombstone => "#tombstone",
            Self::Info => "#info",
            Self::Migrate => "#migrate",
            Self::Error => return None,
        })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Commit => "commit",
            Self::Handle => "handle",
            Self::Identity => "identity",
            Self::Account => "account",
            Self::Tombstone => "tombstone",
            Self::Info => "info",
            Self::Migrate => "migrate",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One record mutation inside a commit event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoOp {
    pub action: OpAction,
    /// `collection/rkey`.
    pub path: String,
    /// New record CID; `None` for deletes.
    pub cid: Option<Cid>,
}

/// A repository commit as republished to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitEvent {
    pub repo: Did,
    pub commit: Cid,
    pub rev: Tid,
    /// Revision of the previous commit.
    pub since: Option<Tid>,
    /// Export stream holding the blocks needed to verify the commit.
    pub blocks: Vec<u8>,
    pub ops: Vec<RepoOp>,
    pub blobs: Vec<Cid>,
    pub too_big: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleEvent {
    pub did: Did,
    pub handle: Handle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityEvent {
    pub did: Did,
    pub handle: Option<Handle>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountEvent {
    pub did: Did,
    pub active: bool,
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TombstoneEvent {
    pub did: Did,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoEvent {
    pub name: String,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrateEvent {
    pub did: Did,
    pub migrate_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEvent {
    pub error: String,
    pub message: Option<String>,
}

/// Event content before the bus stamps it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventBody {
    Commit(CommitEvent),
    Handle(HandleEvent),
    Identity(IdentityEvent),
    Account(AccountEvent),
    Tombstone(TombstoneEvent),
    Info(InfoEvent),
    Migrate(MigrateEvent),
    Error(ErrorEvent),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Commit(_) => EventKind::Commit,
            Self::Handle(_) => EventKind::Handle,
            Self::Identity(_) => EventKind::Identity,
            Self::Account(_) => EventKind::Account,
            Self::Tombstone(_) => EventKind::Tombstone,
            Self::Info(_) => EventKind::Info,
            Self::Migrate(_) => EventKind::Migrate,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// The account the event concerns, if any.
    pub fn did(&self) -> Option<&Did> {
        match self {
            Self::Commit(e) => Some(&e.repo),
            Self::Handle(e) => Some(&e.did),
            Self::Identity(e) => Some(&e.did),
            Self::Account(e) => Some(&e.did),
            Self::Tombstone(e) => Some(&e.did),
            Self::Migrate(e) => Some(&e.did),
            Self::Info(_) | Self::Error(_) => None,
        }
    }
}

/// An event as delivered to subscribers.
///
/// `seq` is assigned by the bus at publish time and strictly increases
/// across all events of one bus. `time` is RFC 3339.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirehoseEvent {
    pub seq: i64,
    pub time: String,
    pub body: EventBody,
}

impl FirehoseEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// The frame payload in the IPLD data model.
    pub fn payload(&self) -> Ipld {
        let seq = Ipld::Integer(i128::from(self.seq));
        let time = Ipld::String(self.time.clone());
        match &self.body {
            EventBody::Commit(c) => map([
                ("seq", seq),
                ("rebase", Ipld::Bool(false)),
                ("tooBig", Ipld::Bool(c.too_big)),
                ("repo", string(c.repo.as_str())),
                ("commit", Ipld::Link(c.commit)),
                ("rev", string(&c.rev.to_string())),
                ("since", c.since.map_or(Ipld::Null, |s| string(&s.to_string()))),
                ("blocks", Ipld::Bytes(c.blocks.clone())),
                ("ops", Ipld::List(c.ops.iter().map(op_ipld).collect())),
                ("blobs", Ipld::List(c.blobs.iter().copied().map(Ipld::Link).collect())),
                ("time", time),
            ]),
            EventBody::Handle(h) => map([
                ("seq", seq),
                ("did", string(h.did.as_str())),
                ("handle", string(h.handle.as_str())),
                ("time", time),
            ]),
            EventBody::Identity(i) => {
                let mut fields = vec![("seq", seq), ("did", string(i.did.as_str())), ("time", time)];
                if let Some(handle) = &i.handle {
                    fields.push(("handle", string(handle.as_str())));
                }
                map(fields)
            }
            EventBody::Account(a) => {
                let mut fields = vec![
                    ("seq", seq),
                    ("did", string(a.did.as_str())),
                    ("active", Ipld::Bool(a.active)),
                    ("time", time),
                ];
                if let Some(status) = &a.status {
                    fields.push(("status", string(status)));
                }
                map(fields)
            }
            EventBody::Tombstone(t) => map([("seq", seq), ("did", string(t.did.as_str())), ("time", time)]),
            EventBody::Info(i) => {
                let mut fields = vec![("name", string(&i.name))];
                if let Some(message) = &i.message {
                    fields.push(("message", string(message)));
                }
                map(fields)
            }
            EventBody::Migrate(m) => map([
                ("seq", seq),
                ("did", string(m.did.as_str())),
                ("migrateTo", m.migrate_to.as_deref().map_or(Ipld::Null, string)),
                ("time", time),
            ]),
            EventBody::Error(e) => {
                let mut fields = vec![("error", string(&e.error))];
                if let Some(message) = &e.message {
                    fields.push(("message", string(message)));
                }
                map(fields)
            }
        }
    }
}

fn string(s: &str) -> Ipld {
    Ipld::String(s.to_string())
}

fn map<'a>(fields: impl IntoIterator<Item = (&'a str, Ipld)>) -> Ipld {
    Ipld::Map(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn op_ipld(op: &RepoOp) -> Ipld {
    map([
        ("action", string(op.action.as_str())),
        ("path", string(&op.path)),
        ("cid", op.cid.map_or(Ipld::Null, Ipld::Link)),
    ])
}
