//! Repositories for burrow.
//!
//! A repository is a signed commit over a tree of records grouped by
//! collection. [`RepoManager`] is the entry point: it validates write
//! batches, builds and signs the next commit, lands it atomically and
//! announces it on the firehose.

pub mod car;
pub mod error;
pub mod manager;
pub mod ops;
pub mod tree;

pub use car::{CarReader, CarWriter, MAX_ENTRY_SIZE};
pub use error::{RepoError, RepoResult};
pub use manager::{RepoManager, MAX_EVENT_BLOCKS_BYTES, MAX_EVENT_OPS};
pub use ops::{CommitRef, RepoDescription, RepoStatus, RepoSummary, WriteAction, WriteOp, WriteResult};
pub use tree::{DiffKind, DiffOp, Repo, SignedCommit, COMMIT_VERSION};
