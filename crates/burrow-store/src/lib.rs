//! Storage for burrow repositories.
//!
//! Everything a Personal Data Server persists lives behind the [`Storage`]
//! trait: per-owner content-addressed blocks, the record index, accounts
//! and repository heads, and chunked blob data.
//!
//! # Components
//!
//! - [`Blockstore`] -- per-owner block access with a read-only staging mode
//! - [`BlobStore`] -- chunked blob uploads addressed by content
//!
//! # Storage Backends
//!
//! - [`InMemoryStorage`] -- single-lock maps for tests and ephemeral servers
//! - [`RedbStorage`] -- durable single-file database
//!
//! # Rules
//!
//! 1. Blocks are never deleted; rewriting a block only moves its revision.
//! 2. Record rows and heads change only through [`Storage::apply_commit`],
//!    which is atomic and guarded by the expected head root.
//! 3. Blob reference counts only grow.
//! 4. Not-found is always distinguishable from a backend failure.

pub mod blobs;
pub mod blockstore;
pub mod disk;
pub mod error;
pub mod memory;
pub mod models;
pub mod traits;

#[cfg(test)]
mod conformance;

pub use blobs::{BlobStore, BlobUpload, ChunkedWriter, BLOB_CHUNK_SIZE, DEFAULT_MIME_TYPE};
pub use blockstore::Blockstore;
pub use disk::RedbStorage;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStorage;
pub use models::{Account, Block, BlobRow, CommitBatch, ListQuery, RecordRow, RepoHead};
pub use traits::{AccountStorage, BlobStorage, BlockStorage, RecordStorage, Storage};
