//! Foundation types for burrow.
//!
//! Identifiers and value helpers shared by every other burrow crate.
//!
//! # Key Types
//!
//! - [`Cid`] -- content identifier of a block or blob (CIDv1, SHA-256)
//! - [`Did`] / [`Handle`] -- repository owner identity and its domain handle
//! - [`Nsid`] / [`RecordKey`] / [`RecordPath`] -- record addressing
//! - [`Tid`] / [`TidClock`] -- sortable timestamp identifiers for revisions and cursors
//! - [`BlobRef`] -- blob reference as embedded in records

pub mod cid;
pub mod error;
pub mod identity;
pub mod nsid;
pub mod path;
pub mod record_key;
pub mod tid;
pub mod value;

pub use cid::{cid_for_cbor, cid_for_raw, parse_cid, verify_cid, Cid};
pub use error::TypeError;
pub use identity::{Did, Handle};
pub use libipld::Ipld;
pub use nsid::Nsid;
pub use path::{AtUri, RecordPath};
pub use record_key::RecordKey;
pub use tid::{Tid, TidClock};
pub use value::BlobRef;
