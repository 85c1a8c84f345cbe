use std::fmt;

use crate::error::TypeError;
use crate::identity::Did;
use crate::nsid::Nsid;
use crate::record_key::RecordKey;

/// Location of a record inside a repository: `collection/rkey`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPath {
    pub collection: Nsid,
    pub rkey: RecordKey,
}

impl RecordPath {
    pub fn new(collection: Nsid, rkey: RecordKey) -> Self {
        Self { collection, rkey }
    }

    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let (collection, rkey) = s
            .split_once('/')
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        Ok(Self {
            collection: Nsid::parse(collection)?,
            rkey: RecordKey::parse(rkey)?,
        })
    }

    /// `at://` URI of this record in the given repository.
    pub fn to_uri(&self, did: &Did) -> AtUri {
        AtUri {
            did: did.clone(),
            path: self.clone(),
        }
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

/// `at://did/collection/rkey`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: Did,
    pub path: RecordPath,
}

impl AtUri {
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| TypeError::InvalidPath(format!("{s}: missing at:// scheme")))?;
        let (did, path) = rest
            .split_once('/')
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        Ok(Self {
            did: Did::parse(did)?,
            path: RecordPath::parse(path)?,
        })
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}", self.did, self.path)
    }
}
