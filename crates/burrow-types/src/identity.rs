use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const MAX_DID_LEN: usize = 2048;
const MAX_HANDLE_LEN: usize = 253;

/// Decentralized identifier of a repository owner, e.g. `did:plc:abc123`.
///
/// Validated on construction: `did:` prefix, a lowercase method name, and a
/// method-specific identifier that does not end in `:` or `%`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        validate_did(&s)?;
        Ok(Self(s))
    }

    /// The DID method, e.g. `plc` or `web`.
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_did(s: &str) -> Result<(), TypeError> {
    let err = |reason: &str| TypeError::InvalidDid(format!("{s}: {reason}"));
    if s.len() > MAX_DID_LEN {
        return Err(err("too long"));
    }
    let rest = s.strip_prefix("did:").ok_or_else(|| err("missing did: prefix"))?;
    let (method, ident) = rest.split_once(':').ok_or_else(|| err("missing identifier"))?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
        return Err(err("bad method"));
    }
    if ident.is_empty() {
        return Err(err("empty identifier"));
    }
    let allowed = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'%' | b'-');
    if !ident.bytes().all(allowed) {
        return Err(err("bad identifier character"));
    }
    if ident.ends_with(':') || ident.ends_with('%') {
        return Err(err("identifier ends with ':' or '%'"));
    }
    Ok(())
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

/// Human-readable domain name bound to a DID, e.g. `alice.example.com`.
///
/// Stored lowercased; comparison is case-insensitive.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into().to_ascii_lowercase();
        validate_handle(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_handle(s: &str) -> Result<(), TypeError> {
    let err = |reason: &str| TypeError::InvalidHandle(format!("{s}: {reason}"));
    if s.len() > MAX_HANDLE_LEN {
        return Err(err("too long"));
    }
    let labels: Vec<&str> = s.split('.').collect();
    if labels.len() < 2 {
        return Err(err("needs at least two labels"));
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(err("bad label length"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(err("bad label character"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(err("label starts or ends with '-'"));
        }
    }
    let tld = labels[labels.len() - 1];
    if !tld.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(err("top-level label must start with a letter"));
    }
    Ok(())
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Handle {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Handle {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}
