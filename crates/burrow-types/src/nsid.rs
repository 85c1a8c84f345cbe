use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const MAX_NSID_LEN: usize = 317;

/// Namespaced identifier naming a record collection, e.g. `app.bsky.feed.post`.
///
/// Two or more dot-separated segments. Authority segments may contain
/// letters, digits and hyphens; the final name segment is alphanumeric and
/// starts with a letter.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nsid(String);

impl Nsid {
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    /// The final segment.
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(s: &str) -> Result<(), TypeError> {
    let err = |reason: &str| TypeError::InvalidNsid(format!("{s}: {reason}"));
    if s.is_empty() || s.len() > MAX_NSID_LEN {
        return Err(err("bad length"));
    }
    let segments: Vec<&str> = s.split('.').collect();
    if segments.len() < 2 {
        return Err(err("needs at least two segments"));
    }
    let (name, authority) = segments.split_last().ok_or_else(|| err("empty"))?;
    for seg in authority {
        if seg.is_empty() || seg.len() > 63 {
            return Err(err("bad segment length"));
        }
        if !seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(err("bad segment character"));
        }
        if seg.starts_with('-') || seg.ends_with('-') {
            return Err(err("segment starts or ends with '-'"));
        }
    }
    if authority[0].starts_with(|c: char| c.is_ascii_digit()) {
        return Err(err("first segment starts with a digit"));
    }
    if name.is_empty() || name.len() > 63 {
        return Err(err("bad name length"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic())
        || !name.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(err("bad name"));
    }
    Ok(())
}

impl fmt::Debug for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nsid({})", self.0)
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Nsid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Nsid {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Nsid> for String {
    fn from(nsid: Nsid) -> Self {
        nsid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_collections() {
        for s in ["app.bsky.feed.post", "app.test", "com.example.fooBar", "net.users-1.thing"] {
            assert!(Nsid::parse(s).is_ok(), "{s}");
        }
        assert_eq!(Nsid::parse("app.bsky.feed.post").unwrap().name(), "post");
    }

    #[test]
    fn rejects_bad_collections() {
        for s in ["", "app", "app..post", "1app.post", "app.-x.post", "app.bsky.feed.po-st", "app.bsky/post"] {
            assert!(Nsid::parse(s).is_err(), "{s}");
        }
    }
}
