//! Content identifiers for repository blocks and blobs.
//!
//! Every block in a repository is addressed by a CIDv1 whose multihash is
//! SHA-256 over the block's exact bytes. Structured blocks use the DAG-CBOR
//! codec; blob data uses the raw codec.

use std::str::FromStr;

use libipld::multihash::MultihashGeneric;
use sha2::{Digest, Sha256};

use crate::error::TypeError;

pub use libipld::Cid;

/// Multicodec code for DAG-CBOR blocks.
pub const DAG_CBOR: u64 = 0x71;
/// Multicodec code for raw bytes.
pub const RAW: u64 = 0x55;
/// Multihash code for SHA2-256.
pub const SHA2_256: u64 = 0x12;

/// CID of a DAG-CBOR block.
pub fn cid_for_cbor(bytes: &[u8]) -> Cid {
    cid_from_digest(DAG_CBOR, Sha256::digest(bytes).into())
}

/// CID of raw blob bytes.
pub fn cid_for_raw(bytes: &[u8]) -> Cid {
    cid_from_digest(RAW, Sha256::digest(bytes).into())
}

/// Build a CIDv1 from a codec and a finished SHA-256 digest.
pub fn cid_from_digest(codec: u64, digest: [u8; 32]) -> Cid {
    // A 32-byte digest always fits the 64-byte multihash buffer.
    let hash = MultihashGeneric::<64>::wrap(SHA2_256, &digest)
        .unwrap_or_else(|_| unreachable!("sha2-256 digest fits multihash"));
    Cid::new_v1(codec, hash)
}

/// Returns `true` if `bytes` hash to `cid` under its own codec.
pub fn verify_cid(cid: &Cid, bytes: &[u8]) -> bool {
    let digest: [u8; 32] = Sha256::digest(bytes).into();
    cid.hash().code() == SHA2_256 && cid.hash().digest() == digest.as_slice()
}

/// Parse a CID from its string form.
pub fn parse_cid(s: &str) -> Result<Cid, TypeError> {
    Cid::from_str(s).map_err(|e| TypeError::InvalidCid(format!("{s}: {e}")))
}

/// Parse a CID from its binary form.
pub fn cid_from_bytes(bytes: &[u8]) -> Result<Cid, TypeError> {
    Cid::try_from(bytes).map_err(|e| TypeError::InvalidCid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_cid() {
        assert_eq!(cid_for_cbor(b"abc"), cid_for_cbor(b"abc"));
        assert_ne!(cid_for_cbor(b"abc"), cid_for_cbor(b"abd"));
    }

    #[test]
    fn codec_is_part_of_identity() {
        let cbor = cid_for_cbor(b"payload");
        let raw = cid_for_raw(b"payload");
        assert_ne!(cbor, raw);
        assert_eq!(cbor.codec(), DAG_CBOR);
        assert_eq!(raw.codec(), RAW);
        assert_eq!(cbor.hash().digest(), raw.hash().digest());
    }

    #[test]
    fn verify_detects_tampering() {
        let cid = cid_for_cbor(b"original");
        assert!(verify_cid(&cid, b"original"));
        assert!(!verify_cid(&cid, b"tampered"));
    }

    #[test]
    fn string_form_roundtrips() {
        let cid = cid_for_raw(b"blob");
        let text = cid.to_string();
        assert!(text.starts_with('b'));
        assert_eq!(parse_cid(&text).unwrap(), cid);
        assert!(parse_cid("not-a-cid").is_err());
    }

    #[test]
    fn binary_form_roundtrips() {
        let cid = cid_for_cbor(b"{}");
        assert_eq!(cid_from_bytes(&cid.to_bytes()).unwrap(), cid);
    }
}
