//! CAR v1 export streams.
//!
//! A stream is a varint-length-prefixed DAG-CBOR header
//! `{roots: [cid], version: 1}` followed by varint-length-prefixed
//! entries, each the binary CID immediately followed by the block bytes.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;

use burrow_types::value::{decode_dag_cbor, encode_dag_cbor};
use burrow_types::{verify_cid, Cid, Ipld};
use integer_encoding::{VarIntReader, VarIntWriter};

use crate::error::{RepoError, RepoResult};

/// Largest single header or entry a reader accepts.
pub const MAX_ENTRY_SIZE: usize = 4 * 1024 * 1024;

/// Builds an export stream in memory. Each CID is written at most once.
#[derive(Debug)]
pub struct CarWriter {
    buf: Vec<u8>,
    seen: HashSet<Cid>,
}

impl CarWriter {
    pub fn new(root: &Cid) -> RepoResult<Self> {
        let mut header = BTreeMap::new();
        header.insert("roots".to_string(), Ipld::List(vec![Ipld::Link(*root)]));
        header.insert("version".to_string(), Ipld::Integer(1));
        let header = encode_dag_cbor(&Ipld::Map(header))?;

        let mut buf = Vec::with_capacity(header.len() + 64);
        write_varint(&mut buf, header.len())?;
        buf.extend_from_slice(&header);
        Ok(Self {
            buf,
            seen: HashSet::new(),
        })
    }

    /// Append a block. Returns `false` if the CID was already written.
    pub fn write_block(&mut self, cid: &Cid, bytes: &[u8]) -> RepoResult<bool> {
        if !self.seen.insert(*cid) {
            return Ok(false);
        }
        let cid_bytes = cid.to_bytes();
        write_varint(&mut self.buf, cid_bytes.len() + bytes.len())?;
        self.buf.extend_from_slice(&cid_bytes);
        self.buf.extend_from_slice(bytes);
        Ok(true)
    }

    /// Number of distinct blocks written.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn write_varint(buf: &mut Vec<u8>, n: usize) -> RepoResult<()> {
    buf.write_varint(n as u64)
        .map(|_| ())
        .map_err(|e| RepoError::Encoding(e.to_string()))
}

/// A parsed export stream. Every block is checked against its CID.
#[derive(Clone, Debug)]
pub struct CarReader {
    roots: Vec<Cid>,
    blocks: Vec<(Cid, Vec<u8>)>,
}

impl CarReader {
    pub fn parse(bytes: &[u8]) -> RepoResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = read_entry(&mut cursor, bytes)?
            .ok_or_else(|| RepoError::Encoding("empty CAR stream".into()))?;
        let roots = parse_header(&decode_dag_cbor(header)?)?;

        let mut blocks = Vec::new();
        while let Some(entry) = read_entry(&mut cursor, bytes)? {
            let mut entry_cursor = Cursor::new(entry);
            let cid = Cid::read_bytes(&mut entry_cursor).map_err(|e| RepoError::Encoding(format!("bad block CID: {e}")))?;
            let data = &entry[entry_cursor.position() as usize..];
            if !verify_cid(&cid, data) {
                return Err(RepoError::Encoding(format!("block {cid} does not match its hash")));
            }
            blocks.push((cid, data.to_vec()));
        }
        Ok(Self { roots, blocks })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Blocks in stream order.
    pub fn blocks(&self) -> &[(Cid, Vec<u8>)] {
        &self.blocks
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|(c, _)| c == cid)
            .map(|(_, bytes)| bytes.as_slice())
    }
}

fn read_entry<'a>(cursor: &mut Cursor<&'a [u8]>, bytes: &'a [u8]) -> RepoResult<Option<&'a [u8]>> {
    let start = cursor.position() as usize;
    if start == bytes.len() {
        return Ok(None);
    }
    let len: u64 = cursor
        .read_varint()
        .map_err(|e| RepoError::Encoding(format!("bad entry length at {start}: {e}")))?;
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if len > MAX_ENTRY_SIZE {
        return Err(RepoError::Encoding(format!("entry of {len} bytes exceeds {MAX_ENTRY_SIZE}")));
    }
    let from = cursor.position() as usize;
    let to = from
        .checked_add(len)
        .filter(|to| *to <= bytes.len())
        .ok_or_else(|| RepoError::Encoding(format!("truncated entry at {start}")))?;
    cursor.set_position(to as u64);
    Ok(Some(&bytes[from..to]))
}

fn parse_header(header: &Ipld) -> RepoResult<Vec<Cid>> {
    let Ipld::Map(map) = header else {
        return Err(RepoError::Encoding("CAR header is not a map".into()));
    };
    if map.get("version") != Some(&Ipld::Integer(1)) {
        return Err(RepoError::Encoding("unsupported CAR version".into()));
    }
    match map.get("roots") {
        Some(Ipld::List(roots)) => roots
            .iter()
            .map(|r| match r {
                Ipld::Link(cid) => Ok(*cid),
                other => Err(RepoError::Encoding(format!("CAR root is not a link: {other:?}"))),
            })
            .collect(),
        _ => Err(RepoError::Encoding("CAR header has no roots".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_types::value::encode_block;
    use proptest::prelude::*;

    fn block(n: i128) -> (Cid, Vec<u8>) {
        encode_block(&Ipld::Integer(n)).unwrap()
    }

    #[test]
    fn write_then_read() {
        let (root, root_bytes) = block(0);
        let (other, other_bytes) = block(1);

        let mut car = CarWriter::new(&root).unwrap();
        assert!(car.write_block(&root, &root_bytes).unwrap());
        assert!(car.write_block(&other, &other_bytes).unwrap());
        assert_eq!(car.len(), 2);

        let reader = CarReader::parse(&car.finish()).unwrap();
        assert_eq!(reader.roots(), &[root]);
        assert_eq!(reader.blocks().len(), 2);
        assert_eq!(reader.get(&other), Some(other_bytes.as_slice()));
    }

    #[test]
    fn duplicate_blocks_written_once() {
        let (root, bytes) = block(7);
        let mut car = CarWriter::new(&root).unwrap();
        assert!(car.write_block(&root, &bytes).unwrap());
        assert!(!car.write_block(&root, &bytes).unwrap());
        assert_eq!(CarReader::parse(&car.finish()).unwrap().blocks().len(), 1);
    }

    #[test]
    fn header_only_stream() {
        let (root, _) = block(3);
        let car = CarWriter::new(&root).unwrap();
        assert!(car.is_empty());
        let reader = CarReader::parse(&car.finish()).unwrap();
        assert!(reader.blocks().is_empty());
    }

    #[test]
    fn tampered_block_is_rejected() {
        let (root, bytes) = block(5);
        let mut car = CarWriter::new(&root).unwrap();
        car.write_block(&root, &bytes).unwrap();
        let mut out = car.finish();
        let last = out.len() - 1;
        out[last] ^= 0x01;
        assert!(CarReader::parse(&out).is_err());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let (root, bytes) = block(5);
        let mut car = CarWriter::new(&root).unwrap();
        car.write_block(&root, &bytes).unwrap();
        let out = car.finish();
        assert!(CarReader::parse(&out[..out.len() - 1]).is_err());
    }

    proptest! {
        #[test]
        fn reader_sees_each_distinct_block_once(values in proptest::collection::vec(0i64..50, 0..40)) {
            let (root, _) = block(-1);
            let mut car = CarWriter::new(&root).unwrap();
            let mut expected = Vec::new();
            for v in &values {
                let (cid, bytes) = block(i128::from(*v));
                if car.write_block(&cid, &bytes).unwrap() {
                    expected.push(cid);
                }
            }
            let reader = CarReader::parse(&car.finish()).unwrap();
            let got: Vec<Cid> = reader.blocks().iter().map(|(c, _)| *c).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
