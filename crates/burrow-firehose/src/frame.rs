//! Binary frames for the firehose stream.
//!
//! A frame is two DAG-CBOR values written back to back: a header
//! `{op, t}` selecting the payload variant, then the payload itself. CBOR
//! values are self-delimiting so no length prefix is needed.

use std::collections::BTreeMap;
use std::io::Cursor;

use burrow_types::value::encode_dag_cbor;
use burrow_types::Ipld;
use libipld::cbor::DagCborCodec;
use libipld::codec::Decode;

use crate::error::{FirehoseError, Result};
use crate::event::FirehoseEvent;

/// Header op of a regular message frame.
pub const OP_MESSAGE: i64 = 1;
/// Header op of an error frame.
pub const OP_ERROR: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: i64,
    /// Message type, e.g. `#commit`. Absent on error frames.
    pub t: Option<String>,
}

impl FrameHeader {
    pub fn for_event(event: &FirehoseEvent) -> Self {
        match event.kind().type_tag() {
            Some(tag) => Self {
                op: OP_MESSAGE,
                t: Some(tag.to_string()),
            },
            None => Self { op: OP_ERROR, t: None },
        }
    }

    pub fn is_error(&self) -> bool {
        self.op == OP_ERROR
    }

    fn to_ipld(&self) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("op".to_string(), Ipld::Integer(i128::from(self.op)));
        if let Some(t) = &self.t {
            map.insert("t".to_string(), Ipld::String(t.clone()));
        }
        Ipld::Map(map)
    }

    fn from_ipld(value: &Ipld) -> Result<Self> {
        let Ipld::Map(map) = value else {
            return Err(FirehoseError::Encoding("frame header is not a map".into()));
        };
        let op = match map.get("op") {
            Some(Ipld::Integer(op)) => i64::try_from(*op)
                .map_err(|_| FirehoseError::Encoding(format!("frame op out of range: {op}")))?,
            _ => return Err(FirehoseError::Encoding("frame header has no op".into())),
        };
        let t = match map.get("t") {
            Some(Ipld::String(t)) => Some(t.clone()),
            None => None,
            Some(other) => return Err(FirehoseError::Encoding(format!("bad frame type: {other:?}"))),
        };
        Ok(Self { op, t })
    }
}

/// Encode an event as header followed by payload.
pub fn encode_frame(event: &FirehoseEvent) -> Result<Vec<u8>> {
    let header = FrameHeader::for_event(event).to_ipld();
    let mut frame = encode_dag_cbor(&header).map_err(|e| FirehoseError::Encoding(e.to_string()))?;
    let payload = encode_dag_cbor(&event.payload()).map_err(|e| FirehoseError::Encoding(e.to_string()))?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Split a frame into its header and payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, Ipld)> {
    let mut cursor = Cursor::new(bytes);
    let header = Ipld::decode(DagCborCodec, &mut cursor).map_err(|e| FirehoseError::Encoding(e.to_string()))?;
    let header = FrameHeader::from_ipld(&header)?;
    let payload = Ipld::decode(DagCborCodec, &mut cursor).map_err(|e| FirehoseError::Encoding(e.to_string()))?;
    if cursor.position() != bytes.len() as u64 {
        return Err(FirehoseError::Encoding(format!(
            "{} trailing bytes after frame payload",
            bytes.len() as u64 - cursor.position()
        )));
    }
    Ok((header, payload))
}
