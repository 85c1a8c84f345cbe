//! Record values.
//!
//! Records travel as JSON on the HTTP surface and are stored as canonical
//! DAG-CBOR. Links are written in JSON as `{"$link": "<cid>"}` and byte
//! strings as `{"$bytes": "<base64>"}`. Floats are not part of the data
//! model and are rejected.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::{Cid, Ipld};
use serde_json::{Map, Value};

use crate::cid::{cid_for_cbor, parse_cid};
use crate::error::TypeError;

/// Encode a value as canonical DAG-CBOR.
pub fn encode_dag_cbor(value: &Ipld) -> Result<Vec<u8>, TypeError> {
    DagCborCodec
        .encode(value)
        .map_err(|e| TypeError::Encoding(e.to_string()))
}

pub fn decode_dag_cbor(bytes: &[u8]) -> Result<Ipld, TypeError> {
    DagCborCodec
        .decode(bytes)
        .map_err(|e| TypeError::Encoding(e.to_string()))
}

/// Encode a value and compute its block CID.
pub fn encode_block(value: &Ipld) -> Result<(Cid, Vec<u8>), TypeError> {
    let bytes = encode_dag_cbor(value)?;
    Ok((cid_for_cbor(&bytes), bytes))
}

/// Convert a JSON record body into the IPLD data model.
pub fn ipld_from_json(value: &Value) -> Result<Ipld, TypeError> {
    Ok(match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                Ipld::Integer(i128::from(u))
            } else {
                return Err(TypeError::Encoding(format!("floats are not supported: {n}")));
            }
        }
        Value::String(s) => Ipld::String(s.clone()),
        Value::Array(items) => Ipld::List(items.iter().map(ipld_from_json).collect::<Result<_, _>>()?),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(link)) = map.get("$link") {
                    return Ok(Ipld::Link(parse_cid(link)?));
                }
                if let Some(Value::String(b64)) = map.get("$bytes") {
                    let bytes = STANDARD_NO_PAD
                        .decode(b64.trim_end_matches('='))
                        .map_err(|e| TypeError::Encoding(format!("bad $bytes: {e}")))?;
                    return Ok(Ipld::Bytes(bytes));
                }
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), ipld_from_json(v)?);
            }
            Ipld::Map(out)
        }
    })
}

/// Render an IPLD value as JSON.
pub fn ipld_to_json(value: &Ipld) -> Value {
    match value {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => match i64::try_from(*i) {
            Ok(i) => Value::from(i),
            Err(_) => Value::String(i.to_string()),
        },
        Ipld::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(b) => {
            let mut map = Map::new();
            map.insert("$bytes".into(), Value::String(STANDARD_NO_PAD.encode(b)));
            Value::Object(map)
        }
        Ipld::List(items) => Value::Array(items.iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), ipld_to_json(v))).collect()),
        Ipld::Link(cid) => link_json(cid),
    }
}

/// `{"$link": "<cid>"}`
pub fn link_json(cid: &Cid) -> Value {
    let mut map = Map::new();
    map.insert("$link".into(), Value::String(cid.to_string()));
    Value::Object(map)
}

/// Reference to an uploaded blob as embedded in records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub cid: Cid,
    pub mime_type: String,
    pub size: u64,
}

impl BlobRef {
    pub fn to_ipld(&self) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("$type".into(), Ipld::String("blob".into()));
        map.insert("ref".into(), Ipld::Link(self.cid));
        map.insert("mimeType".into(), Ipld::String(self.mime_type.clone()));
        map.insert("size".into(), Ipld::Integer(i128::from(self.size)));
        Ipld::Map(map)
    }

    pub fn to_json(&self) -> Value {
        ipld_to_json(&self.to_ipld())
    }
}

/// Every distinct blob CID referenced anywhere inside `value`.
///
/// A blob reference is a map whose `$type` is `"blob"` and whose `ref` is a
/// link. The walk visits every map value and list element, so references
/// nested below other references are found too. Each CID appears once, in
/// first-seen order.
pub fn find_blob_refs(value: &Ipld) -> Vec<Cid> {
    let mut found = Vec::new();
    collect_blob_refs(value, &mut found);
    found
}

fn collect_blob_refs(value: &Ipld, found: &mut Vec<Cid>) {
    match value {
        Ipld::Map(map) => {
            let is_blob = matches!(map.get("$type"), Some(Ipld::String(t)) if t == "blob");
            if is_blob {
                if let Some(Ipld::Link(cid)) = map.get("ref") {
                    if !found.contains(cid) {
                        found.push(*cid);
                    }
                }
            }
            for child in map.values() {
                collect_blob_refs(child, found);
            }
        }
        Ipld::List(items) => {
            for child in items {
                collect_blob_refs(child, found);
            }
        }
        _ => {}
    }
}
