//! KRPC (BEP-5) message assembly and envelope parsing on top of bencode.

use crate::bencode::{self as be, BVal};
use std::collections::BTreeMap;

pub fn make_query(t: &[u8], q: &str, a: BVal) -> Vec<u8> {
    let map = be::dict(vec![
        ("t".into(), be::bytes(t)),
        ("y".into(), be::bytes(b"q".to_vec())),
        ("q".into(), be::bytes(q.as_bytes().to_vec())),
        ("a".into(), a),
    ]);
    be::encode(&map)
}

pub fn make_response(t: &[u8], r: BVal) -> Vec<u8> {
    let map = be::dict(vec![
        ("t".into(), be::bytes(t)),
        ("y".into(), be::bytes(b"r".to_vec())),
        ("r".into(), r),
    ]);
    be::encode(&map)
}

pub fn make_error(t: &[u8], code: i64, msg: &str) -> Vec<u8> {
    let map = be::dict(vec![
        ("t".into(), be::bytes(t)),
        ("y".into(), be::bytes(b"e".to_vec())),
        (
            "e".into(),
            be::list(vec![be::int(code), be::bytes(msg.as_bytes().to_vec())]),
        ),
    ]);
    be::encode(&map)
}

/// Pull the `t`/`y` envelope out of a decoded datagram. Anything that does
/// not look like a KRPC message yields `None` and is dropped by the caller.
pub fn parse_envelope(val: &BVal) -> Option<(&[u8], &str, &BTreeMap<String, BVal>)> {
    let BVal::Dict(dict) = val else { return None };
    let t = match dict.get("t")? {
        BVal::Bytes(b) => &b[..],
        _ => return None,
    };
    let y = match dict.get("y")? {
        BVal::Bytes(b) => std::str::from_utf8(b).ok()?,
        _ => return None,
    };
    Some((t, y, dict))
}

pub fn bytes_field<'a>(m: &'a BTreeMap<String, BVal>, key: &str) -> Option<&'a [u8]> {
    match m.get(key) {
        Some(BVal::Bytes(b)) => Some(b),
        _ => None,
    }
}

pub fn int_field(m: &BTreeMap<String, BVal>, key: &str) -> Option<i64> {
    match m.get(key) {
        Some(BVal::Int(n)) => Some(*n),
        _ => None,
    }
}

pub fn dict_field<'a>(
    m: &'a BTreeMap<String, BVal>,
    key: &str,
) -> Option<&'a BTreeMap<String, BVal>> {
    match m.get(key) {
        Some(BVal::Dict(d)) => Some(d),
        _ => None,
    }
}

/// A 20-byte id field (node id, info hash).
pub fn id_field(m: &BTreeMap<String, BVal>, key: &str) -> Option<[u8; 20]> {
    let b = bytes_field(m, key)?;
    let mut out = [0u8; 20];
    if b.len() != 20 {
        return None;
    }
    out.copy_from_slice(b);
    Some(out)
}
