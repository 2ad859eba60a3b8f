//! Bencode codec for KRPC datagrams and torrent metadata.
//!
//! Two decode modes: the tolerant one accepts what the wild DHT sends
//! (later duplicate dict keys overwrite earlier ones); the strict one
//! additionally requires unique, ascending, UTF-8 dict keys so that a
//! decode/encode round trip reproduces the input byte for byte. Only the
//! info-dictionary re-encode path needs strict mode.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum BVal {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<BVal>),
    Dict(BTreeMap<String, BVal>),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BencodeError {
    #[error("truncated input")]
    Truncated,
    #[error("invalid length prefix")]
    BadLength,
    #[error("invalid integer")]
    BadInt,
    #[error("unterminated container")]
    Unterminated,
    #[error("unexpected value prefix")]
    BadPrefix,
    #[error("duplicate dictionary key")]
    DuplicateKey,
    #[error("dictionary keys not in ascending order")]
    UnsortedKeys,
    #[error("dictionary key is not valid utf-8")]
    BadKey,
    #[error("trailing bytes after value")]
    TrailingBytes,
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Tolerant,
    Strict,
}

/// Decode the first bencoded value in `data`; trailing bytes are ignored.
pub fn decode(data: &[u8]) -> Result<BVal, BencodeError> {
    let (v, _) = decode_item(data, 0, Mode::Tolerant)?;
    Ok(v)
}

/// Decode the whole of `data` as one value, rejecting anything the sorted
/// re-encoder could not reproduce.
pub fn decode_strict(data: &[u8]) -> Result<BVal, BencodeError> {
    let (v, end) = decode_item(data, 0, Mode::Strict)?;
    if end != data.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(v)
}

/// Decode a dictionary starting at `i`, returning it with the index of the
/// first byte past it. The wire module uses the index to find where a
/// metadata piece's raw payload begins.
pub fn decode_dict(data: &[u8], i: usize) -> Result<(BTreeMap<String, BVal>, usize), BencodeError> {
    decode_dict_mode(data, i, Mode::Tolerant)
}

fn decode_item(data: &[u8], i: usize, mode: Mode) -> Result<(BVal, usize), BencodeError> {
    match data.get(i) {
        None => Err(BencodeError::Truncated),
        Some(b'l') => {
            let (v, j) = decode_list(data, i, mode)?;
            Ok((BVal::List(v), j))
        }
        Some(b'd') => {
            let (m, j) = decode_dict_mode(data, i, mode)?;
            Ok((BVal::Dict(m), j))
        }
        Some(b'i') => {
            let (n, j) = decode_int(data, i)?;
            Ok((BVal::Int(n), j))
        }
        Some(b'0'..=b'9') => {
            let (s, j) = decode_string(data, i)?;
            Ok((BVal::Bytes(s), j))
        }
        Some(_) => Err(BencodeError::BadPrefix),
    }
}

fn decode_string(data: &[u8], i: usize) -> Result<(Vec<u8>, usize), BencodeError> {
    if !data.get(i).is_some_and(u8::is_ascii_digit) {
        return Err(BencodeError::BadLength);
    }
    let colon = data[i..]
        .iter()
        .position(|&c| c == b':')
        .map(|p| p + i)
        .ok_or(BencodeError::Truncated)?;
    if !data[i..colon].iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::BadLength);
    }
    let len: usize = std::str::from_utf8(&data[i..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::BadLength)?;
    let start = colon + 1;
    let end = start.checked_add(len).ok_or(BencodeError::BadLength)?;
    if end > data.len() {
        return Err(BencodeError::Truncated);
    }
    Ok((data[start..end].to_vec(), end))
}

fn decode_int(data: &[u8], i: usize) -> Result<(i64, usize), BencodeError> {
    debug_assert_eq!(data[i], b'i');
    let end = data[i + 1..]
        .iter()
        .position(|&c| c == b'e')
        .map(|p| p + i + 1)
        .ok_or(BencodeError::Unterminated)?;
    let n = std::str::from_utf8(&data[i + 1..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::BadInt)?;
    Ok((n, end + 1))
}

fn decode_list(data: &[u8], mut i: usize, mode: Mode) -> Result<(Vec<BVal>, usize), BencodeError> {
    debug_assert_eq!(data[i], b'l');
    i += 1;
    let mut out = Vec::new();
    loop {
        match data.get(i) {
            None => return Err(BencodeError::Unterminated),
            Some(b'e') => return Ok((out, i + 1)),
            Some(_) => {
                let (item, j) = decode_item(data, i, mode)?;
                out.push(item);
                i = j;
            }
        }
    }
}

fn decode_dict_mode(
    data: &[u8],
    mut i: usize,
    mode: Mode,
) -> Result<(BTreeMap<String, BVal>, usize), BencodeError> {
    if data.get(i) != Some(&b'd') {
        return Err(BencodeError::BadPrefix);
    }
    i += 1;
    let mut out = BTreeMap::new();
    let mut prev_key: Option<Vec<u8>> = None;
    loop {
        match data.get(i) {
            None => return Err(BencodeError::Unterminated),
            Some(b'e') => return Ok((out, i + 1)),
            Some(_) => {
                let (raw_key, j) = decode_string(data, i)?;
                i = j;
                let (value, j) = decode_item(data, i, mode)?;
                i = j;
                if mode == Mode::Strict {
                    match prev_key.as_deref() {
                        Some(prev) if raw_key == prev => return Err(BencodeError::DuplicateKey),
                        Some(prev) if raw_key.as_slice() < prev => {
                            return Err(BencodeError::UnsortedKeys)
                        }
                        _ => {}
                    }
                    let key =
                        String::from_utf8(raw_key.clone()).map_err(|_| BencodeError::BadKey)?;
                    prev_key = Some(raw_key);
                    out.insert(key, value);
                } else {
                    out.insert(String::from_utf8_lossy(&raw_key).into_owned(), value);
                }
            }
        }
    }
}

fn encode_bytes(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(itoa::Buffer::new().format(s.len()).as_bytes());
    buf.push(b':');
    buf.extend_from_slice(s);
}

fn encode_item_to(buf: &mut Vec<u8>, v: &BVal) {
    match v {
        BVal::Bytes(b) => encode_bytes(buf, b),
        BVal::Int(n) => {
            buf.push(b'i');
            buf.extend_from_slice(itoa::Buffer::new().format(*n).as_bytes());
            buf.push(b'e');
        }
        BVal::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_item_to(buf, item);
            }
            buf.push(b'e');
        }
        BVal::Dict(m) => {
            // BTreeMap iteration gives the lexicographic key order bencode requires
            buf.push(b'd');
            for (k, v) in m {
                encode_bytes(buf, k.as_bytes());
                encode_item_to(buf, v);
            }
            buf.push(b'e');
        }
    }
}

pub fn encode(v: &BVal) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_item_to(&mut buf, v);
    buf
}

// builders
pub fn dict(pairs: Vec<(String, BVal)>) -> BVal {
    BVal::Dict(pairs.into_iter().collect())
}
pub fn list(items: Vec<BVal>) -> BVal {
    BVal::List(items)
}
pub fn bytes<B: Into<Vec<u8>>>(b: B) -> BVal {
    BVal::Bytes(b.into())
}
pub fn int(n: i64) -> BVal {
    BVal::Int(n)
}
