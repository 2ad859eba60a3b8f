//! Turning a raw info dictionary into something reportable.

use crate::bencode::{self as be, BVal, BencodeError};

/// Torrents smaller than this are never persisted to disk.
pub const MIN_LENGTH: i64 = 10 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrentFile {
    /// `/`-joined path inside the torrent.
    pub path: String,
    pub length: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Torrent {
    pub info_hash_hex: String,
    pub name: String,
    pub length: i64,
    /// Never empty: single-file torrents get one synthesized entry.
    pub files: Vec<TorrentFile>,
}

impl Torrent {
    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}", self.info_hash_hex)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("metadata is not a dictionary")]
    NotADict,
}

fn utf8_preferred<'a>(
    dict: &'a std::collections::BTreeMap<String, BVal>,
    utf8_key: &str,
    key: &str,
) -> Option<&'a BVal> {
    dict.get(utf8_key).or_else(|| dict.get(key))
}

fn join_path(val: &BVal) -> Option<String> {
    let BVal::List(parts) = val else { return None };
    let mut segments = Vec::with_capacity(parts.len());
    for part in parts {
        if let BVal::Bytes(b) = part {
            segments.push(String::from_utf8_lossy(b).into_owned());
        }
    }
    Some(segments.join("/"))
}

/// Parse a verified metadata blob. Shape errors inside `files` degrade to
/// partial results rather than failures; only non-bencode input is refused.
pub fn parse(meta: &[u8], info_hash_hex: &str) -> Result<Torrent, ParseError> {
    let BVal::Dict(dict) = be::decode(meta)? else {
        return Err(ParseError::NotADict);
    };

    let name = match utf8_preferred(&dict, "name.utf-8", "name") {
        Some(BVal::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
        _ => String::new(),
    };
    let mut length = match dict.get("length") {
        Some(BVal::Int(n)) => *n,
        _ => 0,
    };

    let mut files = Vec::new();
    let mut total = 0i64;
    if let Some(BVal::List(entries)) = dict.get("files") {
        for entry in entries {
            let BVal::Dict(f) = entry else { continue };
            let path = utf8_preferred(f, "path.utf-8", "path")
                .and_then(join_path)
                .unwrap_or_default();
            let file_length = match f.get("length") {
                Some(BVal::Int(n)) => *n,
                _ => 0,
            };
            total += file_length;
            files.push(TorrentFile {
                path,
                length: file_length,
            });
        }
    }

    if length == 0 {
        length = total;
    }
    if files.is_empty() {
        files.push(TorrentFile {
            path: name.clone(),
            length,
        });
    }

    Ok(Torrent {
        info_hash_hex: info_hash_hex.to_string(),
        name,
        length,
        files,
    })
}

/// Pure persistence predicate: big enough, and the lowercased name contains
/// one of the (already lowercased) keywords.
pub fn interested(torrent: &Torrent, keywords: &[String]) -> bool {
    if torrent.length < MIN_LENGTH {
        return false;
    }
    let name = torrent.name.to_lowercase();
    keywords.iter().any(|k| name.contains(k.as_str()))
}

/// 1024-based human size for log lines, e.g. `2.8G`.
pub fn human_size(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{bytes}B");
    }
    let (mut div, mut exp) = (UNIT, 0);
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1}{}", bytes as f64 / div as f64, b"kMGTPE"[exp] as char)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_dict(pairs: Vec<(String, BVal)>) -> Vec<u8> {
        be::encode(&be::dict(pairs))
    }

    #[test]
    fn single_file() {
        let meta = encode_dict(vec![
            ("length".into(), be::int(3_000_000_000)),
            ("name".into(), be::bytes("ubuntu-22.04.iso")),
            ("piece length".into(), be::int(262144)),
        ]);
        let t = parse(&meta, "ab".repeat(20).as_str()).unwrap();
        assert_eq!(t.name, "ubuntu-22.04.iso");
        assert_eq!(t.length, 3_000_000_000);
        assert_eq!(
            t.files,
            vec![TorrentFile {
                path: "ubuntu-22.04.iso".into(),
                length: 3_000_000_000
            }]
        );
        assert_eq!(t.magnet(), format!("magnet:?xt=urn:btih:{}", "ab".repeat(20)));
    }

    #[test]
    fn multi_file_paths_and_total() {
        let meta = encode_dict(vec![
            (
                "files".into(),
                be::list(vec![
                    be::dict(vec![
                        ("length".into(), be::int(20_000_000)),
                        ("path".into(), be::list(vec![be::bytes("01.flac")])),
                    ]),
                    be::dict(vec![
                        ("length".into(), be::int(500_000)),
                        (
                            "path".into(),
                            be::list(vec![be::bytes("cover"), be::bytes("front.jpg")]),
                        ),
                    ]),
                ]),
            ),
            ("name".into(), be::bytes("album")),
        ]);
        let t = parse(&meta, "00".repeat(20).as_str()).unwrap();
        assert_eq!(t.length, 20_500_000);
        assert_eq!(t.files.len(), 2);
        assert_eq!(t.files[0].path, "01.flac");
        assert_eq!(t.files[1].path, "cover/front.jpg");
        assert_eq!(t.files[1].length, 500_000);
        assert_eq!(t.length, t.files.iter().map(|f| f.length).sum::<i64>());
    }

    #[test]
    fn utf8_name_preferred() {
        let meta = encode_dict(vec![
            ("length".into(), be::int(20_000_000)),
            ("name".into(), be::bytes("garbled")),
            ("name.utf-8".into(), be::bytes("正确")),
        ]);
        let t = parse(&meta, "00".repeat(20).as_str()).unwrap();
        assert_eq!(t.name, "正确");
    }

    #[test]
    fn utf8_path_preferred() {
        let meta = encode_dict(vec![
            (
                "files".into(),
                be::list(vec![be::dict(vec![
                    ("length".into(), be::int(5)),
                    ("path".into(), be::list(vec![be::bytes("bad")])),
                    ("path.utf-8".into(), be::list(vec![be::bytes("good")])),
                ])]),
            ),
            ("name".into(), be::bytes("x")),
        ]);
        let t = parse(&meta, "00".repeat(20).as_str()).unwrap();
        assert_eq!(t.files[0].path, "good");
    }

    #[test]
    fn malformed_files_synthesize_entry() {
        // files present but every entry is the wrong shape
        let meta = encode_dict(vec![
            ("files".into(), be::list(vec![be::int(1), be::bytes("no")])),
            ("name".into(), be::bytes("odd")),
        ]);
        let t = parse(&meta, "00".repeat(20).as_str()).unwrap();
        assert_eq!(
            t.files,
            vec![TorrentFile {
                path: "odd".into(),
                length: 0
            }]
        );
        assert_eq!(t.length, 0);
    }

    #[test]
    fn non_dict_metadata_is_refused() {
        assert!(matches!(parse(b"i1e", "00"), Err(ParseError::NotADict)));
        assert!(matches!(parse(b"xx", "00"), Err(ParseError::Bencode(_))));
    }

    #[test]
    fn interested_boundaries() {
        let mut t = Torrent {
            info_hash_hex: "00".repeat(20),
            name: "Ubuntu-22.04".into(),
            length: MIN_LENGTH,
            files: vec![],
        };
        let kw = vec!["ubuntu".to_string()];
        assert!(interested(&t, &kw));

        t.length = MIN_LENGTH - 1;
        assert!(!interested(&t, &kw));

        t.length = MIN_LENGTH;
        assert!(!interested(&t, &[]));
        assert!(!interested(&t, &["debian".to_string()]));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(500), "500B");
        assert_eq!(human_size(2048), "2.0k");
        assert_eq!(human_size(3_000_000_000), "2.8G");
    }
}
