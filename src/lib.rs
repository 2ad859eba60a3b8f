//! Passive BitTorrent metadata crawler.
//!
//! Joins the mainline DHT as a crawling node, harvests get_peers and
//! announce_peer traffic, and downloads each announced torrent's info
//! dictionary straight from the announcing peer (BEP-9/10). Parsed
//! torrents land in a SQLite summary table; the ones matching the
//! configured keywords are also written out as `.torrent` files.

pub mod announce;
pub mod bencode;
pub mod blacklist;
pub mod dht;
pub mod krpc;
pub mod sniffer;
pub mod storage;
pub mod torrent;
pub mod types;
pub mod util;
pub mod wire;

pub use sniffer::{Config, Sniffer};
pub use types::SniffError;
