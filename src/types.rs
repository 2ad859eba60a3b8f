use std::net::SocketAddr;

/// Node ids share this key space; the crawler never needs to tell them apart.
pub type InfoHash = [u8; 20];

/// A lead produced by the DHT: some peer claims to hold metadata for `info_hash`.
///
/// The peer's TCP port may be a guess (see the get_peers handling in `dht`);
/// a wrong guess simply fails the fetch and blacklists the address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub info_hash: InfoHash,
    pub peer: SocketAddr,
}

impl Announcement {
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Fatal errors. Everything a remote peer can cause stays inside the worker
/// that talked to it; only local failures surface here.
#[derive(thiserror::Error, Debug)]
pub enum SniffError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("dht task died: {0}")]
    Join(#[from] tokio::task::JoinError),
}
