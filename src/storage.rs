//! Where results go: a SQLite summary table for every parsed torrent, and a
//! sharded on-disk tree of `.torrent` files for the interesting ones.

use crate::bencode::{self as be, BencodeError};
use crate::torrent::Torrent;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Shared handle to the summary table. Writes are serialized by the pool;
/// duplicate hashes are absorbed by the primary key.
#[derive(Clone)]
pub struct SummarySink {
    pool: Pool<Sqlite>,
}

impl SummarySink {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS torrent(hash TEXT PRIMARY KEY, name TEXT, length INTEGER)")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    /// Best-effort insert; a duplicate hash is not an event worth reporting.
    pub async fn insert(&self, torrent: &Torrent) {
        let res = sqlx::query("INSERT OR IGNORE INTO torrent(hash, name, length) VALUES(?, ?, ?)")
            .bind(&torrent.info_hash_hex)
            .bind(&torrent.name)
            .bind(torrent.length)
            .execute(&self.pool)
            .await;
        if let Err(e) = res {
            tracing::debug!(hash = %torrent.info_hash_hex, error = %e, "summary insert failed");
        }
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM torrent")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The `.torrent` tree, sharded on the first two hash-hex byte pairs so no
/// single directory grows unbounded.
pub struct TorrentStore {
    root: PathBuf,
}

impl TorrentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// `<root>/<hash[0:2]>/<hash[2:4]>/<hash>.torrent`
    pub fn path_for(&self, info_hash_hex: &str) -> PathBuf {
        self.root
            .join(&info_hash_hex[..2])
            .join(&info_hash_hex[2..4])
            .join(format!("{info_hash_hex}.torrent"))
    }

    /// Persist the metadata as `{"info": <dict>}`. The strict re-decode
    /// guarantees the re-encoded info value stays byte-identical, so the
    /// file's info hash still verifies. Returns false when another worker
    /// or an earlier run already owns the path.
    pub async fn save(&self, info_hash_hex: &str, meta: &[u8]) -> Result<bool, StoreError> {
        let info = be::decode_strict(meta)?;
        let path = self.path_for(info_hash_hex);
        // concurrent mkdir is fine, create_dir_all is idempotent
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let wrapped = be::encode(&be::dict(vec![("info".into(), info)]));
        file.write_all(&wrapped).await?;
        file.flush().await?;
        Ok(true)
    }
}
