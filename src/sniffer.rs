//! Crawl supervisor: owns the DHT node, turns its announcements into
//! bounded metadata fetches, and hands results to the sinks.

use crate::blacklist::Blacklist;
use crate::dht::{self, Dht};
use crate::storage::{SummarySink, TorrentStore};
use crate::torrent::{self, human_size};
use crate::types::{Announcement, SniffError};
use crate::wire::MetaWire;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const BLACKLIST_TTL: Duration = Duration::from_secs(5 * 60);
const BLACKLIST_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct Config {
    /// DHT bind address, `host:port`.
    pub address: String,
    /// Max outbound find_node queries per second.
    pub max_friends: usize,
    /// Max concurrent metadata fetches.
    pub max_peers: usize,
    /// Deadline per metadata fetch.
    pub timeout: Duration,
    /// Root of the `.torrent` tree.
    pub dir: PathBuf,
    /// Lowercased keywords gating disk persistence.
    pub keywords: Vec<String>,
    /// SQLite file for summary rows.
    pub database: PathBuf,
}

pub struct Sniffer {
    cfg: Config,
    sink: SummarySink,
    store: Arc<TorrentStore>,
    blacklist: Arc<Blacklist>,
    keywords: Arc<Vec<String>>,
}

impl Sniffer {
    /// Opens the summary sink; failure there (or later, binding the DHT
    /// socket) is fatal, per the rule that only local errors may kill us.
    pub async fn new(cfg: Config) -> Result<Self, SniffError> {
        let sink = SummarySink::open(&cfg.database).await?;
        let store = Arc::new(TorrentStore::new(cfg.dir.clone()));
        let keywords = Arc::new(cfg.keywords.clone());
        Ok(Self {
            cfg,
            sink,
            store,
            blacklist: Arc::new(Blacklist::new(BLACKLIST_TTL, BLACKLIST_CAPACITY)),
            keywords,
        })
    }

    pub async fn run(&self) -> Result<(), SniffError> {
        let dht = Arc::new(
            Dht::bind(dht::Config {
                address: self.cfg.address.clone(),
                max_friends: self.cfg.max_friends,
                ..dht::Config::default()
            })
            .await?,
        );
        let announcements = dht.announcements();
        let node = dht.clone();
        let mut dht_task = tokio::spawn(async move { node.run().await });

        let slots = Arc::new(Semaphore::new(self.cfg.max_peers));
        tracing::info!(address = %self.cfg.address, "torrent sniffer is running");

        loop {
            tokio::select! {
                _ = announcements.wait() => {
                    while let Some(ac) = announcements.get() {
                        let Ok(permit) = slots.clone().acquire_owned().await else {
                            return Ok(());
                        };
                        let worker = Worker {
                            timeout: self.cfg.timeout,
                            sink: self.sink.clone(),
                            store: self.store.clone(),
                            blacklist: self.blacklist.clone(),
                            keywords: self.keywords.clone(),
                        };
                        tokio::spawn(async move {
                            // permit rides the whole task, released on drop
                            let _permit = permit;
                            worker.work(ac).await;
                        });
                    }
                }
                res = &mut dht_task => {
                    // the DHT only returns on a fatal socket error; workers
                    // in flight are abandoned to their deadlines
                    return match res {
                        Ok(inner) => inner,
                        Err(join_err) => Err(join_err.into()),
                    };
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, shutting down");
                    dht_task.abort();
                    return Ok(());
                }
            }
        }
    }
}

struct Worker {
    timeout: Duration,
    sink: SummarySink,
    store: Arc<TorrentStore>,
    blacklist: Arc<Blacklist>,
    keywords: Arc<Vec<String>>,
}

impl Worker {
    async fn work(&self, ac: Announcement) {
        let peer = ac.peer.to_string();
        if self.blacklist.has(&peer) {
            return;
        }

        let wire = MetaWire::new(ac.info_hash, ac.peer, self.timeout);
        let meta = match wire.fetch().await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "metadata fetch failed");
                self.blacklist.add(peer);
                return;
            }
        };

        let hash_hex = ac.info_hash_hex();
        let torrent = match torrent::parse(&meta, &hash_hex) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(hash = %hash_hex, error = %e, "unparseable metadata");
                return;
            }
        };

        tracing::info!(
            link = %torrent.magnet(),
            name = %torrent.name,
            size = %human_size(torrent.length),
            files = torrent.files.len(),
            "torrent"
        );
        self.sink.insert(&torrent).await;

        if torrent::interested(&torrent, &self.keywords) {
            match self.store.save(&hash_hex, &meta).await {
                Ok(true) => tracing::info!(name = %torrent.name, "saved"),
                Ok(false) => {} // someone else got there first
                Err(e) => tracing::debug!(hash = %hash_hex, error = %e, "save failed"),
            }
        }
    }
}
