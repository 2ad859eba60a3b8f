//! Routing-table-free DHT node (BEP-5 subset) tuned for crawling.
//!
//! The node answers just enough KRPC to stay interesting to the network,
//! responds with per-peer "neighbor" ids so remote routing tables pull it
//! close to live traffic, and turns every get_peers/announce_peer it sees
//! into an announcement for the crawl supervisor. It never stores routing
//! state beyond a small sliding queue of contacts to befriend next.

use crate::announce::AnnounceQueue;
use crate::bencode::{self as be, BVal};
use crate::krpc::{self, bytes_field, dict_field, id_field, int_field};
use crate::types::{Announcement, SniffError};
use crate::util::{decode_compact_nodes, random_id20};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{interval, Duration};

pub const BOOTSTRAP_NODES: [&str; 3] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// How many leading bytes of the querier's id we mirror back. The closer
/// the echoed id, the more future get_peers traffic lands on us.
const NEIGHBOR_PREFIX: usize = 15;

#[derive(Clone)]
pub struct Config {
    pub address: String,
    /// Upper bound on outbound find_node queries per second, and on the
    /// contact queue length.
    pub max_friends: usize,
    pub bootstrap: Vec<String>,
    /// Soft cap of the announcement queue.
    pub queue_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:6881".into(),
            max_friends: 500,
            bootstrap: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            queue_cap: 4096,
        }
    }
}

/// A node we might send a find_node to. Bootstrap contacts come without an
/// id; everything harvested from `nodes` payloads carries one.
#[derive(Clone, Debug)]
struct Contact {
    id: Option<[u8; 20]>,
    addr: SocketAddr,
}

pub struct Dht {
    cfg: Config,
    socket: UdpSocket,
    self_id: [u8; 20],
    announcements: Arc<AnnounceQueue>,
    contacts: Mutex<VecDeque<Contact>>,
    next_tid: AtomicU16,
    malformed: AtomicU64,
}

impl Dht {
    /// Bind the UDP socket. Failure here is fatal for the process.
    pub async fn bind(cfg: Config) -> Result<Self, SniffError> {
        let socket = UdpSocket::bind(&cfg.address).await?;
        let announcements = Arc::new(AnnounceQueue::new(cfg.queue_cap));
        Ok(Self {
            cfg,
            socket,
            self_id: random_id20(),
            announcements,
            contacts: Mutex::new(VecDeque::new()),
            next_tid: AtomicU16::new(0),
            malformed: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn announcements(&self) -> Arc<AnnounceQueue> {
        self.announcements.clone()
    }

    /// Drive the node until the socket is lost. Remote peers cannot make
    /// this return; only a local socket failure does.
    pub async fn run(&self) -> Result<(), SniffError> {
        let mut tick = interval(Duration::from_secs(1));
        let mut buf = [0u8; 8192];
        loop {
            tokio::select! {
                _ = tick.tick() => self.make_friends().await,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => self.handle_packet(&buf[..n], from).await,
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "transient udp receive error");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dht socket lost");
                        return Err(SniffError::Io(e));
                    }
                },
            }
        }
    }

    /// Per-peer identity: mirror the head of the remote id, keep our tail.
    fn neighbor_id(&self, other: &[u8; 20]) -> [u8; 20] {
        let mut id = self.self_id;
        id[..NEIGHBOR_PREFIX].copy_from_slice(&other[..NEIGHBOR_PREFIX]);
        id
    }

    fn next_tid(&self) -> [u8; 2] {
        self.next_tid.fetch_add(1, Ordering::Relaxed).to_be_bytes()
    }

    /// One tick of the outbound crawl: greet up to `max_friends` queued
    /// contacts with find_node, reseeding from the bootstrap routers when
    /// the queue has run dry.
    async fn make_friends(&self) {
        let batch: Vec<Contact> = {
            let mut contacts = self.contacts.lock().unwrap();
            let n = contacts.len().min(self.cfg.max_friends);
            contacts.drain(..n).collect()
        };
        if batch.is_empty() {
            self.bootstrap().await;
            return;
        }
        for contact in batch {
            self.send_find_node(&contact).await;
        }
    }

    async fn bootstrap(&self) {
        for host in &self.cfg.bootstrap {
            match lookup_host(host.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs.filter(|a| a.is_ipv4()) {
                        self.send_find_node(&Contact { id: None, addr }).await;
                    }
                }
                Err(e) => tracing::debug!(host = %host, error = %e, "bootstrap lookup failed"),
            }
        }
    }

    async fn send_find_node(&self, contact: &Contact) {
        let id = match &contact.id {
            Some(remote) => self.neighbor_id(remote),
            None => self.self_id,
        };
        let a = be::dict(vec![
            ("id".into(), be::bytes(&id[..])),
            ("target".into(), be::bytes(&random_id20()[..])),
        ]);
        let buf = krpc::make_query(&self.next_tid(), "find_node", a);
        if let Err(e) = self.socket.send_to(&buf, contact.addr).await {
            tracing::trace!(peer = %contact.addr, error = %e, "find_node send failed");
        }
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let parsed = be::decode(data).ok();
        let Some((tid, kind, msg)) = parsed.as_ref().and_then(krpc::parse_envelope) else {
            let n = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(peer = %from, total = n, "dropped malformed datagram");
            return;
        };
        match kind {
            "q" => self.handle_query(tid, msg, from).await,
            "r" => self.handle_reply(msg),
            // error replies and anything else carry nothing we can crawl
            _ => {}
        }
    }

    async fn handle_query(&self, tid: &[u8], msg: &BTreeMap<String, BVal>, from: SocketAddr) {
        let Some(BVal::Bytes(q)) = msg.get("q") else { return };
        let Ok(query) = std::str::from_utf8(q) else { return };
        let Some(a) = dict_field(msg, "a") else { return };
        let Some(sender_id) = id_field(a, "id") else {
            self.send_to(&krpc::make_error(tid, 203, "invalid id"), from).await;
            return;
        };

        match query {
            "ping" => {
                let r = be::dict(vec![(
                    "id".into(),
                    be::bytes(&self.neighbor_id(&sender_id)[..]),
                )]);
                self.send_to(&krpc::make_response(tid, r), from).await;
            }
            "find_node" => {
                // a crawler has no neighbors to offer
                let r = be::dict(vec![
                    ("id".into(), be::bytes(&self.neighbor_id(&sender_id)[..])),
                    ("nodes".into(), be::bytes(Vec::new())),
                ]);
                self.send_to(&krpc::make_response(tid, r), from).await;
            }
            "get_peers" => {
                let Some(info_hash) = id_field(a, "info_hash") else {
                    self.send_to(&krpc::make_error(tid, 203, "invalid info_hash"), from)
                        .await;
                    return;
                };
                let r = be::dict(vec![
                    ("id".into(), be::bytes(&self.neighbor_id(&sender_id)[..])),
                    ("token".into(), be::bytes(&info_hash[..8])),
                    ("nodes".into(), be::bytes(Vec::new())),
                ]);
                self.send_to(&krpc::make_response(tid, r), from).await;
                // the sender's TCP port is unknowable here; its UDP source
                // port is the best guess, and a wrong one just blacklists
                self.announce(info_hash, SocketAddr::new(from.ip(), from.port()));
            }
            "announce_peer" => {
                let Some(info_hash) = id_field(a, "info_hash") else { return };
                let implied = int_field(a, "implied_port").unwrap_or(0) != 0;
                let port = if implied {
                    from.port()
                } else {
                    match int_field(a, "port") {
                        Some(p) if (1..=u16::MAX as i64).contains(&p) => p as u16,
                        _ => return,
                    }
                };
                let r = be::dict(vec![(
                    "id".into(),
                    be::bytes(&self.neighbor_id(&sender_id)[..]),
                )]);
                self.send_to(&krpc::make_response(tid, r), from).await;
                self.announce(info_hash, SocketAddr::new(from.ip(), port));
            }
            _ => {}
        }
    }

    /// Replies are mined only for fresh contacts; transaction ids are not
    /// correlated, unknown ones simply carry no nodes worth keeping.
    fn handle_reply(&self, msg: &BTreeMap<String, BVal>) {
        let Some(r) = dict_field(msg, "r") else { return };
        let Some(nodes) = bytes_field(r, "nodes") else { return };
        let decoded = decode_compact_nodes(nodes);
        if decoded.is_empty() {
            return;
        }
        let mut contacts = self.contacts.lock().unwrap();
        for (id, addr) in decoded {
            contacts.push_back(Contact { id: Some(id), addr });
            if contacts.len() > self.cfg.max_friends {
                contacts.pop_front();
            }
        }
    }

    fn announce(&self, info_hash: [u8; 20], peer: SocketAddr) {
        self.announcements.put(Announcement { info_hash, peer });
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(buf, addr).await {
            tracing::trace!(peer = %addr, error = %e, "udp send failed");
        }
    }
}

/// UDP sockets surface ICMP-induced noise as receive errors; none of it
/// means the socket is gone.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;
    use crate::krpc::parse_envelope;

    async fn test_node() -> (Arc<Dht>, UdpSocket, SocketAddr) {
        let dht = Arc::new(
            Dht::bind(Config {
                address: "127.0.0.1:0".into(),
                max_friends: 8,
                bootstrap: Vec::new(),
                queue_cap: 16,
            })
            .await
            .unwrap(),
        );
        let dht_addr = dht.local_addr().unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (dht, remote, dht_addr)
    }

    async fn recv_reply(sock: &UdpSocket) -> BVal {
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn neighbor_id_mirrors_prefix() {
        let (dht, _remote, _addr) = test_node().await;
        let other = [0x55; 20];
        let id = dht.neighbor_id(&other);
        assert_eq!(&id[..NEIGHBOR_PREFIX], &other[..NEIGHBOR_PREFIX]);
        assert_eq!(&id[NEIGHBOR_PREFIX..], &dht.self_id[NEIGHBOR_PREFIX..]);
    }

    #[tokio::test]
    async fn ping_gets_neighbor_id_response() {
        let (dht, remote, dht_addr) = test_node().await;
        let sender_id = [0x11; 20];
        let a = be::dict(vec![("id".into(), be::bytes(&sender_id[..]))]);
        let query = krpc::make_query(b"aa", "ping", a);

        let d = dht.clone();
        let _node = tokio::spawn(async move { d.run().await });
        remote.send_to(&query, dht_addr).await.unwrap();

        let reply = recv_reply(&remote).await;
        let (t, y, msg) = parse_envelope(&reply).unwrap();
        assert_eq!((t, y), (&b"aa"[..], "r"));
        let id = id_field(dict_field(msg, "r").unwrap(), "id").unwrap();
        assert_eq!(&id[..NEIGHBOR_PREFIX], &sender_id[..NEIGHBOR_PREFIX]);
    }

    #[tokio::test]
    async fn get_peers_emits_announcement_and_token() {
        let (dht, remote, dht_addr) = test_node().await;
        let queue = dht.announcements();
        let sender_id = [0x11; 20];
        let info_hash = [0x42; 20];
        let a = be::dict(vec![
            ("id".into(), be::bytes(&sender_id[..])),
            ("info_hash".into(), be::bytes(&info_hash[..])),
        ]);
        let query = krpc::make_query(b"gp", "get_peers", a);

        let d = dht.clone();
        let _node = tokio::spawn(async move { d.run().await });
        remote.send_to(&query, dht_addr).await.unwrap();

        let reply = recv_reply(&remote).await;
        let (_, y, msg) = parse_envelope(&reply).unwrap();
        assert_eq!(y, "r");
        let r = dict_field(msg, "r").unwrap();
        let id = id_field(r, "id").unwrap();
        assert_eq!(&id[..NEIGHBOR_PREFIX], &sender_id[..NEIGHBOR_PREFIX]);
        assert_eq!(bytes_field(r, "token").unwrap(), &info_hash[..8]);
        assert_eq!(bytes_field(r, "nodes").unwrap(), b"");

        queue.wait().await;
        let ann = queue.get().unwrap();
        assert_eq!(ann.info_hash, info_hash);
        assert_eq!(ann.peer, remote.local_addr().unwrap());
    }

    #[tokio::test]
    async fn announce_peer_ports() {
        let (dht, remote, dht_addr) = test_node().await;
        let queue = dht.announcements();
        let d = dht.clone();
        let _node = tokio::spawn(async move { d.run().await });

        // explicit port
        let a = be::dict(vec![
            ("id".into(), be::bytes(&[0x11; 20][..])),
            ("info_hash".into(), be::bytes(&[0x42; 20][..])),
            ("port".into(), be::int(9999)),
            ("token".into(), be::bytes(&[0x42; 8][..])),
        ]);
        remote
            .send_to(&krpc::make_query(b"a1", "announce_peer", a), dht_addr)
            .await
            .unwrap();
        let _ = recv_reply(&remote).await;
        queue.wait().await;
        let ann = queue.get().unwrap();
        assert_eq!(ann.peer.port(), 9999);

        // implied port falls back to the UDP source port
        let a = be::dict(vec![
            ("id".into(), be::bytes(&[0x11; 20][..])),
            ("implied_port".into(), be::int(1)),
            ("info_hash".into(), be::bytes(&[0x43; 20][..])),
            ("port".into(), be::int(9999)),
            ("token".into(), be::bytes(&[0x43; 8][..])),
        ]);
        remote
            .send_to(&krpc::make_query(b"a2", "announce_peer", a), dht_addr)
            .await
            .unwrap();
        let _ = recv_reply(&remote).await;
        queue.wait().await;
        let ann = queue.get().unwrap();
        assert_eq!(ann.peer.port(), remote.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn reply_nodes_become_contacts() {
        let (dht, remote, dht_addr) = test_node().await;
        let mut nodes = Vec::new();
        nodes.extend_from_slice(&[1u8; 20]);
        nodes.extend_from_slice(&[127, 0, 0, 1, 0x1f, 0x90]);
        let r = be::dict(vec![
            ("id".into(), be::bytes(&[0x11; 20][..])),
            ("nodes".into(), be::bytes(nodes)),
        ]);
        let reply = krpc::make_response(b"\x00\x01", r);

        let d = dht.clone();
        let _node = tokio::spawn(async move { d.run().await });
        remote.send_to(&reply, dht_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dht.contacts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_datagrams_are_counted_and_dropped() {
        let (dht, remote, dht_addr) = test_node().await;
        let d = dht.clone();
        let _node = tokio::spawn(async move { d.run().await });
        remote.send_to(b"not bencode", dht_addr).await.unwrap();
        remote.send_to(b"i42e", dht_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dht.malformed.load(Ordering::Relaxed), 2);
        assert!(dht.announcements().is_empty());
    }
}
