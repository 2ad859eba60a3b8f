use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub fn random_id20() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

// Compact IP/port (IPv4) as in BEP-5
pub fn decode_compact_ip_port(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != 6 {
        return None;
    }
    let ip = IpAddr::V4(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(ip, port))
}

// Concatenated compact node infos (26 bytes each): 20-byte id + 6-byte ip/port
pub fn decode_compact_nodes(data: &[u8]) -> Vec<([u8; 20], SocketAddr)> {
    if data.len() % 26 != 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(data.len() / 26);
    for chunk in data.chunks_exact(26) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        if let Some(addr) = decode_compact_ip_port(&chunk[20..]) {
            out.push((id, addr));
        }
    }
    out
}
