//! Two nodes talking over loopback: a seed with a listener and a client
//! behind a (simulated) NAT that discovers and connects to it.
//!
//! The seed lives on 127.0.0.3. Its own address is blacklisted by host, and
//! the client's connections arrive from 127.0.0.1, so they are not mistaken
//! for self-connections.

use p2p_node::config::P2pConfig;
use p2p_node::network::{AddrBook, FixedLocalIp, Node, NodeStatus};
use p2p_node::storage::JsonFileDb;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const SEED_IP: &str = "127.0.0.3";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

fn fast_monitor(cfg: &mut P2pConfig) {
    cfg.nat.enabled = false;
    cfg.monitor.dial_secs = 1;
    cfg.monitor.peer_info_secs = 1;
    cfg.monitor.online_discovery_secs = 1;
    cfg.monitor.heartbeat_secs = 1;
    cfg.monitor.max_peer_errors = 1;
    cfg.monitor.dial_timeout_ms = 500;
}

fn seed_node(data_dir: &std::path::Path, port: u16) -> Arc<Node> {
    let mut cfg = P2pConfig {
        is_seed: true,
        default_port: port,
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    };
    fast_monitor(&mut cfg);

    let listen: SocketAddr = format!("{}:{}", SEED_IP, port).parse().unwrap();
    let node = Node::builder(cfg)
        .local_ip_source(Arc::new(FixedLocalIp(SEED_IP.parse().unwrap())))
        .listen_on(listen)
        .build()
        .unwrap();
    Arc::new(node)
}

fn client_node(data_dir: &std::path::Path, seed: &str) -> Arc<Node> {
    let mut cfg = P2pConfig {
        seeds: vec![seed.to_string()],
        server_start: false,
        default_port: free_port(),
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    };
    fast_monitor(&mut cfg);

    let node = Node::builder(cfg)
        .local_ip_source(Arc::new(FixedLocalIp("127.0.0.2".parse().unwrap())))
        .build()
        .unwrap();
    Arc::new(node)
}

#[tokio::test]
async fn test_client_connects_to_seed() {
    let seed_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let seed_port = free_port();
    let seed_addr = format!("{}:{}", SEED_IP, seed_port);

    let seed = seed_node(seed_dir.path(), seed_port);
    seed.start().await.unwrap();
    let seed_status: NodeStatus = seed.status();
    assert!(seed_status.outside);
    assert_eq!(seed_status.external_addr.as_deref(), Some(seed_addr.as_str()));

    let client = client_node(client_dir.path(), &seed_addr);
    client.start().await.unwrap();

    // the seed saw us on loopback and could not dial back
    let info = client.node_info();
    assert!(!info.outside());
    assert_eq!(
        info.external_addr().unwrap().to_string(),
        format!("127.0.0.1:{}", info.cfg.default_nat_port)
    );

    assert!(wait_for(|| client.has(&seed_addr)).await);
    assert!(wait_for(|| client.get_active_peers().1.contains_key(&seed_addr)).await);
    let (_, infos) = client.get_active_peers();
    assert_eq!(infos[&seed_addr].name, seed_status.node_name);
    assert!(wait_for(|| info.is_nat_done()).await);

    // seed goes away, the heartbeat notices and the client drops it
    seed.close().await;
    assert!(wait_for(|| !client.has(&seed_addr)).await);
    assert!(client.get_active_peers().0.is_empty());

    client.close().await;
    assert_eq!(client.size(), 0);
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let node = seed_node(dir.path(), port);
    node.start().await.unwrap();
    let name = node.status().node_name;
    node.close().await;
    drop(node);

    let db = Arc::new(JsonFileDb::open(dir.path()).unwrap());
    let book = AddrBook::open(db).unwrap();
    assert_eq!(book.node_name(), name);

    let node = seed_node(dir.path(), free_port());
    assert_eq!(node.status().node_name, name);
    node.start().await.unwrap();
    node.close().await;
}
