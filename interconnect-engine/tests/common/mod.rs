//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use interconnect_engine::control::ConnectionHandle;
use interconnect_engine::dtls::generate_self_signed;
use interconnect_engine::node::Interconnect;
use interconnect_engine::session::SessionEvent;
use loopgrid_config::InterconnectConfig;
use loopgrid_types::Envelope;
use serde_json::json;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub struct TestNode {
    pub node: Arc<Interconnect>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    _dir: tempfile::TempDir,
}

/// A currently free local UDP port
pub async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

/// Node with generated DTLS identity and the given loops
/// (name, multicast host, multicast port)
pub async fn build_node(name: &str, client: bool, loops: &[(&str, &str, u16)]) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let (cert_pem, key_pem) = generate_self_signed(name).unwrap();

    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(&cert_pem)
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(&key_pem)
        .unwrap();

    let media_port = free_udp_port().await;

    let mut loop_map = serde_json::Map::new();
    for (loop_name, host, port) in loops {
        loop_map.insert(
            loop_name.to_string(),
            json!({"host": host, "port": port}),
        );
    }

    let config: InterconnectConfig = serde_json::from_value(json!({
        "name": name,
        "password": "shared-secret",
        "socket": {
            "client": client,
            "signaling": {"host": "127.0.0.1", "port": 12345, "type": "TLS"},
            "media": {"host": "127.0.0.1", "port": media_port, "type": "UDP"},
            "mixer": {"host": "127.0.0.1", "port": 12346, "type": "TLS"},
            "internal": {"host": "127.0.0.1", "port": 0}
        },
        "tls": {
            "dtls": {"certificate": cert_path, "key": key_path}
        },
        "loops": loop_map
    }))
    .unwrap();

    let (node, events) = Interconnect::new(config, None).await.unwrap();
    TestNode {
        node,
        events,
        _dir: dir,
    }
}

/// Connection handle plus the receiver observing what the node sends on it
pub fn connection(remote: SocketAddr) -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectionHandle::new(remote, tx), rx)
}

/// Next envelope the node queued, with a test timeout
pub async fn recv_envelope(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("connection channel closed")
}

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}
