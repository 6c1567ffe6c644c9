//! Archipel integration test harness.
//!
//! Every test runs whole nodes in-process over loopback TCP. Multicast
//! discovery is off; nodes are connected by address. Each node gets its own
//! scratch directory and an in-memory persistence collaborator unless the
//! test supplies one.
//!
//!   cargo test --test integration
//!   RUST_LOG=archipeld=debug cargo test --test integration -- --nocapture

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use archipel_core::config::ArchipelConfig;
use archipel_core::Identity;
use archipel_services::{Event, MemoryPersistence, Persistence};
use archipeld::Node;
use tempfile::TempDir;
use tokio::sync::mpsc;

mod faults;
mod sessions;
mod transfer;
mod trust;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(20);

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct TestNode {
    pub node: Node,
    pub events: mpsc::Receiver<Event>,
    pub dir: TempDir,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node.shutdown();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Loopback, ephemeral port, no multicast, everything under `dir`.
pub fn test_config(dir: &Path) -> ArchipelConfig {
    let mut config = ArchipelConfig::default();
    config.identity.dir = dir.join("identity");
    config.network.bind_addr = "127.0.0.1".parse().unwrap();
    config.network.tcp_port = 0;
    config.network.discovery_enabled = false;
    config.storage.data_dir = dir.join("data");
    config.transfer.download_dir = dir.join("downloads");
    config
}

pub async fn spawn_node() -> TestNode {
    spawn_node_with(Identity::generate(), Arc::new(MemoryPersistence::default()), |_| {}).await
}

pub async fn spawn_node_with(
    identity: Identity,
    persistence: Arc<dyn Persistence>,
    tweak: impl FnOnce(&mut ArchipelConfig),
) -> TestNode {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let (node, events) = Node::start(config, identity, persistence)
        .await
        .expect("node should start");
    TestNode { node, events, dir }
}

/// Connect `a` to `b` and wait until both ends hold the session.
pub async fn connect(a: &TestNode, b: &TestNode) {
    let peer = a
        .node
        .connect(b.node.local_addr())
        .await
        .expect("handshake should succeed");
    assert_eq!(peer, b.node.id());
    let (a_id, b_id) = (a.node.id(), b.node.id());
    wait_until("both ends established", || {
        a.node.sessions().contains(&b_id) && b.node.sessions().contains(&a_id)
    })
    .await;
}

/// Poll `condition` until it holds or `WAIT` passes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receive events until one matches `pred`.
pub async fn wait_for_event(
    events: &mut mpsc::Receiver<Event>,
    what: &str,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed while waiting for: {what}"),
        Err(_) => panic!("timed out waiting for event: {what}"),
    }
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out: {what}"))
}

/// Deterministic test content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(2_654_435_761) >> 24) as u8 ^ seed)
        .collect()
}
