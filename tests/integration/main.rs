//! Cascade integration test harness.
//!
//! Every scenario runs server and receivers in-process against real
//! sockets: TCP control channels on 127.0.0.1 and multicast groups in
//! 239.255.0.0/16. Environments without a usable multicast route (some
//! build sandboxes) are detected up front and the scenarios SKIP
//! quietly instead of failing.
//!
//! Each scenario uses its own multicast group and port range so the
//! suite can run in parallel without cross-talk.

mod admission;
mod reconnect;
mod secure;
mod transfer;
mod waves;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;

use cascade_core::config::{ClientConfig, ServerConfig};
use cascade_recv::{ReceiverSession, TransferReport, TransferUri};

// ── Environment probe ─────────────────────────────────────────────────────────

/// True when a multicast datagram sent to a 239.255/16 group loops back
/// to a co-located receiver. Scenarios skip when it does not.
pub async fn multicast_available() -> bool {
    use cascade_core::group::{DatagramGroup, GroupInterface};

    let group: std::net::IpAddr = "239.255.90.1".parse().unwrap();
    let Ok(a) = DatagramGroup::join(group, 17699, &GroupInterface::default(), 1, 0) else {
        return false;
    };
    let Ok(b) = DatagramGroup::join(group, 17699, &GroupInterface::default(), 1, 0) else {
        return false;
    };
    if a.send(b"probe").await.is_err() {
        return false;
    }
    let mut buf = [0u8; 16];
    matches!(
        tokio::time::timeout(Duration::from_secs(1), b.recv(&mut buf)).await,
        Ok(Ok(5))
    )
}

/// Shared skip guard; returns true when the scenario should bail out.
pub async fn skip_without_multicast(name: &str) -> bool {
    if multicast_available().await {
        false
    } else {
        eprintln!("SKIP {name}: multicast not available in this environment");
        true
    }
}

// ── Payload fixtures ──────────────────────────────────────────────────────────

/// A scratch area holding a server root with one payload under `path`,
/// plus per-receiver destination roots.
pub struct Fixture {
    pub base: PathBuf,
    pub server_root: PathBuf,
    pub path: String,
}

impl Fixture {
    /// Build a payload of the given `(name, len)` files; contents are a
    /// deterministic byte pattern distinct per file.
    pub fn new(label: &str, files: &[(&str, usize)]) -> Self {
        let base = std::env::temp_dir().join(format!("cascade-it-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let server_root = base.join("server");
        let path = "payload".to_string();
        for (ordinal, (name, len)) in files.iter().enumerate() {
            let full = server_root.join(&path).join(name);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, pattern(ordinal as u8, *len)).unwrap();
        }
        std::fs::create_dir_all(server_root.join(&path)).unwrap();
        Self { base, server_root, path }
    }

    /// A fresh destination root for one receiver.
    pub fn client_root(&self, tag: &str) -> PathBuf {
        let root = self.base.join(format!("client-{tag}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    /// Byte-compare everything under the payload against a receiver's
    /// copy.
    pub fn assert_delivered(&self, client_root: &Path) {
        assert_dirs_equal(
            &self.server_root.join(&self.path),
            &client_root.join(&self.path),
        );
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (seed as usize).wrapping_add(i.wrapping_mul(31)) as u8)
        .collect()
}

fn assert_dirs_equal(expected: &Path, actual: &Path) {
    let mut names = Vec::new();
    collect(expected, expected, &mut names);
    names.sort();
    assert!(!names.is_empty(), "fixture payload is empty");
    for name in names {
        let want = std::fs::read(expected.join(&name)).unwrap();
        let got = std::fs::read(actual.join(&name))
            .unwrap_or_else(|e| panic!("missing delivered file {name:?}: {e}"));
        assert_eq!(got, want, "delivered bytes differ for {name:?}");
    }
}

fn collect(base: &Path, dir: &Path, out: &mut Vec<String>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        if entry.file_type().unwrap().is_dir() {
            collect(base, &entry.path(), out);
        } else {
            out.push(
                entry
                    .path()
                    .strip_prefix(base)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned(),
            );
        }
    }
}

// ── Server / client helpers ───────────────────────────────────────────────────

/// Server config tuned for fast test cadence. `group_octet` and
/// `start_port` isolate the scenario's multicast traffic.
pub fn server_config(fixture: &Fixture, group_octet: u8, start_port: u16) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1:0".into(),
        root_folder: fixture.server_root.clone(),
        multicast_address: format!("239.255.91.{group_octet}").parse().unwrap(),
        multicast_start_port: start_port,
        read_timeout_secs: 2,
        packet_update_interval_ms: 100,
        idle_grace_secs: 1,
        ..ServerConfig::default()
    }
}

pub fn client_config(root: PathBuf) -> ClientConfig {
    ClientConfig {
        root_folder: root,
        read_timeout_secs: 10,
        reconnect_delay_secs: 1,
        packet_update_interval_ms: 100,
        ..ClientConfig::default()
    }
}

pub struct RunningServer {
    pub addr: SocketAddr,
    pub shutdown: broadcast::Sender<()>,
    pub task: tokio::task::JoinHandle<()>,
}

pub async fn start_server(config: ServerConfig) -> RunningServer {
    let (shutdown, _) = broadcast::channel(1);
    let handle = cascaded::serve(config, shutdown.clone())
        .await
        .expect("server failed to start");
    RunningServer { addr: handle.local_addr, shutdown, task: handle.task }
}

impl RunningServer {
    pub fn uri(&self, secure: bool, path: &str) -> String {
        let scheme = if secure { "mcs" } else { "mc" };
        format!("{scheme}://{}:{}/{path}", self.addr.ip(), self.addr.port())
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Run one receiver to completion with a generous deadline.
pub async fn run_client(
    uri: &str,
    config: ClientConfig,
) -> Result<TransferReport, cascade_core::TransferError> {
    let session = ReceiverSession::new(TransferUri::parse(uri)?, config)?;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::time::timeout(Duration::from_secs(60), session.run(shutdown_rx))
        .await
        .expect("receiver did not finish within the deadline")
}
