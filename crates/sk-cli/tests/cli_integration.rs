//! CLI integration tests
//!
//! Tests the skein CLI using assert_cmd. Commands that need a node talk
//! to one started in-process, found through SKEIN_IPC_ADDR.

use std::sync::Arc;

use assert_cmd::Command;
use predicates::prelude::*;
use tokio_util::sync::CancellationToken;

use sk_core::config::NodeConfig;
use sk_node::ipc::IpcServer;
use sk_node::DiscoveryCoordinator;

fn skein() -> Command {
    Command::cargo_bin("skein")
        .expect("Failed to locate skein binary - ensure it's built before running tests")
}

/// A loopback address nothing listens on
fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// IPC server around an idle node, kept alive by the returned runtime
struct TestNode {
    _runtime: tokio::runtime::Runtime,
    address: String,
    shutdown: CancellationToken,
}

impl TestNode {
    fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let mut config = NodeConfig::default();
        config.node.machine_id = Some("m-cli".into());
        config.node.advertise_ip = Some("127.0.0.1".into());

        let shutdown = CancellationToken::new();
        let address = runtime.block_on(async {
            let coordinator = DiscoveryCoordinator::new(config).unwrap();
            let server = IpcServer::bind("127.0.0.1:0", Arc::clone(&coordinator), shutdown.clone())
                .await
                .unwrap();
            let addr = server.local_addr().unwrap();
            tokio::spawn(server.run());
            addr.to_string()
        });

        Self {
            _runtime: runtime,
            address,
            shutdown,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = skein();
        cmd.env("SKEIN_IPC_ADDR", &self.address);
        cmd
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[test]
fn test_cli_help() {
    skein()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("skein"))
        .stdout(predicate::str::contains("LAN machine discovery"));
}

#[test]
fn test_cli_version() {
    skein()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("skein"));
}

#[test]
fn test_cli_ports_help() {
    skein()
        .args(["ports", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("claim"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_cli_unknown_command() {
    skein()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_cli_claim_requires_service() {
    skein().args(["ports", "claim", "8091"]).assert().failure();
}

#[test]
fn test_cli_config_path_honors_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    skein()
        .args(["config", "path", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.toml"));
}

#[test]
fn test_cli_config_init_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    skein()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    skein()
        .args(["config", "get", "discovery.beacon_port", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("8181"));

    // Second init without --force refuses
    skein()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_cli_config_show_without_file() {
    let dir = tempfile::tempdir().unwrap();
    skein()
        .args(["config", "show", "--config"])
        .arg(dir.path().join("missing.toml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("beacon_port = 8181"));
}

#[test]
fn test_cli_status_without_node() {
    skein()
        .env("SKEIN_IPC_ADDR", dead_address())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Is it running?"));
}

#[test]
fn test_cli_status_and_peers() {
    let node = TestNode::start();

    node.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Node: m-cli"));

    node.cmd()
        .arg("peers")
        .assert()
        .success()
        .stdout(predicate::str::contains("m-cli (local)"));
}

#[test]
fn test_cli_ports_round_trip() {
    let node = TestNode::start();
    let port = {
        let l = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        l.local_addr().unwrap().port()
    };

    node.cmd()
        .args(["ports", "check", &port.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("is available"));

    node.cmd()
        .args(["ports", "claim", &port.to_string(), "worker"])
        .assert()
        .success();

    node.cmd()
        .args(["ports", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("postgresql"));

    node.cmd()
        .args(["ports", "release", &port.to_string()])
        .assert()
        .success();

    node.cmd()
        .args(["ports", "release", &port.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not allocated"));
}

#[test]
fn test_cli_claim_reserved_port_fails() {
    let node = TestNode::start();

    node.cmd()
        .args(["ports", "claim", "5432", "dashboard"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reserved for postgresql"));
}

#[test]
fn test_cli_validate_suggests_port() {
    let node = TestNode::start();

    node.cmd()
        .args(["ports", "validate", "my-api"])
        .assert()
        .success()
        .stdout(predicate::str::contains("for my-api (api range 8001-8089)"));
}

#[test]
fn test_cli_discover_needs_running_discovery() {
    let node = TestNode::start();

    node.cmd()
        .arg("discover")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Discovery is not running"));
}
