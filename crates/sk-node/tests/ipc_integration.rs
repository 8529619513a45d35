//! IPC integration tests
//!
//! Drives the IPC server the way the CLI does: one JSON request per line,
//! one JSON response per line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sk_core::config::NodeConfig;
use sk_core::ipc::{IpcMessage, IpcRequest, IpcResponse, NodeEvent};
use sk_node::ipc::IpcServer;
use sk_node::DiscoveryCoordinator;
use sk_protocol::ServiceEndpoint;

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.machine_id = Some("m-ipc".into());
    config.node.advertise_ip = Some("127.0.0.1".into());
    config.node.services = vec![ServiceEndpoint::new("dashboard", 8090)];
    config
}

/// Start an IPC server on an ephemeral port around an idle coordinator
async fn start_server() -> (SocketAddr, CancellationToken, Arc<DiscoveryCoordinator>) {
    let coordinator = DiscoveryCoordinator::new(test_config()).unwrap();
    let shutdown = CancellationToken::new();
    let server = IpcServer::bind("127.0.0.1:0", Arc::clone(&coordinator), shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, shutdown, coordinator)
}

/// Free TCP port on all interfaces
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// IPC test client wrapper
struct TestClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to IPC server");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_message(&mut self) -> IpcMessage {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for server")
            .expect("Failed to read line");
        assert!(!line.is_empty(), "Server closed the connection");
        IpcMessage::from_bytes(line.trim().as_bytes()).expect("Failed to parse message")
    }

    async fn request(&mut self, request: IpcRequest) -> IpcResponse {
        let json = serde_json::to_string(&request).unwrap();
        self.send_raw(&json).await;
        match self.read_message().await {
            IpcMessage::Response(response) => response,
            other => panic!("Expected response, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_ipc_ping_pong() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    assert!(matches!(client.request(IpcRequest::Ping).await, IpcResponse::Pong));
    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_status_and_peers() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    match client.request(IpcRequest::GetStatus).await {
        IpcResponse::Status(status) => {
            assert_eq!(status.machine_id, "m-ipc");
            assert_eq!(status.peers_online, 0);
            assert_eq!(status.beacon_port, 8181);
        }
        other => panic!("Expected status, got {:?}", other),
    }

    match client.request(IpcRequest::ListPeers).await {
        IpcResponse::Peers { peers } => {
            assert_eq!(peers.len(), 1);
            assert!(peers[0].is_local);
            assert_eq!(peers[0].descriptor.services[0].name, "dashboard");
        }
        other => panic!("Expected peers, got {:?}", other),
    }

    match client
        .request(IpcRequest::GetPeer {
            machine_id: "m-missing".into(),
        })
        .await
    {
        IpcResponse::Error { message } => assert!(message.contains("m-missing")),
        other => panic!("Expected error, got {:?}", other),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_invalid_request() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    client.send_raw("{\"type\":\"no_such_request\"}").await;
    match client.read_message().await {
        IpcMessage::Response(IpcResponse::Error { message }) => {
            assert!(message.starts_with("Invalid request"));
        }
        other => panic!("Expected error, got {:?}", other),
    }

    // The connection survives a bad line
    assert!(matches!(client.request(IpcRequest::Ping).await, IpcResponse::Pong));
    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_discover_requires_running_node() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    match client.request(IpcRequest::DiscoverNow).await {
        IpcResponse::Error { message } => assert_eq!(message, "Discovery is not running"),
        other => panic!("Expected error, got {:?}", other),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_port_lifecycle() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let port = free_port();

    match client.request(IpcRequest::CheckPort { port }).await {
        IpcResponse::PortAvailability { available, .. } => assert!(available),
        other => panic!("Expected availability, got {:?}", other),
    }

    match client
        .request(IpcRequest::ClaimPort {
            port,
            service: "worker".into(),
            pid: Some(4242),
        })
        .await
    {
        IpcResponse::PortOutcome(outcome) => {
            assert!(outcome.success, "{}", outcome.message);
            assert_eq!(outcome.allocation.unwrap().pid, Some(4242));
        }
        other => panic!("Expected outcome, got {:?}", other),
    }

    match client
        .request(IpcRequest::ClaimPort {
            port,
            service: "other".into(),
            pid: None,
        })
        .await
    {
        IpcResponse::PortOutcome(outcome) => {
            assert!(!outcome.success);
            assert!(outcome.message.contains("worker"));
        }
        other => panic!("Expected outcome, got {:?}", other),
    }

    match client.request(IpcRequest::GetPortStatus).await {
        IpcResponse::PortStatus(report) => {
            assert_eq!(report.owner_of(port).unwrap().service, "worker");
        }
        other => panic!("Expected port status, got {:?}", other),
    }

    match client.request(IpcRequest::ReleasePort { port }).await {
        IpcResponse::PortOutcome(outcome) => assert!(outcome.success),
        other => panic!("Expected outcome, got {:?}", other),
    }

    match client.request(IpcRequest::ReleasePort { port: 5432 }).await {
        IpcResponse::PortOutcome(outcome) => {
            assert!(!outcome.success);
            assert!(outcome.message.contains("postgresql"));
        }
        other => panic!("Expected outcome, got {:?}", other),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_validate_service() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    match client
        .request(IpcRequest::ValidateService {
            service: "dashboard".into(),
            port: Some(5432),
        })
        .await
    {
        IpcResponse::Validation(validation) => {
            assert!(!validation.valid);
            assert!(validation
                .message
                .starts_with("Port 5432 is reserved for postgresql. Cannot use for dashboard."));
        }
        other => panic!("Expected validation, got {:?}", other),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_subscribe_receives_events() {
    let (addr, shutdown, _) = start_server().await;
    let mut subscriber = TestClient::connect(addr).await;
    let mut client = TestClient::connect(addr).await;

    assert!(matches!(subscriber.request(IpcRequest::Subscribe).await, IpcResponse::Ok));

    let port = free_port();
    let claimed = client
        .request(IpcRequest::ClaimPort {
            port,
            service: "worker".into(),
            pid: None,
        })
        .await;
    assert!(matches!(claimed, IpcResponse::PortOutcome(ref o) if o.success));

    match subscriber.read_message().await {
        IpcMessage::Event(NodeEvent::PortClaimed(allocation)) => {
            assert_eq!(allocation.port, port);
            assert_eq!(allocation.service, "worker");
        }
        other => panic!("Expected port event, got {:?}", other),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_shutdown_cancels_token() {
    let (addr, shutdown, _) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    assert!(matches!(client.request(IpcRequest::Shutdown).await, IpcResponse::Ok));
    timeout(Duration::from_secs(1), shutdown.cancelled())
        .await
        .expect("shutdown token not cancelled");
}
