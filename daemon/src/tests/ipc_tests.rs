//! Tests for the IPC server over a real Unix socket

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UnixStream};

use crate::collector::Collector;
use crate::ipc::IpcServer;
use crate::storage::MemoryBuffer;
use shared::config::{Config, GlobalConfig, ProbeKind};
use shared::ipc::{msg, Response};
use shared::Target;

struct TestDaemon {
    _dir: TempDir,
    collector: Arc<Collector>,
    server: Arc<IpcServer>,
    socket_path: std::path::PathBuf,
}

/// Collector on a loopback TCP target plus an IPC server on a temp
/// socket. The collector is started so subscription pushes flow.
async fn start_daemon() -> TestDaemon {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let config = Arc::new(Config {
        server: Default::default(),
        global: GlobalConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            pings: 2,
            data_dir: None,
        },
        storage: Default::default(),
        targets: vec![Target {
            name: "Local".to_string(),
            host: "127.0.0.1".to_string(),
            port: Some(port),
            probe: ProbeKind::Tcp,
        }],
    });

    let collector = Arc::new(Collector::new(
        config,
        Arc::new(MemoryBuffer::default()),
        None,
    ));
    collector.start().await;

    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("pulse.sock");
    let server = Arc::new(IpcServer::new(socket_path.clone(), Arc::clone(&collector)));
    Arc::clone(&server).start().await.unwrap();

    TestDaemon {
        _dir: dir,
        collector,
        server,
        socket_path,
    }
}

async fn connect(daemon: &TestDaemon) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = UnixStream::connect(&daemon.socket_path).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Response {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a response")
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_socket_created_with_restricted_mode() {
    let daemon = start_daemon().await;

    let mode = std::fs::metadata(&daemon.socket_path)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o660);

    daemon.server.stop().await;
    daemon.collector.stop().await;
    assert!(!daemon.socket_path.exists(), "socket not unlinked on stop");
}

#[tokio::test]
async fn test_get_targets_round_trip() {
    let daemon = start_daemon().await;
    let (mut reader, mut writer) = connect(&daemon).await;

    send_line(&mut writer, r#"{"id":"req-1","type":"get_targets"}"#).await;
    let response = read_response(&mut reader).await;

    assert_eq!(response.id.as_deref(), Some("req-1"));
    assert_eq!(response.kind, msg::TARGETS);
    let targets = &response.data.unwrap()["targets"];
    assert_eq!(targets[0]["name"], "Local");
    assert_eq!(targets[0]["host"], "127.0.0.1");
    assert_eq!(targets[0]["probe"], "tcp");

    daemon.server.stop().await;
    daemon.collector.stop().await;
}

#[tokio::test]
async fn test_get_stats_round_trip() {
    let daemon = start_daemon().await;
    let (mut reader, mut writer) = connect(&daemon).await;

    send_line(
        &mut writer,
        r#"{"id":"s1","type":"get_stats","data":{"target":"Local"}}"#,
    )
    .await;
    let response = read_response(&mut reader).await;

    assert_eq!(response.id.as_deref(), Some("s1"));
    assert_eq!(response.kind, msg::STATS);
    let data = response.data.unwrap();
    assert_eq!(data["target"], "Local");
    assert_eq!(data["stats"]["target"], "Local");

    daemon.server.stop().await;
    daemon.collector.stop().await;
}

#[tokio::test]
async fn test_get_history_round_trip() {
    let daemon = start_daemon().await;
    let (mut reader, mut writer) = connect(&daemon).await;

    send_line(
        &mut writer,
        r#"{"id":"h1","type":"get_history","data":{"target":"Local","from":"2024-01-01T00:00:00Z","to":"2024-01-01T01:00:00Z"}}"#,
    )
    .await;
    let response = read_response(&mut reader).await;

    assert_eq!(response.id.as_deref(), Some("h1"));
    assert_eq!(response.kind, msg::HISTORY);
    let data = response.data.unwrap();
    assert_eq!(data["target"], "Local");
    // No archive behind this collector: an empty sequence, not an error
    assert!(data["data_points"].as_array().unwrap().is_empty());

    daemon.server.stop().await;
    daemon.collector.stop().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_requests_keep_connection_alive() {
    let daemon = start_daemon().await;
    let (mut reader, mut writer) = connect(&daemon).await;

    // Malformed JSON: error with no id, connection stays up
    send_line(&mut writer, "this is not json").await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.kind, msg::ERROR);
    assert_eq!(response.id, None);
    assert!(response.error.unwrap().contains("invalid request"));

    // Unknown type: error echoing the id
    send_line(&mut writer, r#"{"id":"u1","type":"bogus"}"#).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.kind, msg::ERROR);
    assert_eq!(response.id.as_deref(), Some("u1"));
    assert!(response.error.unwrap().contains("unknown request type"));

    // Bad payload: error echoing the id
    send_line(&mut writer, r#"{"id":"u2","type":"get_stats"}"#).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.kind, msg::ERROR);
    assert_eq!(response.id.as_deref(), Some("u2"));

    // The connection still serves real requests afterwards
    send_line(&mut writer, r#"{"id":"ok1","type":"get_targets"}"#).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.kind, msg::TARGETS);
    assert_eq!(response.id.as_deref(), Some("ok1"));

    daemon.server.stop().await;
    daemon.collector.stop().await;
}

#[tokio::test]
async fn test_subscribe_receives_pushes_without_id() {
    let daemon = start_daemon().await;
    let (mut reader, mut writer) = connect(&daemon).await;

    send_line(&mut writer, r#"{"id":"sub-1","type":"subscribe"}"#).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.kind, msg::OK);
    assert_eq!(response.id.as_deref(), Some("sub-1"));

    // The collector ticks every second; a push must arrive shortly
    let push = read_response(&mut reader).await;
    assert_eq!(push.kind, msg::PROBE_RESULT);
    assert_eq!(push.id, None);
    let data = push.data.unwrap();
    assert_eq!(data["target"], "Local");
    assert_eq!(data["success"], true);

    // After unsubscribe the pushes stop (allowing one already queued)
    send_line(&mut writer, r#"{"id":"sub-2","type":"unsubscribe"}"#).await;
    loop {
        let response = read_response(&mut reader).await;
        if response.kind == msg::OK {
            assert_eq!(response.id.as_deref(), Some("sub-2"));
            break;
        }
        assert_eq!(response.kind, msg::PROBE_RESULT);
    }

    daemon.server.stop().await;
    daemon.collector.stop().await;
}

#[tokio::test]
async fn test_unsubscribed_connection_gets_no_pushes() {
    let daemon = start_daemon().await;
    let (mut reader, mut writer) = connect(&daemon).await;

    // Wait out at least one probe round without subscribing
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    send_line(&mut writer, r#"{"id":"t1","type":"get_targets"}"#).await;
    let response = read_response(&mut reader).await;
    // The first (and only) message is our response, not a stray push
    assert_eq!(response.kind, msg::TARGETS);
    assert_eq!(response.id.as_deref(), Some("t1"));

    daemon.server.stop().await;
    daemon.collector.stop().await;
}
