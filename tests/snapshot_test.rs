//! Snapshot creation, restore, and log compaction

use std::time::Duration;

use cetekv::{proto, NodeConfig, RaftServer};
use slog::Drain;

fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("127.0.0.1:{}", addr.port())
}

fn put(key: &[u8], value: &[u8]) -> proto::PutRequest {
    proto::PutRequest { key: key.to_vec(), value: value.to_vec() }
}

fn snapshot_files(data_dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(data_dir.join("snapshots")) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_snapshot_survives_log_loss() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();

    {
        let config = NodeConfig::bootstrap("n1", &addr, dir.path()).with_grpc_addr(&addr);
        let server = RaftServer::new(config, test_logger()).unwrap();
        server.start().await.unwrap();
        server.leader_address(Duration::from_secs(10)).await.unwrap();

        server.set(put(b"x", b"x1")).await.unwrap();
        server.set(put(b"y", b"y1")).await.unwrap();
        server.snapshot().await.expect("forced snapshot should succeed");
        assert!(!snapshot_files(dir.path()).is_empty());

        server.stop().await.unwrap();
    }

    // Lose the log but keep the snapshot ring and stable store.
    std::fs::remove_dir_all(dir.path().join("raft").join("log")).unwrap();

    let addr2 = free_addr();
    let config = NodeConfig::bootstrap("n1", &addr2, dir.path()).with_grpc_addr(&addr2);
    let server = RaftServer::new(config, test_logger()).unwrap();
    server.start().await.unwrap();
    server.leader_address(Duration::from_secs(10)).await.unwrap();

    assert_eq!(
        server.get(proto::GetRequest { key: b"x".to_vec() }).await.unwrap().value,
        b"x1"
    );
    assert_eq!(
        server.get(proto::GetRequest { key: b"y".to_vec() }).await.unwrap().value,
        b"y1"
    );

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn threshold_triggers_snapshots_automatically() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();

    let config = NodeConfig::bootstrap("n1", &addr, dir.path())
        .with_grpc_addr(&addr)
        .with_snapshot_threshold(16);
    let server = RaftServer::new(config, test_logger()).unwrap();
    server.start().await.unwrap();
    server.leader_address(Duration::from_secs(10)).await.unwrap();

    for i in 0..40u32 {
        let key = format!("key{:02}", i);
        server.set(put(key.as_bytes(), b"v")).await.unwrap();
    }

    let files = snapshot_files(dir.path());
    assert!(!files.is_empty(), "threshold should have cut at least one snapshot");
    assert!(files.len() <= 2, "ring keeps at most two snapshots, found {}", files.len());

    server.stop().await.unwrap();

    // Restart replays snapshot plus remaining log back to the same state.
    let addr2 = free_addr();
    let config = NodeConfig::bootstrap("n1", &addr2, dir.path()).with_grpc_addr(&addr2);
    let server = RaftServer::new(config, test_logger()).unwrap();
    server.start().await.unwrap();
    server.leader_address(Duration::from_secs(10)).await.unwrap();

    let pairs = server.fsm().scan().unwrap();
    assert_eq!(pairs.len(), 40);
    assert_eq!(
        server.get(proto::GetRequest { key: b"key00".to_vec() }).await.unwrap().value,
        b"v"
    );
    assert_eq!(
        server.get(proto::GetRequest { key: b"key39".to_vec() }).await.unwrap().value,
        b"v"
    );

    server.stop().await.unwrap();
}
