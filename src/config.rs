//! Configuration for a replicated KV node

use std::path::PathBuf;
use std::time::Duration;

/// Log-entry count after which the consensus loop cuts a snapshot and
/// compacts the log.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;

/// Upper bound on waiting for a proposed command to commit.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for starting a [`RaftServer`](crate::server::RaftServer).
///
/// `bind_addr` is the consensus transport endpoint. `grpc_addr` and
/// `http_addr` are advertised addresses for the outer service tiers; they
/// travel with Join requests and end up in the node metadata, the core does
/// not listen on them itself.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Unique printable node identifier (e.g. "node1")
    pub node_id: String,

    /// Address the consensus transport listens on (e.g. "127.0.0.1:7000")
    pub bind_addr: String,

    /// Advertised gRPC address of the outer service tier
    pub grpc_addr: String,

    /// Advertised HTTP address of the outer service tier
    pub http_addr: String,

    /// Directory holding the KV engine, the raft stores, and snapshots
    pub data_dir: PathBuf,

    /// Form a new single-node cluster on first start. Ignored when the
    /// data directory already contains raft state.
    pub bootstrap: bool,

    /// Snapshot trigger threshold in log entries
    pub snapshot_threshold: u64,
}

impl NodeConfig {
    /// Configuration for bootstrapping a new cluster.
    pub fn bootstrap(
        node_id: impl Into<String>,
        bind_addr: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            bind_addr: bind_addr.into(),
            grpc_addr: String::new(),
            http_addr: String::new(),
            data_dir: data_dir.into(),
            bootstrap: true,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }

    /// Configuration for a node that joins an existing cluster. The node
    /// idles until a leader adds it via `Join`.
    pub fn join(
        node_id: impl Into<String>,
        bind_addr: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            bind_addr: bind_addr.into(),
            grpc_addr: String::new(),
            http_addr: String::new(),
            data_dir: data_dir.into(),
            bootstrap: false,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }

    /// Set the advertised gRPC address.
    pub fn with_grpc_addr(mut self, addr: impl Into<String>) -> Self {
        self.grpc_addr = addr.into();
        self
    }

    /// Set the advertised HTTP address.
    pub fn with_http_addr(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = addr.into();
        self
    }

    /// Override the snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }
}
