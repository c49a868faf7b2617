//! Error types for the replicated key-value core

use std::fmt;

/// Errors surfaced by the store, the state machine, and the server facade.
#[derive(Debug)]
pub enum KvsError {
    /// Key not present in the store
    NotFound,

    /// A mutating operation was submitted to a node that is not the leader
    NotLeader,

    /// Consensus did not acknowledge the command within the apply timeout.
    /// The command may still commit later; commands are idempotent, so
    /// callers may retry.
    ApplyTimeout,

    /// Leader discovery timed out
    Timeout,

    /// The leader address is not present in the current configuration
    LeaderNotFound,

    /// Join for a node id that is already part of the configuration.
    /// Non-fatal: the node's metadata has been refreshed.
    NodeAlreadyExists { id: String },

    /// Operation after the server was stopped
    Closed,

    /// Committed entry carried a command type this version does not know.
    /// Fatal: indicates divergent versions in the cluster.
    UnknownCommand { command_type: i32 },

    /// Storage engine or log engine failure
    Storage { reason: String },

    /// Failed to encode or decode a payload
    Serialization { reason: String },

    /// Network transport failure
    Transport { reason: String },

    /// Consensus library failure
    Raft { reason: String },

    /// Invalid configuration (unparseable address, bad data dir, ...)
    Config { reason: String },
}

impl fmt::Display for KvsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvsError::NotFound => write!(f, "key not found"),
            KvsError::NotLeader => write!(f, "node is not the leader"),
            KvsError::ApplyTimeout => write!(f, "timed out waiting for the command to commit"),
            KvsError::Timeout => write!(f, "timed out waiting for a leader"),
            KvsError::LeaderNotFound => {
                write!(f, "leader address is not in the current configuration")
            }
            KvsError::NodeAlreadyExists { id } => {
                write!(f, "node {} already exists in the cluster", id)
            }
            KvsError::Closed => write!(f, "server is closed"),
            KvsError::UnknownCommand { command_type } => {
                write!(f, "unknown command type {}", command_type)
            }
            KvsError::Storage { reason } => write!(f, "storage error: {}", reason),
            KvsError::Serialization { reason } => write!(f, "serialization error: {}", reason),
            KvsError::Transport { reason } => write!(f, "transport error: {}", reason),
            KvsError::Raft { reason } => write!(f, "raft error: {}", reason),
            KvsError::Config { reason } => write!(f, "configuration error: {}", reason),
        }
    }
}

impl std::error::Error for KvsError {}

impl From<rocksdb::Error> for KvsError {
    fn from(e: rocksdb::Error) -> Self {
        KvsError::Storage { reason: e.to_string() }
    }
}

impl From<std::io::Error> for KvsError {
    fn from(e: std::io::Error) -> Self {
        KvsError::Storage { reason: e.to_string() }
    }
}

impl From<raft::Error> for KvsError {
    fn from(e: raft::Error) -> Self {
        match e {
            raft::Error::ProposalDropped => KvsError::NotLeader,
            other => KvsError::Raft { reason: other.to_string() },
        }
    }
}

impl From<prost::DecodeError> for KvsError {
    fn from(e: prost::DecodeError) -> Self {
        KvsError::Serialization { reason: e.to_string() }
    }
}

impl From<protobuf::ProtobufError> for KvsError {
    fn from(e: protobuf::ProtobufError) -> Self {
        KvsError::Serialization { reason: e.to_string() }
    }
}

impl From<serde_json::Error> for KvsError {
    fn from(e: serde_json::Error) -> Self {
        KvsError::Serialization { reason: e.to_string() }
    }
}

impl From<tonic::transport::Error> for KvsError {
    fn from(e: tonic::transport::Error) -> Self {
        KvsError::Transport { reason: e.to_string() }
    }
}

impl From<tonic::Status> for KvsError {
    fn from(e: tonic::Status) -> Self {
        KvsError::Transport { reason: e.to_string() }
    }
}
