//! Replicated key-value store core
//!
//! A cluster of nodes maintains one shared key-value namespace, kept
//! consistent by Raft. Each node embeds a persistent KV engine as the
//! replicated state machine, a consensus layer that orders and commits
//! commands, a membership manager, and a snapshot/restore mechanism that
//! bounds the log.
//!
//! [`RaftServer`] is the public entry point; everything else supports it.

pub mod config;
pub mod errors;
pub mod fsm;
pub mod grpc;
pub mod kv;
pub mod raft;
pub mod server;

pub use crate::config::NodeConfig;
pub use crate::errors::KvsError;
pub use crate::grpc::proto;
pub use crate::raft::NodeState;
pub use crate::server::RaftServer;
