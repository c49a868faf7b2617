//! Peer clients
//!
//! `PeerClient` is a thin handle to another node's transport endpoint,
//! used transiently by `Cluster()` to ask a peer for its self-reported
//! node info. `PeerClientPool` keeps long-lived handles keyed by node id;
//! the core only tears the pool down on stop, but the lifecycle contract
//! (on-demand creation, idempotent close) is fixed here for components
//! that want background peer sync on top of the public surface.

use std::collections::HashMap;
use std::time::Duration;

use slog::{info, Logger};
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::errors::KvsError;
use crate::grpc::proto::raft_service_client::RaftServiceClient;
use crate::grpc::proto::{self, NodeRequest};

pub struct PeerClient {
    client: RaftServiceClient<Channel>,
    target: String,
}

impl PeerClient {
    /// Connect to a peer's advertised address. Dial timeout 10 s.
    pub async fn connect(address: &str) -> Result<Self, KvsError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| KvsError::Config { reason: e.to_string() })?
            .connect_timeout(Duration::from_secs(10));
        let channel = endpoint.connect().await?;
        Ok(PeerClient { client: RaftServiceClient::new(channel), target: address.to_string() })
    }

    /// Ask the peer for its self-reported node info.
    pub async fn node(&mut self) -> Result<proto::Node, KvsError> {
        let response = self.client.node(NodeRequest {}).await?;
        response
            .into_inner()
            .node
            .ok_or_else(|| KvsError::Transport { reason: "empty node response".to_string() })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Release the connection. Dropping the handle has the same effect;
    /// this makes the release explicit at call sites.
    pub async fn close(self) {}
}

/// Map of node id to peer client, guarded by a single mutex.
pub struct PeerClientPool {
    clients: Mutex<HashMap<String, PeerClient>>,
    logger: Logger,
}

impl PeerClientPool {
    pub fn new(logger: Logger) -> Self {
        PeerClientPool { clients: Mutex::new(HashMap::new()), logger }
    }

    /// Connect and retain a client for `node_id`, replacing any existing
    /// handle whose target differs.
    pub async fn connect(&self, node_id: &str, address: &str) -> Result<(), KvsError> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(node_id) {
            if existing.target() == address {
                return Ok(());
            }
        }
        let client = PeerClient::connect(address).await?;
        clients.insert(node_id.to_string(), client);
        Ok(())
    }

    /// Ask the retained peer for its node info.
    pub async fn node(&self, node_id: &str) -> Result<proto::Node, KvsError> {
        let mut clients = self.clients.lock().await;
        match clients.get_mut(node_id) {
            Some(client) => client.node().await,
            None => Err(KvsError::Transport { reason: format!("no client for {}", node_id) }),
        }
    }

    /// Drop the client for `node_id`. Unknown ids are a no-op.
    pub async fn close(&self, node_id: &str) {
        if let Some(client) = self.clients.lock().await.remove(node_id) {
            info!(self.logger, "closed peer client";
                "id" => node_id, "addr" => client.target());
            client.close().await;
        }
    }

    /// Release every retained client. Safe to call repeatedly.
    pub async fn close_all(&self) {
        let mut clients = self.clients.lock().await;
        for (node_id, client) in clients.drain() {
            info!(self.logger, "closed peer client";
                "id" => &node_id, "addr" => client.target());
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    }

    #[tokio::test]
    async fn pool_close_is_idempotent() {
        let pool = PeerClientPool::new(test_logger());

        // Closing an unknown id and closing twice are both no-ops.
        pool.close("n1").await;
        pool.close_all().await;
        pool.close_all().await;

        assert!(matches!(
            pool.node("n1").await,
            Err(KvsError::Transport { .. })
        ));
    }
}
