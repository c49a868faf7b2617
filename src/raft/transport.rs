//! Consensus transport
//!
//! Sends protobuf-encoded raft messages to peers over tonic channels. The
//! peer registry maps raft ids to consensus endpoints; channels are cached
//! per peer and dropped on failure so the next send reconnects. Every
//! envelope carries the sender's identity, which lets a receiver route
//! responses to peers it has not yet learned from the configuration log.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use protobuf::Message as PbMessage;
use slog::{debug, warn, Logger};
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::errors::KvsError;
use crate::grpc::proto::raft_service_client::RaftServiceClient;
use crate::grpc::proto::RaftEnvelope;

/// Dial timeout for peer connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GrpcTransport {
    local_id: u64,
    local_node_id: String,
    local_bind_addr: String,
    peers: RwLock<HashMap<u64, String>>,
    clients: Mutex<HashMap<u64, RaftServiceClient<Channel>>>,
    logger: Logger,
}

impl GrpcTransport {
    pub fn new(
        local_id: u64,
        local_node_id: impl Into<String>,
        local_bind_addr: impl Into<String>,
        logger: Logger,
    ) -> Self {
        GrpcTransport {
            local_id,
            local_node_id: local_node_id.into(),
            local_bind_addr: local_bind_addr.into(),
            peers: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Register or update a peer endpoint. An address change invalidates
    /// any cached channel.
    pub fn add_peer(self: &Arc<Self>, raft_id: u64, bind_addr: String) {
        let previous = self.peers.write().unwrap().insert(raft_id, bind_addr.clone());
        if previous.as_deref() != Some(bind_addr.as_str()) {
            debug!(self.logger, "registered peer"; "raft_id" => raft_id, "addr" => &bind_addr);
            if previous.is_some() {
                let this = self.clone();
                tokio::spawn(async move {
                    this.clients.lock().await.remove(&raft_id);
                });
            }
        }
    }

    pub fn remove_peer(self: &Arc<Self>, raft_id: u64) {
        self.peers.write().unwrap().remove(&raft_id);
        let this = self.clone();
        tokio::spawn(async move {
            this.clients.lock().await.remove(&raft_id);
        });
    }

    pub fn peer_addr(&self, raft_id: u64) -> Option<String> {
        self.peers.read().unwrap().get(&raft_id).cloned()
    }

    pub fn has_peer(&self, raft_id: u64) -> bool {
        self.peers.read().unwrap().contains_key(&raft_id)
    }

    /// Fire-and-forget send. Raft tolerates message loss; failures are
    /// logged and the cached channel is dropped.
    pub fn send(self: &Arc<Self>, msg: raft::prelude::Message) {
        let to = msg.to;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.send_to(to, msg).await {
                warn!(this.logger, "failed to send raft message"; "to" => to, "error" => %e);
            }
        });
    }

    async fn send_to(&self, to: u64, msg: raft::prelude::Message) -> Result<(), KvsError> {
        let addr = self.peer_addr(to).ok_or_else(|| KvsError::Transport {
            reason: format!("peer {} not in registry", to),
        })?;

        let envelope = RaftEnvelope {
            payload: msg.write_to_bytes()?,
            from_id: self.local_id,
            from_node_id: self.local_node_id.clone(),
            from_bind_addr: self.local_bind_addr.clone(),
        };

        let mut client = self.client_for(to, &addr).await?;
        match client.send_message(envelope).await {
            Ok(response) => {
                let response = response.into_inner();
                if response.success {
                    Ok(())
                } else {
                    self.clients.lock().await.remove(&to);
                    Err(KvsError::Transport { reason: response.error })
                }
            }
            Err(status) => {
                self.clients.lock().await.remove(&to);
                Err(status.into())
            }
        }
    }

    async fn client_for(
        &self,
        raft_id: u64,
        addr: &str,
    ) -> Result<RaftServiceClient<Channel>, KvsError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&raft_id) {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| KvsError::Config { reason: e.to_string() })?
            .connect_timeout(DIAL_TIMEOUT);
        let channel = endpoint.connect().await?;
        let client = RaftServiceClient::new(channel);
        clients.insert(raft_id, client.clone());
        Ok(client)
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
    async fn peer_registry_add_and_remove() {
        let transport =
            Arc::new(GrpcTransport::new(1, "n1", "127.0.0.1:7001", test_logger()));

        transport.add_peer(2, "127.0.0.1:7002".to_string());
        assert!(transport.has_peer(2));
        assert_eq!(transport.peer_addr(2), Some("127.0.0.1:7002".to_string()));

        transport.remove_peer(2);
        assert!(!transport.has_peer(2));
        assert_eq!(transport.peer_addr(2), None);
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let transport =
            Arc::new(GrpcTransport::new(1, "n1", "127.0.0.1:7001", test_logger()));

        let mut msg = raft::prelude::Message::default();
        msg.to = 99;
        let result = transport.send_to(99, msg).await;
        assert!(matches!(result, Err(KvsError::Transport { .. })));
    }
}
