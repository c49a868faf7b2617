//! gRPC service on the consensus endpoint
//!
//! Accepts raft messages from peers and answers the node-info RPC that
//! `Cluster()` on other nodes uses to learn this node's current state.

use std::sync::Arc;

use protobuf::Message as PbMessage;
use slog::{error, info, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::errors::KvsError;
use crate::fsm::KvsFsm;
use crate::grpc::proto::raft_service_server::{RaftService, RaftServiceServer};
use crate::grpc::proto::{self, NodeRequest, NodeResponse, RaftEnvelope, SendResponse};
use crate::raft::transport::GrpcTransport;
use crate::raft::{raft_id_for, Message, Peer, SharedState};

pub struct RaftServiceImpl {
    mailbox: mpsc::UnboundedSender<Message>,
    transport: Arc<GrpcTransport>,
    shared: Arc<SharedState>,
    fsm: Arc<KvsFsm>,
    node_id: String,
    logger: Logger,
}

impl RaftServiceImpl {
    pub fn new(
        mailbox: mpsc::UnboundedSender<Message>,
        transport: Arc<GrpcTransport>,
        shared: Arc<SharedState>,
        fsm: Arc<KvsFsm>,
        node_id: impl Into<String>,
        logger: Logger,
    ) -> Self {
        RaftServiceImpl { mailbox, transport, shared, fsm, node_id: node_id.into(), logger }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceImpl {
    async fn send_message(
        &self,
        request: Request<RaftEnvelope>,
    ) -> Result<Response<SendResponse>, Status> {
        let envelope = request.into_inner();

        // Learn the sender before stepping the message so responses can be
        // routed even when this node has not caught up on configuration.
        if envelope.from_id != 0 && !envelope.from_bind_addr.is_empty() {
            if !self.transport.has_peer(envelope.from_id) {
                self.transport.add_peer(envelope.from_id, envelope.from_bind_addr.clone());
            }
            if !envelope.from_node_id.is_empty()
                && self.shared.peer(envelope.from_id).is_none()
            {
                self.shared.upsert_peer(
                    envelope.from_id,
                    Peer {
                        node_id: envelope.from_node_id.clone(),
                        bind_addr: envelope.from_bind_addr.clone(),
                    },
                );
            }
        }

        let msg = raft::prelude::Message::parse_from_bytes(&envelope.payload)
            .map_err(|e| Status::invalid_argument(format!("bad raft message: {}", e)))?;

        self.mailbox
            .send(Message::Raft(msg))
            .map_err(|_| Status::unavailable("node is shutting down"))?;

        Ok(Response::new(SendResponse { success: true, error: String::new() }))
    }

    async fn node(
        &self,
        _request: Request<NodeRequest>,
    ) -> Result<Response<NodeResponse>, Status> {
        let node = local_node_info(&self.shared, &self.fsm, &self.node_id);
        Ok(Response::new(NodeResponse { node: Some(node) }))
    }
}

/// Self description of the local node. Infallible: bind address comes from
/// the configuration, the role from consensus, advertised addresses from
/// local metadata when present.
pub fn local_node_info(shared: &SharedState, fsm: &KvsFsm, node_id: &str) -> proto::Node {
    let mut node = proto::Node {
        state: shared.role().to_string(),
        ..Default::default()
    };
    if let Some(peer) = shared.peer(raft_id_for(node_id)) {
        node.bind_addr = peer.bind_addr;
    }
    if let Ok(Some(metadata)) = fsm.get_metadata(node_id) {
        node.grpc_addr = metadata.grpc_addr;
        node.http_addr = metadata.http_addr;
    }
    node
}

/// gRPC server handle with graceful shutdown support
pub struct GrpcServerHandle {
    shutdown_tx: oneshot::Sender<()>,
}

impl GrpcServerHandle {
    /// Trigger graceful shutdown of the server
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Bind the consensus endpoint and serve the transport service until the
/// returned handle is shut down. Binding failures surface here, so a node
/// whose address is taken fails its start instead of limping on.
pub async fn start_grpc_server(
    address: &str,
    service: RaftServiceImpl,
) -> Result<GrpcServerHandle, KvsError> {
    let addr: std::net::SocketAddr = address
        .parse()
        .map_err(|e: std::net::AddrParseError| KvsError::Config { reason: e.to_string() })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| KvsError::Transport { reason: format!("bind {}: {}", address, e) })?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let logger = service.logger.clone();
    info!(logger, "consensus transport listening"; "addr" => address);

    tokio::spawn(async move {
        let result = Server::builder()
            .add_service(RaftServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                shutdown_rx.await.ok();
            })
            .await;
        if let Err(e) = result {
            error!(logger, "grpc server failed"; "error" => %e);
        }
    });

    Ok(GrpcServerHandle { shutdown_tx })
}
