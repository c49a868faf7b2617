//! Raft server facade
//!
//! Public entry point of the core. Owns the node lifecycle and exposes the
//! coordination surface: leader discovery, membership (Join/Leave), local
//! reads, replicated writes, cluster description, and snapshots.
//!
//! All mutating operations must be called on the current leader; the
//! facade surfaces `NotLeader` instead of forwarding (forwarding belongs
//! to the outer tier).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use prost::Message as ProstMessage;
use slog::{crit, debug, error, info, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{NodeConfig, APPLY_TIMEOUT};
use crate::errors::KvsError;
use crate::fsm::KvsFsm;
use crate::grpc::client::{PeerClient, PeerClientPool};
use crate::grpc::proto::{self, command};
use crate::grpc::server::{local_node_info, start_grpc_server, GrpcServerHandle, RaftServiceImpl};
use crate::raft::snapshot_store::SnapshotStore;
use crate::raft::storage::RaftStorage;
use crate::raft::transport::GrpcTransport;
use crate::raft::{raft_id_for, Message, NodeState, Peer, RaftNode, SharedState};

/// Cadence at which leader discovery polls the consensus state.
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RaftServer {
    config: NodeConfig,
    raft_id: u64,
    fsm: Arc<KvsFsm>,
    shared: Arc<SharedState>,
    peer_clients: PeerClientPool,
    mailbox: StdRwLock<Option<mpsc::UnboundedSender<Message>>>,
    grpc_handle: StdMutex<Option<GrpcServerHandle>>,
    node_handle: StdMutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl RaftServer {
    /// Create the server and open its state machine under
    /// `<data_dir>/kvs`. The consensus side is brought up by [`start`].
    ///
    /// [`start`]: RaftServer::start
    pub fn new(config: NodeConfig, logger: Logger) -> Result<Self, KvsError> {
        let fsm_path = config.data_dir.join("kvs");
        let fsm = KvsFsm::open(&fsm_path, logger.clone()).map_err(|e| {
            error!(logger, "failed to create FSM";
                "path" => fsm_path.display().to_string(), "error" => %e);
            e
        })?;

        Ok(RaftServer {
            raft_id: raft_id_for(&config.node_id),
            fsm: Arc::new(fsm),
            shared: Arc::new(SharedState::new()),
            peer_clients: PeerClientPool::new(logger.clone()),
            mailbox: StdRwLock::new(None),
            grpc_handle: StdMutex::new(None),
            node_handle: StdMutex::new(None),
            logger,
            config,
        })
    }

    /// Bring up transport, stores, and the consensus loop; optionally
    /// bootstrap a single-node cluster. Any failure is fatal for the node.
    pub async fn start(&self) -> Result<(), KvsError> {
        let snapshots = Arc::new(SnapshotStore::open(
            self.config.data_dir.join("snapshots"),
            self.logger.clone(),
        )?);
        let storage =
            RaftStorage::open(&self.config.data_dir, snapshots.clone(), self.logger.clone())?;

        // The newest complete snapshot is always restored; the log then
        // replays on top of it. Replay over surviving engine state is safe
        // because every command is idempotent.
        let mut applied = 0;
        if let Some((meta, data)) = snapshots.latest()? {
            self.fsm.restore(&data)?;
            applied = meta.index;
            info!(self.logger, "restored snapshot on start"; "index" => meta.index);
        }

        let initialized = storage.is_initialized()?;
        if initialized {
            // Recover membership; the bootstrap flag is ignored.
            let conf_state = storage.conf_state()?;
            self.shared.set_voters(conf_state.voters.clone());
            for (raft_id, peer) in storage.load_peers()? {
                self.shared.upsert_peer(raft_id, peer);
            }
            if self.config.bootstrap {
                debug!(self.logger, "existing raft state found, ignoring bootstrap flag");
            }
        } else if self.config.bootstrap {
            let mut conf_state = raft::prelude::ConfState::default();
            conf_state.voters.push(self.raft_id);
            storage.set_conf_state(&conf_state)?;
            self.shared.set_voters(vec![self.raft_id]);
            info!(self.logger, "bootstrapping single-node cluster"; "id" => &self.config.node_id);
        }

        // The local node is always resolvable, whichever path set up the
        // configuration.
        self.shared.upsert_peer(
            self.raft_id,
            Peer { node_id: self.config.node_id.clone(), bind_addr: self.config.bind_addr.clone() },
        );
        if !initialized && self.config.bootstrap {
            storage.save_peers(&self.shared.peers())?;
        }

        let transport = Arc::new(GrpcTransport::new(
            self.raft_id,
            self.config.node_id.clone(),
            self.config.bind_addr.clone(),
            self.logger.clone(),
        ));
        for (raft_id, peer) in self.shared.peers() {
            if raft_id != self.raft_id {
                transport.add_peer(raft_id, peer.bind_addr);
            }
        }

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();

        let mut node = RaftNode::new(
            self.raft_id,
            storage,
            self.fsm.clone(),
            snapshots,
            transport.clone(),
            self.shared.clone(),
            mailbox_rx,
            applied,
            self.config.snapshot_threshold,
            self.logger.clone(),
        )?;

        let loop_logger = self.logger.clone();
        let loop_shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = node.run().await {
                crit!(loop_logger, "consensus loop terminated"; "error" => %e);
                loop_shared.set_role(NodeState::Shutdown);
            }
        });
        *self.node_handle.lock().unwrap() = Some(handle);

        let service = RaftServiceImpl::new(
            mailbox_tx.clone(),
            transport,
            self.shared.clone(),
            self.fsm.clone(),
            self.config.node_id.clone(),
            self.logger.clone(),
        );
        let grpc_handle = match start_grpc_server(&self.config.bind_addr, service).await {
            Ok(handle) => handle,
            Err(e) => {
                // Release what was brought up before the failure.
                drop(mailbox_tx);
                if let Some(handle) = self.node_handle.lock().unwrap().take() {
                    handle.abort();
                }
                return Err(e);
            }
        };
        *self.grpc_handle.lock().unwrap() = Some(grpc_handle);
        *self.mailbox.write().unwrap() = Some(mailbox_tx);

        if !initialized && self.config.bootstrap {
            self.campaign().await?;
        }

        info!(self.logger, "raft server started"; "addr" => &self.config.bind_addr);
        Ok(())
    }

    /// Stop the transport and the consensus loop, then flush and close the
    /// state machine. Leadership is not handed off; callers that want a
    /// clean exit from the cluster issue `Leave` first.
    pub async fn stop(&self) -> Result<(), KvsError> {
        if let Some(handle) = self.grpc_handle.lock().unwrap().take() {
            handle.shutdown();
        }
        // Ask the loop to exit; it also exits once every sender is gone,
        // but the transport service may outlive us holding one.
        let _ = self.send_to_loop(Message::Stop);
        self.mailbox.write().unwrap().take();

        let node_handle = self.node_handle.lock().unwrap().take();
        if let Some(handle) = node_handle {
            let _ = handle.await;
        }

        self.peer_clients.close_all().await;
        self.shared.set_role(NodeState::Shutdown);
        self.fsm.close()?;

        info!(self.logger, "raft server stopped"; "addr" => &self.config.bind_addr);
        Ok(())
    }

    /// Current role as observed from consensus.
    pub fn state(&self) -> NodeState {
        self.shared.role()
    }

    /// Read-only handle to the state machine (local reads, metadata).
    pub fn fsm(&self) -> Arc<KvsFsm> {
        self.fsm.clone()
    }

    /// Poll for a leader until one is observed or `timeout` expires.
    pub async fn leader_address(&self, timeout: Duration) -> Result<String, KvsError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(LEADER_POLL_INTERVAL);

        loop {
            ticker.tick().await;

            if self.shared.role() == NodeState::Shutdown {
                return Err(KvsError::Closed);
            }

            let leader = self.shared.leader();
            if leader != 0 {
                if let Some(peer) = self.shared.peer(leader) {
                    debug!(self.logger, "detected leader address"; "addr" => &peer.bind_addr);
                    return Ok(peer.bind_addr);
                }
            }

            if Instant::now() >= deadline {
                error!(self.logger, "failed to detect leader address");
                return Err(KvsError::Timeout);
            }
        }
    }

    /// Resolve the leader address against the configuration.
    pub async fn leader_id(&self, timeout: Duration) -> Result<String, KvsError> {
        let leader_addr = self.leader_address(timeout).await?;
        for (_, peer) in self.shared.peers() {
            if peer.bind_addr == leader_addr {
                debug!(self.logger, "detected leader id"; "id" => &peer.node_id);
                return Ok(peer.node_id);
            }
        }
        error!(self.logger, "leader address not in configuration"; "addr" => &leader_addr);
        Err(KvsError::LeaderNotFound)
    }

    /// Membership predicate over the current cluster configuration.
    pub fn exist(&self, id: &str) -> bool {
        self.shared.is_voter(raft_id_for(id))
    }

    /// Add a node to the cluster and record its advertised addresses.
    ///
    /// If `id` is already a member, the voter step is skipped but the
    /// metadata command is still submitted so a rejoining node refreshes
    /// its addresses; the call then returns
    /// [`KvsError::NodeAlreadyExists`], which callers may treat as
    /// success.
    pub async fn join(&self, req: proto::JoinRequest) -> Result<(), KvsError> {
        let exists = self.exist(&req.id);

        if exists {
            debug!(self.logger, "node already exists"; "id" => &req.id, "addr" => &req.bind_addr);
        } else {
            self.add_voter(&req.id, &req.bind_addr).await?;
            info!(self.logger, "node has joined"; "id" => &req.id);
        }

        self.propose_command(command::Type::Join, req.encode_to_vec()).await?;

        if exists {
            Err(KvsError::NodeAlreadyExists { id: req.id })
        } else {
            Ok(())
        }
    }

    /// Remove a node from the cluster and prune its metadata. A node id
    /// that is not in the configuration is logged, not an error.
    pub async fn leave(&self, req: proto::LeaveRequest) -> Result<(), KvsError> {
        if self.exist(&req.id) {
            self.remove_server(&req.id).await?;
            info!(self.logger, "node has left"; "id" => &req.id);
        } else {
            debug!(self.logger, "node does not exist"; "id" => &req.id);
        }

        self.propose_command(command::Type::Leave, req.encode_to_vec()).await
    }

    /// Local self description. Infallible for the local id.
    pub fn node(&self) -> proto::Node {
        local_node_info(&self.shared, &self.fsm, &self.config.node_id)
    }

    /// Describe every member of the configuration. The self entry is
    /// filled locally; peers are asked for their own state through a
    /// transient client, and any failure (missing metadata, connect or
    /// RPC error) yields an entry in `Shutdown` state with the locally
    /// known addresses.
    pub async fn cluster(&self) -> HashMap<String, proto::Node> {
        let mut nodes = HashMap::new();

        for raft_id in self.shared.voters() {
            let peer = match self.shared.peer(raft_id) {
                Some(peer) => peer,
                None => {
                    error!(self.logger, "voter missing from address book"; "raft_id" => raft_id);
                    continue;
                }
            };

            if raft_id == self.raft_id {
                nodes.insert(peer.node_id, self.node());
                continue;
            }

            let mut node = proto::Node {
                bind_addr: peer.bind_addr.clone(),
                state: NodeState::Shutdown.to_string(),
                ..Default::default()
            };

            match self.fsm.get_metadata(&peer.node_id) {
                Ok(Some(metadata)) => {
                    node.grpc_addr = metadata.grpc_addr.clone();
                    node.http_addr = metadata.http_addr.clone();
                    match PeerClient::connect(&metadata.grpc_addr).await {
                        Ok(mut client) => {
                            match client.node().await {
                                Ok(remote) => node = remote,
                                Err(e) => {
                                    error!(self.logger, "failed to get node info";
                                        "addr" => &metadata.grpc_addr, "error" => %e);
                                }
                            }
                            client.close().await;
                        }
                        Err(e) => {
                            error!(self.logger, "failed to create peer client";
                                "addr" => &metadata.grpc_addr, "error" => %e);
                        }
                    }
                }
                Ok(None) => {
                    error!(self.logger, "metadata not found"; "id" => &peer.node_id);
                }
                Err(e) => {
                    error!(self.logger, "failed to read metadata";
                        "id" => &peer.node_id, "error" => %e);
                }
            }

            nodes.insert(peer.node_id, node);
        }

        nodes
    }

    /// Cut a snapshot now.
    pub async fn snapshot(&self) -> Result<(), KvsError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_loop(Message::TakeSnapshot { callback: tx })?;
        rx.await.map_err(|_| KvsError::Closed)?
    }

    /// Local read; `NotFound` propagates.
    pub async fn get(&self, req: proto::GetRequest) -> Result<proto::GetResponse, KvsError> {
        let value = self.fsm.get(&req.key)?;
        Ok(proto::GetResponse { value })
    }

    /// Replicated write.
    pub async fn set(&self, req: proto::PutRequest) -> Result<(), KvsError> {
        self.propose_command(command::Type::Put, req.encode_to_vec()).await
    }

    /// Replicated delete; idempotent.
    pub async fn delete(&self, req: proto::DeleteRequest) -> Result<(), KvsError> {
        self.propose_command(command::Type::Delete, req.encode_to_vec()).await
    }

    fn send_to_loop(&self, msg: Message) -> Result<(), KvsError> {
        let mailbox = self.mailbox.read().unwrap();
        let tx = mailbox.as_ref().ok_or(KvsError::Closed)?;
        tx.send(msg).map_err(|_| KvsError::Closed)
    }

    /// Wrap a per-type request in a command envelope and wait for commit.
    async fn propose_command(
        &self,
        command_type: command::Type,
        data: Vec<u8>,
    ) -> Result<(), KvsError> {
        let envelope =
            proto::Command { r#type: command_type as i32, data }.encode_to_vec();

        let (tx, rx) = oneshot::channel();
        self.send_to_loop(Message::Propose { data: envelope, callback: tx })?;

        match tokio::time::timeout(APPLY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KvsError::Closed),
            Err(_) => {
                error!(self.logger, "timed out waiting for command to commit");
                Err(KvsError::ApplyTimeout)
            }
        }
    }

    async fn add_voter(&self, id: &str, bind_addr: &str) -> Result<(), KvsError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_loop(Message::AddNode {
            raft_id: raft_id_for(id),
            node_id: id.to_string(),
            bind_addr: bind_addr.to_string(),
            callback: tx,
        })?;
        match tokio::time::timeout(APPLY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KvsError::Closed),
            Err(_) => Err(KvsError::ApplyTimeout),
        }
    }

    async fn remove_server(&self, id: &str) -> Result<(), KvsError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_loop(Message::RemoveNode { raft_id: raft_id_for(id), callback: tx })?;
        match tokio::time::timeout(APPLY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KvsError::Closed),
            Err(_) => Err(KvsError::ApplyTimeout),
        }
    }

    async fn campaign(&self) -> Result<(), KvsError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_loop(Message::Campaign { callback: tx })?;
        rx.await.map_err(|_| KvsError::Closed)?;
        Ok(())
    }
}
