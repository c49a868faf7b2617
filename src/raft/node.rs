//! Consensus event loop
//!
//! Owns the raft state machine driver. A single task runs the loop, so
//! committed entries reach the FSM serially in commit order; nothing else
//! writes the engine. The facade talks to the loop through the mailbox and
//! observes role/leader/membership through `SharedState`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use slog::{crit, debug, error, info, warn, Logger};
use tokio::sync::mpsc;

use crate::errors::KvsError;
use crate::fsm::{ApplyOutcome, KvsFsm};
use crate::raft::message::{Message, ProposeCallback};
use crate::raft::snapshot_store::SnapshotStore;
use crate::raft::storage::RaftStorage;
use crate::raft::transport::GrpcTransport;
use crate::raft::{raft_id_for, NodeState, Peer, SharedState};

/// Entries kept below a snapshot when compacting, so followers that lag a
/// little can still be caught up from the log instead of a full snapshot.
const TRAILING_ENTRIES: u64 = 64;

pub struct RaftNode {
    raw: RawNode<RaftStorage>,
    fsm: Arc<KvsFsm>,
    snapshots: Arc<SnapshotStore>,
    transport: Arc<GrpcTransport>,
    shared: Arc<SharedState>,
    mailbox: mpsc::UnboundedReceiver<Message>,

    // Proposal tracking (entry context id -> completion callback)
    sync_commands: HashMap<u64, ProposeCallback>,
    next_command_id: u64,

    // Configuration changes waiting for commit (raft id -> callback)
    pending_conf: HashMap<u64, ProposeCallback>,

    current_role: StateRole,
    committed_index: u64,
    last_snapshot_index: u64,
    snapshot_threshold: u64,
    raft_id: u64,
    logger: Logger,
}

impl RaftNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raft_id: u64,
        storage: RaftStorage,
        fsm: Arc<KvsFsm>,
        snapshots: Arc<SnapshotStore>,
        transport: Arc<GrpcTransport>,
        shared: Arc<SharedState>,
        mailbox: mpsc::UnboundedReceiver<Message>,
        applied: u64,
        snapshot_threshold: u64,
        logger: Logger,
    ) -> Result<Self, KvsError> {
        let config = Config {
            id: raft_id,
            election_tick: 10,
            heartbeat_tick: 3,
            applied,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            ..Default::default()
        };

        let raw = RawNode::new(&config, storage, &logger)?;

        Ok(RaftNode {
            raw,
            fsm,
            snapshots,
            transport,
            shared,
            mailbox,
            sync_commands: HashMap::new(),
            next_command_id: 1,
            pending_conf: HashMap::new(),
            current_role: StateRole::Follower,
            committed_index: applied,
            last_snapshot_index: applied,
            snapshot_threshold,
            raft_id,
            logger,
        })
    }

    /// Main event loop. Returns when the mailbox closes (server stop) or
    /// on a fatal apply failure.
    pub async fn run(&mut self) -> Result<(), KvsError> {
        let mut tick_timer = tokio::time::interval(Duration::from_millis(100));
        tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(Message::Stop) | None => break,
                        Some(msg) => self.handle_message(msg),
                    }
                },
                _ = tick_timer.tick() => {
                    self.raw.tick();
                }
            }

            self.on_ready()?;

            if let Err(e) = self.maybe_snapshot() {
                error!(self.logger, "failed to cut snapshot"; "error" => %e);
            }
        }

        Ok(())
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Propose { data, callback } => {
                let id = self.next_command_id;
                self.next_command_id += 1;
                match self.raw.propose(id.to_be_bytes().to_vec(), data) {
                    Ok(()) => {
                        self.sync_commands.insert(id, callback);
                    }
                    Err(e) => {
                        debug!(self.logger, "proposal rejected"; "error" => %e);
                        let _ = callback.send(Err(e.into()));
                    }
                }
            }
            Message::Raft(raft_msg) => {
                if let Err(e) = self.raw.step(raft_msg) {
                    warn!(self.logger, "failed to step raft message"; "error" => %e);
                }
            }
            Message::AddNode { raft_id, node_id, bind_addr, callback } => {
                // Register the peer before proposing so it can receive
                // messages the moment the change is in flight.
                self.transport.add_peer(raft_id, bind_addr.clone());
                let peer = Peer { node_id: node_id.clone(), bind_addr };
                self.shared.upsert_peer(raft_id, peer.clone());

                let mut change = ConfChange::default();
                change.change_type = ConfChangeType::AddNode;
                change.node_id = raft_id;
                match serde_json::to_vec(&peer) {
                    Ok(context) => change.context = context.into(),
                    Err(e) => {
                        let _ = callback.send(Err(e.into()));
                        return;
                    }
                }

                match self.raw.propose_conf_change(vec![], change) {
                    Ok(()) => {
                        info!(self.logger, "proposed adding node";
                            "raft_id" => raft_id, "id" => &node_id);
                        self.pending_conf.insert(raft_id, callback);
                    }
                    Err(e) => {
                        error!(self.logger, "failed to propose add node";
                            "raft_id" => raft_id, "error" => %e);
                        let _ = callback.send(Err(e.into()));
                    }
                }
            }
            Message::RemoveNode { raft_id, callback } => {
                let mut change = ConfChange::default();
                change.change_type = ConfChangeType::RemoveNode;
                change.node_id = raft_id;

                match self.raw.propose_conf_change(vec![], change) {
                    Ok(()) => {
                        info!(self.logger, "proposed removing node"; "raft_id" => raft_id);
                        self.pending_conf.insert(raft_id, callback);
                    }
                    Err(e) => {
                        error!(self.logger, "failed to propose remove node";
                            "raft_id" => raft_id, "error" => %e);
                        let _ = callback.send(Err(e.into()));
                    }
                }
            }
            Message::Campaign { callback } => {
                let ok = match self.raw.campaign() {
                    Ok(()) => true,
                    Err(e) => {
                        error!(self.logger, "failed to start campaign"; "error" => %e);
                        false
                    }
                };
                let _ = callback.send(ok);
            }
            Message::TakeSnapshot { callback } => {
                let _ = callback.send(self.build_snapshot());
            }
            // Intercepted by the run loop.
            Message::Stop => {}
        }
    }

    fn on_ready(&mut self) -> Result<(), KvsError> {
        if !self.raw.has_ready() {
            return Ok(());
        }

        let store = self.raw.raft.raft_log.store.clone();
        let mut ready = self.raw.ready();

        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        // Snapshots first: a follower that is sent one replaces its state
        // before any newer committed entries are applied.
        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(&snapshot)?;
            store.apply_snapshot_meta(snapshot.get_metadata())?;
        }

        let committed_entries = ready.take_committed_entries();
        self.handle_committed_entries(&committed_entries)?;

        // Entries must be persisted before advance().
        if !ready.entries().is_empty() {
            store.append(ready.entries())?;
        }

        if let Some(hs) = ready.hs() {
            store.set_hard_state(hs)?;
        }

        if let Some(ss) = ready.ss() {
            self.on_role_change(ss.raft_state);
        }

        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        let mut light_rd = self.raw.advance(ready);

        if let Some(commit) = light_rd.commit_index() {
            store.update_commit(commit)?;
        }
        if !light_rd.messages().is_empty() {
            self.send_messages(light_rd.take_messages());
        }
        let light_committed = light_rd.take_committed_entries();
        self.handle_committed_entries(&light_committed)?;

        self.raw.advance_apply();

        self.shared.set_leader(self.raw.raft.leader_id);
        Ok(())
    }

    fn send_messages(&self, messages: Vec<raft::prelude::Message>) {
        for msg in messages {
            self.transport.send(msg);
        }
    }

    fn handle_committed_entries(&mut self, entries: &[Entry]) -> Result<(), KvsError> {
        for entry in entries {
            self.committed_index = entry.index;

            if entry.data.is_empty() {
                // Empty entry, usually a leadership change.
                continue;
            }

            match entry.entry_type {
                EntryType::EntryNormal => {
                    let callback = self.take_callback(entry);
                    match self.fsm.apply(&entry.data, entry.index) {
                        Ok(outcome) => {
                            if let Some(cb) = callback {
                                let _ = cb.send(Ok(()));
                            }
                            self.apply_outcome(outcome)?;
                        }
                        Err(e) => {
                            // Apply is a write path: failures are fatal for
                            // the node, the caller still learns the cause.
                            crit!(self.logger, "failed to apply committed entry";
                                "index" => entry.index, "error" => %e);
                            if let Some(cb) = callback {
                                let _ = cb.send(Err(KvsError::Storage {
                                    reason: e.to_string(),
                                }));
                            }
                            return Err(e);
                        }
                    }
                }
                EntryType::EntryConfChange => {
                    let change = ConfChange::parse_from_bytes(&entry.data)?;
                    self.apply_conf_change(&change)?;
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(self.logger, "joint configuration changes are not used";
                        "index" => entry.index);
                }
            }
        }
        Ok(())
    }

    fn take_callback(&mut self, entry: &Entry) -> Option<ProposeCallback> {
        if entry.context.len() != 8 {
            return None;
        }
        let id = u64::from_be_bytes(entry.context[..].try_into().ok()?);
        self.sync_commands.remove(&id)
    }

    /// Mirror applied JOIN/LEAVE metadata into the address book so nodes
    /// that learned the cluster from the log alone can resolve peers.
    fn apply_outcome(&mut self, outcome: ApplyOutcome) -> Result<(), KvsError> {
        match outcome {
            ApplyOutcome::Applied => Ok(()),
            ApplyOutcome::NodeJoined { node_id, bind_addr } => {
                let raft_id = raft_id_for(&node_id);
                if raft_id != self.raft_id && !bind_addr.is_empty() {
                    self.transport.add_peer(raft_id, bind_addr.clone());
                }
                self.shared.upsert_peer(raft_id, Peer { node_id, bind_addr });
                self.persist_peers()
            }
            ApplyOutcome::NodeLeft { node_id } => {
                let raft_id = raft_id_for(&node_id);
                if raft_id != self.raft_id {
                    self.transport.remove_peer(raft_id);
                }
                self.shared.remove_peer(raft_id);
                self.persist_peers()
            }
        }
    }

    fn apply_conf_change(&mut self, change: &ConfChange) -> Result<(), KvsError> {
        match change.change_type {
            ConfChangeType::AddNode => {
                // On the leader this repeats what AddNode already did; on
                // followers it is how the new peer becomes routable.
                if !change.context.is_empty() {
                    match serde_json::from_slice::<Peer>(&change.context) {
                        Ok(peer) => {
                            if change.node_id != self.raft_id {
                                self.transport.add_peer(change.node_id, peer.bind_addr.clone());
                            }
                            self.shared.upsert_peer(change.node_id, peer);
                        }
                        Err(e) => {
                            warn!(self.logger, "bad conf change context"; "error" => %e);
                        }
                    }
                }
            }
            ConfChangeType::RemoveNode => {
                info!(self.logger, "removing node from configuration";
                    "raft_id" => change.node_id);
                if change.node_id != self.raft_id {
                    self.transport.remove_peer(change.node_id);
                }
                self.shared.remove_peer(change.node_id);
            }
            ConfChangeType::AddLearnerNode => {
                warn!(self.logger, "learners are not used"; "raft_id" => change.node_id);
            }
        }

        let conf_state = self.raw.apply_conf_change(change)?;
        let store = self.raw.raft.raft_log.store.clone();
        store.set_conf_state(&conf_state)?;
        self.shared.set_voters(conf_state.voters.clone());
        self.persist_peers()?;

        if let Some(callback) = self.pending_conf.remove(&change.node_id) {
            let _ = callback.send(Ok(()));
        }
        Ok(())
    }

    fn persist_peers(&mut self) -> Result<(), KvsError> {
        let store = self.raw.raft.raft_log.store.clone();
        store.save_peers(&self.shared.peers())
    }

    fn on_role_change(&mut self, new_role: StateRole) {
        if new_role == self.current_role {
            return;
        }
        let state = match new_role {
            StateRole::Leader => NodeState::Leader,
            StateRole::Follower => NodeState::Follower,
            StateRole::Candidate | StateRole::PreCandidate => NodeState::Candidate,
        };
        info!(self.logger, "role changed"; "role" => %state);
        self.shared.set_role(state);
        self.current_role = new_role;

        // Proposals this node was tracking can no longer be confirmed once
        // leadership is lost; fail them instead of leaving callers to hit
        // the apply timeout.
        if new_role != StateRole::Leader {
            for (_, callback) in self.sync_commands.drain() {
                let _ = callback.send(Err(KvsError::NotLeader));
            }
            for (_, callback) in self.pending_conf.drain() {
                let _ = callback.send(Err(KvsError::NotLeader));
            }
        }
    }

    /// Restore FSM state from a snapshot sent by the leader and adopt its
    /// view of the cluster.
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), KvsError> {
        let metadata = snapshot.get_metadata();
        let data = snapshot.get_data();
        if data.is_empty() {
            return Ok(());
        }

        self.fsm.restore(data)?;
        self.committed_index = metadata.index;
        self.last_snapshot_index = metadata.index;
        self.snapshots.save(metadata.index, metadata.term, data)?;

        // The restored metadata namespace is the authoritative address
        // book for everything the snapshot covers.
        for (node_id, meta) in self.fsm.list_metadata()? {
            let raft_id = raft_id_for(&node_id);
            if !meta.bind_addr.is_empty() {
                if raft_id != self.raft_id {
                    self.transport.add_peer(raft_id, meta.bind_addr.clone());
                }
                self.shared.upsert_peer(raft_id, Peer { node_id, bind_addr: meta.bind_addr });
            }
        }
        self.shared.set_voters(metadata.get_conf_state().voters.clone());
        self.persist_peers()?;

        info!(self.logger, "restored state from snapshot";
            "snapshot_index" => metadata.index,
            "data_size" => data.len()
        );
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<(), KvsError> {
        if self.snapshot_threshold == 0 || self.committed_index <= self.last_snapshot_index {
            return Ok(());
        }
        let store = self.raw.raft.raft_log.store.clone();
        let first_index = store
            .first_index()
            .map_err(|e| KvsError::Raft { reason: e.to_string() })?;
        let log_size = (self.committed_index + 1).saturating_sub(first_index);
        if log_size < self.snapshot_threshold {
            return Ok(());
        }
        self.build_snapshot()
    }

    /// Cut a snapshot at the applied index and compact the log behind it.
    fn build_snapshot(&mut self) -> Result<(), KvsError> {
        let index = self.committed_index;
        if index == 0 {
            return Ok(());
        }

        let store = self.raw.raft.raft_log.store.clone();
        let term = store
            .term(index)
            .map_err(|e| KvsError::Raft { reason: e.to_string() })?;

        let data = self.fsm.snapshot()?;
        self.snapshots.save(index, term, &data)?;
        self.last_snapshot_index = index;

        let first_index = store
            .first_index()
            .map_err(|e| KvsError::Raft { reason: e.to_string() })?;
        let trailing = TRAILING_ENTRIES.min(self.snapshot_threshold / 2).max(1);
        let compact_to = index.saturating_sub(trailing);
        if compact_to >= first_index {
            store.compact(compact_to)?;
        }

        info!(self.logger, "created snapshot";
            "snapshot_index" => index,
            "data_size" => data.len()
        );
        Ok(())
    }
}
