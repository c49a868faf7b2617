//! Consensus integration: storage, transport, and the node event loop

pub mod message;
pub mod node;
pub mod snapshot_store;
pub mod storage;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

pub use message::Message;
pub use node::RaftNode;
pub use snapshot_store::SnapshotStore;
pub use storage::RaftStorage;
pub use transport::GrpcTransport;

/// Observable role of a node, mirroring the consensus engine. `Shutdown`
/// is terminal and reached only after the server is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Follower => "Follower",
            NodeState::Candidate => "Candidate",
            NodeState::Leader => "Leader",
            NodeState::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Address-book entry for one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: String,
    pub bind_addr: String,
}

/// Raft addresses peers by `u64`; the public surface uses string node ids.
/// The raft id is a stable FNV-1a hash of the node id, so a joining node
/// and the leader agree on it without negotiating. Never zero (raft
/// reserves 0 for "no node").
pub fn raft_id_for(node_id: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in node_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == 0 {
        1
    } else {
        hash
    }
}

/// State shared between the event loop, the transport server, and the
/// facade: current role, last observed leader, the voter set of the
/// cluster configuration, and the address book resolving raft ids.
pub struct SharedState {
    role: RwLock<NodeState>,
    leader: AtomicU64,
    voters: RwLock<Vec<u64>>,
    peers: RwLock<HashMap<u64, Peer>>,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            role: RwLock::new(NodeState::Follower),
            leader: AtomicU64::new(0),
            voters: RwLock::new(Vec::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> NodeState {
        *self.role.read().unwrap()
    }

    pub fn set_role(&self, role: NodeState) {
        *self.role.write().unwrap() = role;
    }

    /// Raft id of the last observed leader; 0 when unknown.
    pub fn leader(&self) -> u64 {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, raft_id: u64) {
        self.leader.store(raft_id, Ordering::SeqCst);
    }

    pub fn voters(&self) -> Vec<u64> {
        let mut voters = self.voters.read().unwrap().clone();
        voters.sort_unstable();
        voters
    }

    pub fn set_voters(&self, voters: Vec<u64>) {
        *self.voters.write().unwrap() = voters;
    }

    pub fn is_voter(&self, raft_id: u64) -> bool {
        self.voters.read().unwrap().contains(&raft_id)
    }

    pub fn peer(&self, raft_id: u64) -> Option<Peer> {
        self.peers.read().unwrap().get(&raft_id).cloned()
    }

    pub fn upsert_peer(&self, raft_id: u64, peer: Peer) {
        self.peers.write().unwrap().insert(raft_id, peer);
    }

    pub fn remove_peer(&self, raft_id: u64) {
        self.peers.write().unwrap().remove(&raft_id);
    }

    pub fn peers(&self) -> Vec<(u64, Peer)> {
        self.peers.read().unwrap().iter().map(|(id, p)| (*id, p.clone())).collect()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_ids_are_stable_and_distinct() {
        assert_eq!(raft_id_for("n1"), raft_id_for("n1"));
        assert_ne!(raft_id_for("n1"), raft_id_for("n2"));
        assert_ne!(raft_id_for("n1"), 0);
        assert_ne!(raft_id_for(""), 0);
    }

    #[test]
    fn shared_state_tracks_membership() {
        let shared = SharedState::new();
        let id = raft_id_for("n1");

        assert_eq!(shared.role(), NodeState::Follower);
        assert_eq!(shared.leader(), 0);
        assert!(!shared.is_voter(id));

        shared.set_voters(vec![id]);
        shared.upsert_peer(id, Peer { node_id: "n1".into(), bind_addr: "127.0.0.1:7000".into() });
        shared.set_leader(id);
        shared.set_role(NodeState::Leader);

        assert!(shared.is_voter(id));
        assert_eq!(shared.peer(id).unwrap().bind_addr, "127.0.0.1:7000");
        assert_eq!(shared.leader(), id);
        assert_eq!(shared.role(), NodeState::Leader);

        shared.remove_peer(id);
        assert!(shared.peer(id).is_none());
    }
}
