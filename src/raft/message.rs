//! Mailbox messages for the consensus event loop

use tokio::sync::oneshot;

use crate::errors::KvsError;

/// Completion callback for operations that wait until the corresponding
/// entry is committed and applied.
pub type ProposeCallback = oneshot::Sender<Result<(), KvsError>>;

pub enum Message {
    /// Propose a serialized command envelope. The callback fires when the
    /// entry has been applied to the state machine, or earlier on a
    /// proposal failure (e.g. not the leader).
    Propose { data: Vec<u8>, callback: ProposeCallback },

    /// A consensus message received from a peer.
    Raft(raft::prelude::Message),

    /// Add a voter to the configuration. The callback fires when the
    /// configuration change commits.
    AddNode { raft_id: u64, node_id: String, bind_addr: String, callback: ProposeCallback },

    /// Remove a server from the configuration.
    RemoveNode { raft_id: u64, callback: ProposeCallback },

    /// Start an election (used when bootstrapping a single-node cluster).
    Campaign { callback: oneshot::Sender<bool> },

    /// Cut a snapshot now, regardless of the threshold.
    TakeSnapshot { callback: oneshot::Sender<Result<(), KvsError>> },

    /// Terminate the event loop. Sent by the facade on stop; the loop
    /// also exits when every mailbox sender is gone.
    Stop,
}
