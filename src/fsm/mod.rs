//! Deterministic state machine over the KV engine
//!
//! The FSM is the only writer of the engine. The consensus loop feeds it
//! committed command envelopes in commit order, one at a time; replaying
//! the same committed sequence on an empty engine reproduces the same
//! state. Reads bypass the log and may lag on followers.

pub mod snapshot;

use std::collections::HashMap;
use std::path::PathBuf;

use prost::Message as ProstMessage;
use slog::{debug, Logger};

use crate::errors::KvsError;
use crate::grpc::proto::{self, command};
use crate::kv::store::Pairs;
use crate::kv::KvStore;

/// Side effect of an applied command that the consensus loop needs to
/// mirror into its address book. The engine state itself is already
/// updated when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    NodeJoined { node_id: String, bind_addr: String },
    NodeLeft { node_id: String },
}

pub struct KvsFsm {
    kv: KvStore,
    logger: Logger,
}

impl KvsFsm {
    /// Open the FSM with its engine rooted at `path`.
    pub fn open(path: impl Into<PathBuf>, logger: Logger) -> Result<Self, KvsError> {
        let kv = KvStore::open(path, logger.clone())?;
        Ok(KvsFsm { kv, logger })
    }

    /// Apply one committed command envelope.
    ///
    /// Total on well-formed envelopes; an unknown command type fails with
    /// [`KvsError::UnknownCommand`], which the caller treats as fatal.
    pub fn apply(&self, data: &[u8], log_index: u64) -> Result<ApplyOutcome, KvsError> {
        let envelope = proto::Command::decode(data)?;
        let command_type = command::Type::try_from(envelope.r#type)
            .map_err(|_| KvsError::UnknownCommand { command_type: envelope.r#type })?;

        match command_type {
            command::Type::Put => {
                let req = proto::PutRequest::decode(envelope.data.as_slice())?;
                self.kv.put(&req.key, &req.value)?;
                debug!(self.logger, "applied put"; "index" => log_index);
                Ok(ApplyOutcome::Applied)
            }
            command::Type::Delete => {
                let req = proto::DeleteRequest::decode(envelope.data.as_slice())?;
                self.kv.delete(&req.key)?;
                debug!(self.logger, "applied delete"; "index" => log_index);
                Ok(ApplyOutcome::Applied)
            }
            command::Type::Join => {
                let req = proto::JoinRequest::decode(envelope.data.as_slice())?;
                let metadata = proto::Metadata {
                    bind_addr: req.bind_addr.clone(),
                    grpc_addr: req.grpc_addr,
                    http_addr: req.http_addr,
                };
                self.kv.put_meta(req.id.as_bytes(), &metadata.encode_to_vec())?;
                debug!(self.logger, "applied join"; "index" => log_index, "id" => &req.id);
                Ok(ApplyOutcome::NodeJoined { node_id: req.id, bind_addr: req.bind_addr })
            }
            command::Type::Leave => {
                let req = proto::LeaveRequest::decode(envelope.data.as_slice())?;
                self.kv.delete_meta(req.id.as_bytes())?;
                debug!(self.logger, "applied leave"; "index" => log_index, "id" => &req.id);
                Ok(ApplyOutcome::NodeLeft { node_id: req.id })
            }
        }
    }

    /// Local read; does not consult the log.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvsError> {
        self.kv.get(key)?.ok_or(KvsError::NotFound)
    }

    /// Metadata for one node, reflecting the most recently applied state.
    pub fn get_metadata(&self, node_id: &str) -> Result<Option<proto::Metadata>, KvsError> {
        match self.kv.get_meta(node_id.as_bytes())? {
            Some(bytes) => Ok(Some(proto::Metadata::decode(bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    /// All metadata entries, keyed by node id.
    pub fn list_metadata(&self) -> Result<HashMap<String, proto::Metadata>, KvsError> {
        let mut out = HashMap::new();
        for (key, value) in self.kv.scan_meta()? {
            let id = String::from_utf8(key)
                .map_err(|e| KvsError::Serialization { reason: e.to_string() })?;
            out.insert(id, proto::Metadata::decode(value.as_slice())?);
        }
        Ok(out)
    }

    /// All user pairs in ascending key order.
    pub fn scan(&self) -> Result<Pairs, KvsError> {
        self.kv.scan()
    }

    /// Capture a point-in-time snapshot stream of both namespaces.
    ///
    /// The export is bound to a consistent engine read view taken at call
    /// time, so writes applied afterwards are not reflected.
    pub fn snapshot(&self) -> Result<Vec<u8>, KvsError> {
        let (user, meta) = self.kv.export()?;
        Ok(snapshot::encode(&user, &meta))
    }

    /// Atomically replace the FSM contents with those in the stream.
    pub fn restore(&self, data: &[u8]) -> Result<(), KvsError> {
        let (user, meta) = snapshot::decode(data)?;
        self.kv.replace(&user, &meta)
    }

    /// Flush and close the engine.
    pub fn close(&self) -> Result<(), KvsError> {
        self.kv.close()
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

    fn open_fsm(dir: &std::path::Path) -> KvsFsm {
        KvsFsm::open(dir.join("kvs"), test_logger()).expect("open fsm")
    }

    fn put_command(key: &[u8], value: &[u8]) -> Vec<u8> {
        let req = proto::PutRequest { key: key.to_vec(), value: value.to_vec() };
        proto::Command { r#type: command::Type::Put as i32, data: req.encode_to_vec() }
            .encode_to_vec()
    }

    fn delete_command(key: &[u8]) -> Vec<u8> {
        let req = proto::DeleteRequest { key: key.to_vec() };
        proto::Command { r#type: command::Type::Delete as i32, data: req.encode_to_vec() }
            .encode_to_vec()
    }

    fn join_command(id: &str, bind: &str, grpc: &str, http: &str) -> Vec<u8> {
        let req = proto::JoinRequest {
            id: id.to_string(),
            bind_addr: bind.to_string(),
            grpc_addr: grpc.to_string(),
            http_addr: http.to_string(),
        };
        proto::Command { r#type: command::Type::Join as i32, data: req.encode_to_vec() }
            .encode_to_vec()
    }

    fn leave_command(id: &str) -> Vec<u8> {
        let req = proto::LeaveRequest { id: id.to_string() };
        proto::Command { r#type: command::Type::Leave as i32, data: req.encode_to_vec() }
            .encode_to_vec()
    }

    #[test]
    fn apply_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let outcome = fsm.apply(&put_command(b"k", b"v"), 1).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(fsm.get(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn apply_delete_then_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        fsm.apply(&put_command(b"k", b"v"), 1).unwrap();
        fsm.apply(&delete_command(b"k"), 2).unwrap();
        assert!(matches!(fsm.get(b"k"), Err(KvsError::NotFound)));
    }

    #[test]
    fn apply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        fsm.apply(&put_command(b"k", b"v"), 1).unwrap();
        fsm.apply(&put_command(b"k", b"v"), 2).unwrap();
        assert_eq!(fsm.get(b"k").unwrap(), b"v".to_vec());
        assert_eq!(fsm.scan().unwrap().len(), 1);
    }

    #[test]
    fn join_upserts_metadata_and_leave_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let outcome = fsm
            .apply(&join_command("n2", "127.0.0.1:7002", "127.0.0.1:9002", "127.0.0.1:8002"), 1)
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::NodeJoined {
                node_id: "n2".to_string(),
                bind_addr: "127.0.0.1:7002".to_string()
            }
        );

        let meta = fsm.get_metadata("n2").unwrap().unwrap();
        assert_eq!(meta.bind_addr, "127.0.0.1:7002");
        assert_eq!(meta.grpc_addr, "127.0.0.1:9002");
        assert_eq!(meta.http_addr, "127.0.0.1:8002");

        // Rejoin refreshes the advertised addresses.
        fsm.apply(&join_command("n2", "127.0.0.1:7002", "127.0.0.1:9102", "127.0.0.1:8102"), 2)
            .unwrap();
        let meta = fsm.get_metadata("n2").unwrap().unwrap();
        assert_eq!(meta.grpc_addr, "127.0.0.1:9102");

        let outcome = fsm.apply(&leave_command("n2"), 3).unwrap();
        assert_eq!(outcome, ApplyOutcome::NodeLeft { node_id: "n2".to_string() });
        assert!(fsm.get_metadata("n2").unwrap().is_none());
        assert!(fsm.list_metadata().unwrap().is_empty());
    }

    #[test]
    fn unknown_command_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        let envelope = proto::Command { r#type: 42, data: Vec::new() }.encode_to_vec();
        match fsm.apply(&envelope, 1) {
            Err(KvsError::UnknownCommand { command_type }) => assert_eq!(command_type, 42),
            other => panic!("expected UnknownCommand, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn snapshot_restore_roundtrip_is_bit_equal() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());

        fsm.apply(&put_command(b"x", b"x1"), 1).unwrap();
        fsm.apply(&put_command(b"y", b"y1"), 2).unwrap();
        fsm.apply(&join_command("n1", "127.0.0.1:7001", "127.0.0.1:9001", ""), 3).unwrap();

        let stream = fsm.snapshot().unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let restored = open_fsm(dir2.path());
        restored.restore(&stream).unwrap();

        assert_eq!(restored.scan().unwrap(), fsm.scan().unwrap());
        assert_eq!(restored.snapshot().unwrap(), stream);
        assert_eq!(
            restored.get_metadata("n1").unwrap().unwrap().grpc_addr,
            "127.0.0.1:9001"
        );
    }

    #[test]
    fn restore_replaces_prior_contents() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());
        fsm.apply(&put_command(b"a", b"1"), 1).unwrap();
        let stream = fsm.snapshot().unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let other = open_fsm(dir2.path());
        other.apply(&put_command(b"stale", b"gone"), 1).unwrap();
        other.restore(&stream).unwrap();

        assert!(matches!(other.get(b"stale"), Err(KvsError::NotFound)));
        assert_eq!(other.get(b"a").unwrap(), b"1".to_vec());
    }

    #[test]
    fn restore_rejects_corrupt_streams() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = open_fsm(dir.path());
        fsm.apply(&put_command(b"keep", b"me"), 1).unwrap();

        assert!(fsm.restore(b"not a snapshot").is_err());
        // Prior contents are intact after a rejected stream.
        assert_eq!(fsm.get(b"keep").unwrap(), b"me".to_vec());
    }
}
