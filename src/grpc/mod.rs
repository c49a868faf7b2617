pub mod client;
pub mod server;

// Generated protobuf/tonic code
pub mod proto {
    tonic::include_proto!("cetekv");
}

pub use client::{PeerClient, PeerClientPool};
pub use server::{start_grpc_server, GrpcServerHandle};
