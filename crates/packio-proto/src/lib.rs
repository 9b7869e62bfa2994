//! PackIO Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for the replication and
//! audit service that storage nodes expose to their peers.

/// Pack replication/audit service
pub mod pack {
    tonic::include_proto!("packio.pack");
}
