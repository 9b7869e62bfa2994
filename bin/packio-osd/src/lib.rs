//! PackIO OSD - replication and audit RPC surface of a storage node

pub mod service;

pub use service::{GrpcMethodMetrics, GrpcMetrics, RpcServer, error_to_status};
