//! OSD gRPC service implementation
//!
//! [`RpcServer`] answers replication and audit requests for the devices of
//! every registered [`DeviceManager`]. Storage work runs on the blocking
//! pool. Each call gets a child of the server's cancellation token; the
//! child is cancelled when the call's future is dropped or when the server
//! shuts down, and the storage walk stops at its next check.

use packio_common::{Error, Policy};
use packio_proto::pack::{
    Partition, PartitionAuditReply, PartitionHashesReply, PartitionHashesRequest,
    PartitionSuffixesReply, pack_rpc_service_server::PackRpcService,
};
use packio_storage::{DeviceManager, PackDevice};
use parking_lot::RwLock;
use prost::Message;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// gRPC method metrics
#[derive(Debug, Default)]
pub struct GrpcMethodMetrics {
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub latency_sum_us: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl GrpcMethodMetrics {
    pub fn record(&self, success: bool, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_out, Ordering::Relaxed);
    }
}

/// gRPC metrics collector for the OSD
#[derive(Debug, Default)]
pub struct GrpcMetrics {
    pub list_partition_suffixes: GrpcMethodMetrics,
    pub audit_partition: GrpcMethodMetrics,
    pub get_partition_hashes: GrpcMethodMetrics,
}

impl GrpcMetrics {
    fn methods(&self) -> [(&'static str, &GrpcMethodMetrics); 3] {
        [
            ("ListPartitionSuffixes", &self.list_partition_suffixes),
            ("AuditPartition", &self.audit_partition),
            ("GetPartitionHashes", &self.get_partition_hashes),
        ]
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self, node: &str) -> String {
        let mut output = String::with_capacity(2 * 1024);
        let methods = self.methods();

        let _ = writeln!(
            output,
            "# HELP packio_osd_grpc_requests_total Total gRPC requests by method and status"
        );
        let _ = writeln!(output, "# TYPE packio_osd_grpc_requests_total counter");
        for (method, metrics) in &methods {
            let success = metrics.requests_success.load(Ordering::Relaxed);
            let error = metrics.requests_error.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "packio_osd_grpc_requests_total{{node=\"{node}\",method=\"{method}\",status=\"success\"}} {success}"
            );
            let _ = writeln!(
                output,
                "packio_osd_grpc_requests_total{{node=\"{node}\",method=\"{method}\",status=\"error\"}} {error}"
            );
        }

        let _ = writeln!(
            output,
            "# HELP packio_osd_grpc_latency_seconds_sum Sum of gRPC request latencies"
        );
        let _ = writeln!(output, "# TYPE packio_osd_grpc_latency_seconds_sum counter");
        for (method, metrics) in &methods {
            let sum_us = metrics.latency_sum_us.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "packio_osd_grpc_latency_seconds_sum{{node=\"{node}\",method=\"{method}\"}} {}",
                sum_us as f64 / 1_000_000.0
            );
        }

        let _ = writeln!(
            output,
            "# HELP packio_osd_grpc_bytes_sent_total Total bytes sent via gRPC"
        );
        let _ = writeln!(output, "# TYPE packio_osd_grpc_bytes_sent_total counter");
        for (method, metrics) in &methods {
            let bytes = metrics.bytes_sent.load(Ordering::Relaxed);
            if bytes > 0 {
                let _ = writeln!(
                    output,
                    "packio_osd_grpc_bytes_sent_total{{node=\"{node}\",method=\"{method}\"}} {bytes}"
                );
            }
        }

        output
    }
}

/// Map an engine error to a gRPC status
pub fn error_to_status(err: Error) -> Status {
    let message = err.to_string();
    match &err {
        e if e.is_not_found() => Status::not_found(message),
        Error::LockTimeout { .. } => Status::unavailable(message),
        Error::Corruption(_) => Status::data_loss(message),
        Error::Cancelled => Status::cancelled(message),
        Error::InvalidArgument(_) => Status::invalid_argument(message),
        Error::InvalidState(_) => Status::failed_precondition(message),
        _ => Status::internal(message),
    }
}

/// Replication and audit RPC server
pub struct RpcServer {
    managers: RwLock<Vec<Arc<DeviceManager>>>,
    shutdown: CancellationToken,
    grpc_metrics: Arc<GrpcMetrics>,
    start_time: Instant,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            managers: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            grpc_metrics: Arc::new(GrpcMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Serve the devices of a manager
    pub fn register(&self, manager: Arc<DeviceManager>) {
        info!(
            "registered device manager for {}",
            manager.devices_root().display()
        );
        self.managers.write().push(manager);
    }

    /// Stop accepting calls and cancel the ones in flight
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("RPC server shutting down");
        }
        self.shutdown.cancel();
    }

    /// Token cancelled by [`RpcServer::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get gRPC metrics
    pub fn grpc_metrics(&self) -> &Arc<GrpcMetrics> {
        &self.grpc_metrics
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Every device across registered managers
    pub fn devices(&self) -> Vec<Arc<PackDevice>> {
        self.managers
            .read()
            .iter()
            .flat_map(|manager| manager.devices().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn ensure_running(&self) -> Result<(), Status> {
        if self.shutdown.is_cancelled() {
            Err(Status::unavailable("server is shutting down"))
        } else {
            Ok(())
        }
    }

    /// Find the engine named by a request
    fn resolve(&self, request: &Partition) -> Result<Arc<PackDevice>, Error> {
        let policy = u32::try_from(request.policy)
            .map(Policy::new)
            .map_err(|_| Error::invalid_argument(format!("invalid policy: {}", request.policy)))?;
        if request.device.is_empty() {
            return Err(Error::invalid_argument("missing device"));
        }

        let mut served = false;
        for manager in self.managers.read().iter() {
            if !manager.serves(policy) {
                continue;
            }
            served = true;
            match manager.resolve(policy, &request.device) {
                Ok(device) => return Ok(device),
                Err(Error::DeviceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if served {
            Err(Error::DeviceNotFound(request.device.clone()))
        } else {
            Err(Error::PolicyNotFound(policy.index()))
        }
    }

    /// Run storage work on the blocking pool under a per-call token
    async fn run_blocking<T, F>(&self, work: F) -> Result<T, Status>
    where
        F: FnOnce(CancellationToken) -> packio_common::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running()?;

        let call = self.shutdown.child_token();
        // Cancels the storage walk if this future is dropped mid-call
        let _guard = call.clone().drop_guard();
        let worker_token = call.clone();
        let handle = tokio::task::spawn_blocking(move || work(worker_token));

        tokio::select! {
            joined = handle => match joined {
                Ok(result) => result.map_err(error_to_status),
                Err(e) => Err(Status::internal(format!("storage worker failed: {e}"))),
            },
            () = call.cancelled() => Err(Status::cancelled("call cancelled")),
        }
    }

    async fn list_suffixes(&self, request: Partition) -> Result<PartitionSuffixesReply, Status> {
        self.ensure_running()?;
        let device = self.resolve(&request).map_err(error_to_status)?;
        let partition = request.partition;
        debug!(
            "ListPartitionSuffixes: device={}, policy={}, partition={partition}",
            request.device, request.policy
        );

        let suffixes = self
            .run_blocking(move |cancel| device.list_suffixes(partition, &cancel))
            .await?;
        Ok(PartitionSuffixesReply { suffixes })
    }

    async fn audit(&self, request: Partition) -> Result<PartitionAuditReply, Status> {
        self.ensure_running()?;
        let device = self.resolve(&request).map_err(error_to_status)?;
        let partition = request.partition;
        debug!(
            "AuditPartition: device={}, policy={}, partition={partition}",
            request.device, request.policy
        );

        let stats = self
            .run_blocking(move |cancel| device.audit_partition(partition, &cancel))
            .await?;
        if stats.corrupted_files > 0 {
            warn!(
                "partition {partition} on {} has {} corrupted files",
                request.device, stats.corrupted_files
            );
        }

        Ok(PartitionAuditReply {
            processed_files: i64::try_from(stats.processed_files).unwrap_or(i64::MAX),
            processed_bytes: i64::try_from(stats.processed_bytes).unwrap_or(i64::MAX),
            corrupted_files: i64::try_from(stats.corrupted_files).unwrap_or(i64::MAX),
        })
    }

    async fn hashes(&self, request: PartitionHashesRequest) -> Result<PartitionHashesReply, Status> {
        self.ensure_running()?;
        let target = request
            .partition
            .ok_or_else(|| Status::invalid_argument("missing partition"))?;
        let device = self.resolve(&target).map_err(error_to_status)?;
        let partition = target.partition;
        let recalculate = request.recalculate;

        let hashes = self
            .run_blocking(move |cancel| {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                device.get_hashes(partition, &recalculate)
            })
            .await?;
        Ok(PartitionHashesReply {
            hashes: hashes.into_iter().collect(),
        })
    }

    fn finish<T: Message>(
        metrics: &GrpcMethodMetrics,
        start: Instant,
        bytes_in: u64,
        result: Result<T, Status>,
    ) -> Result<Response<T>, Status> {
        let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        match result {
            Ok(reply) => {
                metrics.record(true, latency_us, bytes_in, reply.encoded_len() as u64);
                Ok(Response::new(reply))
            }
            Err(status) => {
                metrics.record(false, latency_us, bytes_in, 0);
                Err(status)
            }
        }
    }
}

#[tonic::async_trait]
impl PackRpcService for RpcServer {
    async fn list_partition_suffixes(
        &self,
        request: Request<Partition>,
    ) -> Result<Response<PartitionSuffixesReply>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let bytes_in = req.encoded_len() as u64;
        let result = self.list_suffixes(req).await;
        Self::finish(
            &self.grpc_metrics.list_partition_suffixes,
            start,
            bytes_in,
            result,
        )
    }

    async fn audit_partition(
        &self,
        request: Request<Partition>,
    ) -> Result<Response<PartitionAuditReply>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let bytes_in = req.encoded_len() as u64;
        let result = self.audit(req).await;
        Self::finish(&self.grpc_metrics.audit_partition, start, bytes_in, result)
    }

    async fn get_partition_hashes(
        &self,
        request: Request<PartitionHashesRequest>,
    ) -> Result<Response<PartitionHashesReply>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let bytes_in = req.encoded_len() as u64;
        let result = self.hashes(req).await;
        Self::finish(
            &self.grpc_metrics.get_partition_hashes,
            start,
            bytes_in,
            result,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packio_common::config::StorageConfig;
    use packio_common::{EngineConfig, ObjectHash, Timestamp};
    use packio_storage::{Metadata, MemoryXattr};
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tonic::Code;

    const THRESHOLD: u64 = 1024;

    fn manager(root: &Path) -> Arc<DeviceManager> {
        std::fs::create_dir_all(root.join("sda")).unwrap();
        let storage = StorageConfig {
            devices_root: root.to_path_buf(),
            devices: vec!["sda".to_string()],
            policies: vec![0, 1],
            mount_check: true,
        };
        let engine = EngineConfig {
            needle_threshold: THRESHOLD,
            fsync: false,
            ..EngineConfig::default()
        };
        Arc::new(DeviceManager::new(&storage, &engine, Arc::new(MemoryXattr::new())).unwrap())
    }

    fn server() -> (TempDir, Arc<DeviceManager>, RpcServer) {
        let root = tempdir().unwrap();
        let manager = manager(root.path());
        let server = RpcServer::new();
        server.register(Arc::clone(&manager));
        (root, manager, server)
    }

    fn put(manager: &DeviceManager, partition: u64, name: &str, size: usize) -> ObjectHash {
        put_in(manager, 1, partition, name, size)
    }

    fn put_in(
        manager: &DeviceManager,
        policy: u32,
        partition: u64,
        name: &str,
        size: usize,
    ) -> ObjectHash {
        let device = manager.resolve(Policy::new(policy), "sda").unwrap();
        let hash = ObjectHash::for_name(name);
        let mut object = device
            .new_object(
                partition,
                hash.clone(),
                Timestamp::now(),
                size as u64,
                Metadata::new(),
            )
            .unwrap();
        object.write(&vec![7u8; size]).unwrap();
        device.commit_write(&mut object).unwrap();
        hash
    }

    fn target(device: &str, policy: i32, partition: u64) -> Partition {
        Partition {
            device: device.to_string(),
            policy,
            partition,
        }
    }

    #[tokio::test]
    async fn test_list_suffixes_after_commit() {
        let (_root, manager, server) = server();
        let hash = put(&manager, 7, "/a/c/o", 10);

        let reply = server
            .list_partition_suffixes(Request::new(target("sda", 1, 7)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.suffixes, vec![hash.suffix().to_string()]);

        let metrics = &server.grpc_metrics().list_partition_suffixes;
        assert_eq!(metrics.requests_success.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_list_suffixes_empty_partition() {
        let (_root, _manager, server) = server();
        let reply = server
            .list_partition_suffixes(Request::new(target("sda", 0, 99)))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.suffixes.is_empty());
    }

    #[tokio::test]
    async fn test_audit_small_and_large() {
        let (_root, manager, server) = server();
        put(&manager, 3, "/a/c/small", 100);
        put(&manager, 3, "/a/c/large", THRESHOLD as usize * 2);

        let reply = server
            .audit_partition(Request::new(target("sda", 1, 3)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.processed_files, 2);
        assert_eq!(reply.processed_bytes, 100 + THRESHOLD as i64 * 2);
        assert_eq!(reply.corrupted_files, 0);
    }

    #[tokio::test]
    async fn test_default_policy_round_trip() {
        let (root, manager, server) = server();
        let hash = put_in(&manager, 0, 12, "/a/c/default", 64);
        assert!(root.path().join("sda/objects/12/needles.pack").exists());

        let reply = server
            .audit_partition(Request::new(target("sda", 0, 12)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.processed_files, 1);
        assert_eq!(reply.processed_bytes, 64);
        assert_eq!(reply.corrupted_files, 0);

        let reply = server
            .list_partition_suffixes(Request::new(target("sda", 0, 12)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.suffixes, vec![hash.suffix().to_string()]);

        let reply = server
            .get_partition_hashes(Request::new(PartitionHashesRequest {
                partition: Some(target("sda", 0, 12)),
                recalculate: Vec::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.hashes.contains_key(hash.suffix()));

        // The other policy never sees it
        let reply = server
            .audit_partition(Request::new(target("sda", 1, 12)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.processed_files, 0);
    }

    /// Runs an audit that spins until its token is cancelled
    fn stalled_audit(
        server: &Arc<RpcServer>,
        manager: &DeviceManager,
    ) -> (
        tokio::task::JoinHandle<Result<packio_storage::AuditStats, Status>>,
        tokio::sync::oneshot::Receiver<()>,
        Arc<AtomicBool>,
    ) {
        let device = manager.resolve(Policy::new(1), "sda").unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let observed = Arc::new(AtomicBool::new(false));
        let worker_observed = Arc::clone(&observed);
        let server = Arc::clone(server);

        let call = tokio::spawn(async move {
            server
                .run_blocking(move |cancel| {
                    let _ = started_tx.send(());
                    while !cancel.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    worker_observed.store(true, Ordering::SeqCst);
                    device.audit_partition(4, &cancel)
                })
                .await
        });
        (call, started_rx, observed)
    }

    async fn wait_for(flag: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_walk() {
        let (_root, manager, server) = server();
        put(&manager, 4, "/a/c/o", 10);
        let server = Arc::new(server);

        let (call, started, observed) = stalled_audit(&server, &manager);
        started.await.unwrap();
        server.shutdown();

        let status = call.await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
        wait_for(&observed).await;
    }

    #[tokio::test]
    async fn test_dropped_call_cancels_running_walk() {
        let (_root, manager, server) = server();
        put(&manager, 4, "/a/c/o", 10);
        let server = Arc::new(server);

        let (call, started, observed) = stalled_audit(&server, &manager);
        started.await.unwrap();
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());

        wait_for(&observed).await;
        assert!(!server.is_shut_down());
    }

    #[tokio::test]
    async fn test_partition_hashes() {
        let (_root, manager, server) = server();
        let hash = put(&manager, 5, "/a/c/o", 10);

        let reply = server
            .get_partition_hashes(Request::new(PartitionHashesRequest {
                partition: Some(target("sda", 1, 5)),
                recalculate: Vec::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.hashes.len(), 1);
        assert!(reply.hashes.contains_key(hash.suffix()));

        let status = server
            .get_partition_hashes(Request::new(PartitionHashesRequest {
                partition: None,
                recalculate: Vec::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let (_root, _manager, server) = server();

        let status = server
            .audit_partition(Request::new(target("sdz", 1, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = server
            .audit_partition(Request::new(target("sda", 9, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = server
            .list_partition_suffixes(Request::new(target("sda", -1, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let metrics = &server.grpc_metrics().audit_partition;
        assert_eq!(metrics.requests_error.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_no_managers_registered() {
        let server = RpcServer::new();
        let status = server
            .list_partition_suffixes(Request::new(target("sda", 0, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown() {
        let (_root, manager, server) = server();
        put(&manager, 1, "/a/c/o", 10);

        server.shutdown();
        assert!(server.is_shut_down());
        assert!(server.shutdown_token().is_cancelled());

        let status = server
            .audit_partition(Request::new(target("sda", 1, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_devices_listed() {
        let (_root, _manager, server) = server();
        let devices = server.devices();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|device| device.name() == "sda"));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            error_to_status(Error::DeviceNotFound("sda".into())).code(),
            Code::NotFound
        );
        assert_eq!(
            error_to_status(Error::LockTimeout {
                path: "/srv/node/sda/objects/1".into(),
                timeout: std::time::Duration::from_secs(10),
            })
            .code(),
            Code::Unavailable
        );
        assert_eq!(error_to_status(Error::corruption("x")).code(), Code::DataLoss);
        assert_eq!(error_to_status(Error::Cancelled).code(), Code::Cancelled);
        assert_eq!(
            error_to_status(Error::invalid_state("closed")).code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            error_to_status(Error::Serialization("x".into())).code(),
            Code::Internal
        );
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = GrpcMetrics::default();
        metrics.audit_partition.record(true, 1500, 20, 30);
        let output = metrics.export_prometheus("node-a");
        assert!(output.contains(
            "packio_osd_grpc_requests_total{node=\"node-a\",method=\"AuditPartition\",status=\"success\"} 1"
        ));
        assert!(output.contains(
            "packio_osd_grpc_bytes_sent_total{node=\"node-a\",method=\"AuditPartition\"} 30"
        ));
        assert!(!output.contains("packio_osd_grpc_bytes_sent_total{node=\"node-a\",method=\"GetPartitionHashes\"}"));
    }
}
