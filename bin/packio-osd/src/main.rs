//! PackIO OSD - Object Storage Daemon
//!
//! This binary serves the replication and audit RPCs of a storage node and
//! exposes Prometheus metrics.

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use packio_common::Config;
use packio_osd::RpcServer;
use packio_proto::pack::pack_rpc_service_server::PackRpcServiceServer;
use packio_storage::{DeviceManager, FsXattr};
use std::fmt::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "packio-osd")]
#[command(about = "PackIO Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/packio/osd.toml")]
    config: PathBuf,

    /// Listen address for gRPC
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Directory holding one mount point per device
    #[arg(long)]
    devices_root: Option<PathBuf>,

    /// Device names under the devices root
    #[arg(long)]
    devices: Vec<String>,

    /// Storage policies to serve
    #[arg(long)]
    policies: Vec<u32>,

    /// Create missing device directories instead of skipping them
    #[arg(long)]
    no_mount_check: bool,

    /// Log level
    #[arg(long, env = "PACKIO_LOG_LEVEL")]
    log_level: Option<String>,

    /// Metrics server address (Prometheus)
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,
}

impl Args {
    /// Command line values take precedence over the file
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.network.rpc_listen = listen;
        }
        if let Some(metrics_listen) = self.metrics_listen {
            config.network.metrics_listen = metrics_listen;
        }
        if let Some(root) = self.devices_root {
            config.storage.devices_root = root;
        }
        if !self.devices.is_empty() {
            config.storage.devices = self.devices;
        }
        if !self.policies.is_empty() {
            config.storage.policies = self.policies;
        }
        if self.no_mount_check {
            config.storage.mount_check = false;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config_path = args.config.clone();
    let mut config = load_config(&config_path)?;
    args.apply(&mut config);

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting PackIO OSD");
    info!("Config file: {}", config_path.display());
    info!(
        "Devices: {:?} under {}",
        config.storage.devices,
        config.storage.devices_root.display()
    );
    info!(
        "Policies: {:?}, needle threshold: {} bytes",
        config.storage.policies, config.engine.needle_threshold
    );

    if config.storage.devices.is_empty() {
        anyhow::bail!(
            "no devices specified; use --devices or configure [storage] in {}",
            config_path.display()
        );
    }

    let manager = DeviceManager::new(&config.storage, &config.engine, Arc::new(FsXattr))
        .context("failed to open devices")?;

    let rpc = Arc::new(RpcServer::new());
    rpc.register(Arc::new(manager));

    // Start metrics server
    let metrics_state = Arc::new(MetricsState {
        rpc: Arc::clone(&rpc),
        node: config.node.name.clone(),
    });
    let metrics_addr = config.network.metrics_listen;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr, metrics_state).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Ctrl-C cancels the server token, which stops the listener and every
    // call in flight
    let signal_rpc = Arc::clone(&rpc);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            signal_rpc.shutdown();
        }
    });

    let addr = config.network.rpc_listen;
    info!("Starting gRPC server on {}", addr);
    info!("Metrics available at http://{}/metrics", metrics_addr);

    Server::builder()
        .add_service(PackRpcServiceServer::from_arc(Arc::clone(&rpc)))
        .serve_with_shutdown(addr, rpc.shutdown_token().cancelled_owned())
        .await?;

    info!("OSD shut down gracefully");

    Ok(())
}

/// State for the metrics HTTP server
struct MetricsState {
    rpc: Arc<RpcServer>,
    node: String,
}

/// Metrics HTTP handler
async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<MetricsState>>,
) -> impl IntoResponse {
    let mut output = String::with_capacity(8 * 1024);
    let node = &state.node;

    let _ = writeln!(output, "# HELP packio_osd_uptime_seconds OSD uptime in seconds");
    let _ = writeln!(output, "# TYPE packio_osd_uptime_seconds counter");
    let _ = writeln!(
        output,
        "packio_osd_uptime_seconds{{node=\"{node}\"}} {}",
        state.rpc.uptime_secs()
    );

    let counters = [
        ("needles_written_total", "Needles appended to pack files"),
        ("files_written_total", "Standalone object files committed"),
        ("bytes_written_total", "Object body bytes committed"),
        ("tombstones_written_total", "Tombstones written"),
        ("commit_errors_total", "Failed commits"),
        ("audits_total", "Partition audits run"),
        ("corrupted_files_total", "Corrupted files found by audits"),
    ];
    let devices = state.rpc.devices();

    for (name, help) in counters {
        let _ = writeln!(output, "# HELP packio_device_{name} {help}");
        let _ = writeln!(output, "# TYPE packio_device_{name} counter");
        for device in &devices {
            let stats = device.stats();
            let value = match name {
                "needles_written_total" => &stats.needles_written,
                "files_written_total" => &stats.files_written,
                "bytes_written_total" => &stats.bytes_written,
                "tombstones_written_total" => &stats.tombstones_written,
                "commit_errors_total" => &stats.commit_errors,
                "audits_total" => &stats.audits,
                _ => &stats.corrupted_found,
            }
            .load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "packio_device_{name}{{node=\"{node}\",device=\"{}\",policy=\"{}\"}} {value}",
                device.name(),
                device.policy()
            );
        }
    }

    // Export gRPC metrics
    output.push_str(&state.rpc.grpc_metrics().export_prometheus(node));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Health check handler
async fn health_handler(
    axum::extract::State(state): axum::extract::State<Arc<MetricsState>>,
) -> impl IntoResponse {
    if state.rpc.is_shut_down() || state.rpc.devices().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    } else {
        (StatusCode::OK, "OK")
    }
}

/// Start the metrics HTTP server
async fn start_metrics_server(addr: SocketAddr, state: Arc<MetricsState>) -> Result<()> {
    let shutdown = state.rpc.shutdown_token();
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    info!("Starting metrics server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
