//! PackIO CLI - Admin Command Line Interface
//!
//! Queries a storage node's replication and audit service.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use packio_proto::pack::{
    Partition, PartitionHashesRequest, pack_rpc_service_client::PackRpcServiceClient,
};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "packio-cli")]
#[command(about = "PackIO Admin CLI")]
#[command(version)]
struct Args {
    /// Storage node endpoint
    #[arg(short, long, default_value = "http://localhost:60000")]
    endpoint: String,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Debug)]
struct PartitionArgs {
    /// Device name
    device: String,
    /// Partition number
    partition: u64,
    /// Storage policy index
    #[arg(short, long, default_value_t = 0)]
    policy: i32,
}

impl From<PartitionArgs> for Partition {
    fn from(args: PartitionArgs) -> Self {
        Self {
            device: args.device,
            policy: args.policy,
            partition: args.partition,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the suffix directories of a partition
    Suffixes(PartitionArgs),
    /// Audit every object in a partition
    Audit(PartitionArgs),
    /// Show per-suffix hashes of a partition
    Hashes {
        #[command(flatten)]
        partition: PartitionArgs,
        /// Suffixes to recompute even if cached
        #[arg(short, long)]
        recalculate: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("connecting to {}", args.endpoint);
    let mut client = PackRpcServiceClient::connect(args.endpoint.clone())
        .await
        .with_context(|| format!("failed to connect to {}", args.endpoint))?;

    match args.command {
        Commands::Suffixes(partition) => {
            let response = client
                .list_partition_suffixes(Partition::from(partition))
                .await?;
            let suffixes = response.into_inner().suffixes;

            if args.json {
                println!("{}", json!({ "suffixes": suffixes }));
            } else if suffixes.is_empty() {
                println!("No suffixes found");
            } else {
                println!("Suffixes ({})", suffixes.len());
                println!("========");
                for suffix in suffixes {
                    println!("{suffix}");
                }
            }
        }
        Commands::Audit(partition) => {
            let response = client.audit_partition(Partition::from(partition)).await?;
            let reply = response.into_inner();

            if args.json {
                println!(
                    "{}",
                    json!({
                        "processed_files": reply.processed_files,
                        "processed_bytes": reply.processed_bytes,
                        "corrupted_files": reply.corrupted_files,
                    })
                );
            } else {
                println!("Audit");
                println!("=====");
                println!("{:<18} {}", "Processed files:", reply.processed_files);
                println!("{:<18} {}", "Processed bytes:", reply.processed_bytes);
                println!("{:<18} {}", "Corrupted files:", reply.corrupted_files);
            }
        }
        Commands::Hashes {
            partition,
            recalculate,
        } => {
            let response = client
                .get_partition_hashes(PartitionHashesRequest {
                    partition: Some(Partition::from(partition)),
                    recalculate,
                })
                .await?;
            let mut hashes: Vec<_> = response.into_inner().hashes.into_iter().collect();
            hashes.sort();

            if args.json {
                let map: serde_json::Map<String, serde_json::Value> = hashes
                    .into_iter()
                    .map(|(suffix, hash)| (suffix, serde_json::Value::String(hash)))
                    .collect();
                println!("{}", serde_json::Value::Object(map));
            } else if hashes.is_empty() {
                println!("No suffixes found");
            } else {
                println!("{:<8} {:<32}", "SUFFIX", "HASH");
                println!("{}", "-".repeat(41));
                for (suffix, hash) in hashes {
                    println!("{suffix:<8} {hash:<32}");
                }
            }
        }
    }

    Ok(())
}
