//! Mooncake Master Service
//!
//! This binary runs the metadata control plane that coordinates replica
//! placement, leases, garbage collection, and eviction across
//! client-contributed memory segments.

mod metrics_http;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use mooncake_common::MasterConfig;
use mooncake_proto::master::master_service_server::MasterServiceServer;
use mooncake_store::MasterService;
use service::MasterRpcService;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mooncake-master")]
#[command(about = "Mooncake Store Master Service")]
#[command(version)]
struct Args {
    /// Listen address for gRPC
    #[arg(short, long, default_value = "0.0.0.0:50051")]
    listen: String,

    /// Port for the HTTP metrics endpoint
    #[arg(long, default_value = "9003")]
    metrics_port: u16,

    /// Maximum number of RPC worker threads (bounded by hardware
    /// parallelism)
    #[arg(long, default_value = "4")]
    max_threads: usize,

    /// Treat reads as one-shot: auto-remove objects shortly after each
    /// read instead of granting leases
    #[arg(long)]
    enable_gc: bool,

    /// Lease duration granted to readers, in milliseconds
    #[arg(long, default_value = "5000")]
    default_kv_lease_ttl_ms: u64,

    /// Fraction of objects to evict per eviction pass [0.0, 1.0]
    #[arg(long, default_value = "0.05")]
    eviction_ratio: f64,

    /// Used-capacity ratio that triggers eviction [0.0, 1.0]
    #[arg(long, default_value = "0.9")]
    eviction_high_watermark_ratio: f64,

    /// Enable HA mode: client heartbeats, expiry, and remounting
    #[arg(long)]
    enable_ha: bool,

    /// Seconds a client may go without a heartbeat before expiry
    #[arg(long, default_value = "10")]
    client_live_ttl_secs: u64,

    /// Cluster identifier returned by GetFsdir
    #[arg(long, default_value = "")]
    cluster_id: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker_threads = args
        .max_threads
        .min(std::thread::available_parallelism()?.get())
        .max(1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    info!(
        "Starting Mooncake master: enable_gc={}, enable_ha={}, metrics_port={}",
        args.enable_gc, args.enable_ha, args.metrics_port
    );

    let config = MasterConfig {
        enable_gc: args.enable_gc,
        default_kv_lease_ttl_ms: args.default_kv_lease_ttl_ms,
        eviction_ratio: args.eviction_ratio,
        eviction_high_watermark_ratio: args.eviction_high_watermark_ratio,
        client_live_ttl_secs: args.client_live_ttl_secs,
        enable_ha: args.enable_ha,
        cluster_id: args.cluster_id,
        view_version: 0,
    };

    let master = Arc::new(
        MasterService::new(config).context("failed to start master service")?,
    );

    let metrics_master = master.clone();
    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics_http::serve(metrics_port, metrics_master).await {
            error!("Metrics server error: {e}");
        }
    });

    let addr = args
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", args.listen))?;

    info!("Starting gRPC server on {addr}");
    info!("Metrics available at http://0.0.0.0:{metrics_port}/metrics");

    Server::builder()
        .add_service(MasterServiceServer::new(MasterRpcService::new(master)))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Master service shut down gracefully");
    Ok(())
}
