//! Agentic Memory Server Entry Point
//!
//! Serves JSON-RPC 2.0 over stdio. Logs go to stderr; stdout carries the
//! protocol.

use agentic_memory::{HashingEmbedder, MemoryService};
use agentic_memory_server::{Args, LineTransport, RpcServer};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentic_memory_server=info,agentic_memory=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting agentic memory server");
    tracing::info!("Data directory: {:?}", args.data_dir);

    let service = MemoryService::open(
        &args.data_dir,
        args.memory_config(),
        Arc::new(HashingEmbedder::new(args.embedding_dim)),
    )
    .await
    .with_context(|| format!("failed to open memory store at {}", args.data_dir.display()))?;
    let service = Arc::new(service);

    let server = Arc::new(RpcServer::new(Arc::clone(&service)));
    let mut transport = LineTransport::stdio();
    let served = server.run(&mut transport).await;

    service.shutdown().await;
    served.context("stdio transport failed")?;
    Ok(())
}
