use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ditto_router::gateway::config::CounterStoreKind;
use ditto_router::gateway::otel::init_tracing;
use ditto_router::gateway::{GatewayConfig, GatewayServer};

/// Multi-tenant admission and routing gateway for OpenAI-compatible inference backends.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Gateway config (.toml, .json, .yaml).
    #[arg(long)]
    config: PathBuf,
    /// Overrides `server.listen`.
    #[arg(long)]
    listen: Option<String>,
    /// Emit logs as json lines.
    #[arg(long)]
    json_logs: bool,
    /// Use Redis at this url for counters (and Redis policy sources without their own url).
    #[arg(long)]
    redis: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    if let Some(url) = args.redis {
        config.counter_store.kind = CounterStoreKind::Redis;
        config.counter_store.url = Some(url);
    }

    let _tracing = init_tracing("ditto-router", &config.logging)?;

    let listen = config.server.listen.clone();
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    let server = GatewayServer::build(config).await?;

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "ditto-router listening");
    axum::serve(listener, server.router())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    let stats = server.shutdown(grace).await;
    tracing::info!(delivered = stats.delivered, queued = stats.queued, "ditto-router stopped");
    Ok(())
}
