mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use taskpulse_cluster::sync::{PubSubTransport, RelayConfig};
use taskpulse_cluster::{MemoryTransport, RealtimeHub, RedisTransport};
use taskpulse_core::{
    bootstrap::{init_database, load_config},
    logging,
    repository::{PgAccessRepository, PgMutationStore},
    JwtVerifier,
};

use server::TaskPulseServer;

#[derive(Parser, Debug)]
#[command(name = "taskpulse")]
#[command(about = "TaskPulse realtime update server", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, short, env = "TASKPULSE_CONFIG_PATH")]
    config: Option<String>,
}

/// Identify this instance in logs
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!(node_id = %node_id, "TaskPulse server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Initialize database
    let pool = init_database(&config).await?;

    // 4. Pick the pub/sub transport
    let transport: Arc<dyn PubSubTransport> = if config.redis_url().is_empty() {
        info!("Redis not configured, events stay on this instance");
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(RedisTransport::connect(config.redis_url()).await?)
    };

    // 5. Realtime hub
    let hub = Arc::new(RealtimeHub::new(
        transport,
        RelayConfig::from_config(&config),
        Arc::new(PgAccessRepository::new(pool.clone())),
        Arc::new(PgMutationStore::new(pool.clone())),
        config.realtime.clone(),
    ));
    hub.start();
    info!(
        debounce_ms = config.realtime.debounce_ms,
        publish_attempts = config.realtime.publish_attempts,
        "Realtime hub initialized"
    );

    let verifier = Arc::new(JwtVerifier::from_config(&config.jwt));

    // 6. Serve until a shutdown signal arrives
    TaskPulseServer::new(config, pool, hub, verifier).run().await
}
