use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use prozess::codec::registry::SerializerRegistry;
use prozess::config::{load_config_from_yaml, EngineConfig};
use prozess::error::EngineError;
use prozess::model::SocketRef;
use prozess::runtime::context::TokenContext;
use prozess::runtime::worker::{Handler, HandlerVerdict, Worker};
use prozess::service::redis_store::RedisObjectStore;
use prozess::service::PersistentTokenContextService;
use prozess::session::SessionRegistry;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
    redis: String,

    /// Node id of this worker (claims are tagged with it for crash recovery)
    #[arg(long, default_value = "worker")]
    node: String,

    /// Optional path to a YAML engine config
    #[arg(long)]
    config: Option<String>,
}

// --- Demo handler: logs the position and completes ---
struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn run(
        &self,
        ctx: &Arc<TokenContext>,
        socket: &SocketRef,
    ) -> Result<HandlerVerdict, EngineError> {
        ctx.check_termination()?;
        info!(context_id = %ctx.id(), socket = %socket, "executing");
        Ok(HandlerVerdict::Completed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    println!("[{}] Starting... Redis: {}", args.node, args.redis);

    // 1. Config
    let config = match &args.config {
        Some(path) => load_config_from_yaml(path)?,
        None => EngineConfig::default(),
    };
    let config = Arc::new(config);

    // 2. Storage + service
    let client = redis::Client::open(args.redis.clone()).expect("Invalid Redis URL");
    let store = Arc::new(RedisObjectStore::new(client));
    let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
        config.session_ttl_secs,
    )));
    let service = Arc::new(
        PersistentTokenContextService::new(
            store,
            SerializerRegistry::with_builtins(),
            config.clone(),
        )
        .with_session_registry(sessions),
    );

    // 3. Worker
    let worker = Worker::new(service, Arc::new(LogHandler), &args.node, &config);

    // 4. Reclaim contexts abandoned by a previous crash of this node
    let repaired = worker.recover().await?;
    println!("[{}] Ready. Recovered {} contexts.", args.node, repaired);

    // 5. Run until ctrl-c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });
    worker.run(shutdown_rx).await;

    Ok(())
}
