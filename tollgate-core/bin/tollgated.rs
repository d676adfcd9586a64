// bin/tollgated.rs - Tollgate node daemon
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tollgate_core::{NodeConfig, TollNode};
use tollgate_rpc::{RpcConfig, TollApi};

#[derive(Parser, Debug)]
#[command(name = "tollgated")]
#[command(about = "Tollgate toll-processing node", long_about = None)]
struct Args {
    /// YAML config file; flags below override its values
    #[arg(short, long)]
    config: Option<String>,

    /// Database path
    #[arg(short, long, default_value = "./tollgate_db")]
    db_path: String,

    /// HTTP listen address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Trust policy file (built-in defaults when omitted)
    #[arg(short, long)]
    policy: Option<String>,

    /// Admin API key (min 16 chars)
    #[arg(short, long)]
    admin_key: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig {
            db_path: args.db_path,
            listen_addr: args.listen,
            policy_path: args.policy,
            admin_key: args.admin_key.unwrap_or_default(),
            log_level: args.log_level,
        },
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    tracing::info!("Starting tollgate node");
    tracing::info!("  Database: {}", config.db_path);
    tracing::info!("  Listen:   {}", config.listen_addr);
    if let Some(policy) = &config.policy_path {
        tracing::info!("  Policy:   {}", policy);
    }

    let listen_addr = config.listen_addr.parse()?;
    let node = TollNode::new(config).await?;
    node.start();

    // Graceful shutdown on ctrl-c
    let shutdown_node = node.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("shutdown signal received");
                shutdown_node.shutdown();
                std::process::exit(0);
            }
            Err(err) => {
                tracing::error!("unable to listen for shutdown signal: {}", err);
            }
        }
    });

    let api: Arc<dyn TollApi> = node;
    tollgate_rpc::start_server(
        RpcConfig {
            listen_addr,
        },
        api,
    )
    .await?;

    Ok(())
}
