//! Workflow broker binary: parses CLI flags into a [`BrokerConfig`], starts
//! structured logging, and launches the Rocket server.

use clap::Parser;
use tracing::info;
use workflow_broker::config::BrokerConfig;

#[derive(Parser, Debug)]
#[command(name = "workflow-broker")]
#[command(about = "Real-time collaboration broker for workflow edits, presence, and workspace events")]
struct Args {
    /// SQLite path backing the workflow and permission store stand-ins.
    #[arg(long, value_name = "PATH")]
    database_path: Option<String>,

    /// Base URL of the identity service; falls back to the local HMAC verifier if unset.
    #[arg(long, value_name = "URL")]
    identity_service_url: Option<String>,

    /// Base URL of the permission service; falls back to the local SQLite store if unset.
    #[arg(long, value_name = "URL")]
    permission_service_url: Option<String>,

    /// Shared secret the local token verifier signs/verifies dev tokens with.
    #[arg(long, value_name = "SECRET")]
    ingress_shared_secret: Option<String>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> BrokerConfig {
        let mut config = BrokerConfig::from_env();
        if let Some(path) = self.database_path {
            config.database_path = path;
        }
        if let Some(url) = self.identity_service_url {
            config.identity_service_url = Some(url);
        }
        if let Some(url) = self.permission_service_url {
            config.permission_service_url = Some(url);
        }
        if let Some(secret) = self.ingress_shared_secret {
            config.ingress_shared_secret = Some(secret);
        }
        config
    }
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = args.into_config();
    info!(database_path = %config.database_path, "starting workflow broker");

    let rocket = workflow_broker::rocket_with_config(config).ignite().await?;
    let shutdown = rocket.shutdown();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown.notify();
        }
    });

    rocket.launch().await?;
    Ok(())
}
