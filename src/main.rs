use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use originsync::config::{Cli, Command, Config};
use originsync::objectstore::AwsCliObjectStore;
use originsync::orchestrator::Orchestrator;
use originsync::origin::{HttpOriginAdapter, OriginCredentials};
use originsync::webhook::{self, WebhookState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    let log_path = originsync::config::default_log_file_path();
    originsync::logging::init_log_file(&log_path)?;
    originsync::logging::info(format!("originsyncd starting, zdrive={}", config.zdrive_root.display()));

    match cli.command.unwrap_or(Command::Run { webhook_addr: "0.0.0.0:8080".to_string() }) {
        Command::ConfigPath => {
            println!("{}", config.project_map_path.display());
            Ok(())
        }
        Command::Run { webhook_addr } => run(config, webhook_addr).await,
    }
}

async fn run(config: Config, webhook_addr: String) -> Result<()> {
    let object_store = Arc::new(AwsCliObjectStore::default());
    let creds = config.origin.clone().unwrap_or(OriginCredentials {
        api_key: String::new(),
        api_secret: String::new(),
        user_id: String::new(),
        org_id: String::new(),
        session_url: String::new(),
    });
    let origin = Arc::new(HttpOriginAdapter::new(creds, config.webhook_url.clone())?);

    let orchestrator = Orchestrator::new(config, object_store.clone(), origin.clone());

    let webhook_state = Arc::new(WebhookState {
        object_store: object_store.clone(),
        origin: origin.clone(),
        projects: orchestrator.clone(),
        project_map: orchestrator.project_map(),
    });
    let app = webhook::router(webhook_state);
    let listener = tokio::net::TcpListener::bind(&webhook_addr).await?;
    originsync::logging::info(format!("webhook listening on {webhook_addr}"));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx));

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            originsync::logging::info("received interrupt, shutting down".to_string());
            let _ = shutdown_tx.send(());
        }
    }
    let _ = orchestrator_task.await;
    Ok(())
}
