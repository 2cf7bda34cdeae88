pub mod cli;
pub mod config;
pub mod drift;
pub mod error;
pub mod models;
pub mod monitor;
pub mod pagination;
pub mod probe;
pub mod server;
pub mod state;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod trigger;
pub mod window;

use crate::{
    cli::{Cli, Command},
    config::MonitorConfig,
    models::BaselineUpload,
    monitor::Monitor,
    probe::HttpServingClient,
    server::Server,
    store::open_store,
    trigger::{ConsumeReply, TriggerManager},
};
use anyhow::Context;
use chrono::Utc;
use std::{path::Path, sync::Arc};
use tokio::sync::watch;
use tracing::info;

/// Dispatches one CLI invocation.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(MonitorConfig::load(cli.config.as_deref())?);
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Once => once(config).await,
        Command::Purge { older_than_secs } => purge(&config, older_than_secs).await,
        Command::ImportBaseline { file } => import_baseline(&config, &file).await,
        Command::Consume { id } => consume(&config, &id).await,
    }
}

async fn serve(config: Arc<MonitorConfig>) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;
    let client = Arc::new(HttpServingClient::new(config.probe.timeout)?);
    let (monitor, handle) = Monitor::new(Arc::clone(&config), Arc::clone(&store), client);

    let (stop_tx, stop_rx) = watch::channel(false);
    let loop_task = tokio::spawn(monitor.run(stop_rx.clone()));
    let mut server_task = tokio::spawn(Server::new(config, store, Some(handle)).run(stop_rx));

    tokio::select! {
        result = &mut server_task => {
            let _ = stop_tx.send(true);
            loop_task.await.context("monitor loop panicked")?;
            return result.context("API server panicked")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
    }

    let _ = stop_tx.send(true);
    server_task.await.context("API server panicked")??;
    loop_task.await.context("monitor loop panicked")?;
    Ok(())
}

async fn once(config: Arc<MonitorConfig>) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;
    let client = Arc::new(HttpServingClient::new(config.probe.timeout)?);
    let (mut monitor, handle) = Monitor::new(Arc::clone(&config), store, client);
    let record = monitor.run_once().await;
    let status = handle.status();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "cycle": record,
            "drift": status.last_drift,
            "detector": status.detector,
        }))?
    );
    Ok(())
}

async fn purge(config: &MonitorConfig, older_than_secs: Option<u64>) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;
    let age = older_than_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or(config.store.retention);
    let cutoff = Utc::now() - chrono::Duration::from_std(age).context("purge age out of range")?;
    let deleted = store.purge(cutoff).await?;
    info!(deleted, %cutoff, "purge finished");
    println!("deleted {deleted} records older than {cutoff}");
    Ok(())
}

async fn import_baseline(config: &MonitorConfig, file: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read baseline file {}", file.display()))?;
    let upload: BaselineUpload = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse baseline file {}", file.display()))?;
    let model_version = upload.model_version.trim().to_string();
    let snapshots = upload.into_snapshots(Utc::now())?;
    let features = snapshots.len();

    let store = open_store(&config.store).await?;
    store.put_baselines(&model_version, snapshots).await?;
    info!(%model_version, features, "baseline imported");
    println!("published baseline {model_version} with {features} features");
    Ok(())
}

async fn consume(config: &MonitorConfig, id: &str) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;
    let triggers = TriggerManager::new(store, config.triggers.clone());
    let reply = ConsumeReply::new(id, triggers.consume(id).await?);
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
