//! stratad — Strata coordinator and compute node daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use strata_core::config::StrataConfig;
use strata_services::{Coordinator, NodeAgent};

const USAGE: &str = "usage: stratad <coordinator|node>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StrataConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = StrataConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StrataConfig::default()
    });

    let mode = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coordinator".to_string());
    tracing::info!(mode, "stratad starting");

    match mode.as_str() {
        "coordinator" => run_coordinator(config).await,
        "node" => run_node(config).await,
        other => anyhow::bail!("unknown mode {other:?}; {USAGE}"),
    }
}

async fn run_coordinator(config: StrataConfig) -> Result<()> {
    let settings = config.coordinator;
    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    let api_port = settings.api_port;
    let coordinator = Coordinator::new(settings);

    // Shutdown broadcast
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let listener_task = tokio::spawn(coordinator.clone().listen(listener, shutdown_tx.subscribe()));

    let api_task = {
        let state = strata_api::ApiState {
            coordinator: coordinator.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = strata_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    let node_printer = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                coordinator.reconcile();
                let nodes = coordinator.registry().snapshot();
                tracing::info!(
                    nodes = nodes.len(),
                    jobs_in_flight = coordinator.jobs_in_flight(),
                    "registry"
                );
                for n in &nodes {
                    tracing::debug!(
                        node_id = %n.node_id,
                        peer = %n.peer,
                        connected_secs = n.connected_secs,
                        last_seen_secs = n.last_seen_secs,
                        "node"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = listener_task       => tracing::error!("listener exited: {:?}", r),
        r = api_task            => tracing::error!("API task exited: {:?}", r),
        r = node_printer        => tracing::error!("node printer exited: {:?}", r),
    }

    Ok(())
}

async fn run_node(config: StrataConfig) -> Result<()> {
    let settings = config.node;
    let agent = NodeAgent::from_settings(&settings);
    tracing::info!(
        node_id = %settings.node_id,
        coordinator = %settings.coordinator_addr,
        transform = ?settings.transform,
        workers = settings.worker_count(),
        "compute node starting"
    );

    let handle = agent
        .join(&settings.coordinator_addr)
        .await
        .with_context(|| format!("failed to join coordinator at {}", settings.coordinator_addr))?;
    let link = handle.transport().clone();

    tokio::select! {
        r = handle.wait() => {
            r.context("compute node link failed")?;
            tracing::info!("coordinator link closed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            link.close().await;
        }
    }

    Ok(())
}
