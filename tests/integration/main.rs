//! Strata integration test harness.
//!
//! Every test runs a real coordinator on a loopback TCP port and real
//! compute node agents connecting to it. Ports are picked by the OS, so
//! tests run in parallel without interfering.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use strata_core::config::CoordinatorSettings;
use strata_services::{AgentHandle, Coordinator, NodeAgent, RowTransform};

mod failures;
mod scenarios;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A coordinator listening on 127.0.0.1.
pub struct Cluster {
    pub coordinator: Arc<Coordinator>,
    pub addr: String,
    shutdown_tx: broadcast::Sender<()>,
    listener: JoinHandle<()>,
}

impl Cluster {
    pub async fn start(job_timeout_ms: u64) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind loopback listener")?;
        let addr = listener.local_addr()?.to_string();

        let settings = CoordinatorSettings {
            listen_addr: addr.clone(),
            job_timeout_ms,
            handshake_timeout_ms: 500,
            ..CoordinatorSettings::default()
        };
        let coordinator = Coordinator::new(settings);
        let (shutdown_tx, _) = broadcast::channel(1);
        let listener = tokio::spawn(
            coordinator
                .clone()
                .listen(listener, shutdown_tx.subscribe()),
        );

        Ok(Self {
            coordinator,
            addr,
            shutdown_tx,
            listener,
        })
    }

    /// Start a node agent and wait until the coordinator has registered it.
    pub async fn join(
        &self,
        node_id: &str,
        transform: Arc<dyn RowTransform>,
        workers: usize,
    ) -> Result<AgentHandle> {
        let handle = NodeAgent::new(node_id, transform)
            .with_workers(workers)
            .join(&self.addr)
            .await
            .with_context(|| format!("{node_id} failed to join {}", self.addr))?;

        let registry = self.coordinator.registry().clone();
        let id = node_id.to_string();
        wait_for_condition(2000, move || registry.get(&id).is_some())
            .await
            .with_context(|| format!("{node_id} never registered"))?;
        Ok(handle)
    }

    /// Stop accepting connections and wait for the listener to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(2), self.listener)
            .await
            .context("listener did not stop")?
            .context("listener panicked")?;
        Ok(())
    }
}

/// Poll `cond` every 10 ms until it holds or `timeout_ms` passes.
pub async fn wait_for_condition(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition not met within {timeout_ms} ms")
}
