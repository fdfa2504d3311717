//! Compute node agent — joins a coordinator and runs row tasks.
//!
//! One receive loop per link reads TASK frames and hands each to a bounded
//! worker pool. Workers run the row transform on the blocking pool and send
//! the RESULT back through the shared transport.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use strata_core::config::{NodeSettings, TransformKind};
use strata_core::task::{Row, RowUnit};
use strata_core::wire::{Message, MessageKind};

use crate::transport::{read_frame, Transport, TransportError};

// ── Transforms ────────────────────────────────────────────────────────────────

/// The computation a node applies to each row.
pub trait RowTransform: Send + Sync + 'static {
    fn apply(&self, row: &[i32]) -> Row;
}

impl<F> RowTransform for F
where
    F: Fn(&[i32]) -> Row + Send + Sync + 'static,
{
    fn apply(&self, row: &[i32]) -> Row {
        self(row)
    }
}

/// Returns the row unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl RowTransform for Identity {
    fn apply(&self, row: &[i32]) -> Row {
        row.to_vec()
    }
}

/// Multiplies every value by a constant, wrapping on overflow.
#[derive(Debug, Clone, Copy)]
pub struct Scale(pub i32);

impl RowTransform for Scale {
    fn apply(&self, row: &[i32]) -> Row {
        row.iter().map(|v| v.wrapping_mul(self.0)).collect()
    }
}

/// The transform named in a node's settings.
pub fn transform_from_settings(settings: &NodeSettings) -> Arc<dyn RowTransform> {
    match settings.transform {
        TransformKind::Identity => Arc::new(Identity),
        TransformKind::Scale => Arc::new(Scale(settings.scale_factor)),
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

pub struct NodeAgent {
    node_id: String,
    transform: Arc<dyn RowTransform>,
    workers: usize,
}

impl NodeAgent {
    /// An agent with one worker per available core.
    pub fn new(node_id: impl Into<String>, transform: Arc<dyn RowTransform>) -> Self {
        Self {
            node_id: node_id.into(),
            transform,
            workers: NodeSettings::default().worker_count(),
        }
    }

    pub fn from_settings(settings: &NodeSettings) -> Self {
        Self {
            node_id: settings.node_id.clone(),
            transform: transform_from_settings(settings),
            workers: settings.worker_count(),
        }
    }

    /// Cap the number of rows computed at once. Clamped to at least one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Connect to a coordinator over TCP and register.
    pub async fn join(&self, addr: &str) -> Result<AgentHandle, AgentError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| AgentError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr, error = %e, "set_nodelay failed");
        }
        self.attach(stream, addr).await
    }

    /// Register over an already-open stream and start serving tasks.
    pub async fn attach<S>(&self, stream: S, peer: &str) -> Result<AgentHandle, AgentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let transport = Transport::new(writer, peer);
        transport.send(&Message::identity(self.node_id.clone())).await?;
        tracing::info!(node_id = %self.node_id, peer, workers = self.workers, "joined coordinator");

        let task = tokio::spawn(receive_loop(
            reader,
            transport.clone(),
            self.node_id.clone(),
            self.transform.clone(),
            self.workers,
        ));
        Ok(AgentHandle { transport, task })
    }
}

/// A running agent link.
pub struct AgentHandle {
    transport: Arc<Transport>,
    task: JoinHandle<Result<(), AgentError>>,
}

impl AgentHandle {
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Wait for the link to end. `Ok` means the coordinator hung up cleanly.
    pub async fn wait(self) -> Result<(), AgentError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(AgentError::Join(e.to_string())),
        }
    }

    /// Stop serving immediately. In-flight rows are abandoned.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        self.transport.close().await;
    }
}

async fn receive_loop<S>(
    mut reader: ReadHalf<S>,
    transport: Arc<Transport>,
    node_id: String,
    transform: Arc<dyn RowTransform>,
    workers: usize,
) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut running: JoinSet<()> = JoinSet::new();

    let outcome = loop {
        while running.try_join_next().is_some() {}

        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(node_id = %node_id, "coordinator closed the link");
                break Ok(());
            }
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "link failed");
                break Err(AgentError::from(e));
            }
        };

        if frame.kind != MessageKind::Task {
            tracing::debug!(node_id = %node_id, kind = %frame.kind, "ignoring non-task frame");
            continue;
        }
        let unit = match RowUnit::decode(&frame.payload) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(node_id = %node_id, sender = %frame.sender, error = %e, "rejecting malformed task");
                continue;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break Ok(()), // semaphore closed
        };

        let transport = transport.clone();
        let transform = transform.clone();
        let node_id = node_id.clone();
        running.spawn(async move {
            let _permit = permit;
            let row = unit.row_index;
            match run_task(frame, unit, &node_id, transform, &transport).await {
                Ok(()) => tracing::debug!(node_id = %node_id, row, "row computed"),
                Err(e) => tracing::warn!(node_id = %node_id, row, error = %e, "task failed"),
            }
        });
    };

    running.shutdown().await;
    semaphore.close();
    transport.close().await;
    outcome
}

async fn run_task(
    task: Message,
    unit: RowUnit,
    node_id: &str,
    transform: Arc<dyn RowTransform>,
    transport: &Transport,
) -> Result<(), AgentError> {
    let RowUnit { row_index, values } = unit;
    let output = tokio::task::spawn_blocking(move || transform.apply(&values))
        .await
        .map_err(|e| AgentError::TransformPanicked(e.to_string()))?;

    let result = RowUnit::new(row_index, output);
    transport
        .send(&Message::result(&task, node_id, &result))
        .await?;
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("row transform panicked: {0}")]
    TransformPanicked(String),

    #[error("agent task failed: {0}")]
    Join(String),
}
