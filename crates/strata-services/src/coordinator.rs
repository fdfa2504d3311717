//! Coordinator — accepts compute nodes, splits jobs into rows, and
//! reassembles the results.
//!
//! Each accepted connection gets its own task: handshake first, then a
//! receive loop that feeds RESULT frames into the job table. `coordinate`
//! runs on the caller's task, dispatches every row, then waits for the job
//! to settle or for its deadline.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use strata_core::config::CoordinatorSettings;
use strata_core::task::{JobId, Matrix, RowUnit, TaskUnit};
use strata_core::wire::{Message, MessageKind, MAGIC};

use crate::jobs::{JobReport, JobTable, Resolution};
use crate::registry::NodeRegistry;
use crate::transport::{read_frame, ConnectionId, Transport, TransportError};

/// Operations `coordinate` understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Partition the matrix by row and run every row through the nodes'
    /// transform.
    BlockMultiply,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::BlockMultiply => "BLOCK_MULTIPLY",
        }
    }
}

impl FromStr for Operation {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BLOCK_MULTIPLY" => Ok(Operation::BlockMultiply),
            other => Err(CoordinateError::UnsupportedOperation(other.to_string())),
        }
    }
}

pub struct Coordinator {
    registry: NodeRegistry,
    jobs: JobTable,
    settings: CoordinatorSettings,
    next_job: AtomicU64,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings) -> Arc<Self> {
        Arc::new(Self {
            registry: NodeRegistry::new(),
            jobs: JobTable::new(),
            settings,
            next_job: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Jobs currently waiting on results.
    pub fn jobs_in_flight(&self) -> usize {
        self.jobs.len()
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Accept node connections until `shutdown` fires.
    pub async fn listen(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "coordinator listening");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
                        }
                        tokio::spawn(self.clone().serve_connection(stream, peer.to_string()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("coordinator listener stopping");
                    break;
                }
            }
        }
    }

    /// Drive one node connection from handshake to hang-up.
    ///
    /// When the link ends the transport is closed, dead nodes are swept, and
    /// any rows still pending on this connection are sent elsewhere.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let transport = Transport::new(writer, peer.clone());

        let handshake = self.settings.handshake_timeout();
        let node_id = match tokio::time::timeout(handshake, read_frame(&mut reader)).await {
            Err(_) => Err(HandshakeError::Timeout(handshake)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(None)) => Err(HandshakeError::ConnectionClosed),
            Ok(Ok(Some(first))) => self.handle_registration(&first, transport.clone()),
        };
        let node_id = match node_id {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "handshake rejected");
                transport.close().await;
                return;
            }
        };

        loop {
            match read_frame(&mut reader).await {
                Ok(Some(msg)) => self.handle_frame(&node_id, &msg),
                Ok(None) => {
                    tracing::info!(node_id = %node_id, peer = %peer, "node disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, peer = %peer, error = %e, "node link failed");
                    break;
                }
            }
        }

        transport.close().await;
        self.reconcile();
        self.redispatch_orphans(&node_id, transport.id()).await;
    }

    /// Validate a connection's first frame and register the node.
    pub fn handle_registration(
        &self,
        frame: &Message,
        transport: Arc<Transport>,
    ) -> Result<String, HandshakeError> {
        if frame.magic != MAGIC {
            return Err(HandshakeError::BadMagic(frame.magic.clone()));
        }
        if frame.kind != MessageKind::Identity {
            return Err(HandshakeError::UnexpectedKind(frame.kind));
        }
        if frame.node_id.is_empty() {
            return Err(HandshakeError::EmptyNodeId);
        }

        let node_id = frame.node_id.clone();
        let connection = transport.id();
        let peer = transport.peer().to_string();
        if let Some(previous) = self.registry.register(&node_id, transport) {
            tracing::warn!(
                node_id = %node_id,
                old_connection = previous.transport.id(),
                new_connection = connection,
                "node re-registered, replacing previous link"
            );
        }
        tracing::info!(node_id = %node_id, peer = %peer, connection, "node registered");
        Ok(node_id)
    }

    /// Route one post-handshake frame.
    fn handle_frame(&self, node_id: &str, msg: &Message) {
        if msg.kind != MessageKind::Result {
            tracing::debug!(node_id, kind = %msg.kind, "ignoring non-result frame");
            return;
        }

        let Some(job) = msg.job_id() else {
            tracing::warn!(node_id, sender = %msg.sender, "result without a job key");
            return;
        };
        let unit = match RowUnit::decode(&msg.payload) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(node_id, job_id = %job, error = %e, "malformed result payload");
                return;
            }
        };

        let row = unit.row_index;
        match self.jobs.resolve(job, unit) {
            Resolution::Accepted { remaining } => {
                tracing::debug!(node_id, job_id = %job, row, remaining, "row resolved");
            }
            Resolution::Duplicate => {
                tracing::debug!(node_id, job_id = %job, row, "duplicate result dropped");
            }
            Resolution::OutOfRange => {
                tracing::warn!(node_id, job_id = %job, row, "result row out of range");
            }
            Resolution::UnknownJob => {
                tracing::debug!(node_id, job_id = %job, row, "result for unknown or finished job");
            }
        }
    }

    // ── Jobs ──────────────────────────────────────────────────────────────────

    /// Run `operation` over `matrix` on the registered nodes.
    ///
    /// Returns an error only when the job cannot start. Once rows are out,
    /// the outcome (complete, timed out, or unplaceable rows) is reported in
    /// the `JobReport`.
    pub async fn coordinate(&self, operation: &str, matrix: Matrix) -> Result<JobReport, CoordinateError> {
        let operation: Operation = operation.parse()?;
        let deadline = tokio::time::Instant::now() + self.settings.job_timeout();

        self.reconcile();
        if self.registry.is_empty() {
            return Err(CoordinateError::NoNodesAvailable);
        }
        let rows = i32::try_from(matrix.len()).map_err(|_| CoordinateError::TooManyRows(matrix.len()))?;

        let job = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
        let started = Instant::now();
        let input = Arc::new(matrix);
        let done = self.jobs.open(job, input.clone());
        tracing::info!(
            job_id = %job,
            operation = operation.as_str(),
            rows,
            nodes = self.registry.len(),
            "job started"
        );

        for (row, values) in input.iter().enumerate() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(job_id = %job, row, "deadline passed before every row was dispatched");
                break;
            }
            let unit = TaskUnit::new(row as i32, values.clone());
            self.dispatch_unit(job, &unit, HashSet::new(), Some(deadline)).await;
        }

        if tokio::time::timeout_at(deadline, done).await.is_err() {
            tracing::warn!(job_id = %job, "job deadline passed with rows outstanding");
        }

        let report = self.jobs.close(job, started).ok_or(CoordinateError::JobLost(job))?;
        tracing::info!(
            job_id = %job,
            state = ?report.state,
            unresolved = report.unresolved.len(),
            elapsed_ms = report.elapsed_ms,
            "job finished"
        );
        Ok(report)
    }

    /// Send one row to a live node, moving on to the next node whenever a
    /// send fails. Returns false when every node has been tried; the row is
    /// then recorded as failed.
    ///
    /// Each write is bounded by `send_timeout` and by the job `deadline`. A
    /// node that stops draining its link is dropped like any failed send.
    /// Once the deadline has passed the row is left pending for the timeout
    /// report.
    async fn dispatch_unit(
        &self,
        job: JobId,
        unit: &TaskUnit,
        mut tried: HashSet<String>,
        deadline: Option<tokio::time::Instant>,
    ) -> bool {
        loop {
            let now = tokio::time::Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                tracing::debug!(job_id = %job, row = unit.row_index, "deadline passed, row left pending");
                return false;
            }
            let limit = match deadline {
                Some(d) => d.min(now + self.settings.send_timeout()),
                None => now + self.settings.send_timeout(),
            };

            let Some(node) = self.registry.select(&tried) else {
                tracing::warn!(job_id = %job, row = unit.row_index, "no live node left for row");
                self.jobs.fail(job, unit.row_index);
                return false;
            };

            // Assign before sending so a link that dies mid-send still
            // leaves the row findable as an orphan.
            self.jobs.assign(job, unit.row_index, &node.node_id, node.transport.id());
            let frame = Message::task(job, node.node_id.clone(), unit);
            match node.transport.send_until(&frame, limit).await {
                Ok(()) => {
                    self.registry.touch(&node.node_id);
                    tracing::debug!(job_id = %job, row = unit.row_index, node_id = %node.node_id, "row dispatched");
                    return true;
                }
                Err(source) => {
                    let err = DispatchError {
                        node_id: node.node_id.clone(),
                        job,
                        row: unit.row_index,
                        source,
                    };
                    tracing::warn!(error = %err, "dispatch failed, trying another node");
                    tried.insert(node.node_id);
                    self.reconcile();
                }
            }
        }
    }

    /// Re-place rows that were in flight on a connection that just ended.
    async fn redispatch_orphans(&self, node_id: &str, connection: ConnectionId) {
        let orphans = self.jobs.orphans(connection);
        if orphans.is_empty() {
            return;
        }
        tracing::info!(node_id, count = orphans.len(), "re-dispatching rows from lost node");

        // A node that reconnected under the same id holds a fresh link and
        // stays eligible.
        let reconnected = self
            .registry
            .get(node_id)
            .is_some_and(|entry| entry.transport.id() != connection);
        for (job, unit) in orphans {
            let mut tried = HashSet::new();
            if !reconnected {
                tried.insert(node_id.to_string());
            }
            self.dispatch_unit(job, &unit, tried, None).await;
        }
    }

    /// Drop every node whose link is closed. Returns the removed ids.
    pub fn reconcile(&self) -> Vec<String> {
        let removed = self.registry.sweep();
        for node_id in &removed {
            tracing::info!(node_id = %node_id, "removed dead node");
        }
        removed
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("bad magic {0:?}")]
    BadMagic(String),

    #[error("expected IDENTITY, got {0}")]
    UnexpectedKind(MessageKind),

    #[error("IDENTITY frame has an empty node id")]
    EmptyNodeId,

    #[error("no IDENTITY frame within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before IDENTITY")]
    ConnectionClosed,

    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// A TASK frame could not be written to its node.
#[derive(Debug, thiserror::Error)]
#[error("send to node {node_id} failed (job {job}, row {row}): {source}")]
pub struct DispatchError {
    pub node_id: String,
    pub job: JobId,
    pub row: i32,
    pub source: TransportError,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinateError {
    #[error("unsupported operation {0:?}")]
    UnsupportedOperation(String),

    #[error("no compute nodes available")]
    NoNodesAvailable,

    #[error("matrix has {0} rows, more than a row index can address")]
    TooManyRows(usize),

    #[error("job {0} vanished from the job table")]
    JobLost(JobId),
}
