use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::task::{JobId, Row, RowUnit};
use strata_core::wire::Message;
use strata_services::{read_frame, CoordinateError, Identity, JobState, Transport};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Node & Link Failures
// ══════════════════════════════════════════════════════════════════════════════

/// A node that dies while computing loses its row to the surviving node.
#[tokio::test]
async fn test_node_crash_mid_job_moves_row() -> Result<()> {
    let cluster = Cluster::start(5000).await?;

    let started = Arc::new(AtomicUsize::new(0));
    let slow = {
        let started = started.clone();
        move |row: &[i32]| -> Row {
            started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            row.to_vec()
        }
    };
    let a = cluster.join("node-a", Arc::new(slow), 1).await?;
    let _b = cluster.join("node-b", Arc::new(Identity), 1).await?;

    let coordinator = cluster.coordinator.clone();
    let job = tokio::spawn(async move {
        coordinator
            .coordinate("BLOCK_MULTIPLY", vec![vec![1, 2], vec![3, 4]])
            .await
    });

    // node-a sorts first, so it holds row 0. Kill it mid-computation.
    let probe = started.clone();
    wait_for_condition(2000, move || probe.load(Ordering::SeqCst) > 0).await?;
    a.shutdown().await;

    let report = job.await??;
    assert_eq!(report.state, JobState::Complete);
    assert_eq!(report.into_matrix(), Some(vec![vec![1, 2], vec![3, 4]]));
    assert_eq!(cluster.coordinator.registry().node_ids(), ["node-b"]);
    cluster.stop().await
}

/// Rows that never come back leave the job timed out with partial results.
#[tokio::test]
async fn test_slow_node_times_out_job() -> Result<()> {
    let cluster = Cluster::start(200).await?;
    let stall = |row: &[i32]| -> Row {
        std::thread::sleep(Duration::from_millis(800));
        row.to_vec()
    };
    let _a = cluster.join("node-a", Arc::new(stall), 1).await?;
    let _b = cluster.join("node-b", Arc::new(Identity), 1).await?;

    let report = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", vec![vec![1], vec![2], vec![3], vec![4]])
        .await?;

    assert_eq!(report.state, JobState::TimedOut);
    assert_eq!(report.unresolved, [0, 2]);
    assert_eq!(report.rows[1], Some(vec![2]));
    assert_eq!(report.rows[3], Some(vec![4]));
    assert_eq!(cluster.coordinator.jobs_in_flight(), 0);
    cluster.stop().await
}

#[tokio::test]
async fn test_job_without_nodes_is_rejected() -> Result<()> {
    let cluster = Cluster::start(1000).await?;
    let err = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", vec![vec![1]])
        .await
        .err()
        .context("job should not start without nodes")?;
    assert!(matches!(err, CoordinateError::NoNodesAvailable));
    cluster.stop().await
}

/// A peer whose first frame is not IDENTITY is disconnected unregistered.
#[tokio::test]
async fn test_handshake_requires_identity_first() -> Result<()> {
    let cluster = Cluster::start(1000).await?;

    let stream = tokio::net::TcpStream::connect(&cluster.addr).await?;
    let (mut reader, writer) = tokio::io::split(stream);
    let link = Transport::new(writer, "impostor");
    link.send(&Message::task(JobId(1), "impostor", &RowUnit::new(0, vec![1])))
        .await?;

    let next = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut reader))
        .await
        .context("coordinator kept the link open")??;
    assert!(next.is_none());
    assert!(cluster.coordinator.registry().is_empty());
    cluster.stop().await
}

/// A peer that connects and says nothing is dropped after the handshake window.
#[tokio::test]
async fn test_silent_peer_is_dropped() -> Result<()> {
    let cluster = Cluster::start(1000).await?;

    let stream = tokio::net::TcpStream::connect(&cluster.addr).await?;
    let (mut reader, _writer) = tokio::io::split(stream);

    let next = tokio::time::timeout(Duration::from_secs(3), read_frame(&mut reader))
        .await
        .context("coordinator kept the silent link open")??;
    assert!(next.is_none());
    assert!(cluster.coordinator.registry().is_empty());
    cluster.stop().await
}

/// Re-registering a node id replaces the old link; the old link closing
/// afterwards does not evict the new one.
#[tokio::test]
async fn test_reregistration_last_writer_wins() -> Result<()> {
    let cluster = Cluster::start(5000).await?;
    let first = cluster.join("node-a", Arc::new(Identity), 1).await?;
    let first_conn = cluster
        .coordinator
        .registry()
        .get("node-a")
        .context("node-a missing")?
        .transport
        .id();

    let _second = NodeAgent::new("node-a", Arc::new(Identity))
        .join(&cluster.addr)
        .await?;
    let registry = cluster.coordinator.registry().clone();
    wait_for_condition(2000, move || {
        registry
            .get("node-a")
            .is_some_and(|e| e.transport.id() != first_conn)
    })
    .await?;

    first.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.coordinator.reconcile();
    assert_eq!(cluster.coordinator.registry().node_ids(), ["node-a"]);

    let report = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", vec![vec![9, 9]])
        .await?;
    assert!(report.is_complete());
    cluster.stop().await
}
