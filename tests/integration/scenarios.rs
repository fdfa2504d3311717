use std::sync::Arc;

use strata_core::task::{Matrix, RowUnit};
use strata_core::wire::{Message, MessageKind};
use strata_services::{read_frame, Identity, JobState, Scale, Transport};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Happy paths
// ══════════════════════════════════════════════════════════════════════════════

/// A single hand-driven node sees both rows in order and echoes them back.
#[tokio::test]
async fn test_single_node_receives_every_row() -> Result<()> {
    let cluster = Cluster::start(5000).await?;

    let stream = tokio::net::TcpStream::connect(&cluster.addr).await?;
    let (mut reader, writer) = tokio::io::split(stream);
    let link = Transport::new(writer, "A");
    link.send(&Message::identity("A")).await?;
    let registry = cluster.coordinator.registry().clone();
    wait_for_condition(2000, move || registry.node_ids() == ["A"]).await?;

    let node = tokio::spawn(async move {
        let mut seen = Vec::new();
        for _ in 0..2 {
            let task = read_frame(&mut reader).await?.context("link closed early")?;
            assert_eq!(task.kind, MessageKind::Task);
            assert_eq!(task.node_id, "A");
            let unit = RowUnit::decode(&task.payload)?;
            link.send(&Message::result(&task, "A", &unit)).await?;
            seen.push(unit);
        }
        anyhow::Ok((seen, reader, link))
    });

    let report = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", vec![vec![1, 2], vec![3, 4]])
        .await?;
    let (seen, _reader, _link) = node.await??;

    assert_eq!(
        seen,
        [RowUnit::new(0, vec![1, 2]), RowUnit::new(1, vec![3, 4])]
    );
    assert_eq!(report.state, JobState::Complete);
    assert_eq!(report.into_matrix(), Some(vec![vec![1, 2], vec![3, 4]]));
    cluster.stop().await
}

/// Two identity nodes, one row each: the result is the input.
#[tokio::test]
async fn test_two_node_identity_job() -> Result<()> {
    let cluster = Cluster::start(5000).await?;
    let _a = cluster.join("node-a", Arc::new(Identity), 2).await?;
    let _b = cluster.join("node-b", Arc::new(Identity), 2).await?;

    let report = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", vec![vec![1, 2], vec![3, 4]])
        .await?;

    assert_eq!(report.state, JobState::Complete);
    assert_eq!(report.into_matrix(), Some(vec![vec![1, 2], vec![3, 4]]));
    cluster.stop().await
}

#[tokio::test]
async fn test_scale_transform_applies_per_row() -> Result<()> {
    let cluster = Cluster::start(5000).await?;
    let _a = cluster.join("node-a", Arc::new(Scale(3)), 1).await?;
    let _b = cluster.join("node-b", Arc::new(Scale(3)), 1).await?;

    let report = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", vec![vec![1, 2], vec![3, 4], vec![-5]])
        .await?;

    assert_eq!(
        report.into_matrix(),
        Some(vec![vec![3, 6], vec![9, 12], vec![-15]])
    );
    cluster.stop().await
}

/// Many rows over several nodes, each with a small worker pool.
#[tokio::test]
async fn test_large_job_completes_in_order() -> Result<()> {
    let cluster = Cluster::start(10_000).await?;
    let mut nodes = Vec::new();
    for id in ["n1", "n2", "n3"] {
        nodes.push(cluster.join(id, Arc::new(Identity), 4).await?);
    }

    let matrix: Matrix = (0..200).map(|i| (0..16).map(|j| i * 100 + j).collect()).collect();
    let report = cluster
        .coordinator
        .coordinate("BLOCK_MULTIPLY", matrix.clone())
        .await?;

    assert!(report.is_complete());
    assert_eq!(report.into_matrix(), Some(matrix));
    assert_eq!(cluster.coordinator.jobs_in_flight(), 0);
    cluster.stop().await
}

/// Concurrent jobs share the nodes; results never cross between jobs.
#[tokio::test]
async fn test_concurrent_jobs_stay_separate() -> Result<()> {
    let cluster = Cluster::start(5000).await?;
    let _a = cluster.join("node-a", Arc::new(Identity), 2).await?;
    let _b = cluster.join("node-b", Arc::new(Identity), 2).await?;

    let first: Matrix = (0..20).map(|i| vec![i]).collect();
    let second: Matrix = (0..20).map(|i| vec![-i, 1000]).collect();

    let (r1, r2) = tokio::join!(
        cluster.coordinator.coordinate("BLOCK_MULTIPLY", first.clone()),
        cluster.coordinator.coordinate("BLOCK_MULTIPLY", second.clone()),
    );
    let (r1, r2) = (r1?, r2?);

    assert_ne!(r1.job_id, r2.job_id);
    assert_eq!(r1.into_matrix(), Some(first));
    assert_eq!(r2.into_matrix(), Some(second));
    cluster.stop().await
}

/// Nodes that disconnect are swept from the registry.
#[tokio::test]
async fn test_departed_node_is_removed() -> Result<()> {
    let cluster = Cluster::start(5000).await?;
    let a = cluster.join("node-a", Arc::new(Identity), 1).await?;
    let _b = cluster.join("node-b", Arc::new(Identity), 1).await?;
    assert_eq!(cluster.coordinator.registry().len(), 2);

    a.shutdown().await;
    let registry = cluster.coordinator.registry().clone();
    wait_for_condition(2000, move || registry.get("node-a").is_none()).await?;
    assert_eq!(cluster.coordinator.registry().node_ids(), ["node-b"]);
    cluster.stop().await
}
