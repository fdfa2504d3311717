//! /status, /reconcile, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use strata_services::NodeSnapshot;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub listen_addr: String,
    pub job_timeout_ms: u64,
    pub jobs_in_flight: usize,
    pub nodes: Vec<NodeSnapshot>,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let coordinator = &state.coordinator;
    Json(StatusResponse {
        listen_addr: coordinator.settings().listen_addr.clone(),
        job_timeout_ms: coordinator.settings().job_timeout_ms,
        jobs_in_flight: coordinator.jobs_in_flight(),
        nodes: coordinator.registry().snapshot(),
    })
}

// ── /reconcile ────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub removed: Vec<String>,
    pub remaining: usize,
}

pub async fn handle_reconcile(State(state): State<ApiState>) -> Json<ReconcileResponse> {
    let removed = state.coordinator.reconcile();
    tracing::info!(removed = removed.len(), "registry reconciled via API");
    Json(ReconcileResponse {
        removed,
        remaining: state.coordinator.registry().len(),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_state;
    use strata_core::wire::Message;
    use strata_services::Transport;

    #[tokio::test]
    async fn status_lists_registered_nodes() {
        let state = test_state();
        let (_far, near) = tokio::io::duplex(64);
        state
            .coordinator
            .handle_registration(&Message::identity("A"), Transport::new(near, "10.0.0.7:4000"))
            .unwrap();

        let Json(resp) = handle_status(State(state)).await;
        assert_eq!(resp.nodes.len(), 1);
        assert_eq!(resp.nodes[0].node_id, "A");
        assert_eq!(resp.nodes[0].peer, "10.0.0.7:4000");
        assert_eq!(resp.jobs_in_flight, 0);
        assert_eq!(resp.job_timeout_ms, 200);
    }

    #[tokio::test]
    async fn reconcile_drops_closed_nodes() {
        let state = test_state();
        let (_far, near) = tokio::io::duplex(64);
        let link = Transport::new(near, "peer");
        state
            .coordinator
            .handle_registration(&Message::identity("A"), link.clone())
            .unwrap();
        link.mark_closed();

        let Json(resp) = handle_reconcile(State(state)).await;
        assert_eq!(resp.removed, ["A"]);
        assert_eq!(resp.remaining, 0);
    }

    #[tokio::test]
    async fn shutdown_signals_subscribers() {
        let state = test_state();
        let mut rx = state.shutdown_tx.subscribe();
        handle_shutdown(State(state)).await;
        assert!(rx.recv().await.is_ok());
    }
}
