//! HTTP API handlers — exposes coordinator state and job submission as JSON.

pub mod jobs;
pub mod status;

use std::sync::Arc;

use strata_services::Coordinator;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    /// Fires the daemon-wide shutdown broadcast.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// Re-export handler functions for use in router setup.
pub use jobs::handle_submit_job;
pub use status::{handle_reconcile, handle_shutdown, handle_status};

#[cfg(test)]
pub(crate) fn test_state() -> ApiState {
    let settings = strata_core::config::CoordinatorSettings {
        job_timeout_ms: 200,
        ..Default::default()
    };
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    ApiState {
        coordinator: Coordinator::new(settings),
        shutdown_tx,
    }
}
