//! Coordinator status, reconcile, and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    listen_addr: String,
    job_timeout_ms: u64,
    jobs_in_flight: usize,
    nodes: Vec<NodeInfo>,
}

#[derive(Deserialize)]
struct NodeInfo {
    node_id: String,
    peer: String,
    connection_id: u64,
    connected_secs: u64,
    last_seen_secs: u64,
}

#[derive(Deserialize)]
struct ReconcileResponse {
    removed: Vec<String>,
    remaining: usize,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;
    print!("{}", render_status(&resp));
    Ok(())
}

fn render_status(resp: &StatusResponse) -> String {
    let mut out = String::new();
    out.push_str("═══════════════════════════════════════\n");
    out.push_str("  Strata Coordinator Status\n");
    out.push_str("═══════════════════════════════════════\n");
    out.push_str(&format!("  Listening on   : {}\n", resp.listen_addr));
    out.push_str(&format!("  Job timeout    : {} ms\n", resp.job_timeout_ms));
    out.push_str(&format!("  Jobs in flight : {}\n", resp.jobs_in_flight));
    out.push_str(&format!("  Nodes          : {}\n", resp.nodes.len()));

    if resp.nodes.is_empty() {
        out.push_str("\n  No compute nodes connected.\n");
    } else {
        out.push_str("\n  Nodes:\n");
        for n in &resp.nodes {
            out.push_str(&format!("  ┌─ {}\n", n.node_id));
            out.push_str(&format!("  │  peer      : {}\n", n.peer));
            out.push_str(&format!("  │  link      : #{}\n", n.connection_id));
            out.push_str(&format!("  │  connected : {}s\n", n.connected_secs));
            out.push_str(&format!("  └─ last sent : {}s ago\n", n.last_seen_secs));
        }
    }
    out
}

pub async fn cmd_reconcile(port: u16) -> Result<()> {
    let resp: ReconcileResponse = post_json(&format!("{}/reconcile", base_url(port))).await?;

    if resp.removed.is_empty() {
        println!("No dead nodes. {} node(s) registered.", resp.remaining);
    } else {
        println!(
            "Removed {} dead node(s): {}",
            resp.removed.len(),
            resp.removed.join(", ")
        );
        println!("{} node(s) remain.", resp.remaining);
    }
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
