//! Node registry — the coordinator's view of which compute nodes are live.
//!
//! Shared between every connection task (registration, liveness) and every
//! running job (selection). Keyed on node id; each entry owns the link's
//! write half.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::transport::Transport;

/// Tracked state for a registered node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Stable identity from the node's IDENTITY frame.
    pub node_id: String,

    /// Live link to the node. Shared with the connection task that reads
    /// its results.
    pub transport: Arc<Transport>,

    /// When the IDENTITY handshake completed.
    pub registered_at: Instant,

    /// Last successful send to this node.
    pub last_seen: Instant,
}

/// Point-in-time view of a node, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub peer: String,
    pub connection_id: u64,
    pub connected_secs: u64,
    pub last_seen_secs: u64,
}

/// Concurrent-safe node table.
///
/// Every operation works on whole entries under the map's shard locks, so no
/// caller can observe a half-inserted or half-removed node. The raw map is
/// never handed out.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, NodeEntry>>,
    cursor: Arc<AtomicUsize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `node_id`. Last writer wins; the
    /// replaced entry, if any, is returned so the caller can log it.
    pub fn register(&self, node_id: &str, transport: Arc<Transport>) -> Option<NodeEntry> {
        let now = Instant::now();
        self.nodes.insert(
            node_id.to_string(),
            NodeEntry {
                node_id: node_id.to_string(),
                transport,
                registered_at: now,
                last_seen: now,
            },
        )
    }

    pub fn get(&self, node_id: &str) -> Option<NodeEntry> {
        self.nodes.get(node_id).map(|e| e.value().clone())
    }

    /// Pick the next node for a unit of work.
    ///
    /// Candidates are entries with an open transport whose id is not in
    /// `exclude`, ordered by node id. The shared cursor walks that list, so
    /// a stable membership is served in strict round-robin order. Returns
    /// `None` when no candidate is left.
    pub fn select(&self, exclude: &HashSet<String>) -> Option<NodeEntry> {
        let mut live: Vec<NodeEntry> = self
            .nodes
            .iter()
            .filter(|e| !e.value().transport.is_closed() && !exclude.contains(e.key()))
            .map(|e| e.value().clone())
            .collect();
        if live.is_empty() {
            return None;
        }
        live.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(live.swap_remove(turn % live.len()))
    }

    /// Record a successful send.
    pub fn touch(&self, node_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Remove every entry whose transport is closed. Returns the removed ids.
    pub fn sweep(&self) -> Vec<String> {
        let mut removed = Vec::new();
        self.nodes.retain(|node_id, entry| {
            if entry.transport.is_closed() {
                removed.push(node_id.clone());
                false
            } else {
                true
            }
        });
        removed.sort();
        removed
    }

    /// Registered ids, sorted.
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<NodeSnapshot> = self
            .nodes
            .iter()
            .map(|e| {
                let entry = e.value();
                NodeSnapshot {
                    node_id: entry.node_id.clone(),
                    peer: entry.transport.peer().to_string(),
                    connection_id: entry.transport.id(),
                    connected_secs: entry.registered_at.elapsed().as_secs(),
                    last_seen_secs: entry.last_seen.elapsed().as_secs(),
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
