// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `side`: local, remote
//! - `command`: create, update, delete, add, remove
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Set current cache size in bytes
pub fn set_cache_bytes(bytes: usize) {
    gauge!("offline_sync_cache_bytes").set(bytes as f64);
}

/// Record eviction event
pub fn record_eviction(count: usize, bytes: usize) {
    counter!("offline_sync_evictions_total").increment(count as u64);
    counter!("offline_sync_evicted_bytes_total").increment(bytes as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a mutation against the local or remote backend
pub fn record_operation(side: &str, command: &str, status: &str) {
    counter!(
        "offline_sync_operations_total",
        "side" => side.to_string(),
        "command" => command.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the duration of a remote replay call
pub fn record_replay_latency(command: &str, duration: Duration) {
    histogram!(
        "offline_sync_replay_seconds",
        "command" => command.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set number of commands waiting in the durable log
pub fn set_queue_depth(depth: usize) {
    gauge!("offline_sync_queue_depth").set(depth as f64);
}

/// Record a client id rewritten to a server id
pub fn record_id_remap(rewritten_commands: usize) {
    counter!("offline_sync_id_remaps_total").increment(1);
    counter!("offline_sync_rewritten_commands_total").increment(rewritten_commands as u64);
}

/// Record the drain loop giving up on the head command
pub fn record_stall(command: &str) {
    counter!(
        "offline_sync_stalls_total",
        "command" => command.to_string()
    )
    .increment(1);
}

/// Record a reconciliation pass
pub fn record_resync(added: usize, removed: usize, updated: usize) {
    counter!("offline_sync_resyncs_total").increment(1);
    counter!("offline_sync_resync_items_total", "delta" => "added").increment(added as u64);
    counter!("offline_sync_resync_items_total", "delta" => "removed").increment(removed as u64);
    counter!("offline_sync_resync_items_total", "delta" => "updated").increment(updated as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// PUSH SYNC
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of addresses with live subscribers
pub fn set_tracked_addresses(count: usize) {
    gauge!("offline_sync_tracked_addresses").set(count as f64);
}

/// Record an inbound push event
pub fn record_push(kind: &str, delivered: usize) {
    counter!(
        "offline_sync_push_events_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!("offline_sync_push_deliveries_total").increment(delivered as u64);
}

/// Record a push channel control message failure
pub fn record_channel_error(message: &str) {
    counter!(
        "offline_sync_channel_errors_total",
        "message" => message.to_string()
    )
    .increment(1);
}
