//! Counters and the point-in-time status snapshot exposed to the host.
//!
//! Counters are advisory: nothing reads them for control decisions
//! except the recovery attempt count.

use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub commands_received: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub events_generated: u64,
    pub clock_errors: u64,
    pub recovery_attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub events_queued: u64,
    pub events_processed: u64,
    pub queue_overflows: u64,
    pub queue_timeouts: u64,
    pub max_event_queue_depth: usize,
}

/// Snapshot handed to the transport layer on demand; it caches and
/// serializes this rather than reaching into live state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub task_state: &'static str,
    pub connection_state: &'static str,
    pub clock_connected: bool,
    pub clock_configured: bool,
    pub transport_connected: bool,
    pub last_error_code: u16,
    pub last_error: String,
    pub command_queue_depth: usize,
    pub event_queue_depth: usize,
    pub response_queue_depth: usize,
    pub queues_healthy: bool,
    pub uptime_ms: u64,
    pub stats: TaskStats,
}
