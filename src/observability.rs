use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Counters for workflow host activity
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    pub instances_scheduled: AtomicU64,
    pub instances_completed: AtomicU64,
    pub instances_failed: AtomicU64,
    pub instances_terminated: AtomicU64,
    pub activity_executions: AtomicU64,
    pub activity_replays: AtomicU64,
    pub activity_failures: AtomicU64,
    pub events_raised: AtomicU64,
    pub approval_timeouts: AtomicU64,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduled(&self) {
        self.instances_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.instances_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.instances_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminated(&self) {
        self.instances_terminated.fetch_add(1, Ordering::Relaxed);
        warn!("Workflow instance terminated by host");
    }

    pub fn record_activity_execution(&self) {
        self.activity_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_replay(&self) {
        self.activity_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_failure(&self) {
        self.activity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_raised(&self) {
        self.events_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_timeout(&self) {
        self.approval_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> WorkflowStats {
        WorkflowStats {
            instances_scheduled: self.instances_scheduled.load(Ordering::Relaxed),
            instances_completed: self.instances_completed.load(Ordering::Relaxed),
            instances_failed: self.instances_failed.load(Ordering::Relaxed),
            instances_terminated: self.instances_terminated.load(Ordering::Relaxed),
            activity_executions: self.activity_executions.load(Ordering::Relaxed),
            activity_replays: self.activity_replays.load(Ordering::Relaxed),
            activity_failures: self.activity_failures.load(Ordering::Relaxed),
            events_raised: self.events_raised.load(Ordering::Relaxed),
            approval_timeouts: self.approval_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            scheduled = stats.instances_scheduled,
            completed = stats.instances_completed,
            failed = stats.instances_failed,
            terminated = stats.instances_terminated,
            activity_executions = stats.activity_executions,
            activity_replays = stats.activity_replays,
            activity_failures = stats.activity_failures,
            events_raised = stats.events_raised,
            approval_timeouts = stats.approval_timeouts,
            "Workflow host metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStats {
    pub instances_scheduled: u64,
    pub instances_completed: u64,
    pub instances_failed: u64,
    pub instances_terminated: u64,
    pub activity_executions: u64,
    pub activity_replays: u64,
    pub activity_failures: u64,
    pub events_raised: u64,
    pub approval_timeouts: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
