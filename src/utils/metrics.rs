//! Observability counters
//!
//! One [`Metrics`] instance is owned by each server and shared with its connection
//! supervisors through an `Arc`. Counters are relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for one controller instance
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Connections that completed Register/Hello/Auth
    pub handshakes_success: AtomicU64,
    /// Rejected Auth attempts
    pub auth_failures: AtomicU64,
    /// Non-handshake messages rejected before authentication
    pub unauthenticated_rejections: AtomicU64,
    /// Frames written
    pub frames_sent: AtomicU64,
    /// Frames read
    pub frames_received: AtomicU64,
    /// Commands accepted into the pending queue
    pub commands_enqueued: AtomicU64,
    /// Commands written to an agent
    pub commands_delivered: AtomicU64,
    /// Malformed frames, decryption failures, bad JSON
    pub protocol_errors: AtomicU64,
    /// Read/write failures
    pub connection_errors: AtomicU64,
    /// Identity store writes that failed to reach disk
    pub persistence_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a zeroed collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            unauthenticated_rejections: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            commands_enqueued: AtomicU64::new(0),
            commands_delivered: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unauthenticated_rejection(&self) {
        self.unauthenticated_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_enqueued(&self) {
        self.commands_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_delivered(&self) {
        self.commands_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            unauthenticated_rejections: self.unauthenticated_rejections.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            commands_enqueued: self.commands_enqueued.load(Ordering::Relaxed),
            commands_delivered: self.commands_delivered.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            handshakes_success = s.handshakes_success,
            auth_failures = s.auth_failures,
            unauthenticated_rejections = s.unauthenticated_rejections,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            commands_enqueued = s.commands_enqueued,
            commands_delivered = s.commands_delivered,
            protocol_errors = s.protocol_errors,
            connection_errors = s.connection_errors,
            persistence_errors = s.persistence_errors,
            uptime_seconds = s.uptime_seconds,
            "Controller metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_success: u64,
    pub auth_failures: u64,
    pub unauthenticated_rejections: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub commands_enqueued: u64,
    pub commands_delivered: u64,
    pub protocol_errors: u64,
    pub connection_errors: u64,
    pub persistence_errors: u64,
    pub uptime_seconds: u64,
}
