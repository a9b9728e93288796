//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Lock-free metrics for the SSH server
//!
//! Counters are kept as atomics for [`ServerMetrics::snapshot`] and are also
//! published through the `metrics` facade under the `sshmux.` prefix.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free server metrics
///
/// All metrics are stored as atomics and can be accessed concurrently
/// without locks. Use the `snapshot()` method to get a consistent view
/// of all metrics at a point in time.
#[derive(Debug)]
pub struct ServerMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,

    // Channels
    channels_opened: AtomicU64,

    // Errors
    accept_errors: AtomicU64,
    handshake_failures: AtomicU64,
    channel_errors: AtomicU64,
    panics: AtomicU64,

    // Timing (stored as nanoseconds)
    total_connection_duration_ns: AtomicU64,

    // Server start time
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            channel_errors: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            total_connection_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Connection tracking

    /// Record a new connection being accepted
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        counter!("sshmux.connections.total").increment(1);
        gauge!("sshmux.connections.active").increment(1.0);
    }

    /// Record a connection being closed
    pub fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.total_connection_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        gauge!("sshmux.connections.active").decrement(1.0);
    }

    /// Get the current number of active connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the total number of connections since server start
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Record a channel offer handed to the channel handler
    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
        counter!("sshmux.channels.total").increment(1);
    }

    // Error tracking

    /// Record a failed accept
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
        counter!("sshmux.accept.errors").increment(1);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
        counter!("sshmux.handshake.failures").increment(1);
    }

    /// Record a channel handler error
    pub fn channel_error(&self) {
        self.channel_errors.fetch_add(1, Ordering::Relaxed);
        counter!("sshmux.channels.errors").increment(1);
    }

    /// Record a panic caught by a task barrier
    pub fn panic_caught(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
        counter!("sshmux.tasks.panics").increment(1);
    }

    // Snapshot

    /// Get a snapshot of all metrics
    ///
    /// The snapshot may be slightly inconsistent while metrics are being
    /// updated concurrently.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            channel_errors: self.channel_errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_connection_duration: self.average_connection_duration(),
        }
    }

    fn average_connection_duration(&self) -> Duration {
        let total = self.total_connections.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_connection_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / total)
    }
}

/// A snapshot of server metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total connections since server start
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Channel offers dispatched
    pub channels_opened: u64,
    /// Failed accepts
    pub accept_errors: u64,
    /// Failed handshakes
    pub handshake_failures: u64,
    /// Channel handler errors
    pub channel_errors: u64,
    /// Panics caught by task barriers
    pub panics: u64,
    /// Server uptime
    pub uptime: Duration,
    /// Average connection duration
    pub avg_connection_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.accept_errors + self.handshake_failures + self.channel_errors + self.panics
    }
}
