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

//! Connection registry
//!
//! The ConnectionManager tracks every connection from accept until its task
//! finishes:
//! - Allocating connection ids
//! - Lifecycle state (handshaking, active, draining)
//! - Per-connection counters for snapshots
//! - Feeding connection metrics

use crate::{ConnectionId, ConnectionInfo, ConnectionState, ServerMetrics};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;
use tracing::trace;

/// Managed connection entry
struct ManagedConnection {
    /// Connection ID
    id: ConnectionId,
    /// Remote address, updated after PROXY decoding
    peer_addr: Mutex<Option<SocketAddr>>,
    /// Current state (atomic for lock-free access)
    state: AtomicU8,
    /// Authenticated user
    user: OnceLock<String>,
    /// Channel offers dispatched
    channels: AtomicU64,
    /// When the connection was accepted
    created_at: Instant,
}

impl ManagedConnection {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state(),
            peer_addr: *self.peer_addr.lock().unwrap_or_else(PoisonError::into_inner),
            user: self.user.get().cloned(),
            created_at: self.created_at,
            channels: self.channels.load(Ordering::Relaxed),
        }
    }
}

/// Connection manager
pub struct ConnectionManager {
    /// Live connections (lock-free concurrent map)
    connections: DashMap<ConnectionId, ManagedConnection>,
    /// Next connection ID (monotonically increasing)
    next_id: AtomicU64,
    /// Server metrics
    metrics: Arc<ServerMetrics>,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Register a freshly accepted connection
    pub fn register(&self, peer_addr: Option<SocketAddr>) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ManagedConnection {
                id,
                peer_addr: Mutex::new(peer_addr),
                state: AtomicU8::new(ConnectionState::Handshaking.as_u8()),
                user: OnceLock::new(),
                channels: AtomicU64::new(0),
                created_at: Instant::now(),
            },
        );
        self.metrics.connection_opened();
        trace!(connection = %id, "Connection registered");
        id
    }

    /// Update the lifecycle state of a connection
    pub fn set_state(&self, id: ConnectionId, state: ConnectionState) {
        if let Some(conn) = self.connections.get(&id) {
            conn.state.store(state.as_u8(), Ordering::Release);
        }
    }

    /// Update the remote address of a connection
    pub fn set_peer_addr(&self, id: ConnectionId, peer_addr: Option<SocketAddr>) {
        if let Some(conn) = self.connections.get(&id) {
            *conn.peer_addr.lock().unwrap_or_else(PoisonError::into_inner) = peer_addr;
        }
    }

    /// Mark the handshake as complete
    pub fn activate(&self, id: ConnectionId, user: &str) {
        if let Some(conn) = self.connections.get(&id) {
            let _ = conn.user.set(user.to_string());
            conn.state
                .store(ConnectionState::Active.as_u8(), Ordering::Release);
        }
    }

    /// Record a channel offer on a connection
    pub fn channel_opened(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.get(&id) {
            conn.channels.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.channel_opened();
    }

    /// Remove a finished connection
    ///
    /// Returns `false` if the connection was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, conn)) => {
                conn.state
                    .store(ConnectionState::Closed.as_u8(), Ordering::Release);
                self.metrics.connection_closed(conn.created_at.elapsed());
                trace!(connection = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Get connection info
    pub fn get_connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|conn| conn.info())
    }

    /// Get all connection IDs
    pub fn get_connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Get info for all connections
    pub fn get_all_connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Get the number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Server metrics
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }
}
