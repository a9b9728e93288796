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

//! Core types for the SSH server

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state (stored as atomic u8 for lock-free state management)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted; PROXY decoding and the protocol handshake are in progress
    Handshaking = 0,
    /// Handshake complete, channel offers are being served
    Active = 1,
    /// No more channel offers; waiting for channel tasks to finish
    Draining = 2,
    /// Connection is closed
    Closed = 3,
}

impl ConnectionState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the connection is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }

    /// Check if the connection is serving channels
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshaking => write!(f, "handshaking"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Connection information snapshot (for non-blocking queries)
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Current state
    pub state: ConnectionState,
    /// Peer address, when the transport has one
    pub peer_addr: Option<SocketAddr>,
    /// Authenticated user, once the handshake has completed
    pub user: Option<String>,
    /// When the connection was accepted
    pub created_at: Instant,
    /// Channels accepted or rejected on this connection
    pub channels: u64,
}

impl ConnectionInfo {
    /// Get the connection duration
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Server snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Number of live connections
    pub active_connections: usize,
    /// Total connections since server start
    pub total_connections: u64,
    /// Address of the most recent listener, if any
    pub bind_address: Option<SocketAddr>,
    /// Server uptime
    pub uptime: Duration,
    /// Server start time
    pub started_at: Instant,
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self
            .bind_address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "SshServer {{ active: {}, total: {}, addr: {}, uptime: {:?} }}",
            self.active_connections, self.total_connections, addr, self.uptime
        )
    }
}
