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

//! Error types for the SSH server

use sshmux_transport::TransportError;
use thiserror::Error;

/// Result type for operations
pub type Result<T> = std::result::Result<T, SshdError>;

/// SSH server error types
#[derive(Debug, Error)]
pub enum SshdError {
    /// I/O error from the listener or a connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the transport engine
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server was shut down; returned by `serve` on graceful termination
    #[error("sshd: server closed")]
    ServerClosed,

    /// Graceful shutdown did not finish before its deadline
    #[error("Shutdown deadline exceeded")]
    DeadlineExceeded,

    /// A channel handler could not be registered
    #[error("Invalid registration: {0}")]
    Registration(String),

    /// The operation needs an accepted channel
    #[error("Channel not accepted")]
    ChannelNotAccepted,

    /// A command step failed; the pipeline was aborted
    #[error("Command step {step} failed: {source}")]
    CommandFailed {
        /// Zero based index of the failing step
        step: usize,
        /// The step's error
        #[source]
        source: Box<SshdError>,
    },

    /// A task panicked and was terminated
    #[error("Task panicked: {0}")]
    Panic(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error with a message
    #[error("{0}")]
    Other(String),
}

impl SshdError {
    /// Check if this is the graceful termination condition
    pub fn is_server_closed(&self) -> bool {
        matches!(self, SshdError::ServerClosed)
    }

    /// Check if a shutdown ran out of time
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, SshdError::DeadlineExceeded)
    }

    /// Check if the error is recoverable
    ///
    /// Recoverable errors affect a single connection or channel; the server
    /// keeps running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SshdError::Io(_)
                | SshdError::Transport(_)
                | SshdError::ChannelNotAccepted
                | SshdError::CommandFailed { .. }
                | SshdError::Panic(_)
                | SshdError::Other(_)
        )
    }

    /// Check if the error means a channel or session was already closed
    pub fn is_closed(&self) -> bool {
        match self {
            SshdError::Transport(e) => e.is_closed(),
            SshdError::CommandFailed { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}
