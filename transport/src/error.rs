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

//! Error types for the transport layer

use crate::engine::RejectionReason;
use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by a transport engine or by payload decoding
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol negotiation failed before a session was established
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The peer could not be authenticated
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A request or message payload did not match its wire format
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The channel has already been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// A channel offer was rejected by the remote side
    #[error("Channel rejected ({reason}): {message}")]
    Rejected {
        /// Protocol level rejection reason
        reason: RejectionReason,
        /// Human readable description sent with the rejection
        message: String,
    },

    /// The session (transport connection) has been closed
    #[error("Session closed")]
    SessionClosed,
}

impl TransportError {
    /// Check if the error is caused by something that is already closed
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TransportError::ChannelClosed | TransportError::SessionClosed
        )
    }
}
