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

//! Transport engine interface
//!
//! The engine owns everything on the wire: key exchange, encryption, framing
//! and channel bookkeeping. The server only sees the objects defined here.
//!
//! ```text
//! TransportEngine::handshake(conn, config)
//!     ↓
//! Handshake { session, channels, requests }
//!     ↓                 ↓            ↓
//!  Session        NewChannel     Request (global)
//!                     ↓
//!             accept() → (Channel, Requests)
//! ```

use crate::{BoxedConnection, Permissions, TransportConfig, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Stream of channel offers for one session
pub type NewChannels = BoxStream<'static, Box<dyn NewChannel>>;

/// Stream of requests, either session-global or for one channel
pub type Requests = BoxStream<'static, Box<dyn Request>>;

/// Reason code sent when a channel offer is refused (RFC 4254 §5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RejectionReason {
    /// Administratively prohibited
    Prohibited = 1,
    /// Connection to the target failed
    ConnectionFailed = 2,
    /// The channel type is not supported
    UnknownChannelType = 3,
    /// Not enough resources to open the channel
    ResourceShortage = 4,
}

impl RejectionReason {
    /// Convert from the wire code
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Prohibited),
            2 => Some(Self::ConnectionFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Convert to the wire code
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prohibited => write!(f, "administratively prohibited"),
            Self::ConnectionFailed => write!(f, "connect failed"),
            Self::UnknownChannelType => write!(f, "unknown channel type"),
            Self::ResourceShortage => write!(f, "resource shortage"),
        }
    }
}

/// The outcome of a successful handshake
pub struct Handshake {
    /// The negotiated session
    pub session: Arc<dyn Session>,
    /// Channels the peer offers over the lifetime of the session
    pub channels: NewChannels,
    /// Connection-level (global) requests
    pub requests: Requests,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("user", &self.session.user())
            .finish_non_exhaustive()
    }
}

/// A protocol engine capable of turning a raw connection into a session
#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    /// Perform the protocol handshake over `conn` using `config`
    ///
    /// The engine takes ownership of the connection; it is released again
    /// when [`Session::close`] is called or the peer disconnects.
    async fn handshake(
        &self,
        conn: BoxedConnection,
        config: Arc<TransportConfig>,
    ) -> TransportResult<Handshake>;
}

/// An authenticated session
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Authenticated user name
    fn user(&self) -> &str;

    /// Session identifier negotiated during key exchange
    fn session_id(&self) -> &[u8];

    /// Identification string sent by the client
    fn client_version(&self) -> &str;

    /// Identification string sent by the server
    fn server_version(&self) -> &str;

    /// Address of the remote end
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Address of the local end
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Permissions returned by the authentication callback
    fn permissions(&self) -> &Permissions;

    /// Close the session and the underlying connection
    async fn close(&self) -> TransportResult<()>;
}

/// A channel offered by the peer that has not been accepted yet
#[async_trait]
pub trait NewChannel: Send + 'static {
    /// Channel type, e.g. `session` or `direct-tcpip`
    fn channel_type(&self) -> &str;

    /// Type specific data sent with the offer
    fn extra_data(&self) -> &[u8];

    /// Accept the offer
    async fn accept(self: Box<Self>) -> TransportResult<(Box<dyn Channel>, Requests)>;

    /// Refuse the offer with a reason code and message
    async fn reject(self: Box<Self>, reason: RejectionReason, message: &str) -> TransportResult<()>;
}

/// An accepted channel
///
/// The primary data stream is the channel itself; the extended (stderr)
/// stream is available through [`Channel::stderr`].
#[async_trait]
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Writer for the extended data (stderr) stream
    fn stderr(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);

    /// Send a channel request to the peer
    ///
    /// Returns the peer's answer when `want_reply` is set, `true` otherwise.
    async fn send_request(&mut self, name: &str, want_reply: bool, payload: Bytes) -> TransportResult<bool>;

    /// Close the channel
    ///
    /// Closing a channel twice fails with [`crate::TransportError::ChannelClosed`].
    async fn close(&mut self) -> TransportResult<()>;

    /// Check whether the channel has been closed locally
    fn is_closed(&self) -> bool;
}

/// A request received from the peer
#[async_trait]
pub trait Request: Send + Sync + 'static {
    /// Request type, e.g. `exec` or `env`
    fn request_type(&self) -> &str;

    /// Whether the peer waits for an answer
    fn want_reply(&self) -> bool;

    /// Raw request payload
    fn payload(&self) -> &[u8];

    /// Answer the request; a no-op when no reply was requested
    async fn reply(self: Box<Self>, ok: bool, payload: Bytes) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reason_conversion() {
        for reason in [
            RejectionReason::Prohibited,
            RejectionReason::ConnectionFailed,
            RejectionReason::UnknownChannelType,
            RejectionReason::ResourceShortage,
        ] {
            assert_eq!(RejectionReason::from_u32(reason.as_u32()), Some(reason));
        }
        assert_eq!(RejectionReason::from_u32(0), None);
        assert_eq!(RejectionReason::from_u32(5), None);
    }
}
