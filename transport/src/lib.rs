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

//! # sshmux Transport Interface
//!
//! This crate defines the boundary between the sshmux server and the
//! cryptographic transport engine that actually speaks the SSH protocol. The
//! server never touches key exchange, ciphers or packet framing; it hands a
//! raw [`Connection`] and a per-connection [`TransportConfig`] to a
//! [`TransportEngine`] and receives a [`Session`] together with streams of
//! channel offers and global requests.
//!
//! ## Core Components
//!
//! - [`TransportEngine`], [`Session`], [`NewChannel`], [`Channel`] and
//!   [`Request`]: object safe traits an engine implements.
//! - [`TransportConfig`]: handshake configuration, including authentication
//!   callbacks that may capture connection-scoped state.
//! - [`wire`]: the fixed payload layouts of the channel requests the server
//!   framework produces or inspects (`env`, `exec`, `exit-status`, ...).
//! - [`loopback`]: an in-process engine used by tests and demos.
//!
//! ## Usage Example
//!
//! ```rust
//! use sshmux_transport::wire::{EnvRequest, ExitStatus, WireMessage};
//!
//! let payload = ExitStatus { status: 1 }.encode();
//! assert_eq!(&payload[..], &[0, 0, 0, 1]);
//!
//! let env = EnvRequest::decode(&EnvRequest {
//!     name: "LANG".to_string(),
//!     value: "C".to_string(),
//! }.encode()).unwrap();
//! assert_eq!(env.name, "LANG");
//! ```

mod config;
mod connection;
mod engine;
mod error;
pub mod loopback;
pub mod wire;

pub use config::{
    AuthResult, ConnMetadata, DEFAULT_MAX_AUTH_TRIES, DEFAULT_SERVER_VERSION, HostKey,
    PasswordCallback, Permissions, PublicKey, PublicKeyCallback, TransportConfig,
};
pub use connection::{BoxedConnection, Connection};
pub use engine::{
    Channel, Handshake, NewChannel, NewChannels, RejectionReason, Request, Requests, Session,
    TransportEngine,
};
pub use error::{TransportError, TransportResult};
