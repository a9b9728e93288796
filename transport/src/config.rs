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

//! Handshake configuration handed to the transport engine
//!
//! A [`TransportConfig`] is produced once per connection by the server's
//! configuration factory. Because the authentication callbacks are plain
//! closures they can capture state that belongs to that one connection, e.g.
//! a slot that records the key fingerprint the peer authenticated with.
//!
//! # Example
//!
//! ```
//! use sshmux_transport::{Permissions, TransportConfig};
//!
//! let config = TransportConfig::default()
//!     .with_server_version("SSH-2.0-GitLabShell")
//!     .with_password_callback(|meta, password| {
//!         if meta.user == "git" && password == b"secret" {
//!             Ok(Permissions::default().with_extension("role", "developer"))
//!         } else {
//!             Err("access denied".to_string())
//!         }
//!     });
//! assert!(!config.no_client_auth);
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Default identification string sent by the server
pub const DEFAULT_SERVER_VERSION: &str = "SSH-2.0-sshmux";

/// Default number of authentication attempts per connection
pub const DEFAULT_MAX_AUTH_TRIES: u32 = 6;

/// Result of an authentication callback; `Err` carries the refusal reason
pub type AuthResult = std::result::Result<Permissions, String>;

/// Password authentication callback
pub type PasswordCallback = Arc<dyn Fn(&ConnMetadata, &[u8]) -> AuthResult + Send + Sync>;

/// Public-key authentication callback
pub type PublicKeyCallback = Arc<dyn Fn(&ConnMetadata, &PublicKey) -> AuthResult + Send + Sync>;

/// Metadata about the connection being authenticated
#[derive(Debug, Clone)]
pub struct ConnMetadata {
    /// User name requested by the peer
    pub user: String,
    /// Session identifier negotiated during key exchange
    pub session_id: Bytes,
    /// Identification string sent by the client
    pub client_version: String,
    /// Identification string sent by the server
    pub server_version: String,
    /// Address of the remote end
    pub remote_addr: Option<SocketAddr>,
    /// Address of the local end
    pub local_addr: Option<SocketAddr>,
}

/// A public key offered by the peer, in its wire encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Key algorithm name, e.g. `ssh-ed25519`
    pub algorithm: String,
    /// Encoded public key blob
    pub blob: Bytes,
}

/// A host key the engine signs the key exchange with
///
/// The key material is opaque to this crate; generating and parsing keys is
/// the engine's responsibility.
#[derive(Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key algorithm name, e.g. `ssh-ed25519`
    pub algorithm: String,
    /// Encoded private key material
    pub private_key: Bytes,
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey")
            .field("algorithm", &self.algorithm)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Authorization results attached to an authenticated session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Options the server must enforce (OpenSSH "critical options")
    pub critical_options: HashMap<String, String>,
    /// Free-form values passed from authentication to channel handlers
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    /// Add a critical option
    pub fn with_critical_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.critical_options.insert(key.into(), value.into());
        self
    }

    /// Add an extension
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }
}

/// Handshake configuration for a single connection
#[derive(Clone)]
pub struct TransportConfig {
    /// Identification string announced by the server
    pub server_version: String,
    /// Accept peers without any authentication
    pub no_client_auth: bool,
    /// Maximum number of failed authentication attempts
    pub max_auth_tries: u32,
    /// Host keys used to sign the key exchange
    pub host_keys: Vec<HostKey>,
    /// Password authentication callback
    pub password_callback: Option<PasswordCallback>,
    /// Public-key authentication callback
    pub public_key_callback: Option<PublicKeyCallback>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            no_client_auth: false,
            max_auth_tries: DEFAULT_MAX_AUTH_TRIES,
            host_keys: Vec::new(),
            password_callback: None,
            public_key_callback: None,
        }
    }
}

impl TransportConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server identification string
    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = version.into();
        self
    }

    /// Allow unauthenticated peers
    pub fn with_no_client_auth(mut self, enabled: bool) -> Self {
        self.no_client_auth = enabled;
        self
    }

    /// Set the maximum number of authentication attempts
    pub fn with_max_auth_tries(mut self, tries: u32) -> Self {
        self.max_auth_tries = tries;
        self
    }

    /// Add a host key
    pub fn with_host_key(mut self, key: HostKey) -> Self {
        self.host_keys.push(key);
        self
    }

    /// Set the password authentication callback
    pub fn with_password_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConnMetadata, &[u8]) -> AuthResult + Send + Sync + 'static,
    {
        self.password_callback = Some(Arc::new(callback));
        self
    }

    /// Set the public-key authentication callback
    pub fn with_public_key_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConnMetadata, &PublicKey) -> AuthResult + Send + Sync + 'static,
    {
        self.public_key_callback = Some(Arc::new(callback));
        self
    }

    /// Check whether any authentication method is available
    pub fn has_auth_methods(&self) -> bool {
        self.no_client_auth || self.password_callback.is_some() || self.public_key_callback.is_some()
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("server_version", &self.server_version)
            .field("no_client_auth", &self.no_client_auth)
            .field("max_auth_tries", &self.max_auth_tries)
            .field("host_keys", &self.host_keys)
            .field("password_callback", &self.password_callback.is_some())
            .field("public_key_callback", &self.public_key_callback.is_some())
            .finish()
    }
}
