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

//! Server configuration

use std::time::Duration;

/// Address used when `listen_and_serve` is given an empty address
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:2222";

/// Pause after a failed accept before trying again
pub const DEFAULT_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration
///
/// Timeouts are disabled when `None`. They are applied to every accepted
/// connection through [`crate::TimeoutConn`].
///
/// # Example
///
/// ```
/// use sshmux_service::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_bind_address("127.0.0.1:2022")
///     .with_idle_timeout(Duration::from_secs(600));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind in `listen_and_serve`
    pub bind_address: String,

    /// Maximum time a single read may block
    pub read_timeout: Option<Duration>,

    /// Maximum time a single write may block
    pub write_timeout: Option<Duration>,

    /// Connections with no successful I/O for this long are failed
    ///
    /// Also bounds how long closing a connection may take.
    pub idle_timeout: Option<Duration>,

    /// Pause after a failed accept
    pub accept_backoff: Duration,

    /// Append the panicking stack to panic faults
    ///
    /// Installs a process-wide panic hook the first time a server is built
    /// with this enabled.
    pub capture_panic_stack: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            accept_backoff: DEFAULT_ACCEPT_BACKOFF,
            capture_panic_stack: false,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the given bind address
    ///
    /// All other settings will use their default values.
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Set the read timeout duration
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout duration
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout duration
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the pause after a failed accept
    pub fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }

    /// Record the stack of panicking tasks
    pub fn with_panic_stack_capture(mut self, enabled: bool) -> Self {
        self.capture_panic_stack = enabled;
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.is_empty() {
            return Err("bind_address must not be empty".to_string());
        }

        for (name, timeout) in [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("idle_timeout", self.idle_timeout),
        ] {
            if timeout.is_some_and(|t| t.is_zero()) {
                return Err(format!("{} must be greater than 0 when set", name));
            }
        }

        if self.accept_backoff.is_zero() {
            return Err("accept_backoff must be greater than 0".to_string());
        }

        Ok(())
    }
}
