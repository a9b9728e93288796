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

//! Per-connection context
//!
//! A [`ConnContext`] is created for every accepted connection and shared by
//! the configuration factory, every channel chain and every handler on that
//! connection. Clones share the same value bag and cancellation token.

use crate::ConnectionId;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

type ValueBag = Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>;

/// Lifecycle context of one connection
#[derive(Clone)]
pub struct ConnContext {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    cancellation: CancellationToken,
    values: ValueBag,
}

impl ConnContext {
    /// Create a context for a connection
    pub fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            cancellation,
            values: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connection the context belongs to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address after PROXY decoding and connection callbacks
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address of the connection
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Token cancelled when the server shuts down
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check whether the server is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait until the server is shutting down
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Store a value on the connection
    ///
    /// # Example
    /// ```
    /// # use sshmux_service::{ConnContext, ConnectionId};
    /// # use tokio_util::sync::CancellationToken;
    /// let ctx = ConnContext::new(ConnectionId::new(1), None, None, CancellationToken::new());
    /// ctx.set_data("tenant", "acme".to_string());
    /// assert_eq!(ctx.get_data::<String>("tenant").as_deref(), Some("acme"));
    /// ```
    pub fn set_data<T: Any + Send + Sync + Clone>(&self, key: &str, value: T) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Box::new(value));
    }

    /// Retrieve a value
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get_data<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove a value
    ///
    /// Returns `true` if the key existed and was removed.
    pub fn remove_data(&self, key: &str) -> bool {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Check if a value exists for a key
    pub fn has_data(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .values
            .read()
            .map(|values| values.len())
            .unwrap_or_default();
        f.debug_struct("ConnContext")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("values", &keys)
            .finish()
    }
}
