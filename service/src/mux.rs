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

//! Channel type multiplexer

use crate::{ChannelChain, ChannelHandler, Result, SshdError};
use async_trait::async_trait;
use sshmux_transport::{NewChannel, RejectionReason};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Message sent with offers for unregistered channel types
pub const UNSUPPORTED_CHANNEL_MESSAGE: &str = "unsupported channel type";

/// Routes channel offers to handlers by channel type
///
/// Offers for unregistered types are rejected with
/// [`RejectionReason::UnknownChannelType`].
///
/// # Example
///
/// ```no_run
/// use sshmux_service::{ServeMux, SessionHandler};
///
/// let mux = ServeMux::new();
/// mux.handle("session", SessionHandler::new(|_args: &[String]| Vec::new()));
/// assert!(mux.handler("session").is_some());
/// ```
#[derive(Default)]
pub struct ServeMux {
    handlers: RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
}

impl ServeMux {
    /// Create an empty multiplexer
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a channel type
    ///
    /// # Panics
    ///
    /// Panics if `channel_type` is empty or already registered.
    pub fn handle(&self, channel_type: &str, handler: impl ChannelHandler) {
        if let Err(e) = self.try_handle(channel_type, Arc::new(handler)) {
            panic!("sshd: {}", e);
        }
    }

    /// Register a handler for a channel type, reporting invalid registrations
    pub fn try_handle(&self, channel_type: &str, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        if channel_type.is_empty() {
            return Err(SshdError::Registration("empty channel type".to_string()));
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(channel_type) {
            return Err(SshdError::Registration(format!(
                "multiple registrations for {}",
                channel_type
            )));
        }
        handlers.insert(channel_type.to_string(), handler);
        Ok(())
    }

    /// Register a handler, builder style
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`ServeMux::handle`].
    pub fn with_handler(self, channel_type: &str, handler: impl ChannelHandler) -> Self {
        self.handle(channel_type, handler);
        self
    }

    /// Handler registered for a channel type
    pub fn handler(&self, channel_type: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_type)
            .cloned()
    }

    /// Registered channel types, sorted
    pub fn channel_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[async_trait]
impl ChannelHandler for ServeMux {
    async fn serve_channel(&self, cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()> {
        match self.handler(offer.channel_type()) {
            Some(handler) => handler.serve_channel(cc, offer).await,
            None => {
                debug!(channel_type = offer.channel_type(), "Rejecting unknown channel type");
                offer
                    .reject(RejectionReason::UnknownChannelType, UNSUPPORTED_CHANNEL_MESSAGE)
                    .await?;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeMux")
            .field("channel_types", &self.channel_types())
            .finish()
    }
}
