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

//! # sshmux Service
//!
//! An async multiplexed SSH session server. The cryptographic transport is
//! pluggable through [`sshmux_transport::TransportEngine`]; this crate owns
//! everything around it: accepting connections, deadlines, per-connection
//! configuration, channel routing, request dispatch and command pipelines.
//!
//! # Architecture
//!
//! ```text
//! SshServer (accept loop, shutdown)
//!     ↓ one task per connection
//! ConnectionWorker → TimeoutConn → TransportEngine::handshake
//!     ↓ one task per channel offer
//! ChannelChain → ServeMux → SessionHandler
//!                              ↓ exec / shell / subsystem
//!                           CommandHandler → next() → CommandHandler ...
//! ```
//!
//! Connections and channels are isolated from each other: a panic in a
//! handler ends only its own task and is reported through `tracing` and the
//! optional error logger.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use sshmux_service::{
//!     ChannelChain, CommandHandler, Result, ServeMux, SessionHandler, SshServer,
//! };
//! use sshmux_transport::TransportConfig;
//! use sshmux_transport::loopback::LoopbackEngine;
//! use std::sync::Arc;
//! use tokio::io::AsyncWriteExt;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl CommandHandler for Hello {
//!     async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
//!         let user = cc.user().to_string();
//!         cc.stdout()?.write_all(format!("hello {}\n", user).as_bytes()).await?;
//!         cc.exit(0).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mux = ServeMux::new();
//!     mux.handle(
//!         "session",
//!         SessionHandler::new(|_args: &[String]| vec![Arc::new(Hello) as Arc<dyn CommandHandler>]),
//!     );
//!
//!     let server = SshServer::builder(Arc::new(LoopbackEngine::new()), mux)
//!         .with_config_factory(|_ctx| TransportConfig::default().with_no_client_auth(true))
//!         .build();
//!     server.listen_and_serve("127.0.0.1:2222").await
//! }
//! ```

mod chain;
mod config;
mod conn;
mod context;
mod error;
mod fault;
mod handler;
mod listener;
mod manager;
mod metrics;
mod mux;
mod server;
mod session;
mod types;
mod worker;

pub use chain::{ChannelChain, DEFAULT_REQUEST_HANDLER, PipelineState, RequestHandlers};
pub use config::{DEFAULT_ACCEPT_BACKOFF, DEFAULT_BIND_ADDRESS, ServerConfig};
pub use conn::{MAX_IDLE_TIMEOUT, TimeoutConn};
pub use context::ConnContext;
pub use error::{Result, SshdError};
pub use fault::{ErrorLogger, FaultKind, MAX_PANIC_INFO_SIZE, ServerFault};
pub use handler::{
    ChannelHandler, ChannelHandlerFn, CommandHandler, CommandHandlerFn, RequestHandler,
    RequestHandlerFn,
};
pub use listener::{Listener, MAX_PROXY_V1_HEADER, ProxyDecoder, ProxyV1Decoder};
pub use manager::ConnectionManager;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use mux::{ServeMux, UNSUPPORTED_CHANNEL_MESSAGE};
pub use server::{
    ConfigFactory, ConnCallback, ConnContextHook, ServerBuilder, SshServer,
    default_config_factory, listen_and_serve, serve,
};
pub use session::{CommandRouter, SessionHandler};
pub use types::{ConnectionId, ConnectionInfo, ConnectionState, ServerSnapshot};
