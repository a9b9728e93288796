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

//! SSH server implementation
//!
//! The SshServer is the main entry point. It accepts connections from a
//! [`Listener`], hands each one to a connection worker on its own task, and
//! coordinates graceful shutdown.
//!
//! ```text
//! serve(listener)
//!     ↓ accept (100ms back-off on errors)
//! connection task: PROXY → callback → context → TimeoutConn → config → handshake
//!     ↓ per channel offer
//! channel task: ChannelChain::dispatch → ChannelHandler
//! ```

use crate::fault::{ErrorLogger, FaultKind, FaultReporter, ServerFault, install_panic_hook};
use crate::worker::ConnectionWorker;
use crate::{
    ChannelHandler, ConnContext, ConnectionManager, Listener, ProxyDecoder, Result, ServerConfig,
    ServerMetrics, ServerSnapshot, SshdError,
};
use sshmux_transport::{BoxedConnection, Connection, TransportConfig, TransportEngine};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Builds the transport configuration for each connection
///
/// Called once per connection after the context hook, so authentication
/// callbacks can capture connection-scoped state.
pub type ConfigFactory = Arc<dyn Fn(&ConnContext) -> TransportConfig + Send + Sync>;

/// Transforms a raw connection before the handshake
pub type ConnCallback = Arc<dyn Fn(BoxedConnection) -> BoxedConnection + Send + Sync>;

/// Derives the connection context from the connection
pub type ConnContextHook = Arc<dyn Fn(&dyn Connection, ConnContext) -> ConnContext + Send + Sync>;

/// A factory returning the default transport configuration
pub fn default_config_factory() -> ConfigFactory {
    Arc::new(|_ctx: &ConnContext| TransportConfig::default())
}

/// State shared by the server handle and its connection tasks
pub(crate) struct ServerInner {
    pub(crate) engine: Arc<dyn TransportEngine>,
    pub(crate) config: ServerConfig,
    pub(crate) config_factory: ConfigFactory,
    pub(crate) handler: Arc<dyn ChannelHandler>,
    pub(crate) conn_callback: Option<ConnCallback>,
    pub(crate) conn_context: Option<ConnContextHook>,
    pub(crate) proxy: Option<Arc<dyn ProxyDecoder>>,
    pub(crate) reporter: FaultReporter,
    pub(crate) manager: ConnectionManager,
    pub(crate) cancellation: CancellationToken,
    pub(crate) tracker: TaskTracker,
    listeners: watch::Sender<usize>,
    bind_address: Mutex<Option<SocketAddr>>,
    started_at: Instant,
}

/// Builder for [`SshServer`]
///
/// # Example
///
/// ```no_run
/// use sshmux_service::{ServeMux, SshServer};
/// use sshmux_transport::TransportConfig;
/// use sshmux_transport::loopback::LoopbackEngine;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let server = SshServer::builder(Arc::new(LoopbackEngine::new()), ServeMux::new())
///     .with_idle_timeout(Duration::from_secs(300))
///     .with_config_factory(|_ctx| TransportConfig::default().with_no_client_auth(true))
///     .build();
/// ```
pub struct ServerBuilder {
    engine: Arc<dyn TransportEngine>,
    handler: Arc<dyn ChannelHandler>,
    config: ServerConfig,
    config_factory: ConfigFactory,
    conn_callback: Option<ConnCallback>,
    conn_context: Option<ConnContextHook>,
    proxy: Option<Arc<dyn ProxyDecoder>>,
    error_logger: Option<ErrorLogger>,
}

impl ServerBuilder {
    /// Create a builder with default configuration
    pub fn new(engine: Arc<dyn TransportEngine>, handler: impl ChannelHandler) -> Self {
        Self {
            engine,
            handler: Arc::new(handler),
            config: ServerConfig::default(),
            config_factory: default_config_factory(),
            conn_callback: None,
            conn_context: None,
            proxy: None,
            error_logger: None,
        }
    }

    /// Replace the server configuration
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the read timeout of every connection
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout of every connection
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout of every connection
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Set the per-connection transport configuration factory
    pub fn with_config_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ConnContext) -> TransportConfig + Send + Sync + 'static,
    {
        self.config_factory = Arc::new(factory);
        self
    }

    /// Transform every raw connection before the handshake
    pub fn with_conn_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(BoxedConnection) -> BoxedConnection + Send + Sync + 'static,
    {
        self.conn_callback = Some(Arc::new(callback));
        self
    }

    /// Derive the context of every connection
    pub fn with_conn_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn Connection, ConnContext) -> ConnContext + Send + Sync + 'static,
    {
        self.conn_context = Some(Arc::new(hook));
        self
    }

    /// Decode a PROXY protocol header on every connection
    pub fn with_proxy_protocol(mut self, decoder: impl ProxyDecoder) -> Self {
        self.proxy = Some(Arc::new(decoder));
        self
    }

    /// Receive every fault the server logs
    pub fn with_error_logger<F>(mut self, logger: F) -> Self
    where
        F: Fn(&ServerFault) + Send + Sync + 'static,
    {
        self.error_logger = Some(Arc::new(logger));
        self
    }

    /// Build the server
    pub fn build(self) -> SshServer {
        if self.config.capture_panic_stack {
            install_panic_hook();
        }
        let (listeners, _) = watch::channel(0);
        SshServer {
            inner: Arc::new(ServerInner {
                engine: self.engine,
                config: self.config,
                config_factory: self.config_factory,
                handler: self.handler,
                conn_callback: self.conn_callback,
                conn_context: self.conn_context,
                proxy: self.proxy,
                reporter: FaultReporter::new(self.error_logger),
                manager: ConnectionManager::new(Arc::new(ServerMetrics::new())),
                cancellation: CancellationToken::new(),
                tracker: TaskTracker::new(),
                listeners,
                bind_address: Mutex::new(None),
                started_at: Instant::now(),
            }),
        }
    }
}

/// Multiplexed SSH session server
///
/// Cloning the server yields another handle to the same server.
///
/// # Example
///
/// ```no_run
/// use sshmux_service::{ServeMux, SessionHandler, SshServer, default_config_factory};
/// use sshmux_transport::loopback::LoopbackEngine;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mux = ServeMux::new();
///     mux.handle("session", SessionHandler::new(|_args: &[String]| Vec::new()));
///
///     let server = SshServer::new(Arc::new(LoopbackEngine::new()), default_config_factory(), mux);
///     let runner = server.clone();
///     let serving = tokio::spawn(async move { runner.listen_and_serve("127.0.0.1:2222").await });
///
///     tokio::signal::ctrl_c().await?;
///     server.shutdown(Some(Duration::from_secs(30))).await?;
///     let _ = serving.await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SshServer {
    inner: Arc<ServerInner>,
}

impl SshServer {
    /// Create a server with a configuration factory and a channel handler
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        config_factory: ConfigFactory,
        handler: impl ChannelHandler,
    ) -> Self {
        let mut builder = ServerBuilder::new(engine, handler);
        builder.config_factory = config_factory;
        builder.build()
    }

    /// Start building a server
    pub fn builder(engine: Arc<dyn TransportEngine>, handler: impl ChannelHandler) -> ServerBuilder {
        ServerBuilder::new(engine, handler)
    }

    /// Accept connections from `listener` until the server is shut down
    ///
    /// Always returns an error; [`SshdError::ServerClosed`] after shutdown and
    /// [`SshdError::Config`] for an invalid configuration. The server is shut
    /// down when this returns.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<()> {
        let inner = &self.inner;
        if inner.cancellation.is_cancelled() {
            return Err(SshdError::ServerClosed);
        }
        self.validate_config()?;

        let guard = ListenerGuard::new(&inner.listeners);
        let local_addr = listener.local_addr().ok();
        *inner
            .bind_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = local_addr;
        info!(address = ?local_addr, "SSH server listening");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = inner.cancellation.cancelled() => break Err(SshdError::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    debug!(peer = ?conn.peer_addr(), "Accepted connection");
                    let worker = ConnectionWorker::new(inner.clone(), conn);
                    inner.tracker.spawn(worker.run());
                }
                Err(e) => {
                    inner.manager.metrics().accept_error();
                    inner
                        .reporter
                        .report(ServerFault::new(FaultKind::Accept, e.to_string()));
                    tokio::select! {
                        _ = inner.cancellation.cancelled() => break Err(SshdError::ServerClosed),
                        _ = tokio::time::sleep(inner.config.accept_backoff) => {}
                    }
                }
            }
        };

        drop(listener);
        drop(guard);
        inner.cancellation.cancel();
        info!("SSH server stopped accepting connections");
        result
    }

    /// Bind `addr` and serve connections
    ///
    /// An empty address binds the configured address (`0.0.0.0:2222` by
    /// default).
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        self.validate_config()?;
        let addr = if addr.is_empty() {
            self.inner.config.bind_address.as_str()
        } else {
            addr
        };
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.cancellation.cancel();
                return Err(e.into());
            }
        };
        self.serve(listener).await
    }

    fn validate_config(&self) -> Result<()> {
        self.inner.config.validate().map_err(|reason| {
            self.inner.cancellation.cancel();
            SshdError::Config(reason)
        })
    }

    /// Shut the server down
    ///
    /// Stops accepting connections at once. With a deadline, waits until the
    /// listeners are closed and every connection task has finished, failing
    /// with [`SshdError::DeadlineExceeded`] when time runs out. Open
    /// connections are left to finish on their own. Safe to call repeatedly.
    pub async fn shutdown(&self, deadline: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if !inner.cancellation.is_cancelled() {
            info!("Shutting down SSH server");
        }
        inner.cancellation.cancel();
        inner.tracker.close();

        let Some(deadline) = deadline else {
            return Ok(());
        };

        let mut listeners = inner.listeners.subscribe();
        let drained = async {
            let _ = listeners.wait_for(|count| *count == 0).await;
            inner.tracker.wait().await;
        };
        match tokio::time::timeout(deadline, drained).await {
            Ok(()) => {
                info!("SSH server shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    connections = inner.manager.connection_count(),
                    "Shutdown deadline exceeded"
                );
                Err(SshdError::DeadlineExceeded)
            }
        }
    }

    /// Check whether the server still accepts connections
    pub fn is_running(&self) -> bool {
        !self.inner.cancellation.is_cancelled()
    }

    /// Address of the most recent listener
    pub fn bind_address(&self) -> Option<SocketAddr> {
        *self
            .inner
            .bind_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner.manager.connection_count()
    }

    /// Get a snapshot of the server state
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_connections: self.inner.manager.connection_count(),
            total_connections: self.inner.manager.metrics().total_connections(),
            bind_address: self.bind_address(),
            uptime: self.inner.started_at.elapsed(),
            started_at: self.inner.started_at,
        }
    }

    /// Get the server metrics
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.inner.manager.metrics().clone()
    }

    /// Get the connection manager
    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

impl fmt::Debug for SshServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshServer")
            .field("bind_address", &self.bind_address())
            .field("running", &self.is_running())
            .field("connection_count", &self.connection_count())
            .field("uptime", &self.inner.started_at.elapsed())
            .finish()
    }
}

/// Counts a listener as open until dropped
struct ListenerGuard<'a>(&'a watch::Sender<usize>);

impl<'a> ListenerGuard<'a> {
    fn new(listeners: &'a watch::Sender<usize>) -> Self {
        listeners.send_modify(|count| *count += 1);
        Self(listeners)
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count -= 1);
    }
}

/// Serve connections from `listener` with a new server
pub async fn serve<L: Listener>(
    listener: L,
    engine: Arc<dyn TransportEngine>,
    config_factory: ConfigFactory,
    handler: impl ChannelHandler,
) -> Result<()> {
    SshServer::new(engine, config_factory, handler)
        .serve(listener)
        .await
}

/// Bind `addr` and serve connections with a new server
pub async fn listen_and_serve(
    addr: &str,
    engine: Arc<dyn TransportEngine>,
    config_factory: ConfigFactory,
    handler: impl ChannelHandler,
) -> Result<()> {
    SshServer::new(engine, config_factory, handler)
        .listen_and_serve(addr)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelChain, FaultKind, ServeMux};
    use async_trait::async_trait;
    use sshmux_transport::loopback::LoopbackEngine;
    use sshmux_transport::{NewChannel, TransportError};
    use std::io;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    struct Accept;

    #[async_trait]
    impl ChannelHandler for Accept {
        async fn serve_channel(&self, _cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()> {
            let (mut channel, _requests) = offer.accept().await?;
            channel.close().await?;
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl ChannelHandler for Panics {
        async fn serve_channel(&self, _cc: &mut ChannelChain, _offer: Box<dyn NewChannel>) -> Result<()> {
            panic!("handler exploded");
        }
    }

    fn open_config(_ctx: &ConnContext) -> TransportConfig {
        TransportConfig::default().with_no_client_auth(true)
    }

    async fn start(server: &SshServer) -> (SocketAddr, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.serve(listener).await });
        (addr, handle)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let engine = Arc::new(LoopbackEngine::new());
        let server = SshServer::builder(engine, Accept)
            .with_config_factory(open_config)
            .build();
        assert!(server.is_running());

        let (addr, handle) = start(&server).await;
        wait_for(|| server.bind_address() == Some(addr)).await;

        server.shutdown(Some(Duration::from_secs(2))).await.unwrap();
        assert!(!server.is_running());

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SshdError::ServerClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let server = SshServer::new(
            Arc::new(LoopbackEngine::new()),
            default_config_factory(),
            ServeMux::new(),
        );

        server.shutdown(None).await.unwrap();
        server.shutdown(None).await.unwrap();
        server.shutdown(Some(Duration::from_millis(100))).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener).await,
            Err(SshdError::ServerClosed)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_tracks_connections() {
        let engine = Arc::new(LoopbackEngine::new());
        let server = SshServer::builder(engine.clone(), Accept)
            .with_config_factory(open_config)
            .build();
        let (addr, handle) = start(&server).await;

        let mut client = engine.client("git");
        client.connect(addr).await.unwrap();
        let channel = client.open_channel("session").await.unwrap();
        channel.closed().await;

        wait_for(|| server.connection_count() == 1).await;
        let info = server.manager().get_all_connection_infos().remove(0);
        assert_eq!(info.user.as_deref(), Some("git"));

        client.disconnect().await.unwrap();
        wait_for(|| server.connection_count() == 0).await;

        let snapshot = server.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(server.metrics().snapshot().channels_opened, 1);

        server.shutdown(Some(Duration::from_secs(2))).await.unwrap();
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_panicking_channel_is_isolated() {
        let engine = Arc::new(LoopbackEngine::new());
        let mux = ServeMux::new()
            .with_handler("boom", Panics)
            .with_handler("session", Accept);
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let server = SshServer::builder(engine.clone(), mux)
            .with_config_factory(open_config)
            .with_error_logger(move |fault| sink.lock().unwrap().push(fault.clone()))
            .build();
        let (addr, _handle) = start(&server).await;

        let mut client = engine.client("git");
        client.connect(addr).await.unwrap();

        // the offer is dropped with the panicking task
        assert!(matches!(
            client.open_channel("boom").await,
            Err(TransportError::ChannelClosed)
        ));
        // the connection keeps serving
        let channel = client.open_channel("session").await.unwrap();
        channel.closed().await;

        wait_for(|| server.metrics().snapshot().panics == 1).await;
        let fault = faults.lock().unwrap()[0].clone();
        assert_eq!(fault.kind, FaultKind::Panic);
        assert_eq!(
            fault.message,
            "boom channel task failed: Task panicked: handler exploded"
        );

        server.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_fault_carries_stack() {
        let engine = Arc::new(LoopbackEngine::new());
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let server = SshServer::builder(engine.clone(), ServeMux::new().with_handler("boom", Panics))
            .with_config(ServerConfig::default().with_panic_stack_capture(true))
            .with_config_factory(open_config)
            .with_error_logger(move |fault| sink.lock().unwrap().push(fault.clone()))
            .build();
        let (addr, _handle) = start(&server).await;

        let mut client = engine.client("git");
        client.connect(addr).await.unwrap();
        assert!(client.open_channel("boom").await.is_err());

        wait_for(|| server.metrics().snapshot().panics == 1).await;
        let fault = faults.lock().unwrap()[0].clone();
        assert!(fault.message.starts_with(
            "boom channel task failed: Task panicked: handler exploded\nstack:\n"
        ));
        assert!(fault.message.len() <= crate::MAX_PANIC_INFO_SIZE + 64);

        server.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let server = SshServer::builder(Arc::new(LoopbackEngine::new()), ServeMux::new())
            .with_config(ServerConfig::default().with_accept_backoff(Duration::ZERO))
            .build();

        let result = server.serve(FlakyListener { failures: 1 }).await;
        assert!(matches!(result, Err(SshdError::Config(ref reason)) if reason.contains("accept_backoff")));
        assert!(!server.is_running());
        assert_eq!(server.metrics().snapshot().accept_errors, 0);

        let server = SshServer::builder(Arc::new(LoopbackEngine::new()), ServeMux::new())
            .with_config(ServerConfig::default().with_idle_timeout(Duration::ZERO))
            .build();
        let result = server.listen_and_serve("127.0.0.1:0").await;
        assert!(matches!(result, Err(SshdError::Config(_))));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_reported() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let server = SshServer::builder(Arc::new(LoopbackEngine::new()), ServeMux::new())
            .with_error_logger(move |fault| sink.lock().unwrap().push(fault.clone()))
            .build();
        let (addr, _handle) = start(&server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        wait_for(|| !faults.lock().unwrap().is_empty()).await;
        let fault = faults.lock().unwrap()[0].clone();
        assert_eq!(fault.kind, FaultKind::Handshake);
        assert!(fault.connection.is_some());
        assert_eq!(server.metrics().snapshot().handshake_failures, 1);

        server.shutdown(Some(Duration::from_secs(2))).await.unwrap();
    }

    /// Fails a fixed number of accepts, then blocks
    struct FlakyListener {
        failures: usize,
    }

    #[async_trait]
    impl Listener for FlakyListener {
        async fn accept(&mut self) -> io::Result<BoxedConnection> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("too many open files"));
            }
            std::future::pending().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:2222".parse().unwrap())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let server = SshServer::builder(Arc::new(LoopbackEngine::new()), ServeMux::new())
            .with_error_logger(move |fault| sink.lock().unwrap().push(fault.kind))
            .build();

        let runner = server.clone();
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { runner.serve(FlakyListener { failures: 3 }).await });

        wait_for(|| faults.lock().unwrap().len() == 3).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(*faults.lock().unwrap(), vec![FaultKind::Accept; 3]);

        server.shutdown(Some(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(handle.await.unwrap(), Err(SshdError::ServerClosed)));
    }
}
