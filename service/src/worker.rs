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

//! Connection worker implementation
//!
//! The ConnectionWorker drives a single accepted connection:
//! - Deadlines through [`TimeoutConn`]
//! - PROXY header decoding and the connection callback
//! - Context derivation and per-connection transport configuration
//! - The protocol handshake
//! - One task per channel offer, each behind a panic barrier
//! - Draining channel tasks once the session ends

use crate::fault::{FaultKind, ServerFault, catch_panic};
use crate::server::ServerInner;
use crate::{ChannelChain, ConnContext, ConnectionId, ConnectionState, TimeoutConn};
use bytes::Bytes;
use futures::StreamExt;
use sshmux_transport::{BoxedConnection, Handshake, NewChannel, Requests};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument, trace};

/// Drives one connection from accept to close
pub(crate) struct ConnectionWorker {
    inner: Arc<ServerInner>,
    id: ConnectionId,
    conn: BoxedConnection,
}

impl ConnectionWorker {
    /// Register the connection and create its worker
    pub(crate) fn new(inner: Arc<ServerInner>, conn: BoxedConnection) -> Self {
        let id = inner.manager.register(conn.peer_addr());
        Self { inner, id, conn }
    }

    /// Run the connection; never panics and always unregisters it
    pub(crate) async fn run(self) {
        let inner = self.inner.clone();
        let id = self.id;
        let peer = self.conn.peer_addr();

        let capture_stack = inner.config.capture_panic_stack;
        if let Err(e) = catch_panic(self.serve(), capture_stack).await {
            inner.manager.metrics().panic_caught();
            inner.reporter.report(
                ServerFault::new(FaultKind::Panic, format!("connection task failed: {}", e))
                    .with_connection(id, peer),
            );
        }
        inner.manager.remove(id);
    }

    #[instrument(skip_all, fields(connection_id = %self.id))]
    async fn serve(self) {
        let Self { inner, id, conn } = self;

        // deadlines cover everything read from the socket, PROXY header included
        let mut conn: BoxedConnection = Box::new(
            TimeoutConn::new(conn)
                .with_read_timeout(inner.config.read_timeout)
                .with_write_timeout(inner.config.write_timeout)
                .with_idle_timeout(inner.config.idle_timeout),
        );

        if let Some(decoder) = &inner.proxy {
            let peer = conn.peer_addr();
            conn = match decoder.decode(conn).await {
                Ok(conn) => conn,
                Err(e) => {
                    inner.reporter.report(
                        ServerFault::new(FaultKind::Proxy, e.to_string()).with_connection(id, peer),
                    );
                    return;
                }
            };
            inner.manager.set_peer_addr(id, conn.peer_addr());
        }

        if let Some(callback) = &inner.conn_callback {
            conn = callback(conn);
        }

        let context = ConnContext::new(
            id,
            conn.peer_addr(),
            conn.local_addr(),
            inner.cancellation.child_token(),
        );
        let context = match &inner.conn_context {
            Some(hook) => hook(&*conn, context),
            None => context,
        };
        let peer = context.peer_addr();
        let transport_config = Arc::new((inner.config_factory)(&context));

        let Handshake {
            session,
            mut channels,
            requests,
        } = match inner.engine.handshake(conn, transport_config.clone()).await {
            Ok(handshake) => handshake,
            Err(e) => {
                inner.manager.metrics().handshake_failed();
                inner.reporter.report(
                    ServerFault::new(FaultKind::Handshake, e.to_string()).with_connection(id, peer),
                );
                return;
            }
        };
        inner.manager.activate(id, session.user());
        debug!(user = session.user(), "Handshake complete");

        let globals = tokio::spawn(discard_requests(requests));
        let mut channel_tasks = JoinSet::new();

        loop {
            tokio::select! {
                offer = channels.next() => match offer {
                    Some(offer) => {
                        inner.manager.channel_opened(id);
                        let cc = ChannelChain::new(
                            context.clone(),
                            session.clone(),
                            transport_config.clone(),
                            inner.handler.clone(),
                        )
                        .with_reporter(inner.reporter.clone());
                        channel_tasks.spawn(serve_channel(inner.clone(), cc, offer, peer));
                    }
                    None => break,
                },
                Some(_) = channel_tasks.join_next(), if !channel_tasks.is_empty() => {}
            }
        }

        trace!("No more channel offers");
        inner.manager.set_state(id, ConnectionState::Draining);
        if let Err(e) = session.close().await {
            debug!(error = %e, "Session close failed");
        }
        globals.abort();

        while channel_tasks.join_next().await.is_some() {}
        debug!("Connection finished");
    }
}

/// Serve one channel offer behind a panic barrier
async fn serve_channel(
    inner: Arc<ServerInner>,
    mut cc: ChannelChain,
    offer: Box<dyn NewChannel>,
    peer: Option<SocketAddr>,
) {
    let id = cc.context().id();
    let channel_type = offer.channel_type().to_string();

    match catch_panic(cc.dispatch(offer), inner.config.capture_panic_stack).await {
        Ok(Ok(())) => trace!(connection_id = %id, channel_type = %channel_type, "Channel finished"),
        Ok(Err(e)) => {
            inner.manager.metrics().channel_error();
            inner.reporter.report(
                ServerFault::new(
                    FaultKind::Channel,
                    format!("{} channel failed: {}", channel_type, e),
                )
                .with_connection(id, peer),
            );
        }
        Err(e) => {
            inner.manager.metrics().panic_caught();
            inner.reporter.report(
                ServerFault::new(
                    FaultKind::Panic,
                    format!("{} channel task failed: {}", channel_type, e),
                )
                .with_connection(id, peer),
            );
        }
    }
}

/// Answer every connection-level request negatively
async fn discard_requests(mut requests: Requests) {
    while let Some(request) = requests.next().await {
        trace!(request = request.request_type(), "Discarding global request");
        if let Err(e) = request.reply(false, Bytes::new()).await {
            debug!(error = %e, "Failed to reply to global request");
        }
    }
}
