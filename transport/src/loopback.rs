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

//! In-process loopback engine
//!
//! The loopback engine runs a tiny line based exchange over the real
//! connection and keeps all channel traffic in memory. It is meant for tests
//! and demos: the server side sees a genuine socket (so timeouts, PROXY
//! decoding and disconnects behave as they would in production) while the
//! client side is driven directly from Rust.
//!
//! The exchange on the socket is:
//!
//! ```text
//! client → SSH-2.0-<client software>\r\n
//! client → <client id> <user> <password | ->\r\n
//! server → <server version>\r\n
//! server → OK <hex session id>\r\n  |  FAIL <reason>\r\n
//! ```
//!
//! After that the socket carries no data; the session ends when either side
//! closes it.

use crate::{
    BoxedConnection, Channel, ConnMetadata, Handshake, NewChannel, NewChannels, Permissions,
    RejectionReason, Request, Requests, Session, TransportConfig, TransportEngine,
    TransportError, TransportResult,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identification string sent by loopback clients
pub const LOOPBACK_CLIENT_VERSION: &str = "SSH-2.0-sshmux-loopback";

/// Longest identification or authentication line accepted
const MAX_LINE_LENGTH: u64 = 255;

/// Buffer size of the in-memory channel streams
const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;

struct PendingClient {
    offers: mpsc::UnboundedReceiver<LoopbackOffer>,
    globals: mpsc::UnboundedReceiver<LoopbackRequest>,
}

/// Engine that pairs accepted connections with in-process clients
#[derive(Default)]
pub struct LoopbackEngine {
    pending: Mutex<HashMap<u64, PendingClient>>,
    next_client: AtomicU64,
    sessions: AtomicU64,
}

impl LoopbackEngine {
    /// Create a new engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client that will authenticate as `user`
    ///
    /// The client must connect to a server running this engine before its
    /// channels can be used.
    pub fn client(&self, user: impl Into<String>) -> LoopbackClient {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let (globals_tx, globals_rx) = mpsc::unbounded_channel();

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingClient {
                    offers: offers_rx,
                    globals: globals_rx,
                },
            );

        LoopbackClient {
            id,
            user: user.into(),
            password: None,
            offers: offers_tx,
            globals: globals_tx,
            stream: None,
            server_version: String::new(),
            session_id: String::new(),
        }
    }

    /// Number of registered clients that have not completed a handshake
    pub fn pending_clients(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take_pending(&self, id: u64) -> Option<PendingClient> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

async fn read_line<R>(reader: &mut R) -> TransportResult<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.take(MAX_LINE_LENGTH).read_line(&mut line).await?;
    if read == 0 {
        return Err(TransportError::Handshake(
            "connection closed during handshake".to_string(),
        ));
    }
    if !line.ends_with('\n') {
        return Err(TransportError::Handshake("handshake line too long".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn authenticate(
    config: &TransportConfig,
    meta: &ConnMetadata,
    password: Option<&str>,
) -> std::result::Result<Permissions, String> {
    if config.no_client_auth {
        return Ok(Permissions::default());
    }
    match (&config.password_callback, password) {
        (Some(callback), Some(password)) => callback(meta, password.as_bytes()),
        _ => Err("no supported authentication methods".to_string()),
    }
}

#[async_trait]
impl TransportEngine for LoopbackEngine {
    async fn handshake(
        &self,
        conn: BoxedConnection,
        config: Arc<TransportConfig>,
    ) -> TransportResult<Handshake> {
        let remote_addr = conn.peer_addr();
        let local_addr = conn.local_addr();
        let mut reader = BufReader::new(conn);

        let client_version = read_line(&mut reader).await?;
        if !client_version.starts_with("SSH-2.0-") {
            return Err(TransportError::Handshake(format!(
                "unsupported identification {:?}",
                client_version
            )));
        }

        let auth_line = read_line(&mut reader).await?;
        let mut fields = auth_line.splitn(3, ' ');
        let client_id = fields
            .next()
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::Handshake("missing client id".to_string()))?;
        let user = fields
            .next()
            .filter(|user| !user.is_empty())
            .ok_or_else(|| TransportError::Handshake("missing user name".to_string()))?
            .to_string();
        let password = fields.next().filter(|password| *password != "-");

        let pending = self
            .take_pending(client_id)
            .ok_or_else(|| TransportError::Handshake(format!("unknown client {}", client_id)))?;

        let mut session_id = BytesMut::with_capacity(16);
        session_id.put_u64(client_id);
        session_id.put_u64(self.sessions.fetch_add(1, Ordering::SeqCst));
        let session_id = session_id.freeze();

        let meta = ConnMetadata {
            user: user.clone(),
            session_id: session_id.clone(),
            client_version: client_version.clone(),
            server_version: config.server_version.clone(),
            remote_addr,
            local_addr,
        };

        let conn = reader.into_inner();
        let (mut read_half, mut write_half) = tokio::io::split(conn);

        let permissions = match authenticate(&config, &meta, password) {
            Ok(permissions) => permissions,
            Err(reason) => {
                let reply = format!("{}\r\nFAIL {}\r\n", config.server_version, reason);
                let _ = write_half.write_all(reply.as_bytes()).await;
                let _ = write_half.shutdown().await;
                return Err(TransportError::AuthFailed(reason));
            }
        };

        let reply = format!(
            "{}\r\nOK {}\r\n",
            config.server_version,
            to_hex(&session_id)
        );
        write_half.write_all(reply.as_bytes()).await?;
        write_half.flush().await?;

        let closed = CancellationToken::new();

        // Watch the socket; the session is over once the peer goes away or
        // reads start failing (e.g. an idle deadline fired).
        let watcher = closed.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                tokio::select! {
                    _ = watcher.cancelled() => break,
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => trace!(bytes = n, "Ignoring loopback socket data"),
                        Err(e) => {
                            debug!(error = %e, "Loopback socket read failed");
                            break;
                        }
                    },
                }
            }
            watcher.cancel();
        });

        let session_token = closed.clone();
        let channels: NewChannels = until_closed(pending.offers, closed.clone(), None)
            .map(move |mut offer| {
                offer.session = Some(session_token.clone());
                Box::new(offer) as Box<dyn NewChannel>
            })
            .boxed();
        let requests: Requests = until_closed(pending.globals, closed.clone(), None)
            .map(|request| Box::new(request) as Box<dyn Request>)
            .boxed();

        debug!(user = %user, client = client_id, "Loopback handshake complete");

        Ok(Handshake {
            session: Arc::new(LoopbackSession {
                user,
                session_id,
                client_version,
                server_version: config.server_version.clone(),
                remote_addr,
                local_addr,
                permissions,
                closed,
                writer: tokio::sync::Mutex::new(Some(write_half)),
            }),
            channels,
            requests,
        })
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Turn a receiver into a stream that ends when either token is cancelled
fn until_closed<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
    closed: CancellationToken,
    session: Option<CancellationToken>,
) -> BoxStream<'static, T> {
    futures::stream::unfold((rx, closed, session), |(mut rx, closed, session)| async move {
        tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            _ = session_closed(&session) => None,
            item = rx.recv() => item.map(|item| (item, (rx, closed, session))),
        }
    })
    .boxed()
}

async fn session_closed(session: &Option<CancellationToken>) {
    match session {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

struct LoopbackSession {
    user: String,
    session_id: Bytes,
    client_version: String,
    server_version: String,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    permissions: Permissions,
    closed: CancellationToken,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedConnection>>>,
}

#[async_trait]
impl Session for LoopbackSession {
    fn user(&self) -> &str {
        &self.user
    }

    fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    fn client_version(&self) -> &str {
        &self.client_version
    }

    fn server_version(&self) -> &str {
        &self.server_version
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.cancel();
        match self.writer.lock().await.take() {
            Some(mut writer) => {
                writer.shutdown().await?;
                Ok(())
            }
            None => Err(TransportError::SessionClosed),
        }
    }
}

/// Server side of a channel offer
pub struct LoopbackOffer {
    channel_type: String,
    extra_data: Bytes,
    decision: oneshot::Sender<std::result::Result<(), (RejectionReason, String)>>,
    parts: ServerParts,
    session: Option<CancellationToken>,
}

struct ServerParts {
    primary: DuplexStream,
    stderr: DuplexStream,
    requests: mpsc::UnboundedReceiver<LoopbackRequest>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: CancellationToken,
}

/// Client side of a channel offer, resolved once the server decides
pub struct PendingChannel {
    decision: oneshot::Receiver<std::result::Result<(), (RejectionReason, String)>>,
    channel: ClientChannel,
}

impl PendingChannel {
    /// Wait for the server to accept or reject the offer
    pub async fn opened(self) -> TransportResult<ClientChannel> {
        match self.decision.await {
            Ok(Ok(())) => Ok(self.channel),
            Ok(Err((reason, message))) => Err(TransportError::Rejected { reason, message }),
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }
}

/// Create a connected channel offer and its client side
pub fn channel_pair(channel_type: &str) -> (LoopbackOffer, PendingChannel) {
    let (decision_tx, decision_rx) = oneshot::channel();
    let (server_primary, client_primary) = tokio::io::duplex(CHANNEL_BUFFER_SIZE);
    let (server_stderr, client_stderr) = tokio::io::duplex(CHANNEL_BUFFER_SIZE);
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let offer = LoopbackOffer {
        channel_type: channel_type.to_string(),
        extra_data: Bytes::new(),
        decision: decision_tx,
        parts: ServerParts {
            primary: server_primary,
            stderr: server_stderr,
            requests: requests_rx,
            events: events_tx,
            closed: closed.clone(),
        },
        session: None,
    };
    let pending = PendingChannel {
        decision: decision_rx,
        channel: ClientChannel {
            primary: client_primary,
            stderr: client_stderr,
            requests: Some(requests_tx),
            events: events_rx,
            closed,
        },
    };
    (offer, pending)
}

#[async_trait]
impl NewChannel for LoopbackOffer {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }

    async fn accept(self: Box<Self>) -> TransportResult<(Box<dyn Channel>, Requests)> {
        let this = *self;
        this.decision
            .send(Ok(()))
            .map_err(|_| TransportError::ChannelClosed)?;

        let parts = this.parts;
        let requests = until_closed(parts.requests, parts.closed.clone(), this.session)
            .map(|request| Box::new(request) as Box<dyn Request>)
            .boxed();
        let channel = LoopbackChannel {
            primary: parts.primary,
            stderr: parts.stderr,
            events: Some(parts.events),
            closed: parts.closed,
        };
        Ok((Box::new(channel), requests))
    }

    async fn reject(self: Box<Self>, reason: RejectionReason, message: &str) -> TransportResult<()> {
        self.decision
            .send(Err((reason, message.to_string())))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Server side of an accepted loopback channel
pub struct LoopbackChannel {
    primary: DuplexStream,
    stderr: DuplexStream,
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    closed: CancellationToken,
}

impl AsyncRead for LoopbackChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.primary).poll_read(cx, buf)
    }
}

impl AsyncWrite for LoopbackChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.events.is_none() {
            return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.primary).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.primary).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.primary).poll_shutdown(cx)
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn stderr(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.stderr
    }

    async fn send_request(&mut self, name: &str, want_reply: bool, payload: Bytes) -> TransportResult<bool> {
        let events = self.events.as_ref().ok_or(TransportError::ChannelClosed)?;
        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        events
            .send(ChannelEvent {
                name: name.to_string(),
                want_reply,
                payload,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::ChannelClosed)?;

        match reply_rx {
            Some(rx) => rx.await.map_err(|_| TransportError::ChannelClosed),
            None => Ok(true),
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.events.take().is_none() {
            return Err(TransportError::ChannelClosed);
        }
        let _ = self.primary.shutdown().await;
        let _ = self.stderr.shutdown().await;
        self.closed.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.events.is_none()
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// A request travelling from the client to the server
struct LoopbackRequest {
    name: String,
    want_reply: bool,
    payload: Bytes,
    reply: Option<oneshot::Sender<(bool, Bytes)>>,
}

#[async_trait]
impl Request for LoopbackRequest {
    fn request_type(&self) -> &str {
        &self.name
    }

    fn want_reply(&self) -> bool {
        self.want_reply
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn reply(self: Box<Self>, ok: bool, payload: Bytes) -> TransportResult<()> {
        match self.reply {
            Some(tx) => tx
                .send((ok, payload))
                .map_err(|_| TransportError::ChannelClosed),
            None => Ok(()),
        }
    }
}

fn new_request(name: &str, want_reply: bool, payload: Bytes) -> (LoopbackRequest, PendingReply) {
    let (tx, rx) = if want_reply {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let request = LoopbackRequest {
        name: name.to_string(),
        want_reply,
        payload,
        reply: tx,
    };
    (request, PendingReply { rx })
}

/// The answer to a request sent by a loopback client
#[derive(Debug)]
pub struct PendingReply {
    rx: Option<oneshot::Receiver<(bool, Bytes)>>,
}

impl PendingReply {
    /// Wait for the answer
    ///
    /// Requests sent without `want_reply` resolve to `(true, empty)` at once.
    pub async fn recv(self) -> TransportResult<(bool, Bytes)> {
        match self.rx {
            Some(rx) => rx.await.map_err(|_| TransportError::ChannelClosed),
            None => Ok((true, Bytes::new())),
        }
    }
}

/// A request travelling from the server to the client
#[derive(Debug)]
pub struct ChannelEvent {
    /// Request name, e.g. `exit-status`
    pub name: String,
    /// Whether the server waits for an answer
    pub want_reply: bool,
    /// Raw request payload
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelEvent {
    /// Answer the request
    pub fn reply(self, ok: bool) {
        if let Some(tx) = self.reply {
            let _ = tx.send(ok);
        }
    }
}

/// Client side of an open loopback channel
pub struct ClientChannel {
    primary: DuplexStream,
    stderr: DuplexStream,
    requests: Option<mpsc::UnboundedSender<LoopbackRequest>>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    closed: CancellationToken,
}

impl ClientChannel {
    /// Send a request without waiting for the answer
    pub fn send_request(&self, name: &str, want_reply: bool, payload: Bytes) -> TransportResult<PendingReply> {
        let requests = self.requests.as_ref().ok_or(TransportError::ChannelClosed)?;
        let (request, reply) = new_request(name, want_reply, payload);
        requests
            .send(request)
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(reply)
    }

    /// Send a request and wait for the answer
    pub async fn request(&self, name: &str, payload: Bytes) -> TransportResult<(bool, Bytes)> {
        self.send_request(name, true, payload)?.recv().await
    }

    /// Receive the next request sent by the server
    ///
    /// Returns `None` once the server has closed the channel and all pending
    /// requests were delivered.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Write to the channel's primary stream
    pub async fn write_stdin(&mut self, data: &[u8]) -> TransportResult<()> {
        self.primary.write_all(data).await?;
        Ok(())
    }

    /// Signal end of input on the primary stream
    pub async fn close_stdin(&mut self) -> TransportResult<()> {
        self.primary.shutdown().await?;
        Ok(())
    }

    /// Read the primary stream until the server closes it
    pub async fn read_stdout(&mut self) -> TransportResult<Vec<u8>> {
        let mut out = Vec::new();
        self.primary.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Read the extended (stderr) stream until the server closes it
    pub async fn read_stderr(&mut self) -> TransportResult<Vec<u8>> {
        let mut out = Vec::new();
        self.stderr.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Wait until the server closes the channel
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stop sending requests; the server's request stream ends
    pub fn close(&mut self) {
        self.requests = None;
    }
}

/// The client end of a loopback session
pub struct LoopbackClient {
    id: u64,
    user: String,
    password: Option<String>,
    offers: mpsc::UnboundedSender<LoopbackOffer>,
    globals: mpsc::UnboundedSender<LoopbackRequest>,
    stream: Option<BufReader<BoxedConnection>>,
    server_version: String,
    session_id: String,
}

impl LoopbackClient {
    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Connect over TCP and perform the handshake
    pub async fn connect(&mut self, addr: SocketAddr) -> TransportResult<()> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        self.connect_stream(Box::new(stream)).await
    }

    /// Perform the handshake over an existing connection
    pub async fn connect_stream(&mut self, mut conn: BoxedConnection) -> TransportResult<()> {
        let hello = format!(
            "{}\r\n{} {} {}\r\n",
            LOOPBACK_CLIENT_VERSION,
            self.id,
            self.user,
            self.password.as_deref().unwrap_or("-")
        );
        conn.write_all(hello.as_bytes()).await?;
        conn.flush().await?;

        let mut reader = BufReader::new(conn);
        self.server_version = read_line(&mut reader).await?;
        let status = read_line(&mut reader).await?;
        match status.split_once(' ') {
            Some(("OK", session_id)) => {
                self.session_id = session_id.to_string();
                self.stream = Some(reader);
                Ok(())
            }
            Some(("FAIL", reason)) => Err(TransportError::AuthFailed(reason.to_string())),
            _ => Err(TransportError::Handshake(format!(
                "unexpected handshake status {:?}",
                status
            ))),
        }
    }

    /// Identification string announced by the server
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Hex encoded session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Offer a channel of the given type and wait for the server's decision
    pub async fn open_channel(&self, channel_type: &str) -> TransportResult<ClientChannel> {
        let (offer, pending) = channel_pair(channel_type);
        self.offers
            .send(offer)
            .map_err(|_| TransportError::SessionClosed)?;
        pending.opened().await
    }

    /// Send a connection-level request and wait for the answer
    pub async fn global_request(&self, name: &str, payload: Bytes) -> TransportResult<(bool, Bytes)> {
        let (request, reply) = new_request(name, true, payload);
        self.globals
            .send(request)
            .map_err(|_| TransportError::SessionClosed)?;
        reply.recv().await
    }

    /// Wait until the server closes the underlying connection
    pub async fn wait_closed(&mut self) -> TransportResult<()> {
        let reader = self.stream.as_mut().ok_or(TransportError::SessionClosed)?;
        let mut buf = [0u8; 512];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the underlying connection
    pub async fn disconnect(&mut self) -> TransportResult<()> {
        if let Some(mut reader) = self.stream.take() {
            reader.get_mut().shutdown().await?;
        }
        Ok(())
    }
}
