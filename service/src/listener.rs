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

//! Listener and connection preprocessing seams

use async_trait::async_trait;
use sshmux_transport::{BoxedConnection, Connection};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tracing::trace;

/// Longest valid PROXY protocol v1 header, including CRLF
pub const MAX_PROXY_V1_HEADER: usize = 107;

/// Source of incoming connections
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next connection
    async fn accept(&mut self) -> io::Result<BoxedConnection>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<BoxedConnection> {
        let (stream, _) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Decodes a PROXY protocol header
///
/// Runs on the connection's own task, before the connection callback. The
/// returned connection reports the client address carried in the header.
#[async_trait]
pub trait ProxyDecoder: Send + Sync + 'static {
    /// Consume the header and return the wrapped connection
    async fn decode(&self, conn: BoxedConnection) -> io::Result<BoxedConnection>;
}

/// Decoder for the text form (v1) of the PROXY protocol
///
/// Accepts `PROXY TCP4 ...`, `PROXY TCP6 ...` and `PROXY UNKNOWN`; the latter
/// keeps the socket addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyV1Decoder;

#[async_trait]
impl ProxyDecoder for ProxyV1Decoder {
    async fn decode(&self, mut conn: BoxedConnection) -> io::Result<BoxedConnection> {
        // byte at a time so nothing past the header is consumed
        let mut header = Vec::with_capacity(MAX_PROXY_V1_HEADER);
        loop {
            let byte = conn.read_u8().await?;
            header.push(byte);
            if header.ends_with(b"\r\n") {
                break;
            }
            if header.len() >= MAX_PROXY_V1_HEADER {
                return Err(invalid_header("header too long"));
            }
        }

        let line = std::str::from_utf8(&header[..header.len() - 2])
            .map_err(|_| invalid_header("header is not ASCII"))?;
        let (peer_addr, local_addr) = match parse_proxy_v1(line)? {
            Some(addrs) => addrs,
            None => (conn.peer_addr(), conn.local_addr()),
        };
        trace!(?peer_addr, ?local_addr, "PROXY header decoded");

        Ok(Box::new(ProxiedConnection {
            inner: conn,
            peer_addr,
            local_addr,
        }))
    }
}

fn invalid_header(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid PROXY header: {}", reason))
}

type ProxiedAddrs = (Option<SocketAddr>, Option<SocketAddr>);

fn parse_proxy_v1(line: &str) -> io::Result<Option<ProxiedAddrs>> {
    let mut fields = line.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(invalid_header("missing PROXY signature"));
    }
    match fields.next() {
        Some("UNKNOWN") => return Ok(None),
        Some("TCP4") | Some("TCP6") => {}
        _ => return Err(invalid_header("unsupported protocol")),
    }

    let fields: Vec<&str> = fields.collect();
    let [src, dst, src_port, dst_port] = fields.as_slice() else {
        return Err(invalid_header("wrong number of fields"));
    };
    let src: IpAddr = src.parse().map_err(|_| invalid_header("bad source address"))?;
    let dst: IpAddr = dst.parse().map_err(|_| invalid_header("bad destination address"))?;
    let src_port: u16 = src_port.parse().map_err(|_| invalid_header("bad source port"))?;
    let dst_port: u16 = dst_port.parse().map_err(|_| invalid_header("bad destination port"))?;

    Ok(Some((
        Some(SocketAddr::new(src, src_port)),
        Some(SocketAddr::new(dst, dst_port)),
    )))
}

/// A connection reporting the addresses carried in a PROXY header
struct ProxiedConnection {
    inner: BoxedConnection,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl AsyncRead for ProxiedConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxiedConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connection for ProxiedConnection {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
