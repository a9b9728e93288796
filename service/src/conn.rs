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

//! Connection deadlines
//!
//! [`TimeoutConn`] wraps a byte stream and fails reads, writes and shutdown
//! that block for longer than the configured limits. Three limits apply:
//!
//! - read timeout: how long one read may stay pending
//! - write timeout: how long one write or flush may stay pending
//! - idle timeout: how long the connection may go without a successful
//!   transfer in either direction
//!
//! An expired limit yields [`io::ErrorKind::TimedOut`]; the engine sees a
//! failed read or write and tears the session down.

use pin_project_lite::pin_project;
use sshmux_transport::Connection;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep, sleep_until};

/// Upper bound on closing a connection when no idle timeout is set
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pin_project! {
    /// A connection with read, write and idle deadlines
    ///
    /// ```
    /// use sshmux_service::TimeoutConn;
    /// use std::time::Duration;
    ///
    /// let (stream, _peer) = tokio::io::duplex(64);
    /// let conn = TimeoutConn::new(stream)
    ///     .with_read_timeout(Some(Duration::from_secs(30)))
    ///     .with_idle_timeout(Some(Duration::from_secs(300)));
    /// assert_eq!(conn.idle_timeout(), Some(Duration::from_secs(300)));
    /// ```
    pub struct TimeoutConn<S> {
        #[pin]
        inner: S,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        idle_timeout: Option<Duration>,
        last_activity: Instant,
        read: Deadline,
        write: Deadline,
        close: Deadline,
    }
}

impl<S> TimeoutConn<S> {
    /// Wrap a stream; no limits are applied until configured
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            last_activity: Instant::now(),
            read: Deadline::default(),
            write: Deadline::default(),
            close: Deadline::default(),
        }
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Read timeout, if any
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Write timeout, if any
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Idle timeout, if any
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Time of the last successful transfer
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Get a reference to the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap the stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Pending-operation timer, armed lazily when an operation first blocks
#[derive(Default)]
struct Deadline {
    started: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn clear(&mut self) {
        self.started = None;
    }

    fn poll_expired(
        &mut self,
        cx: &mut Context<'_>,
        limit: impl FnOnce(Instant) -> Option<Instant>,
    ) -> Poll<()> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let Some(deadline) = limit(started) else {
            return Poll::Pending;
        };
        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(sleep_until(deadline)));
        if timer.deadline() != deadline {
            timer.as_mut().reset(deadline);
        }
        timer.as_mut().poll(cx)
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn timed_out(operation: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", operation))
}

impl<S: AsyncRead> AsyncRead for TimeoutConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read.clear();
                if result.is_ok() && buf.filled().len() > before {
                    *this.last_activity = Instant::now();
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = *this.read_timeout;
                let idle = this.idle_timeout.map(|t| *this.last_activity + t);
                match this
                    .read
                    .poll_expired(cx, |started| earliest(timeout.map(|t| started + t), idle))
                {
                    Poll::Ready(()) => {
                        this.read.clear();
                        Poll::Ready(Err(timed_out("read")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for TimeoutConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write.clear();
                if matches!(result, Ok(n) if n > 0) {
                    *this.last_activity = Instant::now();
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = *this.write_timeout;
                let idle = this.idle_timeout.map(|t| *this.last_activity + t);
                match this
                    .write
                    .poll_expired(cx, |started| earliest(timeout.map(|t| started + t), idle))
                {
                    Poll::Ready(()) => {
                        this.write.clear();
                        Poll::Ready(Err(timed_out("write")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_flush(cx) {
            Poll::Ready(result) => {
                this.write.clear();
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = *this.write_timeout;
                let idle = this.idle_timeout.map(|t| *this.last_activity + t);
                match this
                    .write
                    .poll_expired(cx, |started| earliest(timeout.map(|t| started + t), idle))
                {
                    Poll::Ready(()) => {
                        this.write.clear();
                        Poll::Ready(Err(timed_out("flush")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.close.clear();
                Poll::Ready(result)
            }
            Poll::Pending => {
                let limit = this.idle_timeout.unwrap_or(MAX_IDLE_TIMEOUT);
                match this.close.poll_expired(cx, |started| Some(started + limit)) {
                    Poll::Ready(()) => {
                        this.close.clear();
                        Poll::Ready(Err(timed_out("close")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: Connection> Connection for TimeoutConn<S> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}
