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

//! Handler traits for channels, requests and command steps
//!
//! Three kinds of handlers plug into the server:
//!
//! - [`ChannelHandler`]: decides what to do with a channel offer. The server
//!   calls exactly one per connection (usually a [`crate::ServeMux`]).
//! - [`RequestHandler`]: answers one kind of channel request inside
//!   [`ChannelChain::handle_requests`].
//! - [`CommandHandler`]: one step of a command pipeline run by
//!   [`ChannelChain::handle_command`].
//!
//! Plain functions returning a boxed future can be used through
//! [`ChannelHandlerFn`], [`RequestHandlerFn`] and [`CommandHandlerFn`].

use crate::{ChannelChain, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use sshmux_transport::{NewChannel, Request};
use std::sync::Arc;

/// Serves channel offers
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use sshmux_service::{ChannelChain, ChannelHandler, Result};
/// use sshmux_transport::{NewChannel, RejectionReason};
///
/// struct Deny;
///
/// #[async_trait]
/// impl ChannelHandler for Deny {
///     async fn serve_channel(&self, _cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()> {
///         offer.reject(RejectionReason::Prohibited, "go away").await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// Serve one channel offer
    ///
    /// The offer must be accepted or rejected. Returned errors are logged by
    /// the server and never affect other channels.
    async fn serve_channel(&self, cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()>;
}

/// Answers a channel request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Serve one request and produce the reply
    ///
    /// The reply is only sent when the peer asked for one.
    async fn serve(&self, cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes);
}

/// One step of a command pipeline
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Run the step
    ///
    /// The pipeline moves on to the following step when this returns. A step
    /// that finishes the command calls [`ChannelChain::abort`]; returning an
    /// error aborts the pipeline as well.
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()>;
}

#[async_trait]
impl<T: ChannelHandler + ?Sized> ChannelHandler for Arc<T> {
    async fn serve_channel(&self, cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()> {
        (**self).serve_channel(cc, offer).await
    }
}

/// A [`ChannelHandler`] backed by a function
pub struct ChannelHandlerFn<F>(F);

impl<F> ChannelHandlerFn<F>
where
    F: for<'a> Fn(&'a mut ChannelChain, Box<dyn NewChannel>) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    /// Wrap a function
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ChannelHandler for ChannelHandlerFn<F>
where
    F: for<'a> Fn(&'a mut ChannelChain, Box<dyn NewChannel>) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    async fn serve_channel(&self, cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()> {
        (self.0)(cc, offer).await
    }
}

/// A [`RequestHandler`] backed by a function
pub struct RequestHandlerFn<F>(F);

impl<F> RequestHandlerFn<F>
where
    F: for<'a> Fn(&'a mut ChannelChain, &'a dyn Request) -> BoxFuture<'a, (bool, Bytes)>
        + Send
        + Sync
        + 'static,
{
    /// Wrap a function
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> RequestHandler for RequestHandlerFn<F>
where
    F: for<'a> Fn(&'a mut ChannelChain, &'a dyn Request) -> BoxFuture<'a, (bool, Bytes)>
        + Send
        + Sync
        + 'static,
{
    async fn serve(&self, cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes) {
        (self.0)(cc, request).await
    }
}

/// A [`CommandHandler`] backed by a function
///
/// ```no_run
/// use futures::future::BoxFuture;
/// use sshmux_service::{ChannelChain, CommandHandlerFn, Result};
/// use tokio::io::AsyncWriteExt;
///
/// fn hello(cc: &mut ChannelChain) -> BoxFuture<'_, Result<()>> {
///     Box::pin(async move {
///         cc.stdout()?.write_all(b"hello\n").await?;
///         cc.next().await
///     })
/// }
///
/// let step = CommandHandlerFn::new(hello);
/// ```
pub struct CommandHandlerFn<F>(F);

impl<F> CommandHandlerFn<F>
where
    F: for<'a> Fn(&'a mut ChannelChain) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    /// Wrap a function
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> CommandHandler for CommandHandlerFn<F>
where
    F: for<'a> Fn(&'a mut ChannelChain) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        (self.0)(cc).await
    }
}
