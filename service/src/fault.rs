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

//! Fault reporting and task failure barriers
//!
//! Every fault the server swallows (instead of returning it to a caller) is
//! logged through `tracing` and, when configured, handed to the server's
//! [`ErrorLogger`].

use crate::{ConnectionId, SshdError};
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use tracing::{error, warn};

/// Upper bound on the panic description kept in a fault
pub const MAX_PANIC_INFO_SIZE: usize = 64 << 10;

/// Callback receiving every fault the server logs
pub type ErrorLogger = Arc<dyn Fn(&ServerFault) + Send + Sync>;

/// Category of a logged fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The listener failed to accept a connection
    Accept,
    /// The PROXY protocol header could not be decoded
    Proxy,
    /// The protocol handshake failed
    Handshake,
    /// A channel handler returned an error
    Channel,
    /// A command step returned an error
    Command,
    /// A connection or channel task panicked
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Proxy => write!(f, "proxy"),
            Self::Handshake => write!(f, "handshake"),
            Self::Channel => write!(f, "channel"),
            Self::Command => write!(f, "command"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

/// A fault observed by the server
#[derive(Debug, Clone)]
pub struct ServerFault {
    /// Fault category
    pub kind: FaultKind,
    /// Connection the fault belongs to, if any
    pub connection: Option<ConnectionId>,
    /// Remote address of that connection
    pub peer_addr: Option<SocketAddr>,
    /// Description of what went wrong
    pub message: String,
}

impl ServerFault {
    /// Create a fault without connection details
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            connection: None,
            peer_addr: None,
            message: message.into(),
        }
    }

    /// Attach the connection the fault belongs to
    pub fn with_connection(mut self, id: ConnectionId, peer_addr: Option<SocketAddr>) -> Self {
        self.connection = Some(id);
        self.peer_addr = peer_addr;
        self
    }
}

impl fmt::Display for ServerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sshd: {} fault", self.kind)?;
        if let Some(id) = self.connection {
            write!(f, " on {}", id)?;
        }
        if let Some(addr) = self.peer_addr {
            write!(f, " ({})", addr)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Sink for faults: `tracing` first, then the optional logger
#[derive(Clone, Default)]
pub(crate) struct FaultReporter {
    logger: Option<ErrorLogger>,
}

impl FaultReporter {
    pub(crate) fn new(logger: Option<ErrorLogger>) -> Self {
        Self { logger }
    }

    pub(crate) fn report(&self, fault: ServerFault) {
        let connection = fault.connection.map(|id| id.to_string());
        let peer = fault.peer_addr.map(|addr| addr.to_string());
        match fault.kind {
            FaultKind::Panic => error!(
                kind = %fault.kind,
                connection = connection.as_deref().unwrap_or("-"),
                peer = peer.as_deref().unwrap_or("-"),
                "{}",
                fault.message
            ),
            _ => warn!(
                kind = %fault.kind,
                connection = connection.as_deref().unwrap_or("-"),
                peer = peer.as_deref().unwrap_or("-"),
                "{}",
                fault.message
            ),
        }
        if let Some(logger) = &self.logger {
            logger(&fault);
        }
    }
}

impl fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultReporter")
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Record the stack of every panic for the task barriers
///
/// Installed once per process; the previous hook still runs.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Run a future, converting a panic into [`SshdError::Panic`]
///
/// With `capture_stack` the stack recorded by the panic hook is appended to
/// the message. The message never exceeds [`MAX_PANIC_INFO_SIZE`].
pub(crate) async fn catch_panic<F: Future>(
    future: F,
    capture_stack: bool,
) -> Result<F::Output, SshdError> {
    AssertUnwindSafe(future).catch_unwind().await.map_err(|payload| {
        // the hook ran on this thread just before unwinding reached us
        let stack = PANIC_STACK.with(|slot| slot.borrow_mut().take());
        SshdError::Panic(panic_message(
            payload.as_ref(),
            stack.filter(|_| capture_stack).as_deref(),
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send), stack: Option<&str>) -> String {
    let mut message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    if let Some(stack) = stack {
        message.push_str("\nstack:\n");
        message.push_str(stack);
    }
    truncate(message, MAX_PANIC_INFO_SIZE)
}

fn truncate(mut message: String, limit: usize) -> String {
    if message.len() > limit {
        let mut end = limit;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
