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

//! Raw transport connections
//!
//! A [`Connection`] is a bidirectional byte stream that knows the addresses of
//! both of its ends. Wrappers such as a PROXY protocol decoder or a timeout
//! adapter implement the trait themselves, so they can report a different peer
//! address than the socket underneath.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A raw, bidirectional transport connection
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Address of the remote end, if known
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Address of the local end, if known
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Type-erased connection handed between the accept loop, hooks and engine
pub type BoxedConnection = Box<dyn Connection>;

impl Connection for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }
}

impl Connection for DuplexStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Connection for BoxedConnection {
    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }
}
