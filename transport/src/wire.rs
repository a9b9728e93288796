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

//! Channel request payloads (RFC 4254 §6)
//!
//! Every payload is a sequence of the protocol's primitive types:
//!
//! - `uint32`: 4 bytes, big endian
//! - `boolean`: 1 byte, zero is false
//! - `string`: `uint32` length followed by that many bytes
//!
//! Decoding is strict: truncated input and trailing bytes are both rejected,
//! so a handler can answer a malformed request negatively instead of acting
//! on a partial value.

use crate::{TransportError, TransportResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Request name for environment variables
pub const REQUEST_ENV: &str = "env";
/// Request name for command execution
pub const REQUEST_EXEC: &str = "exec";
/// Request name for an interactive shell
pub const REQUEST_SHELL: &str = "shell";
/// Request name for a subsystem
pub const REQUEST_SUBSYSTEM: &str = "subsystem";
/// Request name for a pseudo terminal
pub const REQUEST_PTY: &str = "pty-req";
/// Request name for terminal size changes
pub const REQUEST_WINDOW_CHANGE: &str = "window-change";
/// Request name for the exit status notification
pub const REQUEST_EXIT_STATUS: &str = "exit-status";
/// Request name for the exit signal notification
pub const REQUEST_EXIT_SIGNAL: &str = "exit-signal";

/// A payload with a fixed wire layout
pub trait WireMessage: Sized {
    /// Append the encoded payload to `buf`
    fn encode_to(&self, buf: &mut BytesMut);

    /// Decode a payload from `buf`, consuming what was read
    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self>;

    /// Encode into a fresh buffer
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Decode a complete payload, rejecting trailing data
    fn decode(payload: &[u8]) -> TransportResult<Self> {
        let mut buf = payload;
        let message = Self::decode_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(TransportError::Malformed(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }
        Ok(message)
    }
}

/// Append a `string` field
pub fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Read a `string` field
pub fn get_string(buf: &mut &[u8]) -> TransportResult<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(TransportError::Malformed(format!(
            "string of {} bytes truncated to {}",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Read a `string` field that must be valid UTF-8
pub fn get_utf8(buf: &mut &[u8]) -> TransportResult<String> {
    let raw = get_string(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| TransportError::Malformed(format!("invalid utf-8 string: {}", e)))
}

/// Read a `uint32` field
pub fn get_u32(buf: &mut &[u8]) -> TransportResult<u32> {
    if buf.remaining() < 4 {
        return Err(TransportError::Malformed("uint32 truncated".to_string()));
    }
    Ok(buf.get_u32())
}

/// Read a `boolean` field
pub fn get_bool(buf: &mut &[u8]) -> TransportResult<bool> {
    if !buf.has_remaining() {
        return Err(TransportError::Malformed("boolean truncated".to_string()));
    }
    Ok(buf.get_u8() != 0)
}

/// `env` request: one environment variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

impl WireMessage for EnvRequest {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_string(buf, self.name.as_bytes());
        put_string(buf, self.value.as_bytes());
    }

    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self> {
        Ok(Self {
            name: get_utf8(buf)?,
            value: get_utf8(buf)?,
        })
    }
}

/// `exec` and `subsystem` requests: a single command string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command line or subsystem name
    pub command: String,
}

impl WireMessage for CommandRequest {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_string(buf, self.command.as_bytes());
    }

    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self> {
        Ok(Self {
            command: get_utf8(buf)?,
        })
    }
}

/// `exit-status` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code of the command
    pub status: u32,
}

impl WireMessage for ExitStatus {
    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.status);
    }

    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self> {
        Ok(Self {
            status: get_u32(buf)?,
        })
    }
}

/// `exit-signal` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the `SIG` prefix
    pub signal: String,
    /// Whether a core dump was produced
    pub core_dumped: bool,
    /// Error message
    pub message: String,
    /// Language tag of the message
    pub language: String,
}

impl WireMessage for ExitSignal {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_string(buf, self.signal.as_bytes());
        buf.put_u8(self.core_dumped as u8);
        put_string(buf, self.message.as_bytes());
        put_string(buf, self.language.as_bytes());
    }

    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self> {
        Ok(Self {
            signal: get_utf8(buf)?,
            core_dumped: get_bool(buf)?,
            message: get_utf8(buf)?,
            language: get_utf8(buf)?,
        })
    }
}

/// `pty-req` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value of the `TERM` environment variable
    pub term: String,
    /// Width in characters
    pub columns: u32,
    /// Height in rows
    pub rows: u32,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
    /// Encoded terminal modes
    pub modes: Bytes,
}

impl WireMessage for PtyRequest {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_string(buf, self.term.as_bytes());
        buf.put_u32(self.columns);
        buf.put_u32(self.rows);
        buf.put_u32(self.width_px);
        buf.put_u32(self.height_px);
        put_string(buf, &self.modes);
    }

    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self> {
        Ok(Self {
            term: get_utf8(buf)?,
            columns: get_u32(buf)?,
            rows: get_u32(buf)?,
            width_px: get_u32(buf)?,
            height_px: get_u32(buf)?,
            modes: get_string(buf)?,
        })
    }
}

/// `window-change` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    /// Width in characters
    pub columns: u32,
    /// Height in rows
    pub rows: u32,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
}

impl WireMessage for WindowChange {
    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.columns);
        buf.put_u32(self.rows);
        buf.put_u32(self.width_px);
        buf.put_u32(self.height_px);
    }

    fn decode_from(buf: &mut &[u8]) -> TransportResult<Self> {
        Ok(Self {
            columns: get_u32(buf)?,
            rows: get_u32(buf)?,
            width_px: get_u32(buf)?,
            height_px: get_u32(buf)?,
        })
    }
}
