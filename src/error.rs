// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error kinds surfaced by the wire transport. Every fallible operation in
// the crate returns `Result<T, WireError>`; nothing is swallowed except the
// documented drop-on-close behaviour of result-set writers.

use thiserror::Error;

/// Errors raised by the shared-memory wire transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A segment, wire, or named in-segment object could not be located.
    #[error("cannot find {0}")]
    NotFound(String),

    /// No free response-box slot or no free connection ticket.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// The deadline elapsed before the awaited event.
    #[error("{0} has not been received within the specified time")]
    Timeout(&'static str),

    /// A wait timed out and the status provider reports the server gone.
    #[error("server crashed")]
    ServerDead,

    /// The disconnect sentinel frame was observed (server side only).
    #[error("client disconnected")]
    ClientDisconnected,

    /// A header carried fields inconsistent with the segment layout.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The operation was attempted on a channel already closed by the peer.
    #[error("channel closed by peer")]
    Closed,

    /// The segment allocator or a process-shared primitive is irrecoverable.
    #[error("fatal wire error: {0}")]
    Fatal(String),
}

impl WireError {
    /// Whether the caller may simply retry the operation later.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether the session is permanently unusable after this error.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ServerDead | Self::Closed | Self::Fatal(_))
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Fatal(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WireError>;
