//! Error types for the transport and dispatch layers.
//!
//! Three tiers, matching how far a failure is allowed to spread:
//!
//! - [`TransportError`]: setup and API-misuse failures reported to the caller.
//!   Never fatal to the process on their own.
//! - [`ConnectionError`]: the reason a single connection was torn down.
//! - [`PayloadError`]: a typed payload did not parse. The message is dropped,
//!   the connection survives.

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

use crate::socket::server::ConnId;

/// Failures while creating sockets or queueing frames.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket path does not fit in `sockaddr_un.sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {}", path.display())]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
        /// Its length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Binding or listening on the rendezvous path failed.
    #[error("bind {}: {source}", path.display())]
    Bind {
        /// Path we tried to bind.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Connecting to the rendezvous path failed.
    #[error("connect {}: {source}", path.display())]
    Connect {
        /// Path we tried to connect to.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An inherited listening descriptor was not usable.
    #[error("invalid file descriptor: {0}")]
    InvalidFd(RawFd),

    /// Payload exceeds what the peer would accept.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload length.
        size: usize,
        /// Maximum allowed size.
        max: u32,
    },

    /// The handle no longer names a live connection.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    /// The event loop owning the connection has gone away.
    #[error("event loop is gone")]
    LoopClosed,

    /// Any other socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a connection was destroyed.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Peer closed its end (zero-byte read).
    #[error("peer closed the connection")]
    Closed,

    /// Read failed with something other than would-block or interrupted.
    #[error("reading unix domain socket: {0}")]
    Read(#[source] io::Error),

    /// Write failed with something other than would-block or interrupted.
    #[error("writing to unix domain socket: {0}")]
    Write(#[source] io::Error),

    /// Header announced a payload no legitimate peer would send. The stream
    /// cannot be resynchronised after this.
    #[error("message size {size} exceeds maximum {max}")]
    Oversized {
        /// Size announced by the header.
        size: u32,
        /// Maximum accepted size.
        max: u32,
    },
}

/// A message payload did not match the layout its type requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Fewer bytes than the fixed part of the payload.
    #[error("{what} payload too short: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Payload kind.
        what: &'static str,
        /// Minimum length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Payload length is not consistent with a count or size field.
    #[error("{what} payload length {actual} does not match declared {declared}")]
    LengthMismatch {
        /// Payload kind.
        what: &'static str,
        /// Length implied by the payload's own fields.
        declared: usize,
        /// Actual length.
        actual: usize,
    },

    /// Scratch buffer for conversion could not be allocated.
    #[error("out of memory converting {what}")]
    OutOfMemory {
        /// Payload kind.
        what: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_too_long_message_names_path() {
        let err = TransportError::PathTooLong {
            path: PathBuf::from("/tmp/x.sock"),
            len: 200,
            max: 107,
        };
        let msg = err.to_string();
        assert!(msg.contains("too long"), "{msg}");
        assert!(msg.contains("/tmp/x.sock"), "{msg}");
    }

    #[test]
    fn test_oversized_message() {
        let err = ConnectionError::Oversized { size: u32::MAX, max: 1024 };
        assert_eq!(err.to_string(), format!("message size {} exceeds maximum 1024", u32::MAX));
    }
}
