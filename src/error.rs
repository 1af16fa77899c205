//! Error reporting for the reactor and client pool.
//!
//! Per-connection failures never abort the event loop: the offending
//! connection is closed and an `Error` is handed to the `on_error` callback.
//! Only startup failures (bad bind, missing `on_error`) panic.

use std::fmt;
use thiserror::Error;

/// Classifies where an error was raised, mirroring the reactor's close paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `accept(2)` failed on the listen socket.
    Accept,
    /// A socket option could not be applied to a fresh connection.
    SetNonblock,
    /// TLS handshake or record-layer failure.
    Ssl,
    /// A readiness event arrived for an unknown token.
    Lookup,
    /// Read-side failure, including protocol parse errors.
    Read,
    /// Write-side failure.
    Write,
    /// Buffered input exceeded the configured maximum.
    Oversize,
    /// WebSocket protocol violation.
    Websocket,
    /// Peer closed its end of the connection.
    Eof,
    /// Idle timeout (server) or request death-timer (client) expired.
    Timeout,
    /// `close(2)` itself failed.
    Close,
    /// A panic escaped the reactor loop.
    Panic,
    /// The upstream peer answered a client command with a RESP error.
    Reply,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Accept => "accept",
            ErrorKind::SetNonblock => "setnonblock",
            ErrorKind::Ssl => "ssl",
            ErrorKind::Lookup => "lookup",
            ErrorKind::Read => "read",
            ErrorKind::Write => "write",
            ErrorKind::Oversize => "oversize",
            ErrorKind::Websocket => "websocket",
            ErrorKind::Eof => "eof",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Close => "close",
            ErrorKind::Panic => "panic",
            ErrorKind::Reply => "reply",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error paired with the close path that produced it.
#[derive(Debug, Error)]
#[error("{kind}: {cause}")]
pub struct Error {
    pub kind: ErrorKind,
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            kind,
            cause: cause.into(),
        }
    }

    pub fn io(kind: ErrorKind, cause: std::io::Error) -> Self {
        Error::new(kind, cause)
    }

    /// Shorthand for errors whose cause is a plain message.
    pub fn msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error::new(kind, msg.into())
    }
}
