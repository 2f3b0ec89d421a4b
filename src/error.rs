//! Error and Result types.

use std::io;

/// A specialized `Result` type for pggate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All the ways the gateway can fail.
///
/// Session-level errors are never retried: the session is torn down and the
/// client must reconnect. The only pool-level recovery is the single
/// dead-connection replacement performed inside [`Pool::get`][crate::pool::Pool::get].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unreadable configuration. Fatal at startup.
    #[error("configuration: {0}")]
    Config(String),

    /// Malformed wire framing (length below the protocol minimum, short read,
    /// unexpected EOF mid-message). Terminates the affected session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A pool could not open a new connection to its upstream.
    #[error("upstream {address} unreachable")]
    UpstreamUnreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure on an established backend connection. The
    /// offending connection is discarded, never returned to its pool.
    #[error("upstream i/o")]
    UpstreamIo(#[source] io::Error),

    /// Read or write failure on the client socket.
    #[error("client i/o")]
    ClientIo(#[source] io::Error),

    /// A read or write deadline expired. Treated like an I/O failure.
    #[error("i/o deadline exceeded")]
    Timeout,

    /// `get` was called on a pool that has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl Error {
    /// Classify an I/O failure on the client socket.
    pub(crate) fn client(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::InvalidData => Error::Protocol(err.to_string()),
            _ => Error::ClientIo(err),
        }
    }

    /// Classify an I/O failure on a backend connection.
    pub(crate) fn upstream(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::InvalidData => Error::Protocol(err.to_string()),
            _ => Error::UpstreamIo(err),
        }
    }
}
