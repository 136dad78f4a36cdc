//! Error types for transport operations.

use std::io;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while speaking the Gateway Exchange Protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A decoder needs more bytes than the buffer holds. Resumable: feed
    /// more data and retry.
    #[error("not enough data: need {needed} bytes, have {available}")]
    NotEnoughData {
        /// Bytes required to make progress.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Received bytes violate the protocol. The connection is terminated.
    #[error("malformed {context}: {detail}")]
    Malformed {
        /// What was being decoded.
        context: &'static str,
        /// Why it failed.
        detail: String,
    },

    /// A measurement referenced a signal index absent from the cache.
    /// The measurement is skipped; the connection survives.
    #[error("unknown signal index {0}")]
    UnknownSignalIndex(u16),

    /// A compact record referenced a base time offset that has not been
    /// received yet. The record is skipped.
    #[error("no base time offset defined for time index {0}")]
    MissingBaseTime(usize),

    /// A TSSC sequence number jumped without a reset. Packets are dropped
    /// until a reset is observed.
    #[error("compressed payload out of sequence: expected {expected}, received {actual}")]
    OutOfSequence {
        /// The sequence number the decoder expected.
        expected: u16,
        /// The sequence number that arrived.
        actual: u16,
    },

    /// The publisher answered a solicited command with a failure response.
    #[error("server rejected command {command:#04X}: {message}")]
    RemoteFailure {
        /// The original command code.
        command: u8,
        /// The failure text sent by the server.
        message: String,
    },

    /// The peer closed, reset, or aborted the connection.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Hostname resolution produced no usable address.
    #[error("cannot resolve {host}:{port}")]
    Resolve {
        /// The hostname that failed to resolve.
        host: String,
        /// The port that was requested.
        port: u16,
    },

    /// GZip inflate or deflate failure on an exchanged payload.
    #[error("compression error: {0}")]
    Compression(String),

    /// An operation was invoked in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Create a malformed-data error.
    pub fn malformed(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            context,
            detail: detail.into(),
        }
    }

    /// Check whether this error is resumable: the caller may retry after
    /// supplying more input.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::NotEnoughData { .. })
    }

    /// Check whether this error only invalidates one record, leaving the
    /// stream and connection intact.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownSignalIndex(_) | Self::MissingBaseTime(_)
        )
    }

    /// Check whether this error means the connection is gone. I/O errors
    /// from the sockets map here as well: the engine treats any OS-level
    /// failure as a lost connection.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Io(_))
    }
}

/// Map a socket-level error into the transport taxonomy.
pub(crate) fn connection_lost(err: &io::Error) -> Error {
    Error::ConnectionLost(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable() {
        let err = Error::NotEnoughData {
            needed: 15,
            available: 7,
        };
        assert!(err.is_resumable());
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn test_record_errors_do_not_kill_the_stream() {
        assert!(Error::UnknownSignalIndex(42).is_record_error());
        assert!(Error::MissingBaseTime(1).is_record_error());
        assert!(!Error::malformed("frame", "bad marker").is_record_error());
    }

    #[test]
    fn test_io_maps_to_connection_lost() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(err.is_connection_lost());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::RemoteFailure {
            command: 0x02,
            message: "subscription denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "server rejected command 0x02: subscription denied"
        );

        let err = Error::OutOfSequence {
            expected: 6,
            actual: 9,
        };
        assert_eq!(
            err.to_string(),
            "compressed payload out of sequence: expected 6, received 9"
        );
    }
}
