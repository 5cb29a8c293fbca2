//! PioError: unified error type for pario public APIs.
//!
//! Every internal function returns a status up through its caller; there are
//! no panics on library paths. Communication failures are fatal to the
//! enclosing call and carry the peer rank they were detected on.

use thiserror::Error;

/// Unified error type for pario operations.
#[derive(Debug, Error)]
pub enum PioError {
    /// Malformed arguments rejected before any communication begins.
    #[error("invalid argument: {0}")]
    InvalidArguments(String),
    /// A send, receive, or wait on the underlying communicator failed.
    #[error("communication with rank {peer} failed: {detail}")]
    Comm { peer: usize, detail: String },
    /// A buffer could not be sized as required.
    #[error("allocation of {0} bytes failed")]
    OutOfMemory(usize),
    /// No decomposition registered under this id.
    #[error("unknown decomposition id {0}")]
    BadIoid(i32),
    /// No open file registered under this id.
    #[error("unknown file id {0}")]
    BadNcid(i32),
    /// The union of per-task maps is not a partition of the global space.
    #[error("decomposition is not a partition: global index {0} claimed twice")]
    DuplicateIndex(i64),
    /// A map entry points outside the global array.
    #[error("map entry {found} out of range for global size {gsize}")]
    MapOutOfRange { found: i64, gsize: i64 },
    /// The format dispatch layer reported a failure.
    #[error("dispatch error: {0}")]
    Dispatch(String),
    /// Reading or writing a persisted decomposition file failed.
    #[error("decomposition file: {0}")]
    DecompFile(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PioError {
    /// Shorthand for an [`PioError::InvalidArguments`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        PioError::InvalidArguments(msg.into())
    }

    /// Shorthand for a [`PioError::Comm`] wrapping a backend failure.
    pub fn comm(peer: usize, msg: impl Into<String>) -> Self {
        PioError::Comm {
            peer,
            detail: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_error_carries_peer_and_detail() {
        let err = PioError::comm(3, "handshake lost");
        assert_eq!(
            err.to_string(),
            "communication with rank 3 failed: handshake lost"
        );
        // backend text is a plain message, not a chained source
        assert!(std::error::Error::source(&err).is_none());
    }
}
