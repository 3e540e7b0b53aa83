//! Error types for aircast.

use thiserror::Error;

/// Result type alias using aircast's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of the audio path an xrun occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrunKind {
    /// The playback buffer drained.
    Underrun,
    /// The capture buffer overflowed.
    Overrun,
}

/// Main error type for aircast operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A wire or grammar violation. Non-retryable at the point of decode.
    ///
    /// `offset` is the byte position the decoder had reached, preserved for
    /// caller diagnostics.
    #[error("malformed input at byte {offset}: {detail}")]
    Malformed {
        /// What the decoder was expecting.
        detail: String,
        /// Byte offset of the failure.
        offset: usize,
    },

    /// A peer-requested option this side does not advertise.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An operation issued in a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O to a pipe, player or recorder returned a short or negative count.
    #[error("transaction failed: {0}")]
    FailedTransaction(String),

    /// Non-blocking operation cannot proceed right now. Only surfaced
    /// through the audio prefill path.
    #[error("operation would block")]
    WouldBlock,

    /// Audio over/underrun, surfaced to the loopback event callback.
    #[error("audio xrun: {0:?}")]
    Xrun(XrunKind),

    /// Capability config document error.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a [`Error::Malformed`] with a byte offset.
    pub fn malformed(detail: impl Into<String>, offset: usize) -> Self {
        Error::Malformed {
            detail: detail.into(),
            offset,
        }
    }

    /// Returns true for [`Error::Malformed`].
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_carries_offset() {
        let err = Error::malformed("bad hex field", 17);
        match err {
            Error::Malformed { offset, .. } => assert_eq!(offset, 17),
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = Error::Unsupported("wfd_uibc_capability".into());
        assert_eq!(err.to_string(), "unsupported: wfd_uibc_capability");

        let err = Error::WouldBlock;
        assert_eq!(err.to_string(), "operation would block");
    }
}
