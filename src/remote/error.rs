//! Error taxonomy for connections and file tasks.
//!
//! Errors are classified once, at the transport adapter boundary, into a small
//! fixed vocabulary. Everything downstream (retry loops, pool discard decisions,
//! callers) matches on [`ErrorKind`] and never inspects message text.
//!
//! # Retry Classification
//!
//! 1. **Generic failure** ([`ErrorKind::Failure`]): the remote side reported a
//!    failure without a more specific code. Possibly transient, retried within a
//!    fixed bound by stat/list/upload.
//!
//! 2. **Channel lost** ([`ErrorKind::ChannelLost`]): the sub-channel or the
//!    connection under it died. The channel is discarded instead of pooled.
//!    Upload retries on a fresh channel; other operations surface it.
//!
//! 3. **Everything else** (no such file, permission denied, unsupported, local
//!    I/O, cancellation): terminal on the first occurrence.

use std::fmt;
use std::io;

use thiserror::Error;

/// Why a connection attempt did not produce a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    /// Credentials were rejected or the handshake timed out. The transport cannot
    /// tell these two apart, so they share one variant.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The caller or the process aborted the attempt.
    #[error("connection attempt cancelled")]
    Cancelled,
    /// Network or protocol level failure.
    #[error("connection failed: {0}")]
    Io(String),
}

impl ConnectFailure {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Machine-checkable failure class carried by every task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoSuchFile,
    PermissionDenied,
    /// Generic remote failure without a specific code.
    Failure,
    Unsupported,
    /// The channel or connection died mid-operation.
    ChannelLost,
    /// Local filesystem error while reading or writing a payload.
    LocalIo,
    NotConnected,
    Cancelled,
    Timeout,
    InvalidInput,
}

impl ErrorKind {
    /// Whether the pooled channel that produced this error must not be reused.
    pub fn corrupts_channel(self) -> bool {
        matches!(self, Self::ChannelLost)
    }

    /// Conventional process-style exit status for callers that want one.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::NoSuchFile => 2,
            Self::PermissionDenied => 13,
            Self::Unsupported => 95,
            Self::Cancelled => 130,
            Self::Timeout => 124,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoSuchFile => "no such file",
            Self::PermissionDenied => "permission denied",
            Self::Failure => "failure",
            Self::Unsupported => "unsupported operation",
            Self::ChannelLost => "channel lost",
            Self::LocalIo => "local i/o error",
            Self::NotConnected => "not connected",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timed out",
            Self::InvalidInput => "invalid input",
        };
        f.write_str(text)
    }
}

/// An error reported by a transport adapter, before operation context is added.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Decorate with the operation and path that produced it.
    pub fn context(self, op: &'static str, path: impl Into<String>) -> TaskError {
        TaskError {
            kind: self.kind,
            op,
            path: path.into(),
            message: self.message,
        }
    }
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        Self::new(classify_io(&e), e.to_string())
    }
}

/// A failed transfer task, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} '{path}' failed ({kind}): {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub op: &'static str,
    pub path: String,
    pub message: String,
}

impl TaskError {
    pub fn new(
        kind: ErrorKind,
        op: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            op,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Local filesystem failure: always terminal.
    pub fn local_io(op: &'static str, path: impl Into<String>, e: &io::Error) -> Self {
        Self::new(ErrorKind::LocalIo, op, path, e.to_string())
    }

    /// Whether a bounded retry loop may try again.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Failure)
    }

    /// Transient for uploads, which also retry on a fresh channel.
    pub fn is_transient_transfer(&self) -> bool {
        matches!(self.kind, ErrorKind::Failure | ErrorKind::ChannelLost)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Classify an I/O error raised while talking over a channel stream.
///
/// Broken streams mean the channel is gone; everything else is reported as a
/// generic failure.
pub(crate) fn classify_io(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::NoSuchFile,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::Unsupported => ErrorKind::Unsupported,
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ErrorKind::ChannelLost,
        _ => ErrorKind::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod transient_classification {
        use super::*;

        #[test]
        fn test_only_generic_failure_is_transient() {
            let transient = TaskError::new(ErrorKind::Failure, "stat", "/a", "boom");
            assert!(transient.is_transient());

            for kind in [
                ErrorKind::NoSuchFile,
                ErrorKind::PermissionDenied,
                ErrorKind::Unsupported,
                ErrorKind::ChannelLost,
                ErrorKind::LocalIo,
                ErrorKind::Cancelled,
            ] {
                let err = TaskError::new(kind, "stat", "/a", "x");
                assert!(!err.is_transient(), "{kind} must be terminal");
            }
        }

        #[test]
        fn test_transfer_also_retries_lost_channel() {
            let err = TaskError::new(ErrorKind::ChannelLost, "upload", "/a", "eof");
            assert!(err.is_transient_transfer());
            let err = TaskError::new(ErrorKind::NoSuchFile, "upload", "/a", "gone");
            assert!(!err.is_transient_transfer());
        }

        #[test]
        fn test_only_channel_lost_corrupts_channel() {
            assert!(ErrorKind::ChannelLost.corrupts_channel());
            assert!(!ErrorKind::Failure.corrupts_channel());
        }
    }

    mod io_classification {
        use super::*;

        #[test]
        fn test_broken_pipe_is_channel_lost() {
            let e = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
            assert_eq!(classify_io(&e), ErrorKind::ChannelLost);
        }

        #[test]
        fn test_not_found_maps_to_no_such_file() {
            let e = io::Error::new(io::ErrorKind::NotFound, "nope");
            assert_eq!(RemoteError::from(e).kind, ErrorKind::NoSuchFile);
        }

        #[test]
        fn test_other_is_generic_failure() {
            let e = io::Error::other("weird");
            assert_eq!(classify_io(&e), ErrorKind::Failure);
        }
    }

    mod decoration {
        use super::*;

        #[test]
        fn test_context_keeps_kind_and_adds_path() {
            let err = RemoteError::new(ErrorKind::PermissionDenied, "denied")
                .context("rename", "/srv/app.tar");
            assert_eq!(err.kind, ErrorKind::PermissionDenied);
            assert_eq!(err.op, "rename");
            assert_eq!(
                err.to_string(),
                "rename '/srv/app.tar' failed (permission denied): denied"
            );
        }

        #[test]
        fn test_connect_failure_display() {
            assert_eq!(
                ConnectFailure::Cancelled.to_string(),
                "connection attempt cancelled"
            );
            assert!(ConnectFailure::Authentication("x".into()).is_authentication());
            assert!(!ConnectFailure::Io("x".into()).is_authentication());
        }

        #[test]
        fn test_exit_codes() {
            assert_eq!(ErrorKind::NoSuchFile.exit_code(), 2);
            assert_eq!(ErrorKind::Failure.exit_code(), 1);
        }
    }
}
