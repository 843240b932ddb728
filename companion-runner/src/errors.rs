// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the companion core.
//!
//! Every operation in this crate fails into exactly one [`CompanionError`].
//! The type is `Clone` so a single terminal error can be fanned out to every
//! waiter on an operation; OS errors are wrapped in `Arc` for that reason.
//! Mapping to transport status codes happens once, at the RPC boundary.

use crate::target::TargetState;
use camino::Utf8PathBuf;
use companion_metadata::ErrorKind;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;

/// The result type used throughout the companion core.
pub type CompanionResult<T> = Result<T, CompanionError>;

/// An error from a companion operation.
#[derive(Clone, Debug, Error)]
pub enum CompanionError {
    /// A bad path, bad identifier or missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bundle, file or descriptor was not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique-path ingest collided with an existing artifact.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The bundle's supported architectures do not intersect the target's.
    #[error(
        "bundle `{bundle_id}` supports [{}] but the target executes [{}]",
        .bundle_archs.join(", "),
        .target_archs.join(", "),
    )]
    IncompatibleArchitecture {
        /// The identifier of the rejected bundle.
        bundle_id: String,
        /// The architectures the bundle supports.
        bundle_archs: Vec<String>,
        /// The architectures the target executes.
        target_archs: Vec<String>,
    },

    /// The operation requires a target state the target is not in.
    #[error("operation requires target state `{required}`, but target is `{actual}`")]
    TargetState {
        /// The state the operation requires.
        required: TargetState,
        /// The state the target was observed in.
        actual: TargetState,
    },

    /// A deadline was exceeded.
    #[error("timed out after {after:?}: {reason}")]
    Timeout {
        /// How long the operation was given.
        after: Duration,
        /// What was being waited for.
        reason: String,
    },

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An OS-level I/O error.
    #[error("I/O error {context}")]
    Io {
        /// What the companion was doing when the error occurred.
        context: String,
        /// The underlying OS error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The chosen file container does not implement the capability.
    #[error("container `{container}` does not support {operation}")]
    BackendUnsupported {
        /// The operation that was attempted.
        operation: &'static str,
        /// A description of the container.
        container: String,
    },

    /// Test bus framing or decoding failed.
    #[error("test bus protocol error: {0}")]
    Protocol(String),

    /// A spawned process exited outside the acceptable set, or was signalled.
    #[error("process `{command}` {description}")]
    Subprocess {
        /// The launch path of the process.
        command: String,
        /// How the process terminated.
        description: String,
    },

    /// An invariant was violated; a companion bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CompanionError {
    /// Wraps an OS error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CompanionError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Wraps an OS error that occurred while operating on `path`.
    pub fn io_path(verb: &str, path: &camino::Utf8Path, source: io::Error) -> Self {
        CompanionError::io(format!("while {verb} `{path}`"), source)
    }

    /// Constructs an [`InvalidArgument`](Self::InvalidArgument) error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CompanionError::InvalidArgument(message.into())
    }

    /// Constructs a [`NotFound`](Self::NotFound) error for a path.
    pub fn path_not_found(path: &camino::Utf8Path) -> Self {
        CompanionError::NotFound(format!("path `{path}`"))
    }

    /// The taxonomy kind of this error, for boundary translation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompanionError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CompanionError::NotFound(_) => ErrorKind::NotFound,
            CompanionError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CompanionError::IncompatibleArchitecture { .. } => ErrorKind::IncompatibleArchitecture,
            CompanionError::TargetState { .. } => ErrorKind::TargetState,
            CompanionError::Timeout { .. } => ErrorKind::Timeout,
            CompanionError::Cancelled => ErrorKind::Cancelled,
            CompanionError::Io { .. } => ErrorKind::Io,
            CompanionError::BackendUnsupported { .. } => ErrorKind::BackendUnsupported,
            CompanionError::Protocol(_) => ErrorKind::Protocol,
            CompanionError::Subprocess { .. } => ErrorKind::Subprocess,
            CompanionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompanionError::Cancelled)
    }
}

/// An aggregate of per-file failures from an `all` over independent files.
///
/// Partial failure of independent file work is surfaced as a whole; each
/// file's error is retained.
#[derive(Clone, Debug, Error)]
#[error("{} of {} files failed: {}", .failures.len(), .total, summarize(.failures))]
pub struct FileBatchError {
    /// The number of files in the batch.
    pub total: usize,
    /// The failures, by path.
    pub failures: Vec<(Utf8PathBuf, CompanionError)>,
}

fn summarize(failures: &[(Utf8PathBuf, CompanionError)]) -> String {
    failures
        .iter()
        .map(|(path, error)| format!("`{path}`: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<FileBatchError> for CompanionError {
    fn from(error: FileBatchError) -> Self {
        // The aggregate keeps its taxonomy kind from the first failure so a
        // batch of not-founds still maps to not-found at the boundary.
        match error.failures.first() {
            Some((_, first)) => match first {
                CompanionError::NotFound(_) => CompanionError::NotFound(error.to_string()),
                _ => CompanionError::io(
                    error.to_string(),
                    io::Error::other("file batch failure"),
                ),
            },
            None => CompanionError::Internal("empty file batch error".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            CompanionError::invalid_argument("x").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(CompanionError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            CompanionError::io("reading", io::Error::other("boom")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn incompatible_architecture_message() {
        let error = CompanionError::IncompatibleArchitecture {
            bundle_id: "com.x.Sample".to_owned(),
            bundle_archs: vec!["x86_64".to_owned()],
            target_archs: vec!["arm64".to_owned()],
        };
        assert_eq!(
            error.to_string(),
            "bundle `com.x.Sample` supports [x86_64] but the target executes [arm64]"
        );
    }
}
