// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The error taxonomy as it appears on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of failure an operation resolved with.
///
/// Every error produced by the companion core maps onto exactly one of these
/// kinds; the boundary translates them to transport status codes. Internal
/// code never performs that translation itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A bad path, bad identifier or missing required field.
    InvalidArgument,
    /// A bundle, file or descriptor was not present.
    NotFound,
    /// A unique-path ingest collided with an existing artifact.
    AlreadyExists,
    /// The bundle's architectures do not intersect the target's.
    IncompatibleArchitecture,
    /// The operation requires a target state the target is not in.
    TargetState,
    /// A deadline was exceeded.
    Timeout,
    /// The operation was cancelled.
    Cancelled,
    /// An OS-level I/O error.
    Io,
    /// The chosen file container does not implement the capability.
    BackendUnsupported,
    /// Test bus framing or decoding failed.
    Protocol,
    /// A spawned process exited outside the acceptable set, or was signalled.
    Subprocess,
    /// An invariant was violated; a companion bug.
    Internal,
}

impl ErrorKind {
    /// The string form used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::IncompatibleArchitecture => "incompatible-architecture",
            ErrorKind::TargetState => "target-state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::BackendUnsupported => "backend-unsupported",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Subprocess => "subprocess",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure as delivered to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WireError {
    /// The taxonomy kind.
    pub kind: ErrorKind,

    /// A human-readable description of the failure.
    pub message: String,
}
