// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `companiond` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum CompanionExitCode {}

impl CompanionExitCode {
    /// The daemon shut down cleanly.
    pub const OK: i32 = 0;

    /// The daemon could not initialize: the storage root was unwritable, or
    /// the target was unreachable while operating in attached mode.
    pub const INIT_FAILED: i32 = 2;

    /// The daemon's listen socket could not be bound.
    pub const BIND_FAILED: i32 = 3;
}
