// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Daemon configuration.

use camino::Utf8PathBuf;
use clap::Parser;

/// Companion daemon for driving one iOS simulator or device.
#[derive(Debug, Parser)]
#[command(name = "companiond", version, about)]
pub struct Args {
    /// Directory persisted artifacts are stored under.
    #[arg(long, value_name = "DIR")]
    pub storage_root: Utf8PathBuf,

    /// Directory ephemeral working state lives under.
    #[arg(long, value_name = "DIR")]
    pub temp_root: Utf8PathBuf,

    /// TCP port the companion listens on.
    #[arg(long, default_value_t = 10882)]
    pub port: u16,

    /// Port reserved for debugserver connections.
    #[arg(long, default_value_t = 10881)]
    pub debugserver_port: u16,

    /// Back the companion with a loopback target rooted at this directory
    /// instead of an attached device or simulator.
    #[arg(long, value_name = "DIR")]
    pub loopback_root: Option<Utf8PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<Utf8PathBuf>,

    /// Log filter directives, e.g. `info` or `companion_runner=debug`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

/// The resolved configuration record handed to the daemon at startup.
#[derive(Clone, Debug)]
pub struct CompanionConfig {
    /// The storage root.
    pub storage_root: Utf8PathBuf,
    /// The temporary workspace root.
    pub temp_root: Utf8PathBuf,
    /// The listen port.
    pub port: u16,
    /// The debugserver port.
    pub debugserver_port: u16,
    /// The loopback backing directory, when not attached.
    pub loopback_root: Option<Utf8PathBuf>,
    /// The log file, if logging to a file.
    pub log_file: Option<Utf8PathBuf>,
}

impl From<&Args> for CompanionConfig {
    fn from(args: &Args) -> Self {
        Self {
            storage_root: args.storage_root.clone(),
            temp_root: args.temp_root.clone(),
            port: args.port,
            debugserver_port: args.debugserver_port,
            loopback_root: args.loopback_root.clone(),
            log_file: args.log_file.clone(),
        }
    }
}
