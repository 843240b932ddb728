// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! File-container kinds addressable over the wire.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The logical filesystem namespaces a file operation can be routed to.
///
/// The wire carries these as strings; the boundary maps them onto concrete
/// container backends. Not every target supports every kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    /// The data sandbox of a single application, keyed by bundle id.
    AppSandbox,
    /// The media library (camera roll).
    Media,
    /// The root filesystem of the target.
    Root,
    /// Installed provisioning profiles.
    ProvisioningProfiles,
    /// Installed MDM configuration profiles.
    MdmProfiles,
    /// Crash reports.
    Crashes,
    /// Springboard icon layout.
    SpringboardIcons,
    /// Wallpaper images.
    Wallpaper,
    /// Mounted developer disk images.
    DiskImages,
    /// Debug symbols.
    Symbols,
    /// Auxiliary storage managed by the companion itself.
    Auxiliary,
}

impl ContainerKind {
    /// The string form used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::AppSandbox => "app-sandbox",
            ContainerKind::Media => "media",
            ContainerKind::Root => "root",
            ContainerKind::ProvisioningProfiles => "provisioning-profiles",
            ContainerKind::MdmProfiles => "mdm-profiles",
            ContainerKind::Crashes => "crashes",
            ContainerKind::SpringboardIcons => "springboard-icons",
            ContainerKind::Wallpaper => "wallpaper",
            ContainerKind::DiskImages => "disk-images",
            ContainerKind::Symbols => "symbols",
            ContainerKind::Auxiliary => "auxiliary",
        }
    }

    /// All known container kinds.
    pub fn variants() -> &'static [ContainerKind] {
        &[
            ContainerKind::AppSandbox,
            ContainerKind::Media,
            ContainerKind::Root,
            ContainerKind::ProvisioningProfiles,
            ContainerKind::MdmProfiles,
            ContainerKind::Crashes,
            ContainerKind::SpringboardIcons,
            ContainerKind::Wallpaper,
            ContainerKind::DiskImages,
            ContainerKind::Symbols,
            ContainerKind::Auxiliary,
        ]
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned while parsing a [`ContainerKind`] from a string.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unrecognized container kind: {input}")]
pub struct ContainerKindParseError {
    input: String,
}

impl FromStr for ContainerKind {
    type Err = ContainerKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::variants()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ContainerKindParseError { input: s.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_kind_parse_round_trip() {
        for kind in ContainerKind::variants() {
            assert_eq!(kind.as_str().parse::<ContainerKind>().unwrap(), *kind);
        }
        assert!("sandbox".parse::<ContainerKind>().is_err());
    }
}
