// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Install framing and persisted-artifact descriptions.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of artifact carried by an install stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallKind {
    /// An `.app` bundle.
    App,
    /// An `.xctest` bundle, or a directory containing an `.xctestrun` file.
    Xctest,
    /// A single dynamic library.
    Dylib,
    /// A `.framework` bundle.
    Framework,
    /// A `.dSYM` bundle or a directory of dSYMs.
    Dsym,
}

impl InstallKind {
    /// Returns the string form used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            InstallKind::App => "app",
            InstallKind::Xctest => "xctest",
            InstallKind::Dylib => "dylib",
            InstallKind::Framework => "framework",
            InstallKind::Dsym => "dsym",
        }
    }
}

impl fmt::Display for InstallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The compression applied to an install stream's chunk frames.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamCompression {
    /// The stream is an uncompressed tar.
    #[default]
    None,
    /// The stream is a gzip-compressed tar.
    Gzip,
    /// The stream is a zstd-compressed tar.
    Zstd,
}

/// The header frame of a client-streaming install.
///
/// Sent exactly once, before any chunk frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstallHeader {
    /// The kind of artifact the stream carries.
    pub kind: InstallKind,

    /// The compression applied to the chunk frames.
    #[serde(default)]
    pub compression: StreamCompression,

    /// A client-provided name for name-keyed artifacts (dylibs).
    #[serde(default)]
    pub name: Option<String>,

    /// Whether to mark the installed app as debuggable.
    #[serde(default)]
    pub make_debuggable: bool,

    /// Whether to rewrite modification times of extracted files to now.
    #[serde(default)]
    pub override_mtime: bool,

    /// Whether to skip codesigning of ingested test bundles.
    #[serde(default)]
    pub skip_signing: bool,

    /// For dSYM installs: the bundle identifier to link the dSYM against.
    #[serde(default)]
    pub link_to: Option<String>,
}

/// A bundle or file that storage has persisted, as reported to the client.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstalledArtifactInfo {
    /// The logical name of the artifact.
    pub name: String,

    /// The content UUID of the artifact, if one was extracted.
    pub uuid: Option<Uuid>,

    /// The absolute on-disk path of the artifact.
    pub path: Utf8PathBuf,
}

/// An installed application, as reported by `list_apps`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstalledAppInfo {
    /// The bundle identifier.
    pub bundle_id: String,

    /// The display name of the app.
    pub name: String,

    /// How the app got onto the target.
    pub install_type: AppInstallType,

    /// The architectures the app's executable supports.
    pub architectures: Vec<String>,

    /// The running pid, if process state was fetched and the app is running.
    pub pid: Option<u32>,
}

/// How an application was installed on the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppInstallType {
    /// A user-installed application.
    User,
    /// An application that shipped with the OS.
    System,
    /// Installed state could not be determined.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_header_defaults() {
        let header: InstallHeader =
            serde_json::from_str(r#"{"kind":"app"}"#).expect("header deserializes");
        assert_eq!(header.kind, InstallKind::App);
        assert_eq!(header.compression, StreamCompression::None);
        assert!(!header.make_debuggable);
        assert!(header.name.is_none());
        assert!(header.link_to.is_none());
    }

    #[test]
    fn install_kind_round_trip() {
        for kind in [
            InstallKind::App,
            InstallKind::Xctest,
            InstallKind::Dylib,
            InstallKind::Framework,
            InstallKind::Dsym,
        ] {
            let json = serde_json::to_string(&kind).expect("kind serializes");
            assert_eq!(json.trim_matches('"'), kind.as_str());
        }
    }
}
