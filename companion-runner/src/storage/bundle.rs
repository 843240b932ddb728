// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsed bundle metadata.

use super::macho;
use crate::errors::{CompanionError, CompanionResult};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// The keys the companion needs from a bundle's `Info.plist`.
#[derive(Debug, Deserialize)]
struct InfoPlist {
    #[serde(rename = "CFBundleIdentifier")]
    identifier: String,
    #[serde(rename = "CFBundleName")]
    name: Option<String>,
    #[serde(rename = "CFBundleDisplayName")]
    display_name: Option<String>,
    #[serde(rename = "CFBundleExecutable")]
    executable: Option<String>,
}

/// Parsed metadata about an app, test, or framework bundle.
///
/// Immutable once constructed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleDescriptor {
    /// The bundle identifier, e.g. `com.x.Sample`.
    pub identifier: String,

    /// The display name of the bundle.
    pub name: String,

    /// The on-disk path of the bundle root.
    pub path: Utf8PathBuf,

    /// The path of the bundle's executable, if it declares one.
    pub executable: Option<Utf8PathBuf>,

    /// The architectures the executable supports. Empty when the bundle has
    /// no inspectable binary; an empty set is treated as universal.
    pub architectures: BTreeSet<String>,

    /// The executable's content UUID, if one was present.
    pub content_uuid: Option<Uuid>,
}

impl BundleDescriptor {
    /// Parses the bundle rooted at `path`.
    ///
    /// `Info.plist` is looked up both at the bundle root (iOS layout) and
    /// under `Contents/` (macOS layout, which simulator host apps use).
    pub fn parse(path: &Utf8Path) -> CompanionResult<Self> {
        if !path.is_dir() {
            return Err(CompanionError::path_not_found(path));
        }
        let (plist_path, contents_dir) = locate_info_plist(path)?;
        let info: InfoPlist = plist::from_file(plist_path.as_std_path()).map_err(|error| {
            CompanionError::invalid_argument(format!(
                "bundle `{path}` has an unreadable Info.plist: {error}"
            ))
        })?;

        let name = info
            .display_name
            .or(info.name)
            .unwrap_or_else(|| default_name(path));

        let mut executable = None;
        let mut architectures = BTreeSet::new();
        let mut content_uuid = None;
        if let Some(executable_name) = &info.executable {
            let executable_path = contents_dir.join(executable_name);
            if let Some(binary) = macho::inspect(&executable_path)? {
                architectures = binary.architectures;
                content_uuid = binary.uuid;
            }
            executable = Some(executable_path);
        }

        Ok(Self {
            identifier: info.identifier,
            name,
            path: path.to_owned(),
            executable,
            architectures,
            content_uuid,
        })
    }

    /// True if this bundle can execute on a target with `target_archs`.
    ///
    /// Either side being unknown (empty) is treated as compatible; the check
    /// only rejects a definite mismatch.
    pub fn is_compatible_with(&self, target_archs: &BTreeSet<String>) -> bool {
        self.architectures.is_empty()
            || target_archs.is_empty()
            || self.architectures.intersection(target_archs).next().is_some()
    }

    /// Fails with `incompatibleArchitecture` on a definite mismatch.
    pub fn check_architectures(&self, target_archs: &BTreeSet<String>) -> CompanionResult<()> {
        if self.is_compatible_with(target_archs) {
            return Ok(());
        }
        Err(CompanionError::IncompatibleArchitecture {
            bundle_id: self.identifier.clone(),
            bundle_archs: self.architectures.iter().cloned().collect(),
            target_archs: target_archs.iter().cloned().collect(),
        })
    }

    /// The bundle directory's file name, e.g. `Sample.app`.
    pub fn file_name(&self) -> &str {
        self.path.file_name().unwrap_or(self.identifier.as_str())
    }
}

fn locate_info_plist(path: &Utf8Path) -> CompanionResult<(Utf8PathBuf, Utf8PathBuf)> {
    let flat = path.join("Info.plist");
    if flat.is_file() {
        return Ok((flat, path.to_owned()));
    }
    let contents = path.join("Contents");
    let nested = contents.join("Info.plist");
    if nested.is_file() {
        return Ok((nested, contents.join("MacOS")));
    }
    Err(CompanionError::invalid_argument(format!(
        "`{path}` is not a bundle: no Info.plist found"
    )))
}

fn default_name(path: &Utf8Path) -> String {
    path.file_stem().unwrap_or("bundle").to_owned()
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Builders for synthetic bundles used across storage and executor
    //! tests.

    use super::super::macho::test_fixtures as macho_fixtures;
    use camino::{Utf8Path, Utf8PathBuf};
    use std::fs;
    use uuid::Uuid;

    /// Writes a minimal `.app` bundle with an executable built for the given
    /// Mach-O cputype. Returns the bundle path.
    pub(crate) fn write_app_bundle(
        dir: &Utf8Path,
        bundle_name: &str,
        identifier: &str,
        cputype: u32,
        uuid: Option<Uuid>,
    ) -> Utf8PathBuf {
        let bundle = dir.join(format!("{bundle_name}.app"));
        fs::create_dir_all(&bundle).unwrap();
        fs::write(
            bundle.join("Info.plist"),
            info_plist_xml(identifier, bundle_name),
        )
        .unwrap();
        fs::write(
            bundle.join(bundle_name),
            macho_fixtures::thin_binary(cputype, uuid),
        )
        .unwrap();
        bundle
    }

    /// Writes a minimal `.xctest` bundle.
    pub(crate) fn write_xctest_bundle(
        dir: &Utf8Path,
        bundle_name: &str,
        identifier: &str,
        cputype: u32,
    ) -> Utf8PathBuf {
        let bundle = dir.join(format!("{bundle_name}.xctest"));
        fs::create_dir_all(&bundle).unwrap();
        fs::write(
            bundle.join("Info.plist"),
            info_plist_xml(identifier, bundle_name),
        )
        .unwrap();
        fs::write(
            bundle.join(bundle_name),
            macho_fixtures::thin_binary(cputype, None),
        )
        .unwrap();
        bundle
    }

    pub(crate) fn info_plist_xml(identifier: &str, name: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>{identifier}</string>
    <key>CFBundleName</key>
    <string>{name}</string>
    <key>CFBundleExecutable</key>
    <string>{name}</string>
</dict>
</plist>
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{test_fixtures::*, *};
    use crate::storage::macho::test_fixtures::{ARM64, X86_64};
    use maplit::btreeset;

    #[test]
    fn parses_flat_bundle() {
        let dir = camino_tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bundle =
            write_app_bundle(dir.path(), "Sample", "com.x.Sample", ARM64, Some(uuid));

        let descriptor = BundleDescriptor::parse(&bundle).unwrap();
        assert_eq!(descriptor.identifier, "com.x.Sample");
        assert_eq!(descriptor.name, "Sample");
        assert_eq!(descriptor.architectures, btreeset! {"arm64".to_owned()});
        assert_eq!(descriptor.content_uuid, Some(uuid));
        assert_eq!(descriptor.file_name(), "Sample.app");
    }

    #[test]
    fn architecture_check() {
        let dir = camino_tempfile::tempdir().unwrap();
        let bundle = write_app_bundle(dir.path(), "Intel", "com.x.Intel", X86_64, None);
        let descriptor = BundleDescriptor::parse(&bundle).unwrap();

        let arm_target = btreeset! {"arm64".to_owned()};
        let error = descriptor.check_architectures(&arm_target).unwrap_err();
        assert!(
            matches!(error, CompanionError::IncompatibleArchitecture { .. }),
            "{error}"
        );

        let intel_target = btreeset! {"x86_64".to_owned()};
        descriptor.check_architectures(&intel_target).unwrap();

        // An unknown target architecture set is permissive.
        descriptor.check_architectures(&BTreeSet::new()).unwrap();
    }

    #[test]
    fn missing_plist_is_invalid_argument() {
        let dir = camino_tempfile::tempdir().unwrap();
        let not_a_bundle = dir.path().join("NotABundle.app");
        std::fs::create_dir_all(&not_a_bundle).unwrap();
        let error = BundleDescriptor::parse(&not_a_bundle).unwrap_err();
        assert!(matches!(error, CompanionError::InvalidArgument(_)), "{error}");
    }
}
