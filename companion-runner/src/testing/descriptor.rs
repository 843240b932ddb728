// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test descriptors: validated references to runnable test payloads.

use crate::{
    errors::{CompanionError, CompanionResult},
    storage::BundleDescriptor,
};
use camino::{Utf8Path, Utf8PathBuf};
use plist::Value as PlistValue;
use std::collections::BTreeSet;

/// The `__TESTROOT__` placeholder `.xctestrun` files use for paths relative
/// to their own directory.
const TEST_ROOT_PLACEHOLDER: &str = "__TESTROOT__";

/// A runnable test payload.
///
/// The two variants differ in who drives execution: a bootstrap descriptor
/// has the companion bring up the runner itself around a `.xctest` bundle; a
/// build-tool descriptor hands the `.xctestrun` file to the platform's own
/// build tooling.
#[derive(Clone, Debug)]
pub enum TestDescriptor {
    /// The companion bootstraps the runner around a test bundle.
    Bootstrap {
        /// The parsed test bundle.
        bundle: BundleDescriptor,
    },
    /// Execution is delegated to the build tool via an `.xctestrun` file.
    BuildTool {
        /// The logical name (the `.xctestrun` file stem).
        name: String,
        /// The `.xctestrun` file.
        xctestrun: Utf8PathBuf,
    },
}

impl TestDescriptor {
    /// Resolves a descriptor from a host path: a `.xctest` bundle, a
    /// `.xctestrun` file, or a directory containing either.
    pub fn resolve_from_path(path: &Utf8Path) -> CompanionResult<Self> {
        match path.extension() {
            Some("xctest") => Ok(TestDescriptor::Bootstrap {
                bundle: BundleDescriptor::parse(path)?,
            }),
            Some("xctestrun") => Ok(TestDescriptor::BuildTool {
                name: path.file_stem().unwrap_or("xctestrun").to_owned(),
                xctestrun: path.to_owned(),
            }),
            _ if path.is_dir() => Self::scan_directory(path),
            _ => Err(CompanionError::invalid_argument(format!(
                "`{path}` is neither an .xctest bundle nor an .xctestrun file"
            ))),
        }
    }

    fn scan_directory(dir: &Utf8Path) -> CompanionResult<Self> {
        let entries = dir
            .read_dir_utf8()
            .map_err(|error| CompanionError::io_path("listing", dir, error))?;
        let mut bundle = None;
        let mut xctestrun = None;
        for entry in entries {
            let entry = entry.map_err(|error| CompanionError::io_path("listing", dir, error))?;
            let path = entry.path();
            match path.extension() {
                Some("xctest") => bundle = Some(path.to_owned()),
                Some("xctestrun") => xctestrun = Some(path.to_owned()),
                _ => {}
            }
        }
        if let Some(xctestrun) = xctestrun {
            return Ok(TestDescriptor::BuildTool {
                name: xctestrun.file_stem().unwrap_or("xctestrun").to_owned(),
                xctestrun,
            });
        }
        if let Some(bundle) = bundle {
            return Ok(TestDescriptor::Bootstrap {
                bundle: BundleDescriptor::parse(&bundle)?,
            });
        }
        Err(CompanionError::NotFound(format!(
            "`{dir}` contains no .xctest bundle or .xctestrun file"
        )))
    }

    /// The descriptor's logical name.
    pub fn name(&self) -> &str {
        match self {
            TestDescriptor::Bootstrap { bundle } => &bundle.name,
            TestDescriptor::BuildTool { name, .. } => name,
        }
    }

    /// The path handed to the runner builder.
    pub fn payload_path(&self) -> &Utf8Path {
        match self {
            TestDescriptor::Bootstrap { bundle } => &bundle.path,
            TestDescriptor::BuildTool { xctestrun, .. } => xctestrun,
        }
    }

    /// The architectures the payload supports; empty means unverifiable,
    /// which the architecture check treats as universal.
    pub fn architectures(&self) -> BTreeSet<String> {
        match self {
            TestDescriptor::Bootstrap { bundle } => bundle.architectures.clone(),
            TestDescriptor::BuildTool { .. } => BTreeSet::new(),
        }
    }

    /// Validates the payload against the target's architectures.
    pub fn check_architectures(&self, target_archs: &BTreeSet<String>) -> CompanionResult<()> {
        match self {
            TestDescriptor::Bootstrap { bundle } => bundle.check_architectures(target_archs),
            TestDescriptor::BuildTool { .. } => Ok(()),
        }
    }
}

/// One test target described by an `.xctestrun` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XcTestRunTarget {
    /// The target name (the plist key).
    pub name: String,
    /// The test bundle path, with `__TESTROOT__` resolved.
    pub test_bundle_path: Option<Utf8PathBuf>,
    /// The host app path, with `__TESTROOT__` resolved.
    pub host_app_path: Option<Utf8PathBuf>,
    /// Whether the target is a UI test bundle.
    pub is_ui_test: bool,
}

/// Parses the test targets out of an `.xctestrun` plist.
pub fn xctest_run_targets(path: &Utf8Path) -> CompanionResult<Vec<XcTestRunTarget>> {
    let value = PlistValue::from_file(path.as_std_path()).map_err(|error| {
        CompanionError::invalid_argument(format!("`{path}` is not a valid xctestrun: {error}"))
    })?;
    let Some(dict) = value.as_dictionary() else {
        return Err(CompanionError::invalid_argument(format!(
            "`{path}` does not contain an xctestrun dictionary"
        )));
    };
    let test_root = path.parent().unwrap_or(Utf8Path::new("."));

    let mut targets = Vec::new();
    for (name, entry) in dict {
        if name.starts_with("__") {
            // Metadata keys like __xctestrun_metadata__ are not targets.
            continue;
        }
        let Some(entry) = entry.as_dictionary() else {
            continue;
        };
        let path_field = |key: &str| -> Option<Utf8PathBuf> {
            entry
                .get(key)
                .and_then(PlistValue::as_string)
                .map(|raw| Utf8PathBuf::from(raw.replace(TEST_ROOT_PLACEHOLDER, test_root.as_str())))
        };
        targets.push(XcTestRunTarget {
            name: name.clone(),
            test_bundle_path: path_field("TestBundlePath"),
            host_app_path: path_field("TestHostPath"),
            is_ui_test: entry
                .get("IsUITestBundle")
                .and_then(PlistValue::as_boolean)
                .unwrap_or(false),
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_xctestrun(dir: &Utf8Path) -> Utf8PathBuf {
        let contents = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>__xctestrun_metadata__</key>
    <dict>
        <key>FormatVersion</key>
        <integer>1</integer>
    </dict>
    <key>SampleUITests</key>
    <dict>
        <key>TestBundlePath</key>
        <string>__TESTROOT__/SampleUITests.xctest</string>
        <key>TestHostPath</key>
        <string>__TESTROOT__/SampleUITests-Runner.app</string>
        <key>IsUITestBundle</key>
        <true/>
    </dict>
</dict>
</plist>
"#;
        let path = dir.join("Sample.xctestrun");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_xctestrun_targets() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = write_xctestrun(dir.path());
        let targets = xctest_run_targets(&path).unwrap();
        assert_eq!(targets.len(), 1);
        let target = &targets[0];
        assert_eq!(target.name, "SampleUITests");
        assert!(target.is_ui_test);
        assert_eq!(
            target.test_bundle_path.as_deref(),
            Some(dir.path().join("SampleUITests.xctest").as_path())
        );
    }

    #[test]
    fn resolve_prefers_xctestrun_in_directories() {
        let dir = camino_tempfile::tempdir().unwrap();
        write_xctestrun(dir.path());
        let descriptor = TestDescriptor::resolve_from_path(dir.path()).unwrap();
        match descriptor {
            TestDescriptor::BuildTool { name, .. } => assert_eq!(name, "Sample"),
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn resolve_rejects_unrelated_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let stray = dir.path().join("notes.txt");
        fs::write(&stray, b"nothing").unwrap();
        let error = TestDescriptor::resolve_from_path(&stray).unwrap_err();
        assert!(matches!(error, CompanionError::InvalidArgument(_)), "{error}");
    }
}
