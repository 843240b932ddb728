// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire forms of test-run requests, results and diagnostics.

use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of test run being requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestRunKind {
    /// A logic test: the bundle runs directly under the test runner.
    Logic,
    /// An application test: the bundle is injected into a host app.
    App,
    /// A UI test: the bundle drives a separate target app from a host app.
    Ui,
}

/// A request to execute one test run, as received from the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunParams {
    /// The kind of run.
    pub kind: TestRunKind,

    /// The identifier of an installed test bundle. Exactly one of this and
    /// `test_bundle_path` must be set.
    #[serde(default)]
    pub test_bundle_id: Option<String>,

    /// A path to a `.xctest` bundle or `.xctestrun` file on the host.
    #[serde(default)]
    pub test_bundle_path: Option<Utf8PathBuf>,

    /// The bundle id of the app hosting the tests. Required for app and UI
    /// runs.
    #[serde(default)]
    pub host_app_id: Option<String>,

    /// The bundle id of the app a UI test drives. UI runs only.
    #[serde(default)]
    pub target_app_id: Option<String>,

    /// Environment for the test process.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Arguments for the test process.
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Tests to run, as `Class` or `Class/method`. `None` runs everything;
    /// an empty set runs nothing.
    #[serde(default)]
    pub tests_to_run: Option<Vec<String>>,

    /// Tests to skip. Takes precedence over `tests_to_run`.
    #[serde(default)]
    pub tests_to_skip: Vec<String>,

    /// A timeout for the entire execution, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Whether to report test activities.
    #[serde(default)]
    pub report_activities: bool,

    /// Whether to report activity attachments.
    #[serde(default)]
    pub report_attachments: bool,

    /// Whether to collect os_log output for each test case.
    #[serde(default)]
    pub collect_logs: bool,

    /// Whether the run should stop after launch and wait for a debugger.
    #[serde(default)]
    pub wait_for_debugger: bool,

    /// Whether to collect the `.xcresult` bundle.
    #[serde(default)]
    pub collect_result_bundle: bool,

    /// Code-coverage collection, if requested.
    #[serde(default)]
    pub coverage: Option<CoverageRequest>,
}

/// A request to collect code coverage for a test run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoverageRequest {
    /// The format coverage data should be delivered in.
    pub format: CoverageFormat,
}

/// The format coverage data is delivered in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageFormat {
    /// Raw `.profraw` data.
    Raw,
    /// Exported JSON, as produced by `llvm-cov export`.
    Exported,
}

/// The status of a finished test case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestCaseStatus {
    /// The test passed.
    Passed,
    /// The test reported a failure.
    Failed,
    /// The test crashed mid-execution.
    Crashed,
    /// The test exceeded its per-case time allowance.
    TimedOut,
    /// The test was skipped by filtering or at runtime.
    Skipped,
}

/// Totals for a finished test suite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteTotals {
    /// Number of test cases run.
    pub run_count: u64,

    /// Number of failures.
    pub failure_count: u64,

    /// Number of unexpected exits (crashes).
    pub unexpected_count: u64,

    /// Time spent executing test code, in seconds.
    pub test_duration: f64,

    /// Wall-clock duration of the suite, in seconds.
    pub total_duration: f64,
}

/// The summary delivered when a test run's operation resolves.
///
/// Failed test cases are not errors at the RPC level; they are counted here
/// and reported as events in the stream. A run only errors if the run itself
/// could not proceed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunSummary {
    /// Aggregated totals across all suites.
    pub totals: SuiteTotals,

    /// The path to the collected result bundle, if collection was requested.
    #[serde(default)]
    pub result_bundle_path: Option<Utf8PathBuf>,

    /// The path to collected coverage data, if collection was requested.
    #[serde(default)]
    pub coverage_path: Option<Utf8PathBuf>,

    /// Paths to collected log files, if log collection was requested.
    #[serde(default)]
    pub log_paths: Vec<Utf8PathBuf>,
}

/// A single crash log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrashLogInfo {
    /// The identifier of the crash log.
    pub identifier: String,

    /// The name of the crashed process.
    pub process_name: String,

    /// The pid of the crashed process.
    pub pid: u32,

    /// The pid of the crashed process's parent.
    pub parent_pid: u32,

    /// When the crash occurred.
    pub timestamp: DateTime<FixedOffset>,

    /// The on-disk path of the crash log.
    pub path: Utf8PathBuf,

    /// The classification of the crashed process.
    pub process_type: CrashProcessType,
}

/// The classification of a crashed process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashProcessType {
    /// A user application.
    Application,
    /// A system process.
    System,
    /// Could not be classified.
    Unknown,
}

/// A predicate for selecting crash logs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrashLogQuery {
    /// Match only crashes of processes with this name.
    #[serde(default)]
    pub process_name: Option<String>,

    /// Match only crashes newer than this time.
    #[serde(default)]
    pub since: Option<DateTime<FixedOffset>>,

    /// Match only crashes with this bundle id.
    #[serde(default)]
    pub bundle_id: Option<String>,
}

/// The image format of a screenshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    /// PNG.
    #[default]
    Png,
    /// JPEG.
    Jpeg,
    /// BMP.
    Bmp,
}

/// Static information about the daemon and its target.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiagnosticInfo {
    /// The UDID of the target.
    pub udid: String,

    /// The model of the target, e.g. `iPhone 15`.
    pub model: String,

    /// The OS version running on the target.
    pub os_version: String,

    /// The architectures the target executes.
    pub architectures: Vec<String>,

    /// The current state of the target.
    pub state: String,

    /// The companion's storage root.
    pub storage_root: Utf8PathBuf,
}
