// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test-run requests and filtering.

use crate::errors::{CompanionError, CompanionResult};
use camino::Utf8PathBuf;
use companion_metadata::{CoverageRequest, TestRunKind, TestRunParams};
use std::{collections::BTreeMap, collections::BTreeSet, time::Duration};

/// Where the test bundle comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestBundleSource {
    /// An installed bundle, looked up in storage by identifier.
    Installed(String),
    /// A `.xctest` bundle or `.xctestrun` file at a host path.
    Path(Utf8PathBuf),
}

/// Fields shared by all three run kinds.
#[derive(Clone, Debug, Default)]
pub struct TestRunValues {
    /// The bundle under test.
    pub bundle: Option<TestBundleSource>,
    /// Environment for the test process.
    pub environment: BTreeMap<String, String>,
    /// Arguments for the test process.
    pub arguments: Vec<String>,
    /// The filter over test identifiers.
    pub filter: TestFilter,
    /// Timeout for the entire execution.
    pub timeout: Option<Duration>,
    /// Whether to report activities.
    pub report_activities: bool,
    /// Whether to report attachments.
    pub report_attachments: bool,
    /// Whether to collect os_log output.
    pub collect_logs: bool,
    /// Whether to stop after launch and wait for a debugger.
    pub wait_for_debugger: bool,
    /// Whether to collect the result bundle.
    pub collect_result_bundle: bool,
    /// Coverage collection, if requested.
    pub coverage: Option<CoverageRequest>,
}

/// A request to execute one test run.
///
/// The three kinds share [`TestRunValues`]; the host/target apps only exist
/// for the kinds that need them, so they live on the variants.
#[derive(Clone, Debug)]
pub enum TestRunRequest {
    /// The bundle runs directly under the test runner.
    Logic {
        /// The shared request fields.
        values: TestRunValues,
    },
    /// The bundle is injected into a host application.
    App {
        /// The shared request fields.
        values: TestRunValues,
        /// The bundle id of the hosting app.
        host_app_id: String,
    },
    /// The bundle drives a separate target app from a host application.
    Ui {
        /// The shared request fields.
        values: TestRunValues,
        /// The bundle id of the hosting app.
        host_app_id: String,
        /// The bundle id of the app under test.
        target_app_id: String,
    },
}

impl TestRunRequest {
    /// The shared fields.
    pub fn values(&self) -> &TestRunValues {
        match self {
            TestRunRequest::Logic { values }
            | TestRunRequest::App { values, .. }
            | TestRunRequest::Ui { values, .. } => values,
        }
    }

    /// The hosting app's bundle id, for app and UI runs.
    pub fn host_app_id(&self) -> Option<&str> {
        match self {
            TestRunRequest::Logic { .. } => None,
            TestRunRequest::App { host_app_id, .. }
            | TestRunRequest::Ui { host_app_id, .. } => Some(host_app_id),
        }
    }

    /// The target app's bundle id, for UI runs.
    pub fn target_app_id(&self) -> Option<&str> {
        match self {
            TestRunRequest::Ui { target_app_id, .. } => Some(target_app_id),
            _ => None,
        }
    }

    /// A short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TestRunRequest::Logic { .. } => "logic-test",
            TestRunRequest::App { .. } => "app-test",
            TestRunRequest::Ui { .. } => "ui-test",
        }
    }

    /// Builds a request from its wire form.
    pub fn from_params(params: TestRunParams) -> CompanionResult<Self> {
        let bundle = match (&params.test_bundle_id, &params.test_bundle_path) {
            (Some(id), None) => TestBundleSource::Installed(id.clone()),
            (None, Some(path)) => TestBundleSource::Path(path.clone()),
            (Some(_), Some(_)) => {
                return Err(CompanionError::invalid_argument(
                    "test-bundle-id and test-bundle-path are mutually exclusive",
                ));
            }
            (None, None) => {
                return Err(CompanionError::invalid_argument(
                    "one of test-bundle-id or test-bundle-path is required",
                ));
            }
        };
        let values = TestRunValues {
            bundle: Some(bundle),
            environment: params.environment,
            arguments: params.arguments,
            filter: TestFilter::new(
                params.tests_to_run.map(|run| run.into_iter().collect()),
                params.tests_to_skip.into_iter().collect(),
            ),
            timeout: params.timeout_secs.map(Duration::from_secs_f64),
            report_activities: params.report_activities,
            report_attachments: params.report_attachments,
            collect_logs: params.collect_logs,
            wait_for_debugger: params.wait_for_debugger,
            collect_result_bundle: params.collect_result_bundle,
            coverage: params.coverage,
        };
        let host = params.host_app_id;
        match params.kind {
            TestRunKind::Logic => Ok(TestRunRequest::Logic { values }),
            TestRunKind::App => Ok(TestRunRequest::App {
                values,
                host_app_id: host.ok_or_else(|| {
                    CompanionError::invalid_argument("app tests require host-app-id")
                })?,
            }),
            TestRunKind::Ui => Ok(TestRunRequest::Ui {
                values,
                host_app_id: host.ok_or_else(|| {
                    CompanionError::invalid_argument("UI tests require host-app-id")
                })?,
                target_app_id: params.target_app_id.ok_or_else(|| {
                    CompanionError::invalid_argument("UI tests require target-app-id")
                })?,
            }),
        }
    }
}

/// Selection over `Class` / `Class/method` test identifiers.
///
/// Skips always win over the run set. An absent run set means "run
/// everything"; an empty run set means "run nothing" (suites still emit
/// begin/finish events).
#[derive(Clone, Debug, Default)]
pub struct TestFilter {
    run: Option<BTreeSet<String>>,
    skip: BTreeSet<String>,
}

impl TestFilter {
    /// Creates a filter from run/skip sets.
    pub fn new(run: Option<BTreeSet<String>>, skip: BTreeSet<String>) -> Self {
        Self { run, skip }
    }

    /// True when the filter selects every test.
    pub fn is_pass_through(&self) -> bool {
        self.run.is_none() && self.skip.is_empty()
    }

    /// Whether the given test case should execute.
    pub fn should_run(&self, class: &str, method: &str) -> bool {
        let qualified = format!("{class}/{method}");
        if self.skip.contains(class) || self.skip.contains(&qualified) {
            return false;
        }
        match &self.run {
            None => true,
            Some(run) => run.contains(class) || run.contains(&qualified),
        }
    }

    /// The run set in wire form, if present.
    pub fn run_set(&self) -> Option<&BTreeSet<String>> {
        self.run.as_ref()
    }

    /// The skip set in wire form.
    pub fn skip_set(&self) -> &BTreeSet<String> {
        &self.skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    #[test]
    fn skip_wins_over_run() {
        let filter = TestFilter::new(
            Some(btreeset! {"SuiteA/testFoo".to_owned(), "SuiteA/testBar".to_owned()}),
            btreeset! {"SuiteA/testBar".to_owned()},
        );
        assert!(filter.should_run("SuiteA", "testFoo"));
        assert!(!filter.should_run("SuiteA", "testBar"));
        assert!(!filter.should_run("SuiteB", "testBaz"));
    }

    #[test]
    fn empty_run_set_runs_nothing() {
        let filter = TestFilter::new(Some(BTreeSet::new()), BTreeSet::new());
        assert!(!filter.should_run("SuiteA", "testFoo"));
    }

    #[test]
    fn absent_run_set_runs_everything_not_skipped() {
        let filter = TestFilter::new(None, btreeset! {"SuiteA".to_owned()});
        assert!(!filter.should_run("SuiteA", "testFoo"));
        assert!(filter.should_run("SuiteB", "testBar"));
    }

    #[test]
    fn class_level_run_selection() {
        let filter = TestFilter::new(Some(btreeset! {"SuiteA".to_owned()}), BTreeSet::new());
        assert!(filter.should_run("SuiteA", "testAnything"));
        assert!(!filter.should_run("SuiteB", "testAnything"));
    }

    #[test]
    fn wire_form_requires_host_for_app_runs() {
        let params: TestRunParams = serde_json::from_str(
            r#"{"kind":"app","test-bundle-id":"com.x.Tests"}"#,
        )
        .unwrap();
        let error = TestRunRequest::from_params(params).unwrap_err();
        assert!(matches!(error, CompanionError::InvalidArgument(_)), "{error}");
    }
}
