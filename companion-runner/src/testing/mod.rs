// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test-run orchestrator.
//!
//! One [`TestOrchestrator::run`] call executes one test run to completion
//! while streaming structured events to a reporter. The run moves through
//! resolve → validate → setup → launch → bus → drive → teardown; working
//! state lives in a scoped temporary directory that unwinds when the run's
//! operation reaches any terminal state. Runs against one target serialize
//! on the orchestrator's run queue; the runner subprocess and its message
//! bus are exclusively owned by the active run.

pub mod bus;
pub mod descriptor;
pub mod events;
pub mod request;

pub use descriptor::{TestDescriptor, XcTestRunTarget, xctest_run_targets};
pub use events::{
    ActivityInfo, CollectingReporter, ExceptionInfo, ReporterFanout, TestEvent, TestEventKind,
    TestReporter,
};
pub use request::{TestBundleSource, TestFilter, TestRunRequest, TestRunValues};

use crate::{
    errors::{CompanionError, CompanionResult},
    helpers,
    operation::{Operation, SerialQueue},
    process::{OutputSink, Process, StdinSource},
    storage::StorageManager,
    target::{AppLaunchConfig, Target},
    workspace::TemporaryWorkspace,
};
use bus::{BusFrame, BusReceiver, RunnerCommand, RunnerMessage};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use companion_metadata::{CoverageFormat, CoverageRequest, SuiteTotals, TestRunSummary};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{io::AsyncWriteExt, sync::watch};
use uuid::Uuid;

/// How long a terminated runner gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Environment keys the runner contract defines.
mod env_keys {
    pub const RESULT_BUNDLE: &str = "COMPANION_RESULT_BUNDLE";
    pub const COVERAGE_PATH: &str = "COMPANION_COVERAGE_PATH";
    pub const COVERAGE_FORMAT: &str = "COMPANION_COVERAGE_FORMAT";
    pub const LOG_DIRECTORY: &str = "COMPANION_LOG_DIRECTORY";
    pub const TESTS_TO_RUN: &str = "COMPANION_TESTS_TO_RUN";
    pub const TESTS_TO_SKIP: &str = "COMPANION_TESTS_TO_SKIP";
    pub const WAIT_FOR_DEBUGGER: &str = "COMPANION_WAIT_FOR_DEBUGGER";
}

/// A live test run.
#[derive(Clone)]
pub struct TestRunOperation {
    id: Uuid,
    kind: &'static str,
    completed: Operation<TestRunSummary>,
    result_bundle: Arc<Mutex<Option<Utf8PathBuf>>>,
}

impl std::fmt::Debug for TestRunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl TestRunOperation {
    /// The run's operation id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The request kind, for logging.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Resolves when the run is over. Failed test cases do not fail this
    /// operation; only a run that could not proceed does.
    pub fn completed(&self) -> Operation<TestRunSummary> {
        self.completed.clone()
    }

    /// Requests cancellation: the runner gets a terminate command and
    /// SIGTERM, then SIGKILL after the grace period; buffered events are
    /// still flushed and a partial result bundle is still collected.
    pub fn cancel(&self) -> Operation<()> {
        self.completed.cancel()
    }

    /// The collected result bundle, once the run is over.
    pub fn result_bundle_path(&self) -> Option<Utf8PathBuf> {
        self.result_bundle
            .lock()
            .expect("result bundle lock poisoned")
            .clone()
    }
}

/// Executes test runs against one target.
pub struct TestOrchestrator {
    target: Target,
    storage: StorageManager,
    workspace: TemporaryWorkspace,
    run_queue: SerialQueue,
}

impl TestOrchestrator {
    /// Creates an orchestrator over the given facilities.
    pub fn new(target: Target, storage: StorageManager, workspace: TemporaryWorkspace) -> Self {
        Self {
            target,
            storage,
            workspace,
            run_queue: SerialQueue::new("xctest-runs"),
        }
    }

    /// Starts one test run. The returned handle's `completed` operation
    /// resolves when the run is over; a second run on the same target queues
    /// behind the first.
    pub fn run(
        &self,
        request: TestRunRequest,
        reporter: Arc<dyn TestReporter>,
    ) -> TestRunOperation {
        let id = Uuid::new_v4();
        let kind = request.kind_name();
        let result_bundle = Arc::new(Mutex::new(None));
        let chain_slot: Arc<Mutex<Option<Operation<TestRunSummary>>>> = Arc::default();

        let target = self.target.clone();
        let storage = self.storage.clone();
        let workspace = self.workspace.clone();
        let timeout = request.values().timeout;
        let result_slot = Arc::clone(&result_bundle);
        let job_chain_slot = Arc::clone(&chain_slot);

        let completed = self.run_queue.enqueue("xctest-run", async move {
            let chain = build_run_chain(
                target,
                storage,
                workspace,
                request,
                reporter,
                result_slot,
            );
            *job_chain_slot
                .lock()
                .expect("chain slot poisoned") = Some(chain.clone());
            chain.awaited().await.into_result()
        });
        completed.on_cancel(move || {
            match chain_slot
                .lock()
                .expect("chain slot poisoned")
                .take()
            {
                Some(chain) => chain.cancel(),
                None => Operation::done(()),
            }
        });

        let completed = match timeout {
            Some(after) => completed.with_timeout(after, "test run"),
            None => completed,
        };
        TestRunOperation {
            id,
            kind,
            completed,
            result_bundle,
        }
    }

    /// The names of the tests a bundle contains.
    pub fn list_tests_in_bundle(
        &self,
        bundle_id: &str,
        host_app_path: Option<&Utf8Path>,
    ) -> Operation<Vec<String>> {
        let storage = self.storage.clone();
        let target = self.target.clone();
        let bundle_id = bundle_id.to_owned();
        let host_app_path = host_app_path.map(Utf8Path::to_owned);
        Operation::spawn("list-tests-in-bundle", async move {
            let descriptor = resolve_installed(&storage, &bundle_id)?;
            target
                .adapter()
                .list_test_names(descriptor.payload_path(), host_app_path.as_deref())
                .await
        })
    }
}

/// Builds the full run pipeline: a scoped working directory popped with the
/// uninterruptible drive future, with graceful-termination wired into the
/// drive operation's cancellation.
fn build_run_chain(
    target: Target,
    storage: StorageManager,
    workspace: TemporaryWorkspace,
    request: TestRunRequest,
    reporter: Arc<dyn TestReporter>,
    result_slot: Arc<Mutex<Option<Utf8PathBuf>>>,
) -> Operation<TestRunSummary> {
    let ephemeral_workspace = workspace.clone();
    workspace.with_temporary_directory().pop(move |working_dir| {
        let (terminate_tx, terminate_rx) = watch::channel(false);
        let (drained_tx, drained_rx) = watch::channel(false);
        let process_slot: Arc<Mutex<Option<Process>>> = Arc::default();
        let stdin_slot: Arc<Mutex<Option<tokio::process::ChildStdin>>> = Arc::default();

        let drive = {
            let process_slot = Arc::clone(&process_slot);
            let stdin_slot = Arc::clone(&stdin_slot);
            Operation::spawn_uninterruptible("xctest-drive", async move {
                let result = drive_run(
                    target,
                    storage,
                    ephemeral_workspace,
                    request,
                    reporter,
                    working_dir,
                    process_slot,
                    stdin_slot,
                    terminate_rx,
                    result_slot,
                )
                .await;
                // Whatever happened, the drive is over; release any
                // cancellation responder waiting on the flush.
                let _ = drained_tx.send(true);
                result
            })
        };
        drive.on_cancel(move || {
            let process = process_slot
                .lock()
                .expect("process slot poisoned")
                .clone();
            let stdin = stdin_slot.lock().expect("stdin slot poisoned").take();
            let mut drained_rx = drained_rx.clone();
            let _ = terminate_tx.send(true);
            Operation::spawn_uninterruptible("xctest-terminate", async move {
                if let Some(mut stdin) = stdin {
                    let _ = stdin.write_all(&RunnerCommand::Terminate.to_line()).await;
                    let _ = stdin.flush().await;
                }
                if let Some(process) = process {
                    let _ = process
                        .signal_with_fallback(libc::SIGTERM, TERMINATE_GRACE)
                        .awaited()
                        .await;
                }
                // Wait for the drive loop to flush buffered events and
                // collect partial artifacts.
                while !*drained_rx.borrow() {
                    if drained_rx.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            })
        });
        drive
    })
}

/// The resolved application pair for hosted runs.
struct TestApplicationsPair {
    host_app_path: Option<Utf8PathBuf>,
    target_app_id: Option<String>,
}

#[expect(clippy::too_many_arguments)]
async fn drive_run(
    target: Target,
    storage: StorageManager,
    workspace: TemporaryWorkspace,
    request: TestRunRequest,
    reporter: Arc<dyn TestReporter>,
    working_dir: Utf8PathBuf,
    process_slot: Arc<Mutex<Option<Process>>>,
    stdin_slot: Arc<Mutex<Option<tokio::process::ChildStdin>>>,
    terminate_rx: watch::Receiver<bool>,
    result_slot: Arc<Mutex<Option<Utf8PathBuf>>>,
) -> CompanionResult<TestRunSummary> {
    let values = request.values().clone();

    // Resolve.
    let descriptor = match &values.bundle {
        Some(TestBundleSource::Installed(bundle_id)) => resolve_installed(&storage, bundle_id)?,
        Some(TestBundleSource::Path(path)) => TestDescriptor::resolve_from_path(path)?,
        None => {
            return Err(CompanionError::invalid_argument(
                "test run request names no bundle",
            ));
        }
    };
    let applications = resolve_applications(&storage, &request)?;

    // Validate.
    let target_archs = target_architectures(&target).await?;
    descriptor.check_architectures(&target_archs)?;

    // Setup.
    let layout = RunLayout::prepare(&working_dir, &descriptor, &request)?;
    if *terminate_rx.borrow() {
        return Err(CompanionError::Cancelled);
    }

    // Launch. UI runs bring up the target app first.
    let launched_target_app = match &applications.target_app_id {
        Some(target_app_id) => Some(
            target
                .launch_app(AppLaunchConfig {
                    bundle_id: target_app_id.clone(),
                    override_running: true,
                    ..Default::default()
                })
                .awaited()
                .await
                .into_result()?,
        ),
        None => None,
    };

    let mut builder = target.adapter().test_runner_builder(
        descriptor.payload_path(),
        applications.host_app_path.as_deref(),
    )?;
    builder = builder
        .envs(values.environment.clone())
        .args(storage.interpolate_arguments(&values.arguments)?)
        .env(env_keys::RESULT_BUNDLE, layout.result_bundle.as_str())
        .env(env_keys::LOG_DIRECTORY, layout.log_directory.as_str());
    if let Some(coverage) = &layout.coverage {
        builder = builder
            .env(env_keys::COVERAGE_PATH, coverage.path.as_str())
            .env(env_keys::COVERAGE_FORMAT, coverage.format_name());
    }
    if values.wait_for_debugger {
        builder = builder.env(env_keys::WAIT_FOR_DEBUGGER, "1");
    }
    if let Some(run_set) = values.filter.run_set() {
        builder = builder.env(env_keys::TESTS_TO_RUN, join_identifiers(run_set));
    }
    if !values.filter.skip_set().is_empty() {
        builder = builder.env(
            env_keys::TESTS_TO_SKIP,
            join_identifiers(values.filter.skip_set()),
        );
    }

    let (line_consumer, bus_receiver) = bus::stdout_bus();
    builder = builder
        .stdin(StdinSource::Stream)
        .stdout(OutputSink::line_consumer(line_consumer))
        .stderr(OutputSink::Logger(tracing::Level::DEBUG));

    let process = builder.start().awaited().await.into_result()?;
    *process_slot.lock().expect("process slot poisoned") = Some(process.clone());

    // Bus: hand the runner its begin command.
    if let Some(mut stdin) = process.take_stdin_writer() {
        stdin
            .write_all(&RunnerCommand::BeginExecution.to_line())
            .await
            .map_err(|error| CompanionError::io("writing begin command to runner", error))?;
        stdin
            .flush()
            .await
            .map_err(|error| CompanionError::io("flushing runner stdin", error))?;
        *stdin_slot.lock().expect("stdin slot poisoned") = Some(stdin);
    }

    // Drive.
    let exit_code = process.exit_code();
    let drive_result = consume_bus(bus_receiver, &reporter, &values.filter, &values).await;

    // Tear down: the runner has no more events for us; make sure it is gone
    // before collecting artifacts.
    let exit = exit_code.shield_cancellation().awaited().await.into_result();
    if let Some(launched) = launched_target_app {
        let _ = launched.kill().awaited().await;
    }
    let mut summary = match drive_result {
        DriveOutcome::Finished(totals) => TestRunSummary {
            totals,
            ..TestRunSummary::default()
        },
        DriveOutcome::Crashed(message) => {
            return Err(CompanionError::Subprocess {
                command: process.command().to_owned(),
                description: format!("crashed during test execution: {message}"),
            });
        }
        DriveOutcome::Protocol(error) => return Err(error),
        DriveOutcome::EndedEarly { begun } => {
            if *terminate_rx.borrow() {
                // Termination was requested; the stream ending here is the
                // expected wind-down, not a crash. Close the stream and
                // resolve as cancelled.
                if begun {
                    reporter.report(TestEvent::now(TestEventKind::DidFinishExecutingTestPlan));
                }
                collect_artifacts(&workspace, &layout, &values, &mut TestRunSummary::default(), &result_slot)
                    .await?;
                return Err(CompanionError::Cancelled);
            }
            // Stream closed without plan-finished: distinguish a clean exit
            // (empty plan) from a died runner.
            match exit {
                Ok(0) => {
                    if begun {
                        reporter
                            .report(TestEvent::now(TestEventKind::DidFinishExecutingTestPlan));
                    }
                    TestRunSummary::default()
                }
                Ok(code) => {
                    reporter.report(TestEvent::now(TestEventKind::DidCrashDuringTest {
                        error: format!("test runner exited with code {code} mid-plan"),
                    }));
                    return Err(CompanionError::Subprocess {
                        command: process.command().to_owned(),
                        description: format!("exited with code {code} before finishing the plan"),
                    });
                }
                Err(error) => {
                    reporter.report(TestEvent::now(TestEventKind::DidCrashDuringTest {
                        error: error.to_string(),
                    }));
                    return Err(error);
                }
            }
        }
    };

    collect_artifacts(
        &workspace,
        &layout,
        &values,
        &mut summary,
        &result_slot,
    )
    .await?;
    Ok(summary)
}

/// Coverage output of a run: where the runner writes it, and in which form.
struct CoverageLayout {
    path: Utf8PathBuf,
    format: CoverageFormat,
}

impl CoverageLayout {
    /// The artifact the runner is asked to produce. Raw coverage is the
    /// counter dump the instrumented process writes; exported coverage is
    /// the JSON form the runner derives from it with `llvm-cov export`
    /// before exiting.
    fn new(working_dir: &Utf8Path, request: CoverageRequest) -> Self {
        let file_name = match request.format {
            CoverageFormat::Raw => "coverage.profraw",
            CoverageFormat::Exported => "coverage.json",
        };
        Self {
            path: working_dir.join(file_name),
            format: request.format,
        }
    }

    /// The format's name in the runner environment contract.
    fn format_name(&self) -> &'static str {
        match self.format {
            CoverageFormat::Raw => "raw",
            CoverageFormat::Exported => "exported",
        }
    }

    fn file_name(&self) -> &str {
        self.path.file_name().unwrap_or("coverage.profraw")
    }
}

/// Where a run's ephemeral files live inside the scoped working directory.
struct RunLayout {
    result_bundle: Utf8PathBuf,
    log_directory: Utf8PathBuf,
    coverage: Option<CoverageLayout>,
}

impl RunLayout {
    fn prepare(
        working_dir: &Utf8Path,
        descriptor: &TestDescriptor,
        request: &TestRunRequest,
    ) -> CompanionResult<Self> {
        let log_directory = working_dir.join("logs");
        std::fs::create_dir_all(&log_directory)
            .map_err(|error| CompanionError::io_path("creating", &log_directory, error))?;
        let layout = Self {
            result_bundle: working_dir.join("result.xcresult"),
            log_directory,
            coverage: request
                .values()
                .coverage
                .map(|coverage| CoverageLayout::new(working_dir, coverage)),
        };
        // Runs driven through an .xctestrun already carry their layout; for
        // bootstrap runs, materialize one describing what we launch.
        if let TestDescriptor::Bootstrap { bundle } = descriptor {
            let xctestrun = working_dir.join("companion.xctestrun");
            let mut targets = plist::Dictionary::new();
            let mut entry = plist::Dictionary::new();
            entry.insert(
                "TestBundlePath".to_owned(),
                plist::Value::String(bundle.path.to_string()),
            );
            entry.insert(
                "IsUITestBundle".to_owned(),
                plist::Value::Boolean(request.target_app_id().is_some()),
            );
            targets.insert(bundle.name.clone(), plist::Value::Dictionary(entry));
            plist::Value::Dictionary(targets)
                .to_file_xml(xctestrun.as_std_path())
                .map_err(|error| {
                    CompanionError::Internal(format!("could not write xctestrun: {error}"))
                })?;
        }
        Ok(layout)
    }
}

enum DriveOutcome {
    /// `plan-finished` was seen; totals are complete.
    Finished(SuiteTotals),
    /// The runner reported a crash.
    Crashed(String),
    /// The bus produced an undecodable message.
    Protocol(CompanionError),
    /// The stream closed before `plan-finished`.
    EndedEarly {
        /// Whether the begin event was already emitted.
        begun: bool,
    },
}

/// Consumes the runner bus until it closes, fanning events to the reporter.
///
/// This is the only place events are emitted, so ordering is inherent: the
/// begin event precedes everything, and exactly one terminal event follows
/// everything else.
async fn consume_bus(
    mut receiver: BusReceiver,
    reporter: &Arc<dyn TestReporter>,
    filter: &TestFilter,
    values: &TestRunValues,
) -> DriveOutcome {
    let mut begun = false;
    let mut totals = SuiteTotals::default();
    let begin = |reporter: &Arc<dyn TestReporter>, begun: &mut bool| {
        if !*begun {
            *begun = true;
            reporter.report(TestEvent::now(TestEventKind::DidBeginExecutingTestPlan));
        }
    };

    while let Some(frame) = receiver.recv().await {
        let message = match frame {
            Ok(BusFrame::Message(message)) => message,
            Ok(BusFrame::Output(output)) => {
                if !output.is_empty() {
                    reporter.report(TestEvent::now(TestEventKind::HadOutput { output }));
                }
                continue;
            }
            Err(error) => return DriveOutcome::Protocol(error),
        };
        match message {
            RunnerMessage::PlanStarted => begin(reporter, &mut begun),
            RunnerMessage::SuiteStarted { suite } => {
                begin(reporter, &mut begun);
                reporter.report(TestEvent::now(TestEventKind::SuiteDidStart { suite }));
            }
            RunnerMessage::CaseStarted { class, method } => {
                if filter.should_run(&class, &method) {
                    begin(reporter, &mut begun);
                    reporter.report(TestEvent::now(TestEventKind::CaseDidStart {
                        class,
                        method,
                    }));
                }
            }
            RunnerMessage::ActivityStarted {
                class,
                method,
                title,
            } => {
                if values.report_activities && filter.should_run(&class, &method) {
                    reporter.report(TestEvent::now(TestEventKind::CaseWillStartActivity {
                        class,
                        method,
                        activity: ActivityInfo { title },
                    }));
                }
            }
            RunnerMessage::ActivityFinished {
                class,
                method,
                title,
            } => {
                if values.report_activities && filter.should_run(&class, &method) {
                    reporter.report(TestEvent::now(TestEventKind::CaseDidFinishActivity {
                        class,
                        method,
                        activity: ActivityInfo { title },
                    }));
                }
            }
            RunnerMessage::Attachment {
                class,
                method,
                activity,
                uniform_type,
                payload,
            } => {
                if values.report_attachments && filter.should_run(&class, &method) {
                    reporter.report(TestEvent::now(TestEventKind::CaseAttachment {
                        class,
                        method,
                        activity,
                        uniform_type,
                        data: Bytes::from(payload),
                    }));
                }
            }
            RunnerMessage::CaseFailed {
                class,
                method,
                message,
                file,
                line,
            } => {
                if filter.should_run(&class, &method) {
                    reporter.report(TestEvent::now(TestEventKind::CaseDidFail {
                        class,
                        method,
                        exceptions: vec![ExceptionInfo {
                            message,
                            file,
                            line,
                        }],
                    }));
                }
            }
            RunnerMessage::CaseFinished {
                class,
                method,
                status,
                duration,
                logs,
            } => {
                if filter.should_run(&class, &method) {
                    reporter.report(TestEvent::now(TestEventKind::CaseDidFinish {
                        class,
                        method,
                        status,
                        duration,
                        logs: if values.collect_logs { logs } else { Vec::new() },
                    }));
                }
            }
            RunnerMessage::SuiteFinished {
                suite,
                run_count,
                failure_count,
                unexpected_count,
                test_duration,
                total_duration,
            } => {
                let suite_totals = SuiteTotals {
                    run_count,
                    failure_count,
                    unexpected_count,
                    test_duration,
                    total_duration,
                };
                totals.run_count += run_count;
                totals.failure_count += failure_count;
                totals.unexpected_count += unexpected_count;
                totals.test_duration += test_duration;
                totals.total_duration += total_duration;
                reporter.report(TestEvent::now(TestEventKind::SuiteDidFinish {
                    suite,
                    totals: suite_totals,
                }));
            }
            RunnerMessage::PlanFinished => {
                begin(reporter, &mut begun);
                reporter.report(TestEvent::now(TestEventKind::DidFinishExecutingTestPlan));
                return DriveOutcome::Finished(totals);
            }
            RunnerMessage::Crashed { message } => {
                reporter.report(TestEvent::now(TestEventKind::DidCrashDuringTest {
                    error: message.clone(),
                }));
                return DriveOutcome::Crashed(message);
            }
        }
    }
    DriveOutcome::EndedEarly { begun }
}

/// Copies surviving artifacts out of the scoped working directory into
/// ephemeral storage, so they outlive the run's teardown. Partial artifacts
/// from an interrupted run are collected the same way.
async fn collect_artifacts(
    workspace: &TemporaryWorkspace,
    layout: &RunLayout,
    values: &TestRunValues,
    summary: &mut TestRunSummary,
    result_slot: &Arc<Mutex<Option<Utf8PathBuf>>>,
) -> CompanionResult<()> {
    if values.collect_result_bundle && layout.result_bundle.exists() {
        let keep = workspace.ephemeral_temporary_directory()?;
        let dest = keep.join("result.xcresult");
        helpers::copy_recursive(&layout.result_bundle, &dest).await?;
        summary.result_bundle_path = Some(dest.clone());
        *result_slot.lock().expect("result bundle lock poisoned") = Some(dest);
    }
    if let Some(coverage) = &layout.coverage
        && coverage.path.exists()
    {
        let keep = workspace.ephemeral_temporary_directory()?;
        let dest = keep.join(coverage.file_name());
        helpers::copy_recursive(&coverage.path, &dest).await?;
        summary.coverage_path = Some(dest);
    }
    if values.collect_logs && layout.log_directory.is_dir() {
        let keep = workspace.ephemeral_temporary_directory()?;
        let mut entries = tokio::fs::read_dir(&layout.log_directory)
            .await
            .map_err(|error| {
                CompanionError::io_path("listing", &layout.log_directory, error)
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|error| {
            CompanionError::io_path("listing", &layout.log_directory, error)
        })? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let dest = keep.join(&name);
            helpers::copy_recursive(&layout.log_directory.join(&name), &dest).await?;
            summary.log_paths.push(dest);
        }
        summary.log_paths.sort_unstable();
    }
    Ok(())
}

fn resolve_installed(storage: &StorageManager, bundle_id: &str) -> CompanionResult<TestDescriptor> {
    if let Ok(bundle) = storage.test_descriptor_with_id(bundle_id) {
        return Ok(TestDescriptor::Bootstrap { bundle });
    }
    // Raw xctestrun trees are listed by id but carry no bundle metadata.
    if storage
        .persisted_test_bundle_ids()?
        .iter()
        .any(|id| id == bundle_id)
    {
        let tree = storage.root().join(crate::storage::XCTESTS_FOLDER).join(bundle_id);
        return TestDescriptor::resolve_from_path(&tree);
    }
    Err(CompanionError::NotFound(format!(
        "test bundle `{bundle_id}` is not installed"
    )))
}

fn resolve_applications(
    storage: &StorageManager,
    request: &TestRunRequest,
) -> CompanionResult<TestApplicationsPair> {
    let host_app_path = match request.host_app_id() {
        Some(host_app_id) => {
            let apps = storage.persisted_apps()?;
            let descriptor = apps.get(host_app_id).ok_or_else(|| {
                CompanionError::NotFound(format!(
                    "host app `{host_app_id}` is not installed"
                ))
            })?;
            Some(descriptor.path.clone())
        }
        None => None,
    };
    Ok(TestApplicationsPair {
        host_app_path,
        target_app_id: request.target_app_id().map(str::to_owned),
    })
}

async fn target_architectures(target: &Target) -> CompanionResult<BTreeSet<String>> {
    Ok(target
        .adapter()
        .query_description()
        .await?
        .architectures)
}

fn join_identifiers(identifiers: &BTreeSet<String>) -> String {
    identifiers
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{NoopCodesigner, test_support},
        target::{TargetState, loopback::LoopbackAdapter},
    };
    use companion_metadata::TestCaseStatus;
    use maplit::btreeset;

    struct Harness {
        orchestrator: TestOrchestrator,
        _dir: camino_tempfile::Utf8TempDir,
    }

    async fn harness_with_script(script: &str) -> Harness {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = LoopbackAdapter::new(dir.path().join("sim"));
        adapter.set_test_runner_script(script);
        let adapter = Arc::new(adapter);
        let target = Target::new(adapter, TargetState::Booted);
        let storage = StorageManager::new(
            dir.path().join("storage"),
            btreeset! {"arm64".to_owned()},
            Arc::new(NoopCodesigner),
        )
        .unwrap();
        let bundle =
            test_support::write_sample_xctest(dir.path(), "SampleTests", "com.x.SampleTests");
        storage.save_xctest_bundle(&bundle, true).await.unwrap();
        let workspace = TemporaryWorkspace::new(dir.path().join("tmp")).unwrap();
        Harness {
            orchestrator: TestOrchestrator::new(target, storage, workspace),
            _dir: dir,
        }
    }

    fn logic_request(filter: TestFilter) -> TestRunRequest {
        TestRunRequest::Logic {
            values: TestRunValues {
                bundle: Some(TestBundleSource::Installed("com.x.SampleTests".to_owned())),
                filter,
                ..TestRunValues::default()
            },
        }
    }

    const TWO_CASE_SCRIPT: &str = r#"
echo '{"event":"plan-started"}'
echo '{"event":"suite-started","suite":"SuiteA"}'
echo '{"event":"case-started","class":"SuiteA","method":"testFoo"}'
echo '{"event":"case-finished","class":"SuiteA","method":"testFoo","status":"passed","duration":0.1}'
echo '{"event":"case-started","class":"SuiteA","method":"testBar"}'
echo '{"event":"case-finished","class":"SuiteA","method":"testBar","status":"passed","duration":0.1}'
echo '{"event":"suite-finished","suite":"SuiteA","run-count":2,"failure-count":0,"unexpected-count":0,"test-duration":0.2,"total-duration":0.3}'
echo '{"event":"plan-finished"}'
"#;

    #[tokio::test]
    async fn run_streams_enclosed_event_stream() {
        let harness = harness_with_script(TWO_CASE_SCRIPT).await;
        let reporter = CollectingReporter::new();
        let run = harness
            .orchestrator
            .run(logic_request(TestFilter::default()), Arc::new(reporter.clone()));

        let summary = run.completed().await.unwrap();
        assert_eq!(summary.totals.run_count, 2);
        assert_eq!(summary.totals.failure_count, 0);

        let kinds = reporter.kinds();
        assert!(
            matches!(kinds.first(), Some(TestEventKind::DidBeginExecutingTestPlan)),
            "stream must open with the begin event"
        );
        assert!(
            matches!(kinds.last(), Some(TestEventKind::DidFinishExecutingTestPlan)),
            "stream must close with the finish event"
        );
        let begin_count = kinds
            .iter()
            .filter(|kind| matches!(kind, TestEventKind::DidBeginExecutingTestPlan))
            .count();
        let finish_count = kinds
            .iter()
            .filter(|kind| matches!(kind, TestEventKind::DidFinishExecutingTestPlan))
            .count();
        assert_eq!((begin_count, finish_count), (1, 1));
    }

    #[tokio::test]
    async fn filtering_drops_unselected_cases() {
        let harness = harness_with_script(TWO_CASE_SCRIPT).await;
        let reporter = CollectingReporter::new();
        let filter = TestFilter::new(
            Some(btreeset! {"SuiteA/testFoo".to_owned()}),
            btreeset! {"SuiteA/testBar".to_owned()},
        );
        let run = harness
            .orchestrator
            .run(logic_request(filter), Arc::new(reporter.clone()));
        run.completed().await.unwrap();

        let mut saw_foo_start = false;
        let mut saw_foo_finish = false;
        for kind in reporter.kinds() {
            match kind {
                TestEventKind::CaseDidStart { method, .. } => {
                    assert_eq!(method, "testFoo", "only testFoo may start");
                    saw_foo_start = true;
                }
                TestEventKind::CaseDidFinish { method, status, .. } => {
                    assert_eq!(method, "testFoo", "only testFoo may finish");
                    assert_eq!(status, TestCaseStatus::Passed);
                    saw_foo_finish = true;
                }
                _ => {}
            }
        }
        assert!(saw_foo_start && saw_foo_finish);
    }

    #[tokio::test]
    async fn empty_run_set_runs_nothing_but_suites_still_report() {
        let harness = harness_with_script(TWO_CASE_SCRIPT).await;
        let reporter = CollectingReporter::new();
        let filter = TestFilter::new(Some(BTreeSet::new()), BTreeSet::new());
        let run = harness
            .orchestrator
            .run(logic_request(filter), Arc::new(reporter.clone()));
        run.completed().await.unwrap();

        let kinds = reporter.kinds();
        assert!(
            kinds
                .iter()
                .any(|kind| matches!(kind, TestEventKind::SuiteDidStart { .. }))
        );
        assert!(
            !kinds
                .iter()
                .any(|kind| matches!(kind, TestEventKind::CaseDidStart { .. })),
            "no case may run with an empty run set"
        );
    }

    #[tokio::test]
    async fn failure_events_carry_exceptions() {
        let script = r#"
echo '{"event":"plan-started"}'
echo '{"event":"suite-started","suite":"SuiteA"}'
echo '{"event":"case-started","class":"SuiteA","method":"testBroken"}'
echo '{"event":"case-failed","class":"SuiteA","method":"testBroken","message":"assertion failed","file":"SuiteA.m","line":42}'
echo '{"event":"case-finished","class":"SuiteA","method":"testBroken","status":"failed","duration":0.2}'
echo '{"event":"suite-finished","suite":"SuiteA","run-count":1,"failure-count":1,"unexpected-count":0,"test-duration":0.2,"total-duration":0.2}'
echo '{"event":"plan-finished"}'
"#;
        let harness = harness_with_script(script).await;
        let reporter = CollectingReporter::new();
        let run = harness
            .orchestrator
            .run(logic_request(TestFilter::default()), Arc::new(reporter.clone()));

        // Failed test cases are events, not an error of the run itself.
        let summary = run.completed().await.unwrap();
        assert_eq!(summary.totals.failure_count, 1);

        let failure = reporter
            .kinds()
            .into_iter()
            .find_map(|kind| match kind {
                TestEventKind::CaseDidFail { exceptions, .. } => Some(exceptions),
                _ => None,
            })
            .expect("a failure event was streamed");
        assert_eq!(failure[0].message, "assertion failed");
        assert_eq!(failure[0].line, Some(42));
    }

    #[tokio::test]
    async fn timeout_fails_the_run() {
        let harness = harness_with_script("sleep 30").await;
        let reporter = CollectingReporter::new();
        let mut request = logic_request(TestFilter::default());
        if let TestRunRequest::Logic { values } = &mut request {
            values.timeout = Some(Duration::from_millis(300));
        }
        let run = harness.orchestrator.run(request, Arc::new(reporter));
        let error = run.completed().await.unwrap_err();
        assert!(matches!(error, CompanionError::Timeout { .. }), "{error}");
    }

    #[tokio::test]
    async fn crash_message_surfaces_as_error_terminal() {
        let script = r#"
echo '{"event":"plan-started"}'
echo '{"event":"case-started","class":"SuiteA","method":"testFoo"}'
echo '{"event":"crashed","message":"EXC_BAD_ACCESS"}'
"#;
        let harness = harness_with_script(script).await;
        let reporter = CollectingReporter::new();
        let run = harness
            .orchestrator
            .run(logic_request(TestFilter::default()), Arc::new(reporter.clone()));

        let error = run.completed().await.unwrap_err();
        assert!(matches!(error, CompanionError::Subprocess { .. }), "{error}");
        assert!(
            matches!(
                reporter.kinds().last(),
                Some(TestEventKind::DidCrashDuringTest { .. })
            ),
            "the crash is the stream's terminal event"
        );
    }

    #[tokio::test]
    async fn cancellation_terminates_within_grace() {
        let script = r#"
echo '{"event":"plan-started"}'
echo '{"event":"suite-started","suite":"SuiteA"}'
sleep 30
"#;
        let harness = harness_with_script(script).await;
        let reporter = CollectingReporter::new();
        let run = harness
            .orchestrator
            .run(logic_request(TestFilter::default()), Arc::new(reporter.clone()));

        // Let the run reach the drive phase before cancelling.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reporter.events().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "run never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        run.cancel().await.unwrap();
        let outcome = run.completed().awaited().await;
        assert!(
            matches!(
                outcome.state(),
                crate::operation::OperationState::Cancelled
                    | crate::operation::OperationState::Failed
            ),
            "cancelled run must be terminal"
        );
    }

    #[tokio::test]
    async fn collects_result_bundle_when_requested() {
        // The loopback runner writes into the layout the companion hands it.
        let script = r#"
mkdir -p "$COMPANION_RESULT_BUNDLE"
echo 'payload' > "$COMPANION_RESULT_BUNDLE/Info.plist"
echo '{"event":"plan-started"}'
echo '{"event":"plan-finished"}'
"#;
        let harness = harness_with_script(script).await;
        let reporter = CollectingReporter::new();
        let mut request = logic_request(TestFilter::default());
        if let TestRunRequest::Logic { values } = &mut request {
            values.collect_result_bundle = true;
        }
        let run = harness.orchestrator.run(request, Arc::new(reporter));
        let summary = run.completed().await.unwrap();

        let collected = summary.result_bundle_path.expect("result bundle collected");
        assert!(collected.join("Info.plist").is_file());
        assert_eq!(run.result_bundle_path(), Some(collected));
    }

    #[tokio::test]
    async fn coverage_format_drives_runner_contract_and_collection() {
        for (format, format_name, file_name) in [
            (CoverageFormat::Raw, "raw", "coverage.profraw"),
            (CoverageFormat::Exported, "exported", "coverage.json"),
        ] {
            // The runner refuses to write unless the advertised format is
            // the one the request asked for.
            let script = format!(
                r#"
[ "$COMPANION_COVERAGE_FORMAT" = "{format_name}" ] || exit 7
printf 'coverage payload' > "$COMPANION_COVERAGE_PATH"
echo '{{"event":"plan-started"}}'
echo '{{"event":"plan-finished"}}'
"#
            );
            let harness = harness_with_script(&script).await;
            let reporter = CollectingReporter::new();
            let mut request = logic_request(TestFilter::default());
            if let TestRunRequest::Logic { values } = &mut request {
                values.coverage = Some(CoverageRequest { format });
            }
            let run = harness.orchestrator.run(request, Arc::new(reporter));
            let summary = run.completed().await.unwrap();

            let collected = summary.coverage_path.expect("coverage collected");
            assert_eq!(collected.file_name(), Some(file_name));
            assert!(collected.is_file());
        }
    }

    #[tokio::test]
    async fn second_run_queues_behind_first() {
        let harness = harness_with_script(
            r#"
echo '{"event":"plan-started"}'
sleep 0.3
echo '{"event":"plan-finished"}'
"#,
        )
        .await;
        let first_reporter = CollectingReporter::new();
        let second_reporter = CollectingReporter::new();
        let first = harness
            .orchestrator
            .run(logic_request(TestFilter::default()), Arc::new(first_reporter));
        let second = harness.orchestrator.run(
            logic_request(TestFilter::default()),
            Arc::new(second_reporter.clone()),
        );

        // The second run has not produced events while the first is live.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(second_reporter.events().is_empty());

        first.completed().await.unwrap();
        second.completed().await.unwrap();
        assert!(!second_reporter.events().is_empty());
    }
}
