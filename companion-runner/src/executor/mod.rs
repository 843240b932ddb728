// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The request-shaped façade over the companion core.
//!
//! Each RPC maps onto one method here; the method composes storage, the
//! temporary workspace, file containers, the target and the test
//! orchestrator, and returns an [`Operation`]. Nothing in this module
//! blocks, and nothing here translates errors for the wire; that is the
//! boundary's job.

use crate::{
    containers::{FileContainer, PathMappedContainer},
    errors::{CompanionError, CompanionResult, FileBatchError},
    helpers,
    operation::Operation,
    process::{DataConsumer, OutputSink, Process, ProcessBuilder, StdinSource},
    storage::{InstalledArtifact, StorageManager},
    target::{AppLaunchConfig, DebugServerInfo, LaunchedApp, PreferenceUpdate, Target},
    testing::{TestOrchestrator, TestReporter, TestRunOperation, TestRunRequest},
    workspace::{files_from_subdirs, ByteStream, TemporaryWorkspace},
};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use companion_metadata::{
    ContainerKind, CrashLogInfo, CrashLogQuery, DiagnosticInfo, HidEvent, ImageFormat,
    InstallHeader, InstallKind, InstalledAppInfo, StreamCompression,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// The companion's command surface.
#[derive(Clone)]
pub struct CommandExecutor {
    target: Target,
    storage: StorageManager,
    workspace: TemporaryWorkspace,
    orchestrator: Arc<TestOrchestrator>,
    log_file: Option<Utf8PathBuf>,
    debugserver_port: u16,
}

impl CommandExecutor {
    /// Creates the executor over one target, one storage root and one
    /// temporary workspace. `debugserver_port` is the configured port
    /// debugserver instances listen on.
    pub fn new(
        target: Target,
        storage: StorageManager,
        workspace: TemporaryWorkspace,
        log_file: Option<Utf8PathBuf>,
        debugserver_port: u16,
    ) -> Self {
        let orchestrator = Arc::new(TestOrchestrator::new(
            target.clone(),
            storage.clone(),
            workspace.clone(),
        ));
        Self {
            target,
            storage,
            workspace,
            orchestrator,
            log_file,
            debugserver_port,
        }
    }

    /// The target this executor drives.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The storage manager backing installs.
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    // ---- Installs ----------------------------------------------------

    /// Installs an `.app` bundle from a host path: persist in storage, then
    /// install onto the target.
    pub fn install_app_from_path(&self, path: &Utf8Path) -> Operation<InstalledArtifact> {
        let target = self.target.clone();
        self.storage
            .save_app_bundle(path)
            .and_then(move |artifact| {
                let path = artifact.path.clone();
                target.install_app(&path).map(move |()| artifact)
            })
            .named("install-app-from-path")
    }

    /// Installs an `.xctest` bundle or `.xctestrun` directory from a path.
    pub fn install_xctest_from_path(
        &self,
        path: &Utf8Path,
        skip_signing: bool,
    ) -> Operation<InstalledArtifact> {
        if path.extension() == Some("xctest") {
            self.storage.save_xctest_bundle(path, skip_signing)
        } else {
            self.storage
                .save_bundle_or_test_run_from_directory(path, skip_signing)
        }
    }

    /// Installs a single dylib from a host path.
    pub fn install_dylib_from_path(&self, path: &Utf8Path) -> Operation<InstalledArtifact> {
        self.storage.save_dylib(path)
    }

    /// Installs a `.framework` bundle from a host path.
    pub fn install_framework_from_path(&self, path: &Utf8Path) -> Operation<InstalledArtifact> {
        self.storage.save_framework(path)
    }

    /// Installs a dSYM from a host path, optionally linked to an installed
    /// bundle.
    pub fn install_dsym_from_path(
        &self,
        path: &Utf8Path,
        link_to: Option<String>,
    ) -> Operation<InstalledArtifact> {
        self.storage.save_dsym(path, link_to)
    }

    /// Installs an artifact from a client stream: one tar (optionally
    /// compressed) whose payload depends on the header's kind.
    pub fn install_from_stream(
        &self,
        header: InstallHeader,
        stream: ByteStream,
    ) -> Operation<InstalledArtifact> {
        let executor = self.clone();
        let extraction = self.workspace.with_archive_extracted_from_stream(
            stream,
            header.compression,
            header.override_mtime,
        );
        extraction
            .pop(move |dir| executor.install_extracted(header, dir))
            .named("install-from-stream")
    }

    fn install_extracted(
        &self,
        header: InstallHeader,
        dir: Utf8PathBuf,
    ) -> Operation<InstalledArtifact> {
        match header.kind {
            InstallKind::App => {
                let storage = self.storage.clone();
                let target = self.target.clone();
                Operation::spawn("install-extracted-app", async move {
                    let bundle = find_payload(&dir, "app")?;
                    let artifact = storage.save_app_bundle(&bundle).awaited().await;
                    let artifact = artifact.into_result()?;
                    target
                        .install_app(&artifact.path)
                        .awaited()
                        .await
                        .into_result()?;
                    Ok(artifact)
                })
            }
            InstallKind::Xctest => self
                .storage
                .save_bundle_or_test_run_from_directory(&dir, header.skip_signing),
            InstallKind::Dylib => {
                let storage = self.storage.clone();
                Operation::spawn("install-extracted-dylib", async move {
                    let file = single_file_payload(&dir)?;
                    storage.save_dylib(&file).awaited().await.into_result()
                })
            }
            InstallKind::Framework => {
                let storage = self.storage.clone();
                Operation::spawn("install-extracted-framework", async move {
                    let bundle = find_payload(&dir, "framework")?;
                    storage.save_framework(&bundle).awaited().await.into_result()
                })
            }
            InstallKind::Dsym => {
                let storage = self.storage.clone();
                let link_to = header.link_to.clone();
                Operation::spawn("install-extracted-dsym", async move {
                    let payload = match find_payload(&dir, "dSYM") {
                        Ok(bundle) => bundle,
                        // Multi-file dSYM sets are tarred as uuid subdirs.
                        Err(_) => dir.clone(),
                    };
                    storage
                        .save_dsym(&payload, link_to)
                        .awaited()
                        .await
                        .into_result()
                })
            }
        }
    }

    // ---- App lifecycle ----------------------------------------------

    /// Lists applications installed on the target.
    pub fn list_apps(&self, fetch_process_state: bool) -> Operation<Vec<InstalledAppInfo>> {
        self.target.list_apps(fetch_process_state)
    }

    /// Launches an app.
    pub fn launch_app(&self, config: AppLaunchConfig) -> Operation<LaunchedApp> {
        self.target.launch_app(config)
    }

    /// Terminates a running app.
    pub fn kill_app(&self, bundle_id: &str) -> Operation<()> {
        self.target.kill_app(bundle_id)
    }

    /// Uninstalls an app from the target and drops its persisted artifact.
    pub fn uninstall_app(&self, bundle_id: &str) -> Operation<()> {
        let storage = self.storage.clone();
        let bundle_id_owned = bundle_id.to_owned();
        self.target
            .uninstall_app(bundle_id)
            .and_then(move |()| {
                Operation::spawn("forget-persisted-app", async move {
                    // The persisted copy is advisory once the app is gone
                    // from the target; ignore a missing entry.
                    let root = storage.root().join(crate::storage::APPS_FOLDER);
                    helpers::remove_recursive(&root.join(&bundle_id_owned)).await
                })
            })
            .named("uninstall-app")
    }

    // ---- File containers --------------------------------------------

    /// Resolves the container a file operation routes to.
    pub fn container(
        &self,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> CompanionResult<Arc<dyn FileContainer>> {
        match kind {
            // The auxiliary namespace is the companion's own storage,
            // exposed as one virtual filesystem.
            ContainerKind::Auxiliary => Ok(Arc::new(PathMappedContainer::new(
                self.storage.container_mapping(),
            ))),
            _ => self.target.container_for(kind, bundle_id),
        }
    }

    /// Pushes host files into a container directory. Partial failures are
    /// aggregated; every file's error is retained.
    pub fn push_files(
        &self,
        sources: Vec<Utf8PathBuf>,
        dest: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<()> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("push-files", async move {
            let mut failures = Vec::new();
            let total = sources.len();
            for source in sources {
                if let Err(error) = container.copy_from_host(&source, &dest).await {
                    failures.push((source, error));
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(FileBatchError { total, failures }.into())
            }
        })
    }

    /// Pushes the contents of a tar stream into a container directory.
    pub fn push_file_from_tar(
        &self,
        stream: ByteStream,
        dest: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<()> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        self.workspace
            .with_archive_extracted_from_stream(stream, StreamCompression::None, false)
            .pop(move |dir| {
                Operation::spawn("push-extracted", async move {
                    for entry in helpers_list(&dir)? {
                        container.copy_from_host(&dir.join(&entry), &dest).await?;
                    }
                    Ok(())
                })
            })
            .named("push-file-from-tar")
    }

    /// Pulls a container file into memory.
    pub fn pull_file(
        &self,
        path: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<Bytes> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        let workspace = self.workspace.clone();
        Operation::spawn("pull-file", async move {
            let staging = workspace.ephemeral_temporary_directory()?;
            let pulled = container.copy_to_host(&path, &staging).await?;
            let bytes = tokio::fs::read(&pulled)
                .await
                .map_err(|error| CompanionError::io_path("reading", &pulled, error))?;
            helpers::remove_recursive(&staging).await?;
            Ok(Bytes::from(bytes))
        })
    }

    /// Pulls a container path onto the host, returning the final host path.
    pub fn pull_file_path(
        &self,
        path: String,
        host_dest: Utf8PathBuf,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<Utf8PathBuf> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("pull-file-path", async move {
            container.copy_to_host(&path, &host_dest).await
        })
    }

    /// Renames paths within a container. The sources all move into `dest`.
    pub fn move_paths(
        &self,
        sources: Vec<String>,
        dest: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<()> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("move-paths", async move {
            for source in sources {
                let file_name = Utf8Path::new(&source)
                    .file_name()
                    .ok_or_else(|| {
                        CompanionError::invalid_argument(format!(
                            "`{source}` has no file name"
                        ))
                    })?
                    .to_owned();
                let target_path = if dest.is_empty() {
                    file_name
                } else {
                    format!("{dest}/{file_name}")
                };
                container.move_item(&source, &target_path).await?;
            }
            Ok(())
        })
    }

    /// Removes paths within a container.
    pub fn remove_paths(
        &self,
        paths: Vec<String>,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<()> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("remove-paths", async move {
            for path in paths {
                container.remove(&path).await?;
            }
            Ok(())
        })
    }

    /// Lists the entries of a container directory.
    pub fn list_paths(
        &self,
        path: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<Vec<String>> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("list-paths", async move {
            container.contents_of_directory(&path).await
        })
    }

    /// Creates a directory inside a container.
    pub fn create_directory(
        &self,
        path: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> Operation<()> {
        let container = match self.container(kind, bundle_id) {
            Ok(container) => container,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("create-directory", async move {
            container.create_directory(&path).await
        })
    }

    /// Tails a container file. The outer operation resolves with an inner
    /// operation whose cancellation stops the tail.
    pub fn tail(
        &self,
        path: String,
        kind: ContainerKind,
        bundle_id: Option<&str>,
        consumer: Arc<dyn DataConsumer>,
    ) -> Operation<Operation<()>> {
        match self.container(kind, bundle_id) {
            Ok(container) => container.tail(&path, consumer),
            Err(error) => Operation::failed(error),
        }
    }

    // ---- Diagnostics, HID, settings ---------------------------------

    /// Takes a screenshot.
    pub fn take_screenshot(&self, format: ImageFormat) -> Operation<Bytes> {
        self.target.screenshot(format)
    }

    /// Describes the accessibility hierarchy, optionally at a point.
    pub fn accessibility_info(
        &self,
        point: Option<(f64, f64)>,
        nested: bool,
    ) -> Operation<JsonValue> {
        self.target.accessibility_info(point, nested)
    }

    /// Imports media into the camera roll.
    pub fn add_media(&self, paths: Vec<Utf8PathBuf>) -> Operation<()> {
        self.target
            .settings("add-media", move |adapter| async move {
                adapter.add_media(&paths).await
            })
    }

    /// Delivers a synthetic HID event.
    pub fn hid(&self, event: HidEvent) -> Operation<()> {
        self.target.hid(event)
    }

    /// Overrides the simulated location.
    pub fn set_location(&self, latitude: f64, longitude: f64) -> Operation<()> {
        self.target.settings("set-location", move |adapter| async move {
            adapter.set_location(latitude, longitude).await
        })
    }

    /// Brings the simulator window to the foreground.
    pub fn focus(&self) -> Operation<()> {
        self.target
            .settings("focus", |adapter| async move { adapter.focus().await })
    }

    /// Opens a URL on the target.
    pub fn open_url(&self, url: String) -> Operation<()> {
        self.target.settings("open-url", move |adapter| async move {
            adapter.open_url(&url).await
        })
    }

    /// Clears the target's keychain.
    pub fn clear_keychain(&self) -> Operation<()> {
        self.target.settings("clear-keychain", |adapter| async move {
            adapter.clear_keychain().await
        })
    }

    /// Grants services to a bundle.
    pub fn approve(&self, services: Vec<String>, bundle_id: String) -> Operation<()> {
        self.target.settings("approve", move |adapter| async move {
            adapter.approve(&services, &bundle_id).await
        })
    }

    /// Revokes services from a bundle.
    pub fn revoke(&self, services: Vec<String>, bundle_id: String) -> Operation<()> {
        self.target.settings("revoke", move |adapter| async move {
            adapter.revoke(&services, &bundle_id).await
        })
    }

    /// Approves a deeplink scheme for a bundle.
    pub fn approve_deeplink(&self, scheme: String, bundle_id: String) -> Operation<()> {
        self.target
            .settings("approve-deeplink", move |adapter| async move {
                adapter.approve_deeplink(&scheme, &bundle_id).await
            })
    }

    /// Revokes a deeplink scheme from a bundle.
    pub fn revoke_deeplink(&self, scheme: String, bundle_id: String) -> Operation<()> {
        self.target
            .settings("revoke-deeplink", move |adapter| async move {
                adapter.revoke_deeplink(&scheme, &bundle_id).await
            })
    }

    /// Writes a preference.
    pub fn set_preference(&self, update: PreferenceUpdate) -> Operation<()> {
        self.target
            .settings("set-preference", move |adapter| async move {
                adapter.set_preference(&update).await
            })
    }

    /// Reads a preference.
    pub fn get_preference(
        &self,
        name: String,
        domain: Option<String>,
    ) -> Operation<String> {
        let adapter = Arc::clone(self.target.adapter());
        Operation::spawn("get-preference", async move {
            adapter.get_preference(&name, domain.as_deref()).await
        })
    }

    /// Sets the locale identifier.
    pub fn set_locale(&self, locale_identifier: String) -> Operation<()> {
        self.target.settings("set-locale", move |adapter| async move {
            adapter.set_locale(&locale_identifier).await
        })
    }

    /// Reads the current locale identifier.
    pub fn get_current_locale(&self) -> Operation<String> {
        let adapter = Arc::clone(self.target.adapter());
        Operation::spawn("get-locale", async move { adapter.get_locale().await })
    }

    /// Toggles the hardware keyboard.
    pub fn set_hardware_keyboard_enabled(&self, enabled: bool) -> Operation<()> {
        self.target
            .settings("set-hardware-keyboard", move |adapter| async move {
                adapter.set_hardware_keyboard_enabled(enabled).await
            })
    }

    /// Simulates a memory warning.
    pub fn simulate_memory_warning(&self) -> Operation<()> {
        self.target
            .settings("simulate-memory-warning", |adapter| async move {
                adapter.simulate_memory_warning().await
            })
    }

    /// Delivers a push notification payload.
    pub fn send_push_notification(
        &self,
        bundle_id: String,
        payload: String,
    ) -> Operation<()> {
        self.target.settings("send-push", move |adapter| async move {
            adapter.send_push_notification(&bundle_id, &payload).await
        })
    }

    /// Replaces the contacts database from a tar stream of its files.
    pub fn update_contacts(&self, stream: ByteStream) -> Operation<()> {
        let target = self.target.clone();
        self.workspace
            .with_archive_extracted_from_stream(stream, StreamCompression::None, false)
            .pop(move |dir| {
                target.settings("update-contacts", move |adapter| async move {
                    adapter.update_contacts(&dir).await
                })
            })
            .named("update-contacts")
    }

    // ---- Tests -------------------------------------------------------

    /// Identifiers of every installed test bundle.
    pub fn list_test_bundles(&self) -> Operation<Vec<String>> {
        let storage = self.storage.clone();
        Operation::spawn("list-test-bundles", async move {
            storage.persisted_test_bundle_ids()
        })
    }

    /// The test names inside an installed bundle.
    pub fn list_tests_in_bundle(
        &self,
        bundle_id: &str,
        app_path: Option<&Utf8Path>,
    ) -> Operation<Vec<String>> {
        self.orchestrator.list_tests_in_bundle(bundle_id, app_path)
    }

    /// Starts a test run; see the orchestrator for the full contract.
    pub fn xctest_run(
        &self,
        request: TestRunRequest,
        reporter: Arc<dyn TestReporter>,
    ) -> TestRunOperation {
        self.orchestrator.run(request, reporter)
    }

    // ---- Debugging ----------------------------------------------------

    /// Starts a debugserver for an installed bundle on the configured port.
    pub fn debugserver_start(&self, bundle_id: &str) -> Operation<DebugServerInfo> {
        self.target.debugserver_start(bundle_id, self.debugserver_port)
    }

    /// The running debugserver, if any.
    pub fn debugserver_status(&self) -> Option<DebugServerInfo> {
        self.target.debugserver_status()
    }

    /// Stops the running debugserver.
    pub fn debugserver_stop(&self) -> Operation<()> {
        self.target.debugserver_stop()
    }

    /// Spawns a Debug Adapter Protocol server; `stdin_stream` is pumped into
    /// the process and its stdout is pushed to `consumer`. The returned
    /// process terminates with SIGTERM → SIGKILL when its completion
    /// operation is cancelled.
    pub fn dap_server(
        &self,
        dap_path: Utf8PathBuf,
        mut stdin_stream: ByteStream,
        consumer: Arc<dyn DataConsumer>,
    ) -> Operation<Process> {
        let sandbox = match self.workspace.ephemeral_temporary_directory() {
            Ok(dir) => dir,
            Err(error) => return Operation::failed(error),
        };
        let builder = ProcessBuilder::new(dap_path)
            .env("HOME", sandbox.as_str())
            .stdin(StdinSource::Stream)
            .stdout(OutputSink::Consumer(consumer))
            .stderr(OutputSink::Logger(tracing::Level::DEBUG));
        builder.start().map(move |process| {
            if let Some(mut writer) = process.take_stdin_writer() {
                tokio::spawn(async move {
                    while let Some(chunk) = stdin_stream.recv().await {
                        if writer.write_all(&chunk).await.is_err() {
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    let _ = writer.shutdown().await;
                });
            }
            process
        })
    }

    // ---- Logs & diagnostics ------------------------------------------

    /// Tails the companion's own log file.
    pub fn tail_companion_logs(
        &self,
        consumer: Arc<dyn DataConsumer>,
    ) -> Operation<Operation<()>> {
        let Some(log_file) = &self.log_file else {
            return Operation::failed(CompanionError::BackendUnsupported {
                operation: "tail_companion_logs",
                container: "companion logging is not writing to a file".to_owned(),
            });
        };
        let Some(parent) = log_file.parent() else {
            return Operation::failed(CompanionError::invalid_argument(format!(
                "log file `{log_file}` has no parent directory"
            )));
        };
        let container = crate::containers::DirectoryContainer::new(
            "companion-logs",
            parent.to_owned(),
            crate::containers::ContainerCaps::read_only(),
        );
        container.tail(log_file.file_name().unwrap_or_default(), consumer)
    }

    /// Static information about the daemon and its target.
    pub fn diagnostic_information(&self) -> Operation<DiagnosticInfo> {
        let target = self.target.clone();
        let storage_root = self.storage.root().to_owned();
        Operation::spawn("diagnostic-information", async move {
            let description = target.adapter().query_description().await?;
            Ok(DiagnosticInfo {
                udid: description.udid,
                model: description.model,
                os_version: description.os_version,
                architectures: description.architectures.into_iter().collect(),
                state: description.state.to_string(),
                storage_root,
            })
        })
    }

    /// Crash logs matching a query.
    pub fn crash_list(&self, query: CrashLogQuery) -> Operation<Vec<CrashLogInfo>> {
        self.target.crash_list(query)
    }

    /// The contents of the first matching crash log.
    pub fn crash_show(&self, query: CrashLogQuery) -> Operation<String> {
        self.target.crash_show(query)
    }

    /// Deletes matching crash logs.
    pub fn crash_delete(&self, query: CrashLogQuery) -> Operation<Vec<CrashLogInfo>> {
        self.target.crash_delete(query)
    }

    // ---- Clean --------------------------------------------------------

    /// Removes every persisted artifact and uninstalls the apps the
    /// companion had installed on the target.
    pub fn clean(&self) -> Operation<()> {
        let storage = self.storage.clone();
        let target = self.target.clone();
        Operation::spawn("clean", async move {
            let installed = storage.persisted_app_ids()?;
            storage.clean().awaited().await.into_result()?;
            for bundle_id in installed {
                // An app already gone from the target is fine.
                let _ = target.uninstall_app(&bundle_id).awaited().await;
            }
            Ok(())
        })
    }
}

/// Finds the single payload with the given extension in an extraction root.
fn find_payload(dir: &Utf8Path, extension: &str) -> CompanionResult<Utf8PathBuf> {
    for entry in helpers_list(dir)? {
        let path = dir.join(&entry);
        if path.extension() == Some(extension) {
            return Ok(path);
        }
    }
    Err(CompanionError::NotFound(format!(
        "no .{extension} payload in the uploaded archive"
    )))
}

/// Finds a single regular file in an extraction root, descending through
/// the uuid-subdir layout clients use.
fn single_file_payload(dir: &Utf8Path) -> CompanionResult<Utf8PathBuf> {
    let mut files = files_from_subdirs(dir)?;
    match files.len() {
        0 => Err(CompanionError::NotFound(
            "the uploaded archive contains no files".to_owned(),
        )),
        1 => Ok(files.remove(0)),
        n => Err(CompanionError::invalid_argument(format!(
            "expected a single file in the uploaded archive, found {n}"
        ))),
    }
}

fn helpers_list(dir: &Utf8Path) -> CompanionResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in dir
        .read_dir_utf8()
        .map_err(|error| CompanionError::io_path("listing", dir, error))?
    {
        let entry = entry.map_err(|error| CompanionError::io_path("listing", dir, error))?;
        names.push(entry.file_name().to_owned());
    }
    names.sort_unstable();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{NoopCodesigner, test_support},
        target::{TargetState, loopback::LoopbackAdapter},
    };
    use maplit::btreeset;
    use tokio::sync::mpsc;

    struct Harness {
        executor: CommandExecutor,
        adapter: Arc<LoopbackAdapter>,
        dir: camino_tempfile::Utf8TempDir,
    }

    fn harness() -> Harness {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = Arc::new(LoopbackAdapter::new(dir.path().join("sim")));
        let target = Target::new(adapter.clone(), TargetState::Booted);
        let storage = StorageManager::new(
            dir.path().join("storage"),
            btreeset! {"arm64".to_owned()},
            Arc::new(NoopCodesigner),
        )
        .unwrap();
        let workspace = TemporaryWorkspace::new(dir.path().join("tmp")).unwrap();
        Harness {
            executor: CommandExecutor::new(target, storage, workspace, None, 10881),
            adapter,
            dir,
        }
    }

    fn tar_of_dir(name: &str, path: &Utf8Path) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(name, path).unwrap();
        builder.into_inner().unwrap()
    }

    async fn stream_of(data: Vec<u8>) -> ByteStream {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for chunk in data.chunks(4096) {
                if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn install_app_then_list() {
        let harness = harness();
        let bundle =
            test_support::write_sample_app(harness.dir.path(), "Sample", "com.x.Sample");

        let artifact = harness
            .executor
            .install_app_from_path(&bundle)
            .await
            .unwrap();
        assert_eq!(artifact.name, "Sample");
        assert!(artifact.path.as_str().ends_with("apps/com.x.Sample/Sample.app"));

        let apps = harness.executor.list_apps(false).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].bundle_id, "com.x.Sample");
        assert_eq!(apps[0].pid, None);
    }

    #[tokio::test]
    async fn install_app_from_stream() {
        let harness = harness();
        let bundle =
            test_support::write_sample_app(harness.dir.path(), "Sample", "com.x.Sample");
        let tarball = tar_of_dir("Sample.app", &bundle);

        let header: InstallHeader = serde_json::from_str(r#"{"kind":"app"}"#).unwrap();
        let artifact = harness
            .executor
            .install_from_stream(header, stream_of(tarball).await)
            .await
            .unwrap();
        assert_eq!(artifact.name, "Sample");

        let apps = harness.executor.list_apps(false).await.unwrap();
        assert_eq!(apps[0].bundle_id, "com.x.Sample");
    }

    #[tokio::test]
    async fn install_dylib_from_stream_uses_unique_subdir_layout() {
        let harness = harness();
        let staging = harness.dir.path().join("payload/0a1b2c");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("libInject.dylib"), b"dylib bytes").unwrap();
        let tarball = tar_of_dir("0a1b2c", &staging);

        let header: InstallHeader = serde_json::from_str(r#"{"kind":"dylib"}"#).unwrap();
        let artifact = harness
            .executor
            .install_from_stream(header, stream_of(tarball).await)
            .await
            .unwrap();
        assert_eq!(artifact.name, "libInject.dylib");
        assert_eq!(
            harness.executor.storage().persisted_dylib_names().unwrap(),
            vec!["libInject.dylib".to_owned()]
        );
    }

    #[tokio::test]
    async fn push_tar_then_pull_round_trips() {
        let harness = harness();
        let bundle =
            test_support::write_sample_app(harness.dir.path(), "Sample", "com.x.Sample");
        harness
            .executor
            .install_app_from_path(&bundle)
            .await
            .unwrap();

        // Tar containing a single file X with contents C.
        let payload_dir = harness.dir.path().join("payload");
        std::fs::create_dir_all(&payload_dir).unwrap();
        std::fs::write(payload_dir.join("X"), b"file contents C").unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_path_with_name(payload_dir.join("X"), "X")
            .unwrap();
        let tarball = builder.into_inner().unwrap();

        harness
            .executor
            .push_file_from_tar(
                stream_of(tarball).await,
                "Documents".to_owned(),
                ContainerKind::AppSandbox,
                Some("com.x.Sample"),
            )
            .await
            .unwrap();

        let pulled = harness
            .executor
            .pull_file(
                "Documents/X".to_owned(),
                ContainerKind::AppSandbox,
                Some("com.x.Sample"),
            )
            .await
            .unwrap();
        assert_eq!(&pulled[..], b"file contents C");
    }

    #[tokio::test]
    async fn file_ops_route_through_containers() {
        let harness = harness();
        harness
            .executor
            .create_directory("inbox".to_owned(), ContainerKind::Root, None)
            .await
            .unwrap();

        let payload = harness.dir.path().join("note.txt");
        std::fs::write(&payload, b"note").unwrap();
        harness
            .executor
            .push_files(
                vec![payload],
                "inbox".to_owned(),
                ContainerKind::Root,
                None,
            )
            .await
            .unwrap();

        harness
            .executor
            .move_paths(
                vec!["inbox/note.txt".to_owned()],
                "".to_owned(),
                ContainerKind::Root,
                None,
            )
            .await
            .unwrap();
        let listed = harness
            .executor
            .list_paths("".to_owned(), ContainerKind::Root, None)
            .await
            .unwrap();
        assert!(listed.contains(&"note.txt".to_owned()));

        harness
            .executor
            .remove_paths(vec!["note.txt".to_owned()], ContainerKind::Root, None)
            .await
            .unwrap();
        let listed = harness
            .executor
            .list_paths("".to_owned(), ContainerKind::Root, None)
            .await
            .unwrap();
        assert!(!listed.contains(&"note.txt".to_owned()));
    }

    #[tokio::test]
    async fn auxiliary_container_exposes_storage() {
        let harness = harness();
        let dylib = harness.dir.path().join("libX.dylib");
        std::fs::write(&dylib, b"lib").unwrap();
        harness
            .executor
            .install_dylib_from_path(&dylib)
            .await
            .unwrap();

        let listed = harness
            .executor
            .list_paths("dylibs".to_owned(), ContainerKind::Auxiliary, None)
            .await
            .unwrap();
        assert_eq!(listed, vec!["libX.dylib".to_owned()]);
    }

    #[tokio::test]
    async fn incompatible_architecture_rejected_end_to_end() {
        let harness = harness();
        let bundle = crate::storage::test_support::write_sample_app(
            harness.dir.path(),
            "Sample",
            "com.x.Sample",
        );
        // Overwrite the executable with an x86_64-only binary.
        std::fs::write(bundle.join("Sample"), test_support::x86_64_binary()).unwrap();

        let error = harness
            .executor
            .install_app_from_path(&bundle)
            .await
            .unwrap_err();
        assert!(
            matches!(error, CompanionError::IncompatibleArchitecture { .. }),
            "{error}"
        );
        assert!(harness.executor.storage().persisted_app_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clean_uninstalls_and_empties_storage() {
        let harness = harness();
        let bundle =
            test_support::write_sample_app(harness.dir.path(), "Sample", "com.x.Sample");
        harness
            .executor
            .install_app_from_path(&bundle)
            .await
            .unwrap();
        assert_eq!(harness.executor.list_apps(false).await.unwrap().len(), 1);

        harness.executor.clean().await.unwrap();
        assert!(harness.executor.storage().persisted_app_ids().unwrap().is_empty());
        assert!(harness.executor.list_apps(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_surface_reaches_adapter() {
        let harness = harness();
        harness
            .executor
            .set_location(37.48, -122.14)
            .await
            .unwrap();
        harness.executor.clear_keychain().await.unwrap();
        harness
            .executor
            .approve(vec!["photos".to_owned()], "com.x.Sample".to_owned())
            .await
            .unwrap();

        let invocations = harness.adapter.invocations();
        assert!(invocations.iter().any(|i| i.starts_with("set-location:37.48")));
        assert!(invocations.iter().any(|i| i == "clear-keychain"));
        assert!(invocations.iter().any(|i| i.starts_with("approve:com.x.Sample")));
    }

    #[tokio::test]
    async fn diagnostic_information_reports_target_and_storage() {
        let harness = harness();
        let info = harness.executor.diagnostic_information().await.unwrap();
        assert_eq!(info.state, "booted");
        assert!(info.architectures.contains(&"arm64".to_owned()));
        assert!(info.storage_root.as_str().contains("storage"));
    }

    #[tokio::test]
    async fn dap_server_round_trips_protocol_bytes() {
        let harness = harness();
        let consumer = crate::process::MemoryConsumer::new();
        let (tx, rx) = mpsc::channel(4);

        let process = harness
            .executor
            .dap_server(Utf8PathBuf::from("/bin/cat"), rx, Arc::new(consumer.clone()))
            .await
            .unwrap();

        tx.send(Bytes::from_static(b"Content-Length: 2\r\n\r\n{}"))
            .await
            .unwrap();
        drop(tx);

        process
            .run_until_completion(vec![0], std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&consumer.contents()[..], b"Content-Length: 2\r\n\r\n{}");
    }
}
