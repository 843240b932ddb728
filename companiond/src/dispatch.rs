// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire boundary.
//!
//! The daemon speaks line-delimited JSON over TCP, one request per
//! connection; the gRPC plumbing a production deployment would put here is
//! an external collaborator, so this module owns exactly what the core
//! specifies for the boundary: parsing wire requests into executor calls,
//! turning operations back into unary or streaming responses, translating
//! the error taxonomy into transport status codes, and mapping container
//! kind strings onto backends.
//!
//! Frame shapes:
//!
//! * request: `{"method": "...", ...fields}`
//! * client-stream chunk: `{"chunk": "<hex>"}`, terminated by `{"end": true}`
//! * server event: `{"status": "event", "event": {...}}`
//! * terminal: `{"status": "ok", "result": ...}` or
//!   `{"status": "error", "code": N, "error": {"kind": "...", "message": "..."}}`

use bytes::Bytes;
use camino::Utf8PathBuf;
use companion_metadata::{
    ContainerKind, CrashLogQuery, ErrorKind, HidEvent, ImageFormat, InstallHeader,
    TestRunParams, WireError,
};
use companion_runner::{
    errors::CompanionError,
    executor::CommandExecutor,
    process::DataConsumer,
    target::{AppLaunchConfig, PreferenceUpdate},
    testing::{TestEvent, TestEventKind, TestReporter, TestRunRequest},
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{Mutex, mpsc},
};

/// Where a file operation is routed.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerRef {
    /// The container kind string from the wire.
    pub kind: ContainerKind,
    /// The bundle id, for app-sandbox containers.
    #[serde(default)]
    pub bundle_id: Option<String>,
}

/// A wire request.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Request {
    /// List installed applications.
    ListApps {
        /// Whether to include process state.
        #[serde(default)]
        fetch_process_state: bool,
    },
    /// Install an app from a host path.
    InstallAppFilePath {
        /// The bundle path.
        path: Utf8PathBuf,
    },
    /// Install a test bundle from a host path.
    InstallXctestFilePath {
        /// The bundle or directory path.
        path: Utf8PathBuf,
        /// Whether to skip re-signing.
        #[serde(default)]
        skip_signing: bool,
    },
    /// Install a dylib from a host path.
    InstallDylibFilePath {
        /// The file path.
        path: Utf8PathBuf,
    },
    /// Install a framework from a host path.
    InstallFrameworkFilePath {
        /// The bundle path.
        path: Utf8PathBuf,
    },
    /// Install a dSYM from a host path.
    InstallDsymFilePath {
        /// The dSYM path.
        path: Utf8PathBuf,
        /// A bundle id to link the dSYM to.
        #[serde(default)]
        link_to: Option<String>,
    },
    /// Install an artifact from chunk frames following this request.
    InstallStream {
        /// The install header.
        #[serde(flatten)]
        header: InstallHeader,
    },
    /// Launch an app.
    LaunchApp {
        /// The bundle id.
        bundle_id: String,
        /// Environment for the app.
        #[serde(default)]
        environment: BTreeMap<String, String>,
        /// Arguments for the app.
        #[serde(default)]
        arguments: Vec<String>,
        /// Whether to wait for a debugger.
        #[serde(default)]
        wait_for_debugger: bool,
        /// Whether to relaunch if already running.
        #[serde(default)]
        override_running: bool,
    },
    /// Terminate a running app.
    KillApp {
        /// The bundle id.
        bundle_id: String,
    },
    /// Uninstall an app.
    UninstallApp {
        /// The bundle id.
        bundle_id: String,
    },
    /// Push host files into a container.
    PushFiles {
        /// Host paths to push.
        sources: Vec<Utf8PathBuf>,
        /// Destination directory inside the container.
        dest: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Push a tar stream's contents into a container.
    PushFileFromTar {
        /// Destination directory inside the container.
        dest: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Pull a container file as bytes.
    PullFile {
        /// The container path.
        path: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Pull a container path to a host path.
    PullFilePath {
        /// The container path.
        path: String,
        /// The destination on the host.
        host_dest: Utf8PathBuf,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Move paths within a container.
    MovePaths {
        /// The source paths.
        sources: Vec<String>,
        /// The destination directory.
        dest: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Remove paths within a container.
    RemovePaths {
        /// The paths to remove.
        paths: Vec<String>,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// List a container directory.
    ListPaths {
        /// The directory path.
        path: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Create a container directory.
    CreateDirectory {
        /// The directory path.
        path: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Stream appends of a container file until the client disconnects.
    Tail {
        /// The file path.
        path: String,
        /// The container routing.
        #[serde(flatten)]
        container: ContainerRef,
    },
    /// Take a screenshot.
    TakeScreenshot {
        /// The image format.
        #[serde(default)]
        format: ImageFormat,
    },
    /// Describe the accessibility hierarchy.
    AccessibilityInfo {
        /// Optional point of interest, x coordinate.
        #[serde(default)]
        x: Option<f64>,
        /// Optional point of interest, y coordinate.
        #[serde(default)]
        y: Option<f64>,
        /// Whether to nest the hierarchy.
        #[serde(default)]
        nested: bool,
    },
    /// Import media files.
    AddMedia {
        /// Host paths of the media files.
        paths: Vec<Utf8PathBuf>,
    },
    /// Deliver a HID event.
    Hid {
        /// The event.
        event: HidEvent,
    },
    /// Override the simulated location.
    SetLocation {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
    /// Bring the simulator window to the foreground.
    Focus,
    /// Open a URL on the target.
    OpenUrl {
        /// The URL.
        url: String,
    },
    /// Clear the target's keychain.
    ClearKeychain,
    /// Grant services to a bundle.
    Approve {
        /// The services to grant.
        services: Vec<String>,
        /// The bundle id.
        bundle_id: String,
    },
    /// Revoke services from a bundle.
    Revoke {
        /// The services to revoke.
        services: Vec<String>,
        /// The bundle id.
        bundle_id: String,
    },
    /// Approve a deeplink scheme.
    ApproveDeeplink {
        /// The scheme.
        scheme: String,
        /// The bundle id.
        bundle_id: String,
    },
    /// Revoke a deeplink scheme.
    RevokeDeeplink {
        /// The scheme.
        scheme: String,
        /// The bundle id.
        bundle_id: String,
    },
    /// Write a preference.
    SetPreference {
        /// The preference name.
        name: String,
        /// The serialized value.
        value: String,
        /// The value type.
        #[serde(default)]
        value_type: Option<String>,
        /// The preferences domain.
        #[serde(default)]
        domain: Option<String>,
    },
    /// Read a preference.
    GetPreference {
        /// The preference name.
        name: String,
        /// The preferences domain.
        #[serde(default)]
        domain: Option<String>,
    },
    /// Set the locale identifier.
    SetLocale {
        /// The locale identifier.
        locale_identifier: String,
    },
    /// Read the current locale identifier.
    GetCurrentLocale,
    /// Toggle the hardware keyboard.
    SetHardwareKeyboardEnabled {
        /// Whether the hardware keyboard is enabled.
        enabled: bool,
    },
    /// Simulate a memory warning.
    SimulateMemoryWarning,
    /// Deliver a push notification payload.
    SendPushNotification {
        /// The bundle id.
        bundle_id: String,
        /// The notification JSON payload.
        payload: String,
    },
    /// Replace the contacts database from chunk frames.
    UpdateContacts,
    /// List installed test bundles.
    ListTestBundles,
    /// List the tests inside a bundle.
    ListTestsInBundle {
        /// The test bundle id.
        bundle_id: String,
        /// An optional host app path.
        #[serde(default)]
        app_path: Option<Utf8PathBuf>,
    },
    /// Execute a test run, streaming events.
    XctestRun {
        /// The run request.
        #[serde(flatten)]
        params: TestRunParams,
    },
    /// Start a debugserver.
    DebugserverStart {
        /// The bundle id to serve.
        bundle_id: String,
    },
    /// Report the running debugserver.
    DebugserverStatus,
    /// Stop the running debugserver.
    DebugserverStop,
    /// Stream the companion's own log.
    TailCompanionLogs,
    /// Static daemon/target information.
    DiagnosticInformation,
    /// List crash logs.
    CrashList {
        /// The selection query.
        #[serde(flatten)]
        query: CrashLogQuery,
    },
    /// Show the first matching crash log.
    CrashShow {
        /// The selection query.
        #[serde(flatten)]
        query: CrashLogQuery,
    },
    /// Delete matching crash logs.
    CrashDelete {
        /// The selection query.
        #[serde(flatten)]
        query: CrashLogQuery,
    },
    /// Spawn a Debug Adapter Protocol server over this connection.
    DapServer {
        /// The DAP executable path.
        dap_path: Utf8PathBuf,
    },
    /// Remove every artifact and uninstall companion-installed apps.
    Clean,
}

#[derive(Debug, Deserialize)]
struct ChunkFrame {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    end: bool,
}

/// The transport status code for a taxonomy kind (gRPC vocabulary).
pub fn status_code(kind: ErrorKind) -> u32 {
    match kind {
        ErrorKind::Cancelled => 1,
        ErrorKind::InvalidArgument => 3,
        ErrorKind::Timeout => 4,
        ErrorKind::NotFound => 5,
        ErrorKind::AlreadyExists => 6,
        ErrorKind::TargetState | ErrorKind::IncompatibleArchitecture => 9,
        ErrorKind::BackendUnsupported => 12,
        ErrorKind::Io | ErrorKind::Protocol | ErrorKind::Subprocess | ErrorKind::Internal => 13,
    }
}

type SharedWriter = Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>;

async fn write_frame(writer: &SharedWriter, frame: JsonValue) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(&frame).expect("frames always serialize");
    line.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&line).await?;
    writer.flush().await
}

async fn write_ok(writer: &SharedWriter, result: JsonValue) {
    let _ = write_frame(writer, json!({"status": "ok", "result": result})).await;
}

async fn write_error(writer: &SharedWriter, error: &CompanionError) {
    let wire = WireError {
        kind: error.kind(),
        message: error.to_string(),
    };
    let _ = write_frame(
        writer,
        json!({
            "status": "error",
            "code": status_code(wire.kind),
            "error": wire,
        }),
    )
    .await;
}

async fn write_event(writer: &SharedWriter, event: JsonValue) {
    let _ = write_frame(writer, json!({"status": "event", "event": event})).await;
}

/// A reporter that forwards events into an mpsc channel.
struct ChannelReporter {
    sender: mpsc::UnboundedSender<TestEvent>,
}

impl TestReporter for ChannelReporter {
    fn report(&self, event: TestEvent) {
        let _ = self.sender.send(event);
    }
}

/// A data consumer that forwards chunks into an mpsc channel.
struct ChannelConsumer {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl DataConsumer for ChannelConsumer {
    fn consume(&self, data: Bytes) {
        let _ = self.sender.send(data);
    }
}

/// Serializes a test event for the wire.
pub fn event_to_json(event: &TestEvent) -> JsonValue {
    let body = match &event.kind {
        TestEventKind::DidBeginExecutingTestPlan => json!({"kind": "did-begin-executing-test-plan"}),
        TestEventKind::SuiteDidStart { suite } => {
            json!({"kind": "test-suite-did-start", "suite": suite})
        }
        TestEventKind::CaseDidStart { class, method } => {
            json!({"kind": "test-case-did-start", "class": class, "method": method})
        }
        TestEventKind::CaseWillStartActivity {
            class,
            method,
            activity,
        } => json!({
            "kind": "test-case-will-start-activity",
            "class": class, "method": method, "activity": activity.title,
        }),
        TestEventKind::CaseDidFinishActivity {
            class,
            method,
            activity,
        } => json!({
            "kind": "test-case-did-finish-activity",
            "class": class, "method": method, "activity": activity.title,
        }),
        TestEventKind::CaseAttachment {
            class,
            method,
            activity,
            data,
            uniform_type,
        } => json!({
            "kind": "test-case-attachment",
            "class": class, "method": method, "activity": activity,
            "uniform-type": uniform_type,
            "data": hex::encode(data),
        }),
        TestEventKind::CaseDidFail {
            class,
            method,
            exceptions,
        } => json!({
            "kind": "test-case-did-fail",
            "class": class, "method": method,
            "exceptions": exceptions.iter().map(|e| json!({
                "message": e.message, "file": e.file, "line": e.line,
            })).collect::<Vec<_>>(),
        }),
        TestEventKind::CaseDidFinish {
            class,
            method,
            status,
            duration,
            logs,
        } => json!({
            "kind": "test-case-did-finish",
            "class": class, "method": method,
            "status": status, "duration": duration, "logs": logs,
        }),
        TestEventKind::SuiteDidFinish { suite, totals } => {
            json!({"kind": "test-suite-did-finish", "suite": suite, "totals": totals})
        }
        TestEventKind::HadOutput { output } => {
            json!({"kind": "test-had-output", "output": hex::encode(output)})
        }
        TestEventKind::DidCrashDuringTest { error } => {
            json!({"kind": "did-crash-during-test", "error": error})
        }
        TestEventKind::DidFinishExecutingTestPlan => {
            json!({"kind": "did-finish-executing-test-plan"})
        }
    };
    let mut body = body;
    body["timestamp"] = json!(event.timestamp.to_rfc3339());
    body
}

/// The request dispatcher; one per daemon.
#[derive(Clone)]
pub struct Dispatcher {
    executor: CommandExecutor,
}

impl Dispatcher {
    /// Creates a dispatcher over the executor.
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Serves one connection: a single request, then unary or streaming
    /// responses until the method completes or the client goes away.
    pub async fn serve_connection(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));

        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(error) => {
                tracing::debug!(?peer, %error, "connection read failed");
                return;
            }
        };
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(error) => {
                write_error(
                    &writer,
                    &CompanionError::invalid_argument(format!("unparseable request: {error}")),
                )
                .await;
                return;
            }
        };
        tracing::debug!(?peer, request = ?request_name(&request), "dispatching");
        self.dispatch(request, &mut reader, &writer).await;
    }

    async fn dispatch(
        &self,
        request: Request,
        reader: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: &SharedWriter,
    ) {
        let executor = &self.executor;
        match request {
            Request::ListApps {
                fetch_process_state,
            } => {
                respond(writer, executor.list_apps(fetch_process_state).await, |apps| {
                    json!(apps)
                })
                .await;
            }
            Request::InstallAppFilePath { path } => {
                respond(
                    writer,
                    executor.install_app_from_path(&path).await,
                    |artifact| json!(artifact.to_info()),
                )
                .await;
            }
            Request::InstallXctestFilePath { path, skip_signing } => {
                respond(
                    writer,
                    executor
                        .install_xctest_from_path(&path, skip_signing)
                        .await,
                    |artifact| json!(artifact.to_info()),
                )
                .await;
            }
            Request::InstallDylibFilePath { path } => {
                respond(
                    writer,
                    executor.install_dylib_from_path(&path).await,
                    |artifact| json!(artifact.to_info()),
                )
                .await;
            }
            Request::InstallFrameworkFilePath { path } => {
                respond(
                    writer,
                    executor.install_framework_from_path(&path).await,
                    |artifact| json!(artifact.to_info()),
                )
                .await;
            }
            Request::InstallDsymFilePath { path, link_to } => {
                respond(
                    writer,
                    executor
                        .install_dsym_from_path(&path, link_to)
                        .await,
                    |artifact| json!(artifact.to_info()),
                )
                .await;
            }
            Request::InstallStream { header } => {
                let (sender, receiver) = mpsc::channel(16);
                let operation = executor.install_from_stream(header, receiver);
                if let Err(error) = pump_chunks(reader, sender).await {
                    write_error(writer, &error).await;
                    let _ = operation.cancel();
                    return;
                }
                respond(writer, operation.await, |artifact| {
                    json!(artifact.to_info())
                })
                .await;
            }
            Request::LaunchApp {
                bundle_id,
                environment,
                arguments,
                wait_for_debugger,
                override_running,
            } => {
                let config = AppLaunchConfig {
                    bundle_id,
                    environment,
                    arguments,
                    wait_for_debugger,
                    override_running,
                };
                respond(writer, executor.launch_app(config).await, |app| {
                    json!({"bundle-id": app.bundle_id, "pid": app.pid})
                })
                .await;
            }
            Request::KillApp { bundle_id } => {
                respond(writer, executor.kill_app(&bundle_id).await, unit).await;
            }
            Request::UninstallApp { bundle_id } => {
                respond(writer, executor.uninstall_app(&bundle_id).await, unit).await;
            }
            Request::PushFiles {
                sources,
                dest,
                container,
            } => {
                respond(
                    writer,
                    executor
                        .push_files(sources, dest, container.kind, container.bundle_id.as_deref())
                        .await,
                    unit,
                )
                .await;
            }
            Request::PushFileFromTar { dest, container } => {
                let (sender, receiver) = mpsc::channel(16);
                let operation = executor.push_file_from_tar(
                    receiver,
                    dest,
                    container.kind,
                    container.bundle_id.as_deref(),
                );
                if let Err(error) = pump_chunks(reader, sender).await {
                    write_error(writer, &error).await;
                    let _ = operation.cancel();
                    return;
                }
                respond(writer, operation.await, unit).await;
            }
            Request::PullFile { path, container } => {
                respond(
                    writer,
                    executor
                        .pull_file(path, container.kind, container.bundle_id.as_deref())
                        .await,
                    |bytes| json!(hex::encode(bytes)),
                )
                .await;
            }
            Request::PullFilePath {
                path,
                host_dest,
                container,
            } => {
                respond(
                    writer,
                    executor
                        .pull_file_path(
                            path,
                            host_dest,
                            container.kind,
                            container.bundle_id.as_deref(),
                        )
                        .await,
                    |pulled| json!(pulled),
                )
                .await;
            }
            Request::MovePaths {
                sources,
                dest,
                container,
            } => {
                respond(
                    writer,
                    executor
                        .move_paths(sources, dest, container.kind, container.bundle_id.as_deref())
                        .await,
                    unit,
                )
                .await;
            }
            Request::RemovePaths { paths, container } => {
                respond(
                    writer,
                    executor
                        .remove_paths(paths, container.kind, container.bundle_id.as_deref())
                        .await,
                    unit,
                )
                .await;
            }
            Request::ListPaths { path, container } => {
                respond(
                    writer,
                    executor
                        .list_paths(path, container.kind, container.bundle_id.as_deref())
                        .await,
                    |names| json!(names),
                )
                .await;
            }
            Request::CreateDirectory { path, container } => {
                respond(
                    writer,
                    executor
                        .create_directory(path, container.kind, container.bundle_id.as_deref())
                        .await,
                    unit,
                )
                .await;
            }
            Request::Tail { path, container } => {
                self.serve_tail(
                    executor.tail(
                        path,
                        container.kind,
                        container.bundle_id.as_deref(),
                        self.make_byte_streamer(writer).0,
                    ),
                    reader,
                    writer,
                )
                .await;
            }
            Request::TakeScreenshot { format } => {
                respond(
                    writer,
                    executor.take_screenshot(format).await,
                    |bytes| json!(hex::encode(bytes)),
                )
                .await;
            }
            Request::AccessibilityInfo { x, y, nested } => {
                let point = match (x, y) {
                    (Some(x), Some(y)) => Some((x, y)),
                    _ => None,
                };
                respond(
                    writer,
                    executor.accessibility_info(point, nested).await,
                    |info| info,
                )
                .await;
            }
            Request::AddMedia { paths } => {
                respond(writer, executor.add_media(paths).await, unit).await;
            }
            Request::Hid { event } => {
                respond(writer, executor.hid(event).await, unit).await;
            }
            Request::SetLocation {
                latitude,
                longitude,
            } => {
                respond(
                    writer,
                    executor.set_location(latitude, longitude).await,
                    unit,
                )
                .await;
            }
            Request::Focus => {
                respond(writer, executor.focus().await, unit).await;
            }
            Request::OpenUrl { url } => {
                respond(writer, executor.open_url(url).await, unit).await;
            }
            Request::ClearKeychain => {
                respond(writer, executor.clear_keychain().await, unit).await;
            }
            Request::Approve {
                services,
                bundle_id,
            } => {
                respond(
                    writer,
                    executor.approve(services, bundle_id).await,
                    unit,
                )
                .await;
            }
            Request::Revoke {
                services,
                bundle_id,
            } => {
                respond(
                    writer,
                    executor.revoke(services, bundle_id).await,
                    unit,
                )
                .await;
            }
            Request::ApproveDeeplink { scheme, bundle_id } => {
                respond(
                    writer,
                    executor.approve_deeplink(scheme, bundle_id).await,
                    unit,
                )
                .await;
            }
            Request::RevokeDeeplink { scheme, bundle_id } => {
                respond(
                    writer,
                    executor.revoke_deeplink(scheme, bundle_id).await,
                    unit,
                )
                .await;
            }
            Request::SetPreference {
                name,
                value,
                value_type,
                domain,
            } => {
                respond(
                    writer,
                    executor
                        .set_preference(PreferenceUpdate {
                            name,
                            value,
                            value_type,
                            domain,
                        })
                        .await,
                    unit,
                )
                .await;
            }
            Request::GetPreference { name, domain } => {
                respond(
                    writer,
                    executor.get_preference(name, domain).await,
                    |value| json!(value),
                )
                .await;
            }
            Request::SetLocale { locale_identifier } => {
                respond(
                    writer,
                    executor.set_locale(locale_identifier).await,
                    unit,
                )
                .await;
            }
            Request::GetCurrentLocale => {
                respond(
                    writer,
                    executor.get_current_locale().await,
                    |locale| json!(locale),
                )
                .await;
            }
            Request::SetHardwareKeyboardEnabled { enabled } => {
                respond(
                    writer,
                    executor
                        .set_hardware_keyboard_enabled(enabled)
                        .await,
                    unit,
                )
                .await;
            }
            Request::SimulateMemoryWarning => {
                respond(writer, executor.simulate_memory_warning().await, unit).await;
            }
            Request::SendPushNotification { bundle_id, payload } => {
                respond(
                    writer,
                    executor
                        .send_push_notification(bundle_id, payload)
                        .await,
                    unit,
                )
                .await;
            }
            Request::UpdateContacts => {
                let (sender, receiver) = mpsc::channel(16);
                let operation = executor.update_contacts(receiver);
                if let Err(error) = pump_chunks(reader, sender).await {
                    write_error(writer, &error).await;
                    let _ = operation.cancel();
                    return;
                }
                respond(writer, operation.await, unit).await;
            }
            Request::ListTestBundles => {
                respond(writer, executor.list_test_bundles().await, |ids| {
                    json!(ids)
                })
                .await;
            }
            Request::ListTestsInBundle {
                bundle_id,
                app_path,
            } => {
                respond(
                    writer,
                    executor
                        .list_tests_in_bundle(&bundle_id, app_path.as_deref())
                        .await,
                    |names| json!(names),
                )
                .await;
            }
            Request::XctestRun { params } => {
                let request = match TestRunRequest::from_params(params) {
                    Ok(request) => request,
                    Err(error) => {
                        write_error(writer, &error).await;
                        return;
                    }
                };
                let (sender, mut receiver) = mpsc::unbounded_channel();
                let run = executor.xctest_run(request, Arc::new(ChannelReporter { sender }));
                let forwarder = {
                    let writer = Arc::clone(writer);
                    tokio::spawn(async move {
                        while let Some(event) = receiver.recv().await {
                            write_event(&writer, event_to_json(&event)).await;
                        }
                    })
                };
                let outcome = run.completed().await;
                // Drain buffered events before the terminal frame.
                let _ = forwarder.await;
                respond(writer, outcome, |summary| json!(summary)).await;
            }
            Request::DebugserverStart { bundle_id } => {
                respond(
                    writer,
                    executor.debugserver_start(&bundle_id).await,
                    |info| {
                        json!({
                            "pid": info.pid,
                            "port": info.port,
                            "attach-commands": info.attach_commands,
                        })
                    },
                )
                .await;
            }
            Request::DebugserverStatus => {
                let status = executor.debugserver_status().map(|info| {
                    json!({
                        "pid": info.pid,
                        "port": info.port,
                        "attach-commands": info.attach_commands,
                    })
                });
                write_ok(writer, json!(status)).await;
            }
            Request::DebugserverStop => {
                respond(writer, executor.debugserver_stop().await, unit).await;
            }
            Request::TailCompanionLogs => {
                let (consumer, _handle) = self.make_byte_streamer(writer);
                self.serve_tail(executor.tail_companion_logs(consumer), reader, writer)
                    .await;
            }
            Request::DiagnosticInformation => {
                respond(
                    writer,
                    executor.diagnostic_information().await,
                    |info| json!(info),
                )
                .await;
            }
            Request::CrashList { query } => {
                respond(writer, executor.crash_list(query).await, |logs| {
                    json!(logs)
                })
                .await;
            }
            Request::CrashShow { query } => {
                respond(writer, executor.crash_show(query).await, |log| {
                    json!(log)
                })
                .await;
            }
            Request::CrashDelete { query } => {
                respond(writer, executor.crash_delete(query).await, |logs| {
                    json!(logs)
                })
                .await;
            }
            Request::DapServer { dap_path } => {
                let (consumer, _handle) = self.make_byte_streamer(writer);
                let (sender, receiver) = mpsc::channel(16);
                let operation = executor.dap_server(dap_path, receiver, consumer);
                let process = match operation.awaited().await.into_result() {
                    Ok(process) => process,
                    Err(error) => {
                        write_error(writer, &error).await;
                        return;
                    }
                };
                if let Err(error) = pump_chunks(reader, sender).await {
                    write_error(writer, &error).await;
                    return;
                }
                respond(
                    writer,
                    process
                        .run_until_completion(vec![0], std::time::Duration::from_secs(2))
                        .await
                        .map(|_| ()),
                    unit,
                )
                .await;
            }
            Request::Clean => {
                respond(writer, executor.clean().await, unit).await;
            }
        }
    }

    /// A data consumer streaming `{"status":"event","event":{"data": hex}}`
    /// frames to the client.
    fn make_byte_streamer(
        &self,
        writer: &SharedWriter,
    ) -> (Arc<dyn DataConsumer>, tokio::task::JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Bytes>();
        let writer = Arc::clone(writer);
        let handle = tokio::spawn(async move {
            while let Some(chunk) = receiver.recv().await {
                write_event(&writer, json!({"data": hex::encode(&chunk)})).await;
            }
        });
        (Arc::new(ChannelConsumer { sender }), handle)
    }

    /// Runs a tail: streams data frames until the client sends anything (or
    /// disconnects), then cancels the inner operation.
    async fn serve_tail(
        &self,
        outer: companion_runner::operation::Operation<
            companion_runner::operation::Operation<()>,
        >,
        reader: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: &SharedWriter,
    ) {
        let inner = match outer.awaited().await.into_result() {
            Ok(inner) => inner,
            Err(error) => {
                write_error(writer, &error).await;
                return;
            }
        };
        // Any further client input, or EOF, ends the tail.
        let _ = reader.next_line().await;
        inner.cancel().awaited().await.into_result().ok();
        write_ok(writer, json!(null)).await;
    }
}

fn unit(_: ()) -> JsonValue {
    json!(null)
}

async fn respond<T>(
    writer: &SharedWriter,
    result: companion_runner::errors::CompanionResult<T>,
    into_json: impl FnOnce(T) -> JsonValue,
) {
    match result {
        Ok(value) => write_ok(writer, into_json(value)).await,
        Err(error) => write_error(writer, &error).await,
    }
}

/// Forwards hex chunk frames from the client into a byte channel until the
/// end frame arrives.
async fn pump_chunks(
    reader: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    sender: mpsc::Sender<Bytes>,
) -> Result<(), CompanionError> {
    loop {
        let line = reader
            .next_line()
            .await
            .map_err(|error| CompanionError::io("reading chunk frame", error))?;
        let Some(line) = line else {
            return Err(CompanionError::Protocol(
                "stream ended before its end frame".to_owned(),
            ));
        };
        let frame: ChunkFrame = serde_json::from_str(&line).map_err(|error| {
            CompanionError::Protocol(format!("unparseable chunk frame: {error}"))
        })?;
        if frame.end {
            return Ok(());
        }
        let Some(chunk) = frame.chunk else {
            return Err(CompanionError::Protocol(
                "chunk frame carries neither bytes nor an end marker".to_owned(),
            ));
        };
        let bytes = hex::decode(&chunk).map_err(|error| {
            CompanionError::Protocol(format!("chunk frame is not valid hex: {error}"))
        })?;
        if sender.send(Bytes::from(bytes)).await.is_err() {
            // The consumer failed; surface its error via the operation.
            return Ok(());
        }
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::ListApps { .. } => "list-apps",
        Request::InstallAppFilePath { .. } => "install-app-file-path",
        Request::InstallXctestFilePath { .. } => "install-xctest-file-path",
        Request::InstallDylibFilePath { .. } => "install-dylib-file-path",
        Request::InstallFrameworkFilePath { .. } => "install-framework-file-path",
        Request::InstallDsymFilePath { .. } => "install-dsym-file-path",
        Request::InstallStream { .. } => "install-stream",
        Request::LaunchApp { .. } => "launch-app",
        Request::KillApp { .. } => "kill-app",
        Request::UninstallApp { .. } => "uninstall-app",
        Request::PushFiles { .. } => "push-files",
        Request::PushFileFromTar { .. } => "push-file-from-tar",
        Request::PullFile { .. } => "pull-file",
        Request::PullFilePath { .. } => "pull-file-path",
        Request::MovePaths { .. } => "move-paths",
        Request::RemovePaths { .. } => "remove-paths",
        Request::ListPaths { .. } => "list-paths",
        Request::CreateDirectory { .. } => "create-directory",
        Request::Tail { .. } => "tail",
        Request::TakeScreenshot { .. } => "take-screenshot",
        Request::AccessibilityInfo { .. } => "accessibility-info",
        Request::AddMedia { .. } => "add-media",
        Request::Hid { .. } => "hid",
        Request::SetLocation { .. } => "set-location",
        Request::Focus => "focus",
        Request::OpenUrl { .. } => "open-url",
        Request::ClearKeychain => "clear-keychain",
        Request::Approve { .. } => "approve",
        Request::Revoke { .. } => "revoke",
        Request::ApproveDeeplink { .. } => "approve-deeplink",
        Request::RevokeDeeplink { .. } => "revoke-deeplink",
        Request::SetPreference { .. } => "set-preference",
        Request::GetPreference { .. } => "get-preference",
        Request::SetLocale { .. } => "set-locale",
        Request::GetCurrentLocale => "get-current-locale",
        Request::SetHardwareKeyboardEnabled { .. } => "set-hardware-keyboard-enabled",
        Request::SimulateMemoryWarning => "simulate-memory-warning",
        Request::SendPushNotification { .. } => "send-push-notification",
        Request::UpdateContacts => "update-contacts",
        Request::ListTestBundles => "list-test-bundles",
        Request::ListTestsInBundle { .. } => "list-tests-in-bundle",
        Request::XctestRun { .. } => "xctest-run",
        Request::DebugserverStart { .. } => "debugserver-start",
        Request::DebugserverStatus => "debugserver-status",
        Request::DebugserverStop => "debugserver-stop",
        Request::TailCompanionLogs => "tail-companion-logs",
        Request::DiagnosticInformation => "diagnostic-information",
        Request::CrashList { .. } => "crash-list",
        Request::CrashShow { .. } => "crash-show",
        Request::CrashDelete { .. } => "crash-delete",
        Request::DapServer { .. } => "dap-server",
        Request::Clean => "clean",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn requests_parse_from_wire_shapes() {
        let request: Request = serde_json::from_str(
            r#"{"method":"install-stream","kind":"app","compression":"gzip"}"#,
        )
        .unwrap();
        match request {
            Request::InstallStream { header } => {
                assert_eq!(header.kind, companion_metadata::InstallKind::App);
            }
            other => panic!("unexpected request {other:?}"),
        }

        let request: Request = serde_json::from_str(
            r#"{"method":"pull-file","path":"Documents/X","kind":"app-sandbox","bundle-id":"com.x.Sample"}"#,
        )
        .unwrap();
        match request {
            Request::PullFile { path, container } => {
                assert_eq!(path, "Documents/X");
                assert_eq!(container.kind, ContainerKind::AppSandbox);
                assert_eq!(container.bundle_id.as_deref(), Some("com.x.Sample"));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn status_codes_cover_the_taxonomy() {
        assert_eq!(status_code(ErrorKind::InvalidArgument), 3);
        assert_eq!(status_code(ErrorKind::NotFound), 5);
        assert_eq!(status_code(ErrorKind::Timeout), 4);
        assert_eq!(status_code(ErrorKind::BackendUnsupported), 12);
        assert_eq!(status_code(ErrorKind::Internal), 13);
    }

    #[test]
    fn event_serialization_is_stable() {
        let event = TestEvent::now(TestEventKind::CaseDidStart {
            class: "SuiteA".to_owned(),
            method: "testFoo".to_owned(),
        });
        let json = event_to_json(&event);
        assert_eq!(json["kind"], "test-case-did-start");
        assert_eq!(json["class"], "SuiteA");
        assert!(json["timestamp"].is_string());
    }
}
