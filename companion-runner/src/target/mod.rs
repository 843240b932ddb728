// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The capability-typed handle to one iOS target.
//!
//! A [`Target`] owns the serial work queue that all mutating operations
//! against the device or simulator go through, and delegates the actual
//! platform work to a [`PlatformAdapter`]. The adapter is the §6 collaborator
//! boundary: the core never knows whether the backend is a simulator, a
//! physical device, or the [`LoopbackAdapter`](loopback::LoopbackAdapter)
//! used in development and tests.

pub mod loopback;

use crate::{
    containers::FileContainer,
    errors::{CompanionError, CompanionResult},
    operation::{Operation, SerialQueue},
    process::ProcessBuilder,
};
use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use companion_metadata::{
    ContainerKind, CrashLogInfo, CrashLogQuery, HidEvent, ImageFormat, InstalledAppInfo,
};
use serde_json::Value as JsonValue;
use std::{
    collections::BTreeMap,
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex},
};

/// The lifecycle state of a target.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TargetState {
    /// Powered off.
    Shutdown,
    /// Boot is in progress.
    Booting,
    /// Fully booted and accepting work.
    Booted,
    /// Shutdown is in progress.
    ShuttingDown,
    /// An external event invalidated our knowledge; re-query to recover.
    Unknown,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetState::Shutdown => "shutdown",
            TargetState::Booting => "booting",
            TargetState::Booted => "booted",
            TargetState::ShuttingDown => "shutting-down",
            TargetState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Static and dynamic facts about a target.
#[derive(Clone, Debug)]
pub struct TargetDescription {
    /// The unique device identifier.
    pub udid: String,
    /// The user-visible device name.
    pub name: String,
    /// The hardware model, e.g. `iPhone 15`.
    pub model: String,
    /// The OS version string.
    pub os_version: String,
    /// The architectures the target executes.
    pub architectures: BTreeSet<String>,
    /// The state at query time.
    pub state: TargetState,
}

/// A request to launch an app on the target.
#[derive(Clone, Debug, Default)]
pub struct AppLaunchConfig {
    /// The bundle id to launch.
    pub bundle_id: String,
    /// Environment for the app process.
    pub environment: BTreeMap<String, String>,
    /// Arguments for the app process.
    pub arguments: Vec<String>,
    /// Whether the app should wait for a debugger after launch.
    pub wait_for_debugger: bool,
    /// Whether to terminate a running instance first.
    pub override_running: bool,
}

/// A preference write against a settings domain.
#[derive(Clone, Debug)]
pub struct PreferenceUpdate {
    /// The preference name.
    pub name: String,
    /// The serialized value.
    pub value: String,
    /// The value's type (`string`, `bool`, `int`, …), when the domain needs
    /// disambiguation.
    pub value_type: Option<String>,
    /// The preferences domain; the global domain when absent.
    pub domain: Option<String>,
}

/// A running debugserver, ready for a debugger to attach.
#[derive(Clone, Debug)]
pub struct DebugServerInfo {
    /// The pid of the debugserver process.
    pub pid: u32,
    /// The port the debugserver listens on.
    pub port: u16,
    /// The lldb `process connect` commands a client can use.
    pub attach_commands: Vec<String>,
}

/// The platform capability surface the core consumes.
///
/// Implementations cover the subset their platform supports; the defaults
/// fail with `backendUnsupported` so capability probing is uniform across
/// simulators, devices and the loopback backend.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// A short description of the backing platform, for errors.
    fn description(&self) -> String;

    /// Queries the target's current description, including state.
    async fn query_description(&self) -> CompanionResult<TargetDescription>;

    /// Boots the target. Resolves when the target is fully booted.
    async fn boot(&self) -> CompanionResult<()> {
        Err(self.unsupported("boot"))
    }

    /// Shuts the target down.
    async fn shutdown(&self) -> CompanionResult<()> {
        Err(self.unsupported("shutdown"))
    }

    /// Installs an app bundle onto the target proper.
    async fn install_app(&self, path: &Utf8Path) -> CompanionResult<()>;

    /// Uninstalls an app from the target.
    async fn uninstall_app(&self, bundle_id: &str) -> CompanionResult<()>;

    /// Lists installed applications, optionally with process state.
    async fn list_apps(
        &self,
        fetch_process_state: bool,
    ) -> CompanionResult<Vec<InstalledAppInfo>>;

    /// Launches an app, returning its pid.
    async fn launch_app(&self, config: &AppLaunchConfig) -> CompanionResult<u32>;

    /// Terminates a running app.
    async fn kill_app(&self, bundle_id: &str) -> CompanionResult<()>;

    /// Delivers a synthetic HID event.
    async fn hid_event(&self, event: HidEvent) -> CompanionResult<()> {
        let _ = event;
        Err(self.unsupported("hid"))
    }

    /// Grants the given services to a bundle.
    async fn approve(&self, services: &[String], bundle_id: &str) -> CompanionResult<()> {
        let _ = (services, bundle_id);
        Err(self.unsupported("approve"))
    }

    /// Revokes the given services from a bundle.
    async fn revoke(&self, services: &[String], bundle_id: &str) -> CompanionResult<()> {
        let _ = (services, bundle_id);
        Err(self.unsupported("revoke"))
    }

    /// Approves a deeplink scheme for a bundle.
    async fn approve_deeplink(&self, scheme: &str, bundle_id: &str) -> CompanionResult<()> {
        let _ = (scheme, bundle_id);
        Err(self.unsupported("approve_deeplink"))
    }

    /// Revokes a deeplink scheme from a bundle.
    async fn revoke_deeplink(&self, scheme: &str, bundle_id: &str) -> CompanionResult<()> {
        let _ = (scheme, bundle_id);
        Err(self.unsupported("revoke_deeplink"))
    }

    /// Overrides the simulated location.
    async fn set_location(&self, latitude: f64, longitude: f64) -> CompanionResult<()> {
        let _ = (latitude, longitude);
        Err(self.unsupported("set_location"))
    }

    /// Toggles the hardware keyboard.
    async fn set_hardware_keyboard_enabled(&self, enabled: bool) -> CompanionResult<()> {
        let _ = enabled;
        Err(self.unsupported("set_hardware_keyboard_enabled"))
    }

    /// Sets the target's locale identifier.
    async fn set_locale(&self, locale_identifier: &str) -> CompanionResult<()> {
        let _ = locale_identifier;
        Err(self.unsupported("set_locale"))
    }

    /// The target's current locale identifier.
    async fn get_locale(&self) -> CompanionResult<String> {
        Err(self.unsupported("get_locale"))
    }

    /// Writes a preference.
    async fn set_preference(&self, update: &PreferenceUpdate) -> CompanionResult<()> {
        let _ = update;
        Err(self.unsupported("set_preference"))
    }

    /// Reads a preference value.
    async fn get_preference(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> CompanionResult<String> {
        let _ = (name, domain);
        Err(self.unsupported("get_preference"))
    }

    /// Clears the target's keychain.
    async fn clear_keychain(&self) -> CompanionResult<()> {
        Err(self.unsupported("clear_keychain"))
    }

    /// Brings the simulator window to the foreground.
    async fn focus(&self) -> CompanionResult<()> {
        Err(self.unsupported("focus"))
    }

    /// Opens a URL on the target.
    async fn open_url(&self, url: &str) -> CompanionResult<()> {
        let _ = url;
        Err(self.unsupported("open_url"))
    }

    /// Simulates a memory warning.
    async fn simulate_memory_warning(&self) -> CompanionResult<()> {
        Err(self.unsupported("simulate_memory_warning"))
    }

    /// Delivers a push notification payload to a bundle.
    async fn send_push_notification(
        &self,
        bundle_id: &str,
        payload: &str,
    ) -> CompanionResult<()> {
        let _ = (bundle_id, payload);
        Err(self.unsupported("send_push_notification"))
    }

    /// Imports media files into the camera roll.
    async fn add_media(&self, paths: &[Utf8PathBuf]) -> CompanionResult<()> {
        let _ = paths;
        Err(self.unsupported("add_media"))
    }

    /// Replaces the contacts database from an extracted directory.
    async fn update_contacts(&self, db_directory: &Utf8Path) -> CompanionResult<()> {
        let _ = db_directory;
        Err(self.unsupported("update_contacts"))
    }

    /// Takes a screenshot.
    async fn screenshot(&self, format: ImageFormat) -> CompanionResult<Bytes> {
        let _ = format;
        Err(self.unsupported("screenshot"))
    }

    /// Describes the accessibility hierarchy, optionally only the element at
    /// a point.
    async fn accessibility_info(
        &self,
        point: Option<(f64, f64)>,
        nested: bool,
    ) -> CompanionResult<JsonValue> {
        let _ = (point, nested);
        Err(self.unsupported("accessibility_info"))
    }

    /// Crash logs matching a query.
    async fn crash_list(&self, query: &CrashLogQuery) -> CompanionResult<Vec<CrashLogInfo>> {
        let _ = query;
        Err(self.unsupported("crash_list"))
    }

    /// The contents of the first crash log matching a query.
    async fn crash_show(&self, query: &CrashLogQuery) -> CompanionResult<String> {
        let _ = query;
        Err(self.unsupported("crash_show"))
    }

    /// Deletes crash logs matching a query, returning what was removed.
    async fn crash_delete(&self, query: &CrashLogQuery) -> CompanionResult<Vec<CrashLogInfo>> {
        let _ = query;
        Err(self.unsupported("crash_delete"))
    }

    /// Resolves a file container for the given namespace.
    fn container_for(
        &self,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> CompanionResult<Arc<dyn FileContainer>>;

    /// A process builder whose child executes the given test bundle and
    /// speaks the runner bus protocol on stdout.
    fn test_runner_builder(
        &self,
        bundle_path: &Utf8Path,
        host_app_path: Option<&Utf8Path>,
    ) -> CompanionResult<ProcessBuilder> {
        let _ = (bundle_path, host_app_path);
        Err(self.unsupported("test_runner_builder"))
    }

    /// Enumerates the test names a bundle contains.
    async fn list_test_names(
        &self,
        bundle_path: &Utf8Path,
        host_app_path: Option<&Utf8Path>,
    ) -> CompanionResult<Vec<String>> {
        let _ = (bundle_path, host_app_path);
        Err(self.unsupported("list_test_names"))
    }

    /// Starts a debugserver for the given installed bundle, listening on
    /// `port`.
    async fn debugserver_start(
        &self,
        bundle_id: &str,
        port: u16,
    ) -> CompanionResult<DebugServerInfo> {
        let _ = (bundle_id, port);
        Err(self.unsupported("debugserver_start"))
    }

    /// Stops the running debugserver.
    async fn debugserver_stop(&self) -> CompanionResult<()> {
        Err(self.unsupported("debugserver_stop"))
    }

    /// Builds the `backendUnsupported` error for this adapter.
    fn unsupported(&self, operation: &'static str) -> CompanionError {
        CompanionError::BackendUnsupported {
            operation,
            container: self.description(),
        }
    }
}

/// A handle to an app launched through a [`Target`].
#[derive(Clone)]
pub struct LaunchedApp {
    /// The launched bundle id.
    pub bundle_id: String,
    /// The app's pid.
    pub pid: u32,
    target: Target,
}

impl fmt::Debug for LaunchedApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedApp")
            .field("bundle_id", &self.bundle_id)
            .field("pid", &self.pid)
            .finish()
    }
}

impl LaunchedApp {
    /// Terminates the launched app.
    pub fn kill(&self) -> Operation<()> {
        self.target.kill_app(&self.bundle_id)
    }
}

/// The exclusive mediator of all operations against one target.
///
/// Mutating operations are serialized on the target's work queue; reads run
/// concurrently and may complete out of submission order.
#[derive(Clone)]
pub struct Target {
    adapter: Arc<dyn PlatformAdapter>,
    work_queue: SerialQueue,
    state: Arc<Mutex<TargetState>>,
    debugserver: Arc<Mutex<Option<DebugServerInfo>>>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("adapter", &self.adapter.description())
            .field("state", &self.state())
            .finish()
    }
}

impl Target {
    /// Wraps an adapter in a target handle with its own work queue.
    pub fn new(adapter: Arc<dyn PlatformAdapter>, initial_state: TargetState) -> Self {
        Self {
            adapter,
            work_queue: SerialQueue::new("target-work"),
            state: Arc::new(Mutex::new(initial_state)),
            debugserver: Arc::new(Mutex::new(None)),
        }
    }

    /// The underlying platform adapter.
    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.adapter
    }

    /// The last-known state.
    pub fn state(&self) -> TargetState {
        *self.state.lock().expect("target state poisoned")
    }

    /// Marks the state as unknown; the next [`refresh`](Self::refresh)
    /// recovers it. Called when an external event invalidates our view.
    pub fn invalidate_state(&self) {
        self.set_state(TargetState::Unknown);
    }

    fn set_state(&self, state: TargetState) {
        *self.state.lock().expect("target state poisoned") = state;
    }

    /// Re-queries the target description and state.
    pub fn refresh(&self) -> Operation<TargetDescription> {
        let adapter = Arc::clone(&self.adapter);
        let state = Arc::clone(&self.state);
        Operation::spawn("target-refresh", async move {
            let description = adapter.query_description().await?;
            *state.lock().expect("target state poisoned") = description.state;
            Ok(description)
        })
    }

    fn require_state(&self, required: TargetState) -> CompanionResult<()> {
        let actual = self.state();
        if actual == required {
            Ok(())
        } else {
            Err(CompanionError::TargetState { required, actual })
        }
    }

    /// Boots the target; requires `shutdown`.
    pub fn boot(&self) -> Operation<()> {
        let target = self.clone();
        self.work_queue.enqueue("boot", async move {
            target.require_state(TargetState::Shutdown)?;
            target.set_state(TargetState::Booting);
            match target.adapter.boot().await {
                Ok(()) => {
                    target.set_state(TargetState::Booted);
                    Ok(())
                }
                Err(error) => {
                    target.set_state(TargetState::Unknown);
                    Err(error)
                }
            }
        })
    }

    /// Shuts the target down; requires `booted`.
    pub fn shutdown(&self) -> Operation<()> {
        let target = self.clone();
        self.work_queue.enqueue("shutdown", async move {
            target.require_state(TargetState::Booted)?;
            target.set_state(TargetState::ShuttingDown);
            match target.adapter.shutdown().await {
                Ok(()) => {
                    target.set_state(TargetState::Shutdown);
                    Ok(())
                }
                Err(error) => {
                    target.set_state(TargetState::Unknown);
                    Err(error)
                }
            }
        })
    }

    /// Installs an app bundle onto the target.
    pub fn install_app(&self, path: &Utf8Path) -> Operation<()> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_owned();
        self.work_queue
            .enqueue("install-app", async move { adapter.install_app(&path).await })
    }

    /// Uninstalls an app from the target.
    pub fn uninstall_app(&self, bundle_id: &str) -> Operation<()> {
        let adapter = Arc::clone(&self.adapter);
        let bundle_id = bundle_id.to_owned();
        self.work_queue.enqueue("uninstall-app", async move {
            adapter.uninstall_app(&bundle_id).await
        })
    }

    /// Lists installed apps. A read; runs off the work queue.
    pub fn list_apps(&self, fetch_process_state: bool) -> Operation<Vec<InstalledAppInfo>> {
        let adapter = Arc::clone(&self.adapter);
        Operation::spawn("list-apps", async move {
            adapter.list_apps(fetch_process_state).await
        })
    }

    /// Launches an app and returns a handle that can kill it.
    pub fn launch_app(&self, config: AppLaunchConfig) -> Operation<LaunchedApp> {
        let target = self.clone();
        self.work_queue.enqueue("launch-app", async move {
            let pid = target.adapter.launch_app(&config).await?;
            Ok(LaunchedApp {
                bundle_id: config.bundle_id,
                pid,
                target: target.clone(),
            })
        })
    }

    /// Terminates a running app.
    pub fn kill_app(&self, bundle_id: &str) -> Operation<()> {
        let adapter = Arc::clone(&self.adapter);
        let bundle_id = bundle_id.to_owned();
        self.work_queue
            .enqueue("kill-app", async move { adapter.kill_app(&bundle_id).await })
    }

    /// Delivers a synthetic HID event; requires `booted`.
    pub fn hid(&self, event: HidEvent) -> Operation<()> {
        let target = self.clone();
        self.work_queue.enqueue("hid", async move {
            target.require_state(TargetState::Booted)?;
            target.adapter.hid_event(event).await
        })
    }

    /// Takes a screenshot. A read; runs off the work queue.
    pub fn screenshot(&self, format: ImageFormat) -> Operation<Bytes> {
        let adapter = Arc::clone(&self.adapter);
        Operation::spawn("screenshot", async move { adapter.screenshot(format).await })
    }

    /// Describes the accessibility hierarchy.
    pub fn accessibility_info(
        &self,
        point: Option<(f64, f64)>,
        nested: bool,
    ) -> Operation<JsonValue> {
        let adapter = Arc::clone(&self.adapter);
        Operation::spawn("accessibility-info", async move {
            adapter.accessibility_info(point, nested).await
        })
    }

    /// Runs a settings mutation on the work queue.
    pub fn settings<F, Fut>(&self, name: &'static str, f: F) -> Operation<()>
    where
        F: FnOnce(Arc<dyn PlatformAdapter>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CompanionResult<()>> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        self.work_queue.enqueue(name, async move { f(adapter).await })
    }

    /// Crash logs matching a query.
    pub fn crash_list(&self, query: CrashLogQuery) -> Operation<Vec<CrashLogInfo>> {
        let adapter = Arc::clone(&self.adapter);
        Operation::spawn("crash-list", async move { adapter.crash_list(&query).await })
    }

    /// The contents of the first matching crash log.
    pub fn crash_show(&self, query: CrashLogQuery) -> Operation<String> {
        let adapter = Arc::clone(&self.adapter);
        Operation::spawn("crash-show", async move { adapter.crash_show(&query).await })
    }

    /// Deletes matching crash logs.
    pub fn crash_delete(&self, query: CrashLogQuery) -> Operation<Vec<CrashLogInfo>> {
        let adapter = Arc::clone(&self.adapter);
        self.work_queue.enqueue("crash-delete", async move {
            adapter.crash_delete(&query).await
        })
    }

    /// Spawns a process against the target. Spawning is a mutation of the
    /// target's process table, so it goes through the work queue; the
    /// returned handle's lifecycle operations do not.
    pub fn spawn(&self, builder: ProcessBuilder) -> Operation<crate::process::Process> {
        self.work_queue.enqueue("spawn", async move {
            builder.start().awaited().await.into_result()
        })
    }

    /// Resolves a file container for a namespace.
    pub fn container_for(
        &self,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> CompanionResult<Arc<dyn FileContainer>> {
        self.adapter.container_for(kind, bundle_id)
    }

    /// Starts a debugserver for an installed bundle on the given port; one
    /// at a time.
    pub fn debugserver_start(&self, bundle_id: &str, port: u16) -> Operation<DebugServerInfo> {
        let target = self.clone();
        let bundle_id = bundle_id.to_owned();
        self.work_queue.enqueue("debugserver-start", async move {
            {
                let running = target
                    .debugserver
                    .lock()
                    .expect("debugserver lock poisoned");
                if running.is_some() {
                    return Err(CompanionError::AlreadyExists(
                        "a debugserver is already running".to_owned(),
                    ));
                }
            }
            let info = target.adapter.debugserver_start(&bundle_id, port).await?;
            *target
                .debugserver
                .lock()
                .expect("debugserver lock poisoned") = Some(info.clone());
            Ok(info)
        })
    }

    /// The running debugserver, if any.
    pub fn debugserver_status(&self) -> Option<DebugServerInfo> {
        self.debugserver
            .lock()
            .expect("debugserver lock poisoned")
            .clone()
    }

    /// Stops the running debugserver.
    pub fn debugserver_stop(&self) -> Operation<()> {
        let target = self.clone();
        self.work_queue.enqueue("debugserver-stop", async move {
            if target
                .debugserver
                .lock()
                .expect("debugserver lock poisoned")
                .take()
                .is_none()
            {
                return Err(CompanionError::NotFound(
                    "no debugserver is running".to_owned(),
                ));
            }
            target.adapter.debugserver_stop().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{loopback::LoopbackAdapter, *};

    fn booted_target() -> (Target, camino_tempfile::Utf8TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = LoopbackAdapter::new(dir.path().to_owned());
        (
            Target::new(Arc::new(adapter), TargetState::Booted),
            dir,
        )
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = LoopbackAdapter::new(dir.path().to_owned());
        let target = Target::new(Arc::new(adapter), TargetState::Shutdown);

        target.boot().await.unwrap();
        assert_eq!(target.state(), TargetState::Booted);

        // Booting a booted target is a state error.
        let error = target.boot().await.unwrap_err();
        assert!(matches!(error, CompanionError::TargetState { .. }), "{error}");

        target.shutdown().await.unwrap();
        assert_eq!(target.state(), TargetState::Shutdown);
    }

    #[tokio::test]
    async fn unknown_state_recovers_by_refresh() {
        let (target, _dir) = booted_target();
        target.invalidate_state();
        assert_eq!(target.state(), TargetState::Unknown);
        let description = target.refresh().await.unwrap();
        assert_eq!(description.state, TargetState::Booted);
        assert_eq!(target.state(), TargetState::Booted);
    }

    #[tokio::test]
    async fn launch_and_kill_app() {
        let (target, _dir) = booted_target();
        let bundle_dir = camino_tempfile::tempdir().unwrap();
        let bundle = crate::storage::test_support::write_sample_app(
            bundle_dir.path(),
            "Sample",
            "com.x.Sample",
        );
        target.adapter().install_app(&bundle).await.unwrap();

        let launched = target
            .launch_app(AppLaunchConfig {
                bundle_id: "com.x.Sample".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(launched.pid > 0);

        let apps = target.list_apps(true).await.unwrap();
        let entry = apps.iter().find(|a| a.bundle_id == "com.x.Sample").unwrap();
        assert_eq!(entry.pid, Some(launched.pid));

        launched.kill().await.unwrap();
        let apps = target.list_apps(true).await.unwrap();
        let entry = apps.iter().find(|a| a.bundle_id == "com.x.Sample").unwrap();
        assert_eq!(entry.pid, None);
    }

    #[tokio::test]
    async fn hid_requires_booted() {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = LoopbackAdapter::new(dir.path().to_owned());
        let target = Target::new(Arc::new(adapter), TargetState::Shutdown);
        let error = target
            .hid(HidEvent::Tap { x: 1.0, y: 1.0 })
            .await
            .unwrap_err();
        assert!(matches!(error, CompanionError::TargetState { .. }), "{error}");
    }

    #[tokio::test]
    async fn debugserver_lifecycle() {
        let (target, _dir) = booted_target();
        assert!(target.debugserver_status().is_none());
        let info = target.debugserver_start("com.x.Sample", 10881).await.unwrap();
        assert!(info.pid > 0);
        // The server listens where the configuration said it would.
        assert_eq!(info.port, 10881);
        assert!(
            info.attach_commands
                .iter()
                .any(|command| command.contains(":10881"))
        );
        assert!(target.debugserver_status().is_some());

        // A second start is rejected while one is running.
        let error = target
            .debugserver_start("com.x.Other", 10881)
            .await
            .unwrap_err();
        assert!(matches!(error, CompanionError::AlreadyExists(_)), "{error}");

        target.debugserver_stop().await.unwrap();
        assert!(target.debugserver_status().is_none());
    }
}
