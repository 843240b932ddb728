// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A host-directory-backed platform adapter.
//!
//! The loopback adapter plays the role of a booted simulator using nothing
//! but a directory on the host: installed apps are tracked in memory, file
//! containers are plain directories, launches hand out synthetic pids, and
//! the test runner is whatever script a test configures. It backs the
//! daemon's `--loopback` mode and the core's own test suite; a production
//! deployment provides a real simulator or device adapter instead.

use super::{
    AppLaunchConfig, DebugServerInfo, PlatformAdapter, PreferenceUpdate, TargetDescription,
    TargetState,
};
use crate::{
    containers::{ContainerCaps, DirectoryContainer, FileContainer},
    errors::{CompanionError, CompanionResult},
    process::ProcessBuilder,
    storage::BundleDescriptor,
};
use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use companion_metadata::{
    AppInstallType, ContainerKind, CrashLogInfo, CrashLogQuery, HidEvent, ImageFormat,
    InstalledAppInfo,
};
use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

/// Name of the optional manifest file a test bundle can carry to make its
/// test names enumerable by the loopback backend.
pub const TEST_MANIFEST_FILE: &str = "test-manifest.json";

#[derive(Clone, Debug)]
struct LoopbackApp {
    name: String,
    architectures: Vec<String>,
    pid: Option<u32>,
}

/// The state behind one loopback target.
pub struct LoopbackAdapter {
    root: Utf8PathBuf,
    udid: String,
    architectures: BTreeSet<String>,
    state: Mutex<TargetState>,
    apps: Mutex<IndexMap<String, LoopbackApp>>,
    next_pid: AtomicU32,
    crashes: Mutex<Vec<(CrashLogInfo, String)>>,
    invocations: Mutex<Vec<String>>,
    locale: Mutex<String>,
    preferences: Mutex<BTreeMap<(String, String), String>>,
    approvals: Mutex<BTreeSet<(String, String)>>,
    runner_script: Mutex<Option<String>>,
}

impl LoopbackAdapter {
    /// Creates an adapter rooted at `root`, presenting as a booted arm64
    /// simulator.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            udid: "loopback-0000-0000".to_owned(),
            architectures: BTreeSet::from(["arm64".to_owned()]),
            state: Mutex::new(TargetState::Booted),
            apps: Mutex::new(IndexMap::new()),
            next_pid: AtomicU32::new(1000),
            crashes: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            locale: Mutex::new("en_US".to_owned()),
            preferences: Mutex::new(BTreeMap::new()),
            approvals: Mutex::new(BTreeSet::new()),
            runner_script: Mutex::new(None),
        }
    }

    /// Overrides the advertised architecture set.
    pub fn with_architectures(mut self, architectures: BTreeSet<String>) -> Self {
        self.architectures = architectures;
        self
    }

    /// The architectures this target advertises.
    pub fn architectures(&self) -> BTreeSet<String> {
        self.architectures.clone()
    }

    /// Configures the shell script spawned as the in-target test runner.
    ///
    /// The script's stdout is decoded as the runner bus protocol.
    pub fn set_test_runner_script(&self, script: impl Into<String>) {
        *self
            .runner_script
            .lock()
            .expect("runner script lock poisoned") = Some(script.into());
    }

    /// Seeds a crash log, for diagnostics tests and development.
    pub fn push_crash_log(&self, info: CrashLogInfo, contents: impl Into<String>) {
        self.crashes
            .lock()
            .expect("crashes lock poisoned")
            .push((info, contents.into()));
    }

    /// Everything the adapter was asked to do, in order. Settings and HID
    /// calls record themselves here.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .clone()
    }

    fn record(&self, invocation: String) {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .push(invocation);
    }

    fn container_dir(&self, parts: &[&str]) -> CompanionResult<Utf8PathBuf> {
        let mut dir = self.root.clone();
        for part in parts {
            dir.push(part);
        }
        std::fs::create_dir_all(&dir)
            .map_err(|error| CompanionError::io_path("creating", &dir, error))?;
        Ok(dir)
    }

    fn matches(query: &CrashLogQuery, info: &CrashLogInfo) -> bool {
        if let Some(name) = &query.process_name
            && &info.process_name != name
        {
            return false;
        }
        if let Some(bundle_id) = &query.bundle_id
            && !info.identifier.contains(bundle_id.as_str())
        {
            return false;
        }
        if let Some(since) = &query.since
            && info.timestamp < *since
        {
            return false;
        }
        true
    }
}

#[async_trait]
impl PlatformAdapter for LoopbackAdapter {
    fn description(&self) -> String {
        format!("loopback target at {}", self.root)
    }

    async fn query_description(&self) -> CompanionResult<TargetDescription> {
        Ok(TargetDescription {
            udid: self.udid.clone(),
            name: "Loopback".to_owned(),
            model: "Loopback Simulator".to_owned(),
            os_version: "17.0".to_owned(),
            architectures: self.architectures.clone(),
            state: *self.state.lock().expect("state lock poisoned"),
        })
    }

    async fn boot(&self) -> CompanionResult<()> {
        *self.state.lock().expect("state lock poisoned") = TargetState::Booted;
        Ok(())
    }

    async fn shutdown(&self) -> CompanionResult<()> {
        *self.state.lock().expect("state lock poisoned") = TargetState::Shutdown;
        Ok(())
    }

    async fn install_app(&self, path: &Utf8Path) -> CompanionResult<()> {
        let descriptor = BundleDescriptor::parse(path)?;
        let installed_dir = self.container_dir(&["installed"])?;
        let dest = installed_dir.join(descriptor.file_name());
        crate::helpers::copy_recursive(path, &dest).await?;
        self.apps.lock().expect("apps lock poisoned").insert(
            descriptor.identifier.clone(),
            LoopbackApp {
                name: descriptor.name.clone(),
                architectures: descriptor.architectures.iter().cloned().collect(),
                pid: None,
            },
        );
        Ok(())
    }

    async fn uninstall_app(&self, bundle_id: &str) -> CompanionResult<()> {
        let removed = self
            .apps
            .lock()
            .expect("apps lock poisoned")
            .shift_remove(bundle_id);
        if removed.is_none() {
            return Err(CompanionError::NotFound(format!(
                "app `{bundle_id}` is not installed"
            )));
        }
        Ok(())
    }

    async fn list_apps(
        &self,
        fetch_process_state: bool,
    ) -> CompanionResult<Vec<InstalledAppInfo>> {
        Ok(self
            .apps
            .lock()
            .expect("apps lock poisoned")
            .iter()
            .map(|(bundle_id, app)| InstalledAppInfo {
                bundle_id: bundle_id.clone(),
                name: app.name.clone(),
                install_type: AppInstallType::User,
                architectures: app.architectures.clone(),
                pid: if fetch_process_state { app.pid } else { None },
            })
            .collect())
    }

    async fn launch_app(&self, config: &AppLaunchConfig) -> CompanionResult<u32> {
        let mut apps = self.apps.lock().expect("apps lock poisoned");
        let app = apps.get_mut(&config.bundle_id).ok_or_else(|| {
            CompanionError::NotFound(format!("app `{}` is not installed", config.bundle_id))
        })?;
        if let Some(pid) = app.pid {
            if !config.override_running {
                return Ok(pid);
            }
            app.pid = None;
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        app.pid = Some(pid);
        Ok(pid)
    }

    async fn kill_app(&self, bundle_id: &str) -> CompanionResult<()> {
        let mut apps = self.apps.lock().expect("apps lock poisoned");
        let app = apps.get_mut(bundle_id).ok_or_else(|| {
            CompanionError::NotFound(format!("app `{bundle_id}` is not installed"))
        })?;
        app.pid = None;
        Ok(())
    }

    async fn hid_event(&self, event: HidEvent) -> CompanionResult<()> {
        self.record(format!("hid:{event:?}"));
        Ok(())
    }

    async fn approve(&self, services: &[String], bundle_id: &str) -> CompanionResult<()> {
        let mut approvals = self.approvals.lock().expect("approvals lock poisoned");
        for service in services {
            approvals.insert((bundle_id.to_owned(), service.clone()));
        }
        self.record(format!("approve:{bundle_id}:{services:?}"));
        Ok(())
    }

    async fn revoke(&self, services: &[String], bundle_id: &str) -> CompanionResult<()> {
        let mut approvals = self.approvals.lock().expect("approvals lock poisoned");
        for service in services {
            approvals.remove(&(bundle_id.to_owned(), service.clone()));
        }
        self.record(format!("revoke:{bundle_id}:{services:?}"));
        Ok(())
    }

    async fn approve_deeplink(&self, scheme: &str, bundle_id: &str) -> CompanionResult<()> {
        self.record(format!("approve-deeplink:{bundle_id}:{scheme}"));
        Ok(())
    }

    async fn revoke_deeplink(&self, scheme: &str, bundle_id: &str) -> CompanionResult<()> {
        self.record(format!("revoke-deeplink:{bundle_id}:{scheme}"));
        Ok(())
    }

    async fn set_location(&self, latitude: f64, longitude: f64) -> CompanionResult<()> {
        self.record(format!("set-location:{latitude},{longitude}"));
        Ok(())
    }

    async fn set_hardware_keyboard_enabled(&self, enabled: bool) -> CompanionResult<()> {
        self.record(format!("set-hardware-keyboard:{enabled}"));
        Ok(())
    }

    async fn set_locale(&self, locale_identifier: &str) -> CompanionResult<()> {
        *self.locale.lock().expect("locale lock poisoned") = locale_identifier.to_owned();
        Ok(())
    }

    async fn get_locale(&self) -> CompanionResult<String> {
        Ok(self.locale.lock().expect("locale lock poisoned").clone())
    }

    async fn set_preference(&self, update: &PreferenceUpdate) -> CompanionResult<()> {
        let domain = update.domain.clone().unwrap_or_else(|| "global".to_owned());
        self.preferences
            .lock()
            .expect("preferences lock poisoned")
            .insert((domain, update.name.clone()), update.value.clone());
        Ok(())
    }

    async fn get_preference(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> CompanionResult<String> {
        let domain = domain.unwrap_or("global").to_owned();
        self.preferences
            .lock()
            .expect("preferences lock poisoned")
            .get(&(domain, name.to_owned()))
            .cloned()
            .ok_or_else(|| CompanionError::NotFound(format!("preference `{name}`")))
    }

    async fn clear_keychain(&self) -> CompanionResult<()> {
        self.record("clear-keychain".to_owned());
        Ok(())
    }

    async fn focus(&self) -> CompanionResult<()> {
        self.record("focus".to_owned());
        Ok(())
    }

    async fn open_url(&self, url: &str) -> CompanionResult<()> {
        self.record(format!("open-url:{url}"));
        Ok(())
    }

    async fn simulate_memory_warning(&self) -> CompanionResult<()> {
        self.record("simulate-memory-warning".to_owned());
        Ok(())
    }

    async fn send_push_notification(
        &self,
        bundle_id: &str,
        payload: &str,
    ) -> CompanionResult<()> {
        self.record(format!("push:{bundle_id}:{payload}"));
        Ok(())
    }

    async fn add_media(&self, paths: &[Utf8PathBuf]) -> CompanionResult<()> {
        let media = self.container_dir(&["containers", "media"])?;
        for path in paths {
            let name = path.file_name().ok_or_else(|| {
                CompanionError::invalid_argument(format!("`{path}` has no file name"))
            })?;
            crate::helpers::copy_recursive(path, &media.join(name)).await?;
        }
        Ok(())
    }

    async fn update_contacts(&self, db_directory: &Utf8Path) -> CompanionResult<()> {
        let contacts = self.container_dir(&["containers", "contacts"])?;
        crate::helpers::remove_recursive(&contacts).await?;
        crate::helpers::copy_recursive(db_directory, &contacts).await
    }

    async fn screenshot(&self, format: ImageFormat) -> CompanionResult<Bytes> {
        // A recognizable magic header is all the loopback can offer.
        let bytes: &[u8] = match format {
            ImageFormat::Png => &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a],
            ImageFormat::Jpeg => &[0xff, 0xd8, 0xff, 0xe0],
            ImageFormat::Bmp => &[b'B', b'M'],
        };
        Ok(Bytes::copy_from_slice(bytes))
    }

    async fn accessibility_info(
        &self,
        point: Option<(f64, f64)>,
        nested: bool,
    ) -> CompanionResult<JsonValue> {
        Ok(json!({
            "AXFrame": "{{0, 0}, {390, 844}}",
            "AXUniqueId": "loopback-root",
            "role": "Window",
            "queried_point": point.map(|(x, y)| json!({"x": x, "y": y})),
            "nested": nested,
            "children": [],
        }))
    }

    async fn crash_list(&self, query: &CrashLogQuery) -> CompanionResult<Vec<CrashLogInfo>> {
        Ok(self
            .crashes
            .lock()
            .expect("crashes lock poisoned")
            .iter()
            .filter(|(info, _)| Self::matches(query, info))
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn crash_show(&self, query: &CrashLogQuery) -> CompanionResult<String> {
        self.crashes
            .lock()
            .expect("crashes lock poisoned")
            .iter()
            .find(|(info, _)| Self::matches(query, info))
            .map(|(_, contents)| contents.clone())
            .ok_or_else(|| CompanionError::NotFound("no crash log matches".to_owned()))
    }

    async fn crash_delete(&self, query: &CrashLogQuery) -> CompanionResult<Vec<CrashLogInfo>> {
        let mut crashes = self.crashes.lock().expect("crashes lock poisoned");
        let (removed, kept): (Vec<_>, Vec<_>) = crashes
            .drain(..)
            .partition(|(info, _)| Self::matches(query, info));
        *crashes = kept;
        Ok(removed.into_iter().map(|(info, _)| info).collect())
    }

    fn container_for(
        &self,
        kind: ContainerKind,
        bundle_id: Option<&str>,
    ) -> CompanionResult<Arc<dyn FileContainer>> {
        let (dir, caps) = match kind {
            ContainerKind::AppSandbox => {
                let bundle_id = bundle_id.ok_or_else(|| {
                    CompanionError::invalid_argument(
                        "app-sandbox containers require a bundle id",
                    )
                })?;
                if !self
                    .apps
                    .lock()
                    .expect("apps lock poisoned")
                    .contains_key(bundle_id)
                {
                    return Err(CompanionError::NotFound(format!(
                        "app `{bundle_id}` is not installed"
                    )));
                }
                (
                    self.container_dir(&["sandboxes", bundle_id])?,
                    ContainerCaps::read_write(),
                )
            }
            ContainerKind::Root => (
                self.container_dir(&["rootfs"])?,
                ContainerCaps::read_write(),
            ),
            ContainerKind::Media => (
                self.container_dir(&["containers", "media"])?,
                ContainerCaps::read_write(),
            ),
            ContainerKind::Auxiliary => (
                self.container_dir(&["containers", "auxiliary"])?,
                ContainerCaps::read_write(),
            ),
            ContainerKind::ProvisioningProfiles | ContainerKind::MdmProfiles => (
                self.container_dir(&["containers", kind.as_str()])?,
                ContainerCaps::read_write(),
            ),
            // Diagnostic and system namespaces accept no writes here.
            ContainerKind::Crashes
            | ContainerKind::DiskImages
            | ContainerKind::Symbols
            | ContainerKind::SpringboardIcons
            | ContainerKind::Wallpaper => (
                self.container_dir(&["containers", kind.as_str()])?,
                ContainerCaps::read_only(),
            ),
        };
        Ok(Arc::new(DirectoryContainer::new(kind.as_str(), dir, caps)))
    }

    fn test_runner_builder(
        &self,
        bundle_path: &Utf8Path,
        host_app_path: Option<&Utf8Path>,
    ) -> CompanionResult<ProcessBuilder> {
        let script = self
            .runner_script
            .lock()
            .expect("runner script lock poisoned")
            .clone()
            .ok_or_else(|| self.unsupported("test_runner_builder"))?;
        let mut builder = ProcessBuilder::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .env("TEST_BUNDLE_PATH", bundle_path.as_str());
        if let Some(host) = host_app_path {
            builder = builder.env("TEST_HOST_PATH", host.as_str());
        }
        Ok(builder)
    }

    async fn list_test_names(
        &self,
        bundle_path: &Utf8Path,
        _host_app_path: Option<&Utf8Path>,
    ) -> CompanionResult<Vec<String>> {
        let manifest = bundle_path.join(TEST_MANIFEST_FILE);
        if !manifest.is_file() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&manifest)
            .map_err(|error| CompanionError::io_path("reading", &manifest, error))?;
        serde_json::from_str(&raw).map_err(|error| {
            CompanionError::invalid_argument(format!(
                "`{manifest}` is not a valid test manifest: {error}"
            ))
        })
    }

    async fn debugserver_start(
        &self,
        bundle_id: &str,
        port: u16,
    ) -> CompanionResult<DebugServerInfo> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.record(format!("debugserver-start:{bundle_id}:{port}"));
        Ok(DebugServerInfo {
            pid,
            port,
            attach_commands: vec![format!("process connect connect://localhost:{port}")],
        })
    }

    async fn debugserver_stop(&self) -> CompanionResult<()> {
        self.record("debugserver-stop".to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preferences_and_locale_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = LoopbackAdapter::new(dir.path().to_owned());

        adapter.set_locale("de_DE").await.unwrap();
        assert_eq!(adapter.get_locale().await.unwrap(), "de_DE");

        adapter
            .set_preference(&PreferenceUpdate {
                name: "SpeakScreen".to_owned(),
                value: "1".to_owned(),
                value_type: Some("bool".to_owned()),
                domain: Some("com.apple.Accessibility".to_owned()),
            })
            .await
            .unwrap();
        assert_eq!(
            adapter
                .get_preference("SpeakScreen", Some("com.apple.Accessibility"))
                .await
                .unwrap(),
            "1"
        );
        assert!(adapter.get_preference("Missing", None).await.is_err());
    }

    #[tokio::test]
    async fn sandbox_requires_installed_app() {
        let dir = camino_tempfile::tempdir().unwrap();
        let adapter = LoopbackAdapter::new(dir.path().to_owned());
        let error = adapter
            .container_for(ContainerKind::AppSandbox, Some("com.x.Missing"))
            .unwrap_err();
        assert!(matches!(error, CompanionError::NotFound(_)), "{error}");
    }
}
