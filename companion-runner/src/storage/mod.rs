// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk storage for ingested artifacts.
//!
//! A storage root holds five sub-stores:
//!
//! ```text
//! <root>/apps/<bundle-id>/<Bundle.app>       bundle-keyed
//! <root>/xctests/<bundle-id>/<Bundle.xctest> bundle-keyed
//! <root>/dylibs/<name>                       name-keyed
//! <root>/frameworks/<bundle-id>/<bundle>     bundle-keyed
//! <root>/dsyms/<uuid>/<name>                 UUID-keyed; versions coexist
//! ```
//!
//! Bundle-keyed stores hold at most one live artifact per identifier;
//! re-ingest replaces the previous tree. Every mutating ingest writes into a
//! sibling staging directory and renames into place, so a partially-written
//! artifact is never observable. Ingests serialize per sub-store on that
//! store's queue; distinct stores ingest concurrently.

mod bundle;
mod macho;

pub use bundle::BundleDescriptor;

use crate::{
    errors::{CompanionError, CompanionResult},
    helpers,
    operation::{Operation, SerialQueue},
};
use camino::{Utf8Path, Utf8PathBuf};
use companion_metadata::InstalledArtifactInfo;
use indexmap::IndexMap;
use std::{collections::BTreeSet, fs, sync::Arc};
use uuid::Uuid;

/// Sub-store folder for applications.
pub const APPS_FOLDER: &str = "apps";
/// Sub-store folder for test bundles.
pub const XCTESTS_FOLDER: &str = "xctests";
/// Sub-store folder for dynamic libraries.
pub const DYLIBS_FOLDER: &str = "dylibs";
/// Sub-store folder for frameworks.
pub const FRAMEWORKS_FOLDER: &str = "frameworks";
/// Sub-store folder for debug symbols.
pub const DSYMS_FOLDER: &str = "dsyms";

const STAGING_PREFIX: &str = ".staging-";

/// A bundle or file that storage has persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstalledArtifact {
    /// The logical name of the artifact.
    pub name: String,
    /// The content UUID, if one was extracted.
    pub uuid: Option<Uuid>,
    /// The absolute on-disk path.
    pub path: Utf8PathBuf,
}

impl InstalledArtifact {
    /// The wire form of this artifact.
    pub fn to_info(&self) -> InstalledArtifactInfo {
        InstalledArtifactInfo {
            name: self.name.clone(),
            uuid: self.uuid,
            path: self.path.clone(),
        }
    }
}

/// The codesign collaborator invoked on xctest ingest.
pub trait Codesigner: Send + Sync {
    /// Re-signs the bundle at `path`.
    fn sign(&self, path: &Utf8Path) -> Operation<()>;
}

/// A codesigner that does nothing; used on simulator targets and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCodesigner;

impl Codesigner for NoopCodesigner {
    fn sign(&self, _path: &Utf8Path) -> Operation<()> {
        Operation::done(())
    }
}

/// A bundle-keyed sub-store.
#[derive(Clone)]
struct BundleStore {
    base: Utf8PathBuf,
    target_archs: BTreeSet<String>,
    queue: SerialQueue,
}

impl BundleStore {
    fn new(
        base: Utf8PathBuf,
        target_archs: BTreeSet<String>,
        queue_name: &str,
    ) -> CompanionResult<Self> {
        create_store_dir(&base)?;
        Ok(Self {
            base,
            target_archs,
            queue: SerialQueue::new(queue_name),
        })
    }

    /// Verifies architectures and replaces any previous artifact with the
    /// same identifier.
    fn save_bundle(&self, src: Utf8PathBuf) -> Operation<InstalledArtifact> {
        let base = self.base.clone();
        let target_archs = self.target_archs.clone();
        self.queue.enqueue("save-bundle", async move {
            let descriptor = BundleDescriptor::parse(&src)?;
            descriptor.check_architectures(&target_archs)?;
            let staging = base.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
            let staged = staging.join(descriptor.file_name());
            helpers::copy_recursive(&src, &staged).await?;

            let dest_dir = base.join(&descriptor.identifier);
            helpers::remove_recursive(&dest_dir).await?;
            rename(&staging, &dest_dir).await?;
            tracing::info!(
                bundle_id = %descriptor.identifier,
                path = %dest_dir,
                "persisted bundle"
            );
            Ok(InstalledArtifact {
                name: descriptor.name.clone(),
                uuid: descriptor.content_uuid,
                path: dest_dir.join(descriptor.file_name()),
            })
        })
    }

    /// Ingests an arbitrary directory tree under `key`, without bundle
    /// metadata parsing. Used for `.xctestrun` trees.
    fn save_tree(
        &self,
        src: Utf8PathBuf,
        key: String,
        artifact_name: String,
    ) -> Operation<InstalledArtifact> {
        let base = self.base.clone();
        self.queue.enqueue("save-tree", async move {
            let staging = base.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
            helpers::copy_recursive(&src, &staging).await?;
            let dest_dir = base.join(&key);
            helpers::remove_recursive(&dest_dir).await?;
            rename(&staging, &dest_dir).await?;
            Ok(InstalledArtifact {
                name: artifact_name,
                uuid: None,
                path: dest_dir,
            })
        })
    }

    /// Identifiers of every persisted artifact.
    fn persisted_ids(&self) -> CompanionResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in list_dir(&self.base)? {
            if !entry.starts_with(STAGING_PREFIX) {
                ids.push(entry);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Identifier → descriptor for every parseable persisted bundle.
    fn persisted_bundles(&self) -> CompanionResult<IndexMap<String, BundleDescriptor>> {
        let mut bundles = IndexMap::new();
        for id in self.persisted_ids()? {
            let id_dir = self.base.join(&id);
            let Some(bundle_path) = first_child(&id_dir)? else {
                continue;
            };
            match BundleDescriptor::parse(&bundle_path) {
                Ok(descriptor) => {
                    bundles.insert(id, descriptor);
                }
                Err(error) => {
                    // xctestrun trees and other raw ingests live alongside
                    // real bundles; they are listed by id but carry no
                    // parseable metadata.
                    tracing::debug!(%id, %error, "skipping unparseable store entry");
                }
            }
        }
        Ok(bundles)
    }

    fn delete(&self, identifier: &str) -> Operation<bool> {
        let dest_dir = self.base.join(identifier);
        self.queue.enqueue("delete", async move {
            let existed = dest_dir.exists();
            helpers::remove_recursive(&dest_dir).await?;
            Ok(existed)
        })
    }

    fn clean(&self) -> Operation<()> {
        let base = self.base.clone();
        self.queue.enqueue("clean", async move { clean_dir(&base).await })
    }
}

/// A name-keyed sub-store for single files.
#[derive(Clone)]
struct FileStore {
    base: Utf8PathBuf,
    queue: SerialQueue,
}

impl FileStore {
    fn new(base: Utf8PathBuf, queue_name: &str) -> CompanionResult<Self> {
        create_store_dir(&base)?;
        Ok(Self {
            base,
            queue: SerialQueue::new(queue_name),
        })
    }

    fn save_file(&self, src: Utf8PathBuf) -> Operation<InstalledArtifact> {
        let base = self.base.clone();
        self.queue.enqueue("save-file", async move {
            let name = src
                .file_name()
                .ok_or_else(|| {
                    CompanionError::invalid_argument(format!("`{src}` has no file name"))
                })?
                .to_owned();
            let staging = base.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
            helpers::copy_recursive(&src, &staging).await?;
            let dest = base.join(&name);
            helpers::remove_recursive(&dest).await?;
            rename(&staging, &dest).await?;
            let uuid = macho::inspect(&dest)?.and_then(|info| info.uuid);
            Ok(InstalledArtifact {
                name,
                uuid,
                path: dest,
            })
        })
    }

    fn persisted_names(&self) -> CompanionResult<Vec<String>> {
        let mut names: Vec<_> = list_dir(&self.base)?
            .into_iter()
            .filter(|name| !name.starts_with(STAGING_PREFIX))
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    fn clean(&self) -> Operation<()> {
        let base = self.base.clone();
        self.queue.enqueue("clean", async move { clean_dir(&base).await })
    }
}

/// A UUID-keyed sub-store; each ingest mints a fresh slot so versions
/// coexist until cleaned.
#[derive(Clone)]
struct UniqueStore {
    base: Utf8PathBuf,
    queue: SerialQueue,
}

impl UniqueStore {
    fn new(base: Utf8PathBuf, queue_name: &str) -> CompanionResult<Self> {
        create_store_dir(&base)?;
        Ok(Self {
            base,
            queue: SerialQueue::new(queue_name),
        })
    }

    /// Copies `src` into a freshly-minted UUID slot. With `link_to`, the
    /// slot is nested under the linked bundle's identifier so the dSYM set
    /// can be located from the bundle it belongs to.
    fn save_file_in_unique_path(
        &self,
        src: Utf8PathBuf,
        link_to: Option<String>,
    ) -> Operation<InstalledArtifact> {
        let base = self.base.clone();
        self.queue.enqueue("save-unique", async move {
            let name = src
                .file_name()
                .ok_or_else(|| {
                    CompanionError::invalid_argument(format!("`{src}` has no file name"))
                })?
                .to_owned();
            let slot = Uuid::new_v4();
            let slot_dir = match &link_to {
                Some(bundle_id) => base.join(bundle_id).join(slot.to_string()),
                None => base.join(slot.to_string()),
            };
            let staging = base.join(format!("{STAGING_PREFIX}{slot}"));
            helpers::copy_recursive(&src, &staging.join(&name)).await?;
            if let Some(parent) = slot_dir.parent() {
                fs::create_dir_all(parent)
                    .map_err(|error| CompanionError::io_path("creating", parent, error))?;
            }
            rename(&staging, &slot_dir).await?;
            let path = slot_dir.join(&name);
            Ok(InstalledArtifact {
                name,
                uuid: Some(slot),
                path,
            })
        })
    }

    /// Every persisted slot, newest-insertion order not guaranteed.
    fn persisted_slots(&self) -> CompanionResult<Vec<Utf8PathBuf>> {
        let mut slots = Vec::new();
        for entry in list_dir(&self.base)? {
            if entry.starts_with(STAGING_PREFIX) {
                continue;
            }
            let entry_path = self.base.join(&entry);
            if entry.parse::<Uuid>().is_ok() {
                slots.push(entry_path);
            } else {
                // A link_to nesting level; its children are slots.
                for nested in list_dir(&entry_path)? {
                    slots.push(entry_path.join(nested));
                }
            }
        }
        slots.sort_unstable();
        Ok(slots)
    }

    fn clean(&self) -> Operation<()> {
        let base = self.base.clone();
        self.queue.enqueue("clean", async move { clean_dir(&base).await })
    }
}

/// Single source of truth for all artifacts ingested for one target.
#[derive(Clone)]
pub struct StorageManager {
    root: Utf8PathBuf,
    apps: BundleStore,
    xctests: BundleStore,
    frameworks: BundleStore,
    dylibs: FileStore,
    dsyms: UniqueStore,
    codesigner: Arc<dyn Codesigner>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("root", &self.root)
            .finish()
    }
}

impl StorageManager {
    /// Opens (creating if necessary) the storage root.
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        target_archs: BTreeSet<String>,
        codesigner: Arc<dyn Codesigner>,
    ) -> CompanionResult<Self> {
        let root = root.into();
        Ok(Self {
            apps: BundleStore::new(
                root.join(APPS_FOLDER),
                target_archs.clone(),
                "storage-apps",
            )?,
            xctests: BundleStore::new(
                root.join(XCTESTS_FOLDER),
                target_archs.clone(),
                "storage-xctests",
            )?,
            frameworks: BundleStore::new(
                root.join(FRAMEWORKS_FOLDER),
                target_archs,
                "storage-frameworks",
            )?,
            dylibs: FileStore::new(root.join(DYLIBS_FOLDER), "storage-dylibs")?,
            dsyms: UniqueStore::new(root.join(DSYMS_FOLDER), "storage-dsyms")?,
            codesigner,
            root,
        })
    }

    /// The storage root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Ingests an `.app` bundle.
    pub fn save_app_bundle(&self, src: &Utf8Path) -> Operation<InstalledArtifact> {
        self.apps.save_bundle(src.to_owned())
    }

    /// Ingests a `.framework` bundle.
    pub fn save_framework(&self, src: &Utf8Path) -> Operation<InstalledArtifact> {
        self.frameworks.save_bundle(src.to_owned())
    }

    /// Ingests an `.xctest` bundle, re-signing it first unless
    /// `skip_signing`.
    pub fn save_xctest_bundle(
        &self,
        src: &Utf8Path,
        skip_signing: bool,
    ) -> Operation<InstalledArtifact> {
        let sign = if skip_signing {
            Operation::done(())
        } else {
            self.codesigner.sign(src)
        };
        let store = self.xctests.clone();
        let src = src.to_owned();
        sign.and_then(move |()| store.save_bundle(src))
    }

    /// Ingests a single dylib.
    pub fn save_dylib(&self, src: &Utf8Path) -> Operation<InstalledArtifact> {
        self.dylibs.save_file(src.to_owned())
    }

    /// Ingests a dSYM (file or bundle) into a fresh UUID slot.
    pub fn save_dsym(
        &self,
        src: &Utf8Path,
        link_to: Option<String>,
    ) -> Operation<InstalledArtifact> {
        self.dsyms.save_file_in_unique_path(src.to_owned(), link_to)
    }

    /// Scans `dir` for an `.xctest` bundle or an `.xctestrun` file and
    /// dispatches accordingly.
    pub fn save_bundle_or_test_run_from_directory(
        &self,
        dir: &Utf8Path,
        skip_signing: bool,
    ) -> Operation<InstalledArtifact> {
        let entries = match scan_for_test_payload(dir) {
            Ok(found) => found,
            Err(error) => return Operation::failed(error),
        };
        match entries {
            TestPayload::XcTestBundle(bundle) => self.save_xctest_bundle(&bundle, skip_signing),
            TestPayload::XcTestRun { file, root } => {
                let key = file.file_stem().unwrap_or("xctestrun").to_owned();
                self.xctests.save_tree(root, key.clone(), key)
            }
        }
    }

    /// Bundle identifiers persisted in the app store.
    pub fn persisted_app_ids(&self) -> CompanionResult<Vec<String>> {
        self.apps.persisted_ids()
    }

    /// Identifier → descriptor for persisted apps.
    pub fn persisted_apps(&self) -> CompanionResult<IndexMap<String, BundleDescriptor>> {
        self.apps.persisted_bundles()
    }

    /// Bundle identifiers persisted in the test store.
    pub fn persisted_test_bundle_ids(&self) -> CompanionResult<Vec<String>> {
        self.xctests.persisted_ids()
    }

    /// Descriptors for every persisted, parseable test bundle.
    pub fn list_test_descriptors(&self) -> CompanionResult<Vec<BundleDescriptor>> {
        Ok(self
            .xctests
            .persisted_bundles()?
            .into_iter()
            .map(|(_, descriptor)| descriptor)
            .collect())
    }

    /// The descriptor for one installed test bundle.
    pub fn test_descriptor_with_id(&self, bundle_id: &str) -> CompanionResult<BundleDescriptor> {
        self.xctests
            .persisted_bundles()?
            .shift_remove(bundle_id)
            .ok_or_else(|| {
                CompanionError::NotFound(format!("test bundle `{bundle_id}` is not installed"))
            })
    }

    /// Names of persisted dylibs.
    pub fn persisted_dylib_names(&self) -> CompanionResult<Vec<String>> {
        self.dylibs.persisted_names()
    }

    /// Paths of persisted dSYM slots.
    pub fn persisted_dsym_slots(&self) -> CompanionResult<Vec<Utf8PathBuf>> {
        self.dsyms.persisted_slots()
    }

    /// A mapping of artifact name → on-disk path across every sub-store,
    /// used to rewrite launch arguments.
    pub fn replacement_mapping(&self) -> CompanionResult<IndexMap<String, Utf8PathBuf>> {
        let mut mapping = IndexMap::new();
        for (id, descriptor) in self.apps.persisted_bundles()? {
            mapping.insert(id, descriptor.path);
        }
        for (id, descriptor) in self.xctests.persisted_bundles()? {
            mapping.insert(id, descriptor.path);
        }
        for (id, descriptor) in self.frameworks.persisted_bundles()? {
            mapping.insert(id, descriptor.path);
        }
        for name in self.dylibs.persisted_names()? {
            let path = self.dylibs.base.join(&name);
            mapping.insert(name, path);
        }
        Ok(mapping)
    }

    /// Rewrites `$(name)` tokens in launch arguments to storage-resolved
    /// paths, leaving unknown tokens untouched.
    pub fn interpolate_arguments(&self, args: &[String]) -> CompanionResult<Vec<String>> {
        let mapping = self.replacement_mapping()?;
        Ok(args
            .iter()
            .map(|arg| {
                let mut rewritten = arg.clone();
                for (name, path) in &mapping {
                    let token = format!("$({name})");
                    if rewritten.contains(&token) {
                        rewritten = rewritten.replace(&token, path.as_str());
                    }
                }
                rewritten
            })
            .collect())
    }

    /// First-path-component → base-directory mapping that exposes the
    /// sub-stores as one virtual filesystem.
    pub fn container_mapping(&self) -> IndexMap<String, Utf8PathBuf> {
        IndexMap::from([
            (APPS_FOLDER.to_owned(), self.apps.base.clone()),
            (XCTESTS_FOLDER.to_owned(), self.xctests.base.clone()),
            (DYLIBS_FOLDER.to_owned(), self.dylibs.base.clone()),
            (FRAMEWORKS_FOLDER.to_owned(), self.frameworks.base.clone()),
            (DSYMS_FOLDER.to_owned(), self.dsyms.base.clone()),
        ])
    }

    /// Removes every artifact from every sub-store, leaving the empty store
    /// directories in place.
    pub fn clean(&self) -> Operation<()> {
        Operation::all(vec![
            self.apps.clean(),
            self.xctests.clean(),
            self.frameworks.clean(),
            self.dylibs.clean(),
            self.dsyms.clean(),
        ])
        .map_replace(())
    }
}

enum TestPayload {
    XcTestBundle(Utf8PathBuf),
    XcTestRun { file: Utf8PathBuf, root: Utf8PathBuf },
}

fn scan_for_test_payload(dir: &Utf8Path) -> CompanionResult<TestPayload> {
    let mut xctest = None;
    let mut xctestrun = None;
    for name in list_dir(dir)? {
        let path = dir.join(&name);
        match path.extension() {
            Some("xctest") if path.is_dir() => xctest = Some(path),
            Some("xctestrun") if path.is_file() => xctestrun = Some(path),
            _ => {}
        }
    }
    // An .xctestrun file describes the whole directory layout, so it wins
    // over a bare bundle when both are present.
    if let Some(file) = xctestrun {
        return Ok(TestPayload::XcTestRun {
            file,
            root: dir.to_owned(),
        });
    }
    if let Some(bundle) = xctest {
        return Ok(TestPayload::XcTestBundle(bundle));
    }
    Err(CompanionError::invalid_argument(format!(
        "`{dir}` contains neither an .xctest bundle nor an .xctestrun file"
    )))
}

fn create_store_dir(base: &Utf8Path) -> CompanionResult<()> {
    fs::create_dir_all(base).map_err(|error| CompanionError::io_path("creating", base, error))
}

async fn clean_dir(base: &Utf8Path) -> CompanionResult<()> {
    helpers::remove_recursive(base).await?;
    create_store_dir(base)
}

async fn rename(from: &Utf8Path, to: &Utf8Path) -> CompanionResult<()> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|error| CompanionError::io_path("renaming into place", from, error))
}

fn list_dir(base: &Utf8Path) -> CompanionResult<Vec<String>> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(error) => return Err(CompanionError::io_path("listing", base, error)),
    };
    for entry in entries {
        let entry = entry.map_err(|error| CompanionError::io_path("listing", base, error))?;
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(_) => {
                return Err(CompanionError::invalid_argument(format!(
                    "non-UTF-8 entry under `{base}`"
                )));
            }
        }
    }
    Ok(names)
}

fn first_child(dir: &Utf8Path) -> CompanionResult<Option<Utf8PathBuf>> {
    Ok(list_dir(dir)?.into_iter().next().map(|name| dir.join(name)))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Bundle fixtures shared with target/executor/testing tests.

    use super::{bundle::test_fixtures, macho::test_fixtures as macho_fixtures};
    use camino::{Utf8Path, Utf8PathBuf};

    /// Writes a minimal arm64 `.app` bundle and returns its path.
    pub(crate) fn write_sample_app(
        dir: &Utf8Path,
        name: &str,
        identifier: &str,
    ) -> Utf8PathBuf {
        test_fixtures::write_app_bundle(dir, name, identifier, macho_fixtures::ARM64, None)
    }

    /// Writes a minimal arm64 `.xctest` bundle and returns its path.
    pub(crate) fn write_sample_xctest(
        dir: &Utf8Path,
        name: &str,
        identifier: &str,
    ) -> Utf8PathBuf {
        test_fixtures::write_xctest_bundle(dir, name, identifier, macho_fixtures::ARM64)
    }

    /// A minimal x86_64-only Mach-O executable, for incompatibility tests.
    pub(crate) fn x86_64_binary() -> Vec<u8> {
        macho_fixtures::thin_binary(macho_fixtures::X86_64, None)
    }
}

#[cfg(test)]
mod tests {
    use super::{bundle::test_fixtures::*, macho::test_fixtures::*, *};
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    fn manager_for(root: &Utf8Path, archs: BTreeSet<String>) -> StorageManager {
        StorageManager::new(root, archs, Arc::new(NoopCodesigner)).unwrap()
    }

    #[tokio::test]
    async fn save_bundle_then_replace_keeps_one_artifact() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");
        let manager = manager_for(&root, btreeset! {"arm64".to_owned()});

        let bundle = write_app_bundle(dir.path(), "Sample", "com.x.Sample", ARM64, None);
        let first = manager.save_app_bundle(&bundle).await.unwrap();
        assert_eq!(first.name, "Sample");
        assert_eq!(first.path, root.join("apps/com.x.Sample/Sample.app"));
        assert!(first.path.is_dir());

        // Re-ingest replaces, leaving exactly one live artifact.
        let second = manager.save_app_bundle(&bundle).await.unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(
            manager.persisted_app_ids().unwrap(),
            vec!["com.x.Sample".to_owned()]
        );
        let persisted = manager.persisted_apps().unwrap();
        assert_eq!(persisted["com.x.Sample"].path, first.path);
    }

    #[tokio::test]
    async fn incompatible_architecture_leaves_store_untouched() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");
        let manager = manager_for(&root, btreeset! {"arm64".to_owned()});

        let bundle = write_app_bundle(dir.path(), "Intel", "com.x.Intel", X86_64, None);
        let error = manager.save_app_bundle(&bundle).await.unwrap_err();
        assert!(
            matches!(error, CompanionError::IncompatibleArchitecture { .. }),
            "{error}"
        );
        assert!(manager.persisted_app_ids().unwrap().is_empty());
        // No staging residue either.
        assert_eq!(list_dir(&root.join(APPS_FOLDER)).unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn unique_dsym_slots_coexist() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = manager_for(&dir.path().join("storage"), BTreeSet::new());

        let dsym = dir.path().join("Sample.dSYM");
        std::fs::create_dir_all(&dsym).unwrap();
        std::fs::write(dsym.join("payload"), b"symbols").unwrap();

        let first = manager.save_dsym(&dsym, None).await.unwrap();
        let second = manager.save_dsym(&dsym, None).await.unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(manager.persisted_dsym_slots().unwrap().len(), 2);

        manager.clean().await.unwrap();
        assert!(manager.persisted_dsym_slots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clean_empties_every_store_but_keeps_directories() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");
        let manager = manager_for(&root, BTreeSet::new());

        let bundle = write_app_bundle(dir.path(), "Sample", "com.x.Sample", ARM64, None);
        manager.save_app_bundle(&bundle).await.unwrap();
        let dylib = dir.path().join("libInject.dylib");
        std::fs::write(&dylib, thin_binary(ARM64, None)).unwrap();
        manager.save_dylib(&dylib).await.unwrap();

        manager.clean().await.unwrap();
        assert!(manager.persisted_app_ids().unwrap().is_empty());
        assert!(manager.persisted_dylib_names().unwrap().is_empty());
        for folder in [APPS_FOLDER, XCTESTS_FOLDER, DYLIBS_FOLDER, FRAMEWORKS_FOLDER, DSYMS_FOLDER]
        {
            assert!(root.join(folder).is_dir(), "{folder} should survive clean");
        }
    }

    #[tokio::test]
    async fn xctest_ingest_and_lookup() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = manager_for(&dir.path().join("storage"), btreeset! {"arm64".to_owned()});

        let bundle = write_xctest_bundle(dir.path(), "SampleTests", "com.x.SampleTests", ARM64);
        let artifact = manager.save_xctest_bundle(&bundle, false).await.unwrap();
        assert_eq!(artifact.name, "SampleTests");

        let descriptor = manager.test_descriptor_with_id("com.x.SampleTests").unwrap();
        assert_eq!(descriptor.identifier, "com.x.SampleTests");
        assert!(manager.test_descriptor_with_id("com.x.Missing").is_err());

        let listed = manager.list_test_descriptors().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn xctestrun_directory_dispatch() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = manager_for(&dir.path().join("storage"), BTreeSet::new());

        let payload = dir.path().join("payload");
        std::fs::create_dir_all(&payload).unwrap();
        std::fs::write(payload.join("UITests.xctestrun"), b"<plist/>").unwrap();

        let artifact = manager
            .save_bundle_or_test_run_from_directory(&payload, true)
            .await
            .unwrap();
        assert_eq!(artifact.name, "UITests");
        assert!(artifact.path.join("UITests.xctestrun").is_file());
    }

    #[tokio::test]
    async fn argument_interpolation() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = manager_for(&dir.path().join("storage"), BTreeSet::new());

        let dylib = dir.path().join("libShimulator.dylib");
        std::fs::write(&dylib, b"not really a dylib").unwrap();
        let artifact = manager.save_dylib(&dylib).await.unwrap();

        let args = vec![
            "DYLD_INSERT_LIBRARIES=$(libShimulator.dylib)".to_owned(),
            "--verbose".to_owned(),
        ];
        let rewritten = manager.interpolate_arguments(&args).unwrap();
        assert_eq!(
            rewritten[0],
            format!("DYLD_INSERT_LIBRARIES={}", artifact.path)
        );
        assert_eq!(rewritten[1], "--verbose");
    }
}
