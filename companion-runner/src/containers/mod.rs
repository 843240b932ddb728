// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A uniform file surface over many backing stores.
//!
//! A [`FileContainer`] exposes push/pull/mkdir/mv/rm/ls/tail against one
//! logical filesystem namespace: an app's data sandbox, the media library,
//! the root filesystem, a directory on the host, or a virtual filesystem
//! assembled from several real directories. Capabilities differ per backend;
//! an unsupported operation fails with `backendUnsupported` rather than
//! being absent from the trait.
//!
//! Container paths are forward-slash and relative; absolute paths and `..`
//! traversal are rejected with `invalidArgument` on every backend.

use crate::{
    errors::{CompanionError, CompanionResult},
    helpers,
    operation::Operation,
    process::DataConsumer,
};
use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{fmt, io::SeekFrom, sync::Arc, time::Duration};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// How often a tail re-examines the file for appended bytes.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File operations against a single logical container.
#[async_trait]
pub trait FileContainer: Send + Sync + fmt::Debug {
    /// A short description of the container, for errors.
    fn description(&self) -> String;

    /// Recursively copies a host path into the container directory `dest`.
    async fn copy_from_host(&self, source: &Utf8Path, dest: &str) -> CompanionResult<()> {
        let _ = (source, dest);
        Err(self.unsupported("copy_from_host"))
    }

    /// Recursively copies a container path out to the host, returning the
    /// final host path.
    async fn copy_to_host(
        &self,
        source: &str,
        dest: &Utf8Path,
    ) -> CompanionResult<Utf8PathBuf> {
        let _ = (source, dest);
        Err(self.unsupported("copy_to_host"))
    }

    /// Creates a directory (and any missing parents) inside the container.
    async fn create_directory(&self, path: &str) -> CompanionResult<()> {
        let _ = path;
        Err(self.unsupported("create_directory"))
    }

    /// Renames a path within the container.
    async fn move_item(&self, source: &str, dest: &str) -> CompanionResult<()> {
        let _ = (source, dest);
        Err(self.unsupported("move_item"))
    }

    /// Recursively removes a path inside the container.
    async fn remove(&self, path: &str) -> CompanionResult<()> {
        let _ = path;
        Err(self.unsupported("remove"))
    }

    /// Names (not paths) of the entries of a container directory.
    async fn contents_of_directory(&self, path: &str) -> CompanionResult<Vec<String>> {
        let _ = path;
        Err(self.unsupported("contents_of_directory"))
    }

    /// Streams appends of a container file to `consumer`.
    ///
    /// The outer operation resolves, once tailing is established, with an
    /// inner operation; cancelling the inner operation stops the tail. No
    /// bytes are delivered after the cancellation resolves.
    fn tail(&self, path: &str, consumer: Arc<dyn DataConsumer>) -> Operation<Operation<()>> {
        let _ = (path, consumer);
        Operation::failed(self.unsupported("tail"))
    }

    /// Builds the `backendUnsupported` error for this container.
    fn unsupported(&self, operation: &'static str) -> CompanionError {
        CompanionError::BackendUnsupported {
            operation,
            container: self.description(),
        }
    }
}

/// Capability set of a directory-backed container.
#[derive(Clone, Copy, Debug)]
pub struct ContainerCaps {
    /// Whether mutating operations (push, mkdir, mv, rm) are allowed.
    pub write: bool,
}

impl ContainerCaps {
    /// Full read/write capabilities.
    pub fn read_write() -> Self {
        Self { write: true }
    }

    /// Read-only: pull, ls and tail only.
    pub fn read_only() -> Self {
        Self { write: false }
    }
}

/// A container backed by a directory on the host filesystem.
///
/// This is the concrete backend for host paths, app sandboxes (whose base
/// the target adapter resolves), and the device-service namespaces that the
/// platform adapter exposes as mounted directories.
#[derive(Clone)]
pub struct DirectoryContainer {
    kind: String,
    base: Utf8PathBuf,
    caps: ContainerCaps,
}

impl fmt::Debug for DirectoryContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryContainer")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .finish()
    }
}

impl DirectoryContainer {
    /// Creates a container rooted at `base`.
    pub fn new(kind: impl Into<String>, base: impl Into<Utf8PathBuf>, caps: ContainerCaps) -> Self {
        Self {
            kind: kind.into(),
            base: base.into(),
            caps,
        }
    }

    /// The backing directory.
    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    fn resolve(&self, path: &str) -> CompanionResult<Utf8PathBuf> {
        let relative = helpers::normalize_container_path(path)?;
        Ok(self.base.join(relative))
    }

    fn require_write(&self, operation: &'static str) -> CompanionResult<()> {
        if self.caps.write {
            Ok(())
        } else {
            Err(self.unsupported(operation))
        }
    }
}

#[async_trait]
impl FileContainer for DirectoryContainer {
    fn description(&self) -> String {
        format!("{} container at {}", self.kind, self.base)
    }

    async fn copy_from_host(&self, source: &Utf8Path, dest: &str) -> CompanionResult<()> {
        self.require_write("copy_from_host")?;
        if !source.exists() {
            return Err(CompanionError::path_not_found(source));
        }
        let file_name = source.file_name().ok_or_else(|| {
            CompanionError::invalid_argument(format!("`{source}` has no file name"))
        })?;
        let dest_dir = self.resolve(dest)?;
        helpers::copy_recursive(source, &dest_dir.join(file_name)).await
    }

    async fn copy_to_host(
        &self,
        source: &str,
        dest: &Utf8Path,
    ) -> CompanionResult<Utf8PathBuf> {
        let resolved = self.resolve(source)?;
        if !resolved.exists() {
            return Err(CompanionError::NotFound(format!(
                "`{source}` in {}",
                self.description()
            )));
        }
        let final_dest = if dest.is_dir() {
            let file_name = resolved.file_name().ok_or_else(|| {
                CompanionError::invalid_argument(format!("`{source}` has no file name"))
            })?;
            dest.join(file_name)
        } else {
            dest.to_owned()
        };
        helpers::copy_recursive(&resolved, &final_dest).await?;
        Ok(final_dest)
    }

    async fn create_directory(&self, path: &str) -> CompanionResult<()> {
        self.require_write("create_directory")?;
        let resolved = self.resolve(path)?;
        tokio::fs::create_dir_all(&resolved)
            .await
            .map_err(|error| CompanionError::io_path("creating", &resolved, error))
    }

    async fn move_item(&self, source: &str, dest: &str) -> CompanionResult<()> {
        self.require_write("move_item")?;
        let from = self.resolve(source)?;
        if !from.exists() {
            return Err(CompanionError::NotFound(format!(
                "`{source}` in {}",
                self.description()
            )));
        }
        let to = self.resolve(dest)?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|error| CompanionError::io_path("moving", &from, error))
    }

    async fn remove(&self, path: &str) -> CompanionResult<()> {
        self.require_write("remove")?;
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(CompanionError::NotFound(format!(
                "`{path}` in {}",
                self.description()
            )));
        }
        helpers::remove_recursive(&resolved).await
    }

    async fn contents_of_directory(&self, path: &str) -> CompanionResult<Vec<String>> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(CompanionError::NotFound(format!(
                "`{path}` in {}",
                self.description()
            )));
        }
        if !resolved.is_dir() {
            return Err(CompanionError::invalid_argument(format!(
                "`{path}` is not a directory"
            )));
        }
        let mut entries = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|error| CompanionError::io_path("listing", &resolved, error))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| CompanionError::io_path("listing", &resolved, error))?
        {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(_) => {
                    return Err(CompanionError::invalid_argument(format!(
                        "non-UTF-8 entry under `{path}`"
                    )));
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    fn tail(&self, path: &str, consumer: Arc<dyn DataConsumer>) -> Operation<Operation<()>> {
        let resolved = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(error) => return Operation::failed(error),
        };
        Operation::spawn("tail-setup", async move {
            let metadata = tokio::fs::metadata(&resolved)
                .await
                .map_err(|error| CompanionError::io_path("inspecting", &resolved, error))?;
            if !metadata.is_file() {
                return Err(CompanionError::invalid_argument(format!(
                    "`{resolved}` is not a file"
                )));
            }
            let inner = Operation::spawn("tail", async move {
                let mut file = tokio::fs::File::open(&resolved)
                    .await
                    .map_err(|error| CompanionError::io_path("opening", &resolved, error))?;
                // Start at the current end; tail delivers appends only.
                let mut position = file
                    .seek(SeekFrom::End(0))
                    .await
                    .map_err(|error| CompanionError::io_path("seeking", &resolved, error))?;
                let mut interval = tokio::time::interval(TAIL_POLL_INTERVAL);
                let mut chunk = vec![0u8; 16 * 1024];
                loop {
                    interval.tick().await;
                    let len = tokio::fs::metadata(&resolved)
                        .await
                        .map_err(|error| {
                            CompanionError::io_path("inspecting", &resolved, error)
                        })?
                        .len();
                    if len < position {
                        // Truncated underneath us; restart from the top.
                        position = file.seek(SeekFrom::Start(0)).await.map_err(|error| {
                            CompanionError::io_path("seeking", &resolved, error)
                        })?;
                    }
                    while position < len {
                        let n = file.read(&mut chunk).await.map_err(|error| {
                            CompanionError::io_path("reading", &resolved, error)
                        })?;
                        if n == 0 {
                            break;
                        }
                        position += n as u64;
                        consumer.consume(Bytes::copy_from_slice(&chunk[..n]));
                    }
                }
            });
            Ok(inner)
        })
    }
}

/// A virtual container assembled from several real directories, routed by
/// first path component.
///
/// Storage uses this to expose its sub-stores as one filesystem, e.g. for
/// pulling an installed dylib by `dylibs/<name>`.
#[derive(Clone, Debug)]
pub struct PathMappedContainer {
    mapping: IndexMap<String, Utf8PathBuf>,
}

impl PathMappedContainer {
    /// Creates the container from a first-component → base mapping.
    pub fn new(mapping: IndexMap<String, Utf8PathBuf>) -> Self {
        Self { mapping }
    }

    fn route(&self, path: &str) -> CompanionResult<(DirectoryContainer, String)> {
        let normalized = helpers::normalize_container_path(path)?;
        let mut components = normalized.components();
        let first = components
            .next()
            .ok_or_else(|| {
                CompanionError::invalid_argument(
                    "path-mapped containers require a non-empty path",
                )
            })?
            .as_str()
            .to_owned();
        let base = self.mapping.get(&first).ok_or_else(|| {
            CompanionError::NotFound(format!("`{first}` is not a mapped namespace"))
        })?;
        let rest = components.as_path().to_string();
        Ok((
            DirectoryContainer::new(
                format!("mapped:{first}"),
                base.clone(),
                ContainerCaps::read_only(),
            ),
            rest,
        ))
    }
}

#[async_trait]
impl FileContainer for PathMappedContainer {
    fn description(&self) -> String {
        format!(
            "path-mapped container over [{}]",
            self.mapping
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    async fn copy_to_host(
        &self,
        source: &str,
        dest: &Utf8Path,
    ) -> CompanionResult<Utf8PathBuf> {
        let (container, rest) = self.route(source)?;
        container.copy_to_host(&rest, dest).await
    }

    async fn contents_of_directory(&self, path: &str) -> CompanionResult<Vec<String>> {
        let normalized = helpers::normalize_container_path(path)?;
        if normalized.as_str().is_empty() {
            return Ok(self.mapping.keys().cloned().collect());
        }
        let (container, rest) = self.route(path)?;
        container.contents_of_directory(&rest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MemoryConsumer;
    use tokio::io::AsyncWriteExt;

    fn host_container(base: &Utf8Path) -> DirectoryContainer {
        DirectoryContainer::new("host-path", base, ContainerCaps::read_write())
    }

    #[tokio::test]
    async fn push_pull_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let base = dir.path().join("container");
        std::fs::create_dir_all(&base).unwrap();
        let container = host_container(&base);

        let payload = dir.path().join("blob.bin");
        std::fs::write(&payload, [0u8, 1, 2, 255, 254]).unwrap();

        container.copy_from_host(&payload, "Documents").await.unwrap();

        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let pulled = container
            .copy_to_host("Documents/blob.bin", &out_dir)
            .await
            .unwrap();
        assert_eq!(pulled, out_dir.join("blob.bin"));
        assert_eq!(std::fs::read(&pulled).unwrap(), vec![0u8, 1, 2, 255, 254]);
    }

    #[tokio::test]
    async fn mkdir_ls_rm_laws() {
        let dir = camino_tempfile::tempdir().unwrap();
        let base = dir.path().join("container");
        std::fs::create_dir_all(&base).unwrap();
        let container = host_container(&base);

        container.create_directory("a/b").await.unwrap();
        assert_eq!(
            container.contents_of_directory("a").await.unwrap(),
            vec!["b".to_owned()]
        );

        let payload = dir.path().join("x.txt");
        std::fs::write(&payload, b"X").unwrap();
        container.copy_from_host(&payload, "a/b").await.unwrap();
        container.remove("a/b/x.txt").await.unwrap();
        assert!(
            container
                .contents_of_directory("a/b")
                .await
                .unwrap()
                .is_empty()
        );

        // Removing a missing path reports not-found.
        let error = container.remove("a/b/x.txt").await.unwrap_err();
        assert!(matches!(error, CompanionError::NotFound(_)), "{error}");
    }

    #[tokio::test]
    async fn move_within_container() {
        let dir = camino_tempfile::tempdir().unwrap();
        let base = dir.path().join("container");
        std::fs::create_dir_all(&base).unwrap();
        let container = host_container(&base);

        let payload = dir.path().join("y.txt");
        std::fs::write(&payload, b"Y").unwrap();
        container.copy_from_host(&payload, "").await.unwrap();
        container.move_item("y.txt", "z.txt").await.unwrap();
        assert_eq!(
            container.contents_of_directory("").await.unwrap(),
            vec!["z.txt".to_owned()]
        );
    }

    #[tokio::test]
    async fn traversal_is_rejected_everywhere() {
        let dir = camino_tempfile::tempdir().unwrap();
        let container = host_container(dir.path());
        for op_error in [
            container.create_directory("../escape").await.unwrap_err(),
            container.remove("../escape").await.unwrap_err(),
            container
                .contents_of_directory("../escape")
                .await
                .unwrap_err(),
            container
                .copy_to_host("../escape", dir.path())
                .await
                .unwrap_err(),
        ] {
            assert!(
                matches!(op_error, CompanionError::InvalidArgument(_)),
                "{op_error}"
            );
        }
    }

    #[tokio::test]
    async fn read_only_container_rejects_writes() {
        let dir = camino_tempfile::tempdir().unwrap();
        let container =
            DirectoryContainer::new("crashes", dir.path(), ContainerCaps::read_only());
        let error = container.create_directory("sub").await.unwrap_err();
        assert!(
            matches!(error, CompanionError::BackendUnsupported { .. }),
            "{error}"
        );
        // Reads still work.
        container.contents_of_directory("").await.unwrap();
    }

    #[tokio::test]
    async fn tail_streams_appends_and_stops_on_cancel() {
        let dir = camino_tempfile::tempdir().unwrap();
        let base = dir.path().join("container");
        std::fs::create_dir_all(base.join("Documents")).unwrap();
        let log_path = base.join("Documents/app.log");
        std::fs::write(&log_path, b"old contents\n").unwrap();
        let container = host_container(&base);

        let consumer = MemoryConsumer::new();
        let inner = container
            .tail("Documents/app.log", Arc::new(consumer.clone()))
            .await
            .unwrap();

        // Append after the tail is established.
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .await
            .unwrap();
        file.write_all(b"fresh line\n").await.unwrap();
        file.flush().await.unwrap();

        // Wait for the poller to pick up the append.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while consumer.contents().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "tail never delivered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(&consumer.contents()[..], b"fresh line\n");

        inner.cancel().await.unwrap();
        let after_cancel = consumer.contents();

        // Appends after cancellation are not delivered.
        file.write_all(b"late line\n").await.unwrap();
        file.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(consumer.contents(), after_cancel);
    }

    #[tokio::test]
    async fn tail_of_directory_is_invalid() {
        let dir = camino_tempfile::tempdir().unwrap();
        let base = dir.path().join("container");
        std::fs::create_dir_all(base.join("Documents")).unwrap();
        let container = host_container(&base);
        let error = container
            .tail("Documents", Arc::new(MemoryConsumer::new()))
            .await
            .unwrap_err();
        assert!(matches!(error, CompanionError::InvalidArgument(_)), "{error}");
    }

    #[tokio::test]
    async fn path_mapped_routing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dylibs = dir.path().join("dylibs");
        std::fs::create_dir_all(&dylibs).unwrap();
        std::fs::write(dylibs.join("libX.dylib"), b"lib bytes").unwrap();

        let container = PathMappedContainer::new(IndexMap::from([(
            "dylibs".to_owned(),
            dylibs.clone(),
        )]));

        assert_eq!(
            container.contents_of_directory("").await.unwrap(),
            vec!["dylibs".to_owned()]
        );
        assert_eq!(
            container.contents_of_directory("dylibs").await.unwrap(),
            vec!["libX.dylib".to_owned()]
        );

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let pulled = container
            .copy_to_host("dylibs/libX.dylib", &out)
            .await
            .unwrap();
        assert_eq!(std::fs::read(pulled).unwrap(), b"lib bytes");

        // Writes are not part of this container's capability set.
        let error = container.create_directory("dylibs/sub").await.unwrap_err();
        assert!(
            matches!(error, CompanionError::BackendUnsupported { .. }),
            "{error}"
        );
    }
}
