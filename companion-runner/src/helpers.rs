// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for the companion core.

use crate::errors::{CompanionError, CompanionResult};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::fs;

/// Validates a container-relative path and returns it in normalized form.
///
/// Container paths are forward-slash, relative, and may not traverse out of
/// the container root. `.` components are dropped; `..` and absolute paths
/// are rejected.
pub(crate) fn normalize_container_path(path: &str) -> CompanionResult<Utf8PathBuf> {
    let path = Utf8Path::new(path);
    if path.is_absolute() {
        return Err(CompanionError::invalid_argument(format!(
            "container path `{path}` must be relative"
        )));
    }
    let mut normalized = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::Normal(part) => normalized.push(part),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                return Err(CompanionError::invalid_argument(format!(
                    "container path `{path}` may not contain `..`"
                )));
            }
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err(CompanionError::invalid_argument(format!(
                    "container path `{path}` must be relative"
                )));
            }
        }
    }
    Ok(normalized)
}

/// Recursively copies `src` (file or directory) to `dst`.
///
/// Runs on the blocking pool; `dst` is the final path of the copy, not a
/// parent directory.
pub(crate) async fn copy_recursive(src: &Utf8Path, dst: &Utf8Path) -> CompanionResult<()> {
    let src = src.to_owned();
    let dst = dst.to_owned();
    run_blocking_io(move || copy_recursive_blocking(&src, &dst)).await
}

pub(crate) fn copy_recursive_blocking(src: &Utf8Path, dst: &Utf8Path) -> CompanionResult<()> {
    let metadata = fs::symlink_metadata(src)
        .map_err(|error| CompanionError::io_path("reading metadata of", src, error))?;
    if metadata.is_dir() {
        fs::create_dir_all(dst)
            .map_err(|error| CompanionError::io_path("creating", dst, error))?;
        for entry in
            fs::read_dir(src).map_err(|error| CompanionError::io_path("listing", src, error))?
        {
            let entry = entry.map_err(|error| CompanionError::io_path("listing", src, error))?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                CompanionError::invalid_argument(format!(
                    "non-UTF-8 file name under `{src}`"
                ))
            })?;
            copy_recursive_blocking(&src.join(name), &dst.join(name))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| CompanionError::io_path("creating", parent, error))?;
        }
        fs::copy(src, dst)
            .map_err(|error| CompanionError::io_path("copying", src, error))?;
        Ok(())
    }
}

/// Recursively removes `path`, tolerating its absence.
pub(crate) async fn remove_recursive(path: &Utf8Path) -> CompanionResult<()> {
    let path = path.to_owned();
    run_blocking_io(move || remove_recursive_blocking(&path)).await
}

pub(crate) fn remove_recursive_blocking(path: &Utf8Path) -> CompanionResult<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(CompanionError::io_path("removing", path, error)),
    }
}

/// Runs a blocking filesystem closure on tokio's blocking pool.
pub(crate) async fn run_blocking_io<T, F>(f: F) -> CompanionResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CompanionResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|error| CompanionError::Internal(format!("blocking task panicked: {error}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_traversal_and_absolute() {
        assert!(normalize_container_path("Documents/app.log").is_ok());
        assert!(normalize_container_path("./Documents").is_ok());
        assert!(normalize_container_path("../escape").is_err());
        assert!(normalize_container_path("Documents/../../etc").is_err());
        assert!(normalize_container_path("/etc/passwd").is_err());
    }

    #[test]
    fn normalize_drops_cur_dir_components() {
        assert_eq!(
            normalize_container_path("./a/./b").unwrap(),
            Utf8PathBuf::from("a/b")
        );
    }

    #[tokio::test]
    async fn copy_and_remove_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file.txt"), b"contents").unwrap();

        let dst = dir.path().join("dst");
        copy_recursive(&src, &dst).await.unwrap();
        assert_eq!(fs::read(dst.join("nested/file.txt")).unwrap(), b"contents");

        remove_recursive(&dst).await.unwrap();
        assert!(!dst.exists());
        // Removing again is fine.
        remove_recursive(&dst).await.unwrap();
    }
}
