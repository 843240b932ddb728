// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scoped temporary directories and archive-extraction contexts.
//!
//! All ephemeral filesystem state lives under one workspace root. Scoped
//! directories are handed out as [`ScopedOperation`]s whose teardown removes
//! the directory after every chained consumer has finished; ephemeral
//! directories are allowed to live for the process lifetime.
//!
//! Extraction accepts tar, gzipped tar and zstd tar, either from a file or
//! from a channel of byte chunks (the shape install streams arrive in). The
//! tar work itself runs on the blocking pool.

use crate::{
    errors::{CompanionError, CompanionResult},
    helpers,
    operation::{Operation, ScopedOperation},
};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use companion_metadata::StreamCompression;
use std::{fs, io::Read};
use tokio::sync::mpsc;

/// The receiving end of a byte-chunk stream, as produced by the install
/// boundary.
pub type ByteStream = mpsc::Receiver<Bytes>;

/// A factory for temporary directories under one root.
#[derive(Clone, Debug)]
pub struct TemporaryWorkspace {
    root: Utf8PathBuf,
}

impl TemporaryWorkspace {
    /// Opens (creating if necessary) the workspace root.
    pub fn new(root: impl Into<Utf8PathBuf>) -> CompanionResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|error| CompanionError::io_path("creating", &root, error))?;
        Ok(Self { root })
    }

    /// The workspace root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// A unique directory that is never cleaned up by the workspace; it
    /// lives until the process exits or the daemon is re-initialized.
    pub fn ephemeral_temporary_directory(&self) -> CompanionResult<Utf8PathBuf> {
        let dir = camino_tempfile::Builder::new()
            .prefix("ephemeral-")
            .tempdir_in(&self.root)
            .map_err(|error| CompanionError::io_path("creating temp dir under", &self.root, error))?;
        Ok(dir.keep())
    }

    /// A scoped directory; teardown removes it.
    pub fn with_temporary_directory(&self) -> ScopedOperation<Utf8PathBuf> {
        let root = self.root.clone();
        let setup = Operation::spawn("temporary-directory", async move {
            let dir = camino_tempfile::Builder::new()
                .prefix("scoped-")
                .tempdir_in(&root)
                .map_err(|error| {
                    CompanionError::io_path("creating temp dir under", &root, error)
                })?;
            // Lifetime is managed by the scope's teardown, not the guard.
            Ok(dir.keep())
        });
        ScopedOperation::acquire(setup, |dir, _state| async move {
            if let Err(error) = helpers::remove_recursive(&dir).await {
                tracing::warn!(%dir, %error, "failed to remove temporary directory");
            }
        })
    }

    /// Extracts a tar archive (optionally compressed) from a stream of byte
    /// chunks into a scoped directory yielding the extraction root.
    pub fn with_archive_extracted_from_stream(
        &self,
        input: ByteStream,
        compression: StreamCompression,
        override_mtime: bool,
    ) -> ScopedOperation<Utf8PathBuf> {
        self.with_temporary_directory().pend(move |dir| {
            Operation::spawn("extract-archive-stream", async move {
                let dest = dir.clone();
                helpers::run_blocking_io(move || {
                    let reader = ChannelReader::new(input);
                    extract_tar(reader, compression, &dest, override_mtime)?;
                    Ok(dest)
                })
                .await
            })
        })
    }

    /// Extracts a tar archive from a file on the host, sniffing the
    /// compression from its magic bytes.
    pub fn with_archive_extracted_from_file(
        &self,
        archive: &Utf8Path,
        override_mtime: bool,
    ) -> ScopedOperation<Utf8PathBuf> {
        let archive = archive.to_owned();
        self.with_temporary_directory().pend(move |dir| {
            Operation::spawn("extract-archive-file", async move {
                let dest = dir.clone();
                helpers::run_blocking_io(move || {
                    let compression = sniff_compression(&archive)?;
                    let file = fs::File::open(&archive).map_err(|error| {
                        CompanionError::io_path("opening archive", &archive, error)
                    })?;
                    extract_tar(file, compression, &dest, override_mtime)?;
                    Ok(dest)
                })
                .await
            })
        })
    }

    /// Decompresses a single gzipped file (not a tar) from a stream into a
    /// scoped directory, yielding the path of the decompressed file named
    /// `name`.
    pub fn with_gzip_extracted_from_stream(
        &self,
        input: ByteStream,
        name: impl Into<String>,
    ) -> ScopedOperation<Utf8PathBuf> {
        let name = name.into();
        self.with_temporary_directory().pend(move |dir| {
            Operation::spawn("extract-gzip-stream", async move {
                helpers::run_blocking_io(move || {
                    let target = dir.join(&name);
                    let mut decoder = flate2::read::GzDecoder::new(ChannelReader::new(input));
                    let mut out = fs::File::create(&target).map_err(|error| {
                        CompanionError::io_path("creating", &target, error)
                    })?;
                    std::io::copy(&mut decoder, &mut out).map_err(|error| {
                        CompanionError::Protocol(format!("gzip stream was malformed: {error}"))
                    })?;
                    Ok(target)
                })
                .await
            })
        })
    }
}

/// Given an extraction root shaped `root/<uuid>/<file>` (the layout clients
/// use to tar several artifacts into one stream), returns the flat list of
/// contained files.
pub fn files_from_subdirs(root: &Utf8Path) -> CompanionResult<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(root)
        .map_err(|error| CompanionError::io_path("listing", root, error))?;
    for entry in entries {
        let entry = entry.map_err(|error| CompanionError::io_path("listing", root, error))?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| {
                CompanionError::invalid_argument(format!("non-UTF-8 entry under `{root}`"))
            })?;
        let subdir = root.join(&name);
        if !subdir.is_dir() {
            files.push(subdir);
            continue;
        }
        for inner in fs::read_dir(&subdir)
            .map_err(|error| CompanionError::io_path("listing", &subdir, error))?
        {
            let inner =
                inner.map_err(|error| CompanionError::io_path("listing", &subdir, error))?;
            let inner_name = inner.file_name().into_string().map_err(|_| {
                CompanionError::invalid_argument(format!("non-UTF-8 entry under `{subdir}`"))
            })?;
            files.push(subdir.join(inner_name));
        }
    }
    files.sort_unstable();
    Ok(files)
}

/// Bridges an async chunk channel into a blocking `Read` for the tar codecs.
struct ChannelReader {
    receiver: ByteStream,
    current: Bytes,
}

impl ChannelReader {
    fn new(receiver: ByteStream) -> Self {
        Self {
            receiver,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.receiver.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = self.current.slice(n..);
        Ok(n)
    }
}

fn extract_tar<R: Read>(
    input: R,
    compression: StreamCompression,
    dest: &Utf8Path,
    override_mtime: bool,
) -> CompanionResult<()> {
    match compression {
        StreamCompression::None => unpack(tar::Archive::new(input), dest, override_mtime),
        StreamCompression::Gzip => unpack(
            tar::Archive::new(flate2::read::GzDecoder::new(input)),
            dest,
            override_mtime,
        ),
        StreamCompression::Zstd => {
            let decoder = zstd::Decoder::new(input).map_err(|error| {
                CompanionError::Protocol(format!("zstd stream was malformed: {error}"))
            })?;
            unpack(tar::Archive::new(decoder), dest, override_mtime)
        }
    }
}

fn unpack<R: Read>(
    mut archive: tar::Archive<R>,
    dest: &Utf8Path,
    override_mtime: bool,
) -> CompanionResult<()> {
    // With override_mtime the entries' recorded times are discarded and
    // extracted files get the current time, which Xcode-adjacent tooling
    // expects after transfer from another machine.
    archive.set_preserve_mtime(!override_mtime);
    archive.unpack(dest.as_std_path()).map_err(|error| {
        CompanionError::Protocol(format!("archive was malformed: {error}"))
    })
}

fn sniff_compression(path: &Utf8Path) -> CompanionResult<StreamCompression> {
    let mut file = fs::File::open(path)
        .map_err(|error| CompanionError::io_path("opening archive", path, error))?;
    let mut magic = [0u8; 4];
    let n = file
        .read(&mut magic)
        .map_err(|error| CompanionError::io_path("reading archive", path, error))?;
    Ok(match &magic[..n] {
        [0x1f, 0x8b, ..] => StreamCompression::Gzip,
        [0x28, 0xb5, 0x2f, 0xfd] => StreamCompression::Zstd,
        _ => StreamCompression::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationState;

    fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    async fn stream_of(data: Vec<u8>) -> ByteStream {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for chunk in data.chunks(1024) {
                if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn scoped_directory_is_removed_after_pop() {
        let root = camino_tempfile::tempdir().unwrap();
        let workspace = TemporaryWorkspace::new(root.path().join("tmp")).unwrap();

        let observed = workspace
            .with_temporary_directory()
            .pop(|dir| {
                assert!(dir.is_dir());
                Operation::done(dir)
            })
            .await
            .unwrap();
        // Teardown has completed by the time pop resolves.
        assert!(!observed.exists());
    }

    #[tokio::test]
    async fn ephemeral_directory_survives() {
        let root = camino_tempfile::tempdir().unwrap();
        let workspace = TemporaryWorkspace::new(root.path().join("tmp")).unwrap();
        let dir = workspace.ephemeral_temporary_directory().unwrap();
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn extracts_plain_tar_from_stream() {
        let root = camino_tempfile::tempdir().unwrap();
        let workspace = TemporaryWorkspace::new(root.path().join("tmp")).unwrap();

        let tarball = tar_of(&[("Sample.app/Info.plist", b"<plist/>")]);
        let stream = stream_of(tarball).await;
        let contents = workspace
            .with_archive_extracted_from_stream(stream, StreamCompression::None, false)
            .pop(|dir| {
                Operation::spawn("read", async move {
                    tokio::fs::read(dir.join("Sample.app/Info.plist"))
                        .await
                        .map_err(|error| CompanionError::io("reading extracted file", error))
                })
            })
            .await
            .unwrap();
        assert_eq!(contents, b"<plist/>");
    }

    #[tokio::test]
    async fn extracts_gzip_tar_from_file() {
        use std::io::Write;

        let root = camino_tempfile::tempdir().unwrap();
        let workspace = TemporaryWorkspace::new(root.path().join("tmp")).unwrap();

        let tarball = tar_of(&[("dir/file.txt", b"data")]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&tarball).unwrap();
        let gzipped = encoder.finish().unwrap();
        let archive_path = root.path().join("payload.tar.gz");
        fs::write(&archive_path, gzipped).unwrap();

        let exists = workspace
            .with_archive_extracted_from_file(&archive_path, true)
            .pop(|dir| Operation::done(dir.join("dir/file.txt").is_file()))
            .await
            .unwrap();
        assert!(exists);
    }

    #[tokio::test]
    async fn malformed_stream_is_a_protocol_error_and_cleans_up() {
        let root = camino_tempfile::tempdir().unwrap();
        let tmp_root = root.path().join("tmp");
        let workspace = TemporaryWorkspace::new(&tmp_root).unwrap();

        let stream = stream_of(b"certainly not a tar archive".to_vec()).await;
        let scoped =
            workspace.with_archive_extracted_from_stream(stream, StreamCompression::None, false);
        let error = scoped.pop(Operation::done).await.unwrap_err();
        assert!(matches!(error, CompanionError::Protocol(_)), "{error}");

        // The scoped directory was unwound despite the failure.
        assert_eq!(fs::read_dir(&tmp_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn gzip_single_file_extraction() {
        use std::io::Write;

        let root = camino_tempfile::tempdir().unwrap();
        let workspace = TemporaryWorkspace::new(root.path().join("tmp")).unwrap();

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"dwarf data").unwrap();
        let gzipped = encoder.finish().unwrap();
        let stream = stream_of(gzipped).await;

        let contents = workspace
            .with_gzip_extracted_from_stream(stream, "Sample.dSYM")
            .pop(|file| {
                Operation::spawn("read", async move {
                    tokio::fs::read(&file)
                        .await
                        .map_err(|error| CompanionError::io("reading extracted file", error))
                })
            })
            .await
            .unwrap();
        assert_eq!(contents, b"dwarf data");
    }

    #[test]
    fn files_from_subdirs_flattens() {
        let root = camino_tempfile::tempdir().unwrap();
        let base = root.path();
        for (slot, file) in [("a", "one.dylib"), ("b", "two.dylib")] {
            fs::create_dir_all(base.join(slot)).unwrap();
            fs::write(base.join(slot).join(file), b"x").unwrap();
        }
        let files = files_from_subdirs(base).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().unwrap())
            .collect();
        assert_eq!(names, vec!["one.dylib", "two.dylib"]);
    }

    #[tokio::test]
    async fn teardown_state_reflects_cancellation() {
        let root = camino_tempfile::tempdir().unwrap();
        let workspace = TemporaryWorkspace::new(root.path().join("tmp")).unwrap();
        let popped = workspace
            .with_temporary_directory()
            .pop(|_| Operation::<()>::cancelled());
        let outcome = popped.awaited().await;
        assert_eq!(outcome.state(), OperationState::Cancelled);
    }
}
