// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal Mach-O header inspection.
//!
//! Storage needs two facts about a bundle's executable: the set of
//! architectures it was built for, and its LC_UUID. Both live in the first
//! few kilobytes of the binary; this module reads just enough of the header
//! to extract them. Unknown or non-Mach-O files yield `None` rather than an
//! error, since plenty of bundle payloads are not binaries.

use crate::errors::{CompanionError, CompanionResult};
use camino::Utf8Path;
use std::{collections::BTreeSet, fs, io::Read};
use uuid::Uuid;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const FAT_MAGIC: u32 = 0xcafe_babe;

const LC_UUID: u32 = 0x1b;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_ARM: u32 = 12;

/// How much of the file we read. Load commands sit directly after the
/// header and are well inside this window for real binaries.
const HEADER_WINDOW: usize = 64 * 1024;

/// What header inspection found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct BinaryInfo {
    /// Architecture names in target vocabulary (`arm64`, `x86_64`, …).
    pub(crate) architectures: BTreeSet<String>,
    /// The binary's LC_UUID, if one was present.
    pub(crate) uuid: Option<Uuid>,
}

/// Inspects the file at `path`. Returns `None` for non-Mach-O files.
pub(crate) fn inspect(path: &Utf8Path) -> CompanionResult<Option<BinaryInfo>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(CompanionError::io_path("opening", path, error)),
    };
    let mut buf = vec![0u8; HEADER_WINDOW];
    let mut filled = 0;
    loop {
        let n = file
            .read(&mut buf[filled..])
            .map_err(|error| CompanionError::io_path("reading", path, error))?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(inspect_bytes(&buf))
}

/// Inspects an in-memory header window.
pub(crate) fn inspect_bytes(data: &[u8]) -> Option<BinaryInfo> {
    let magic = read_u32_be(data, 0)?;
    if magic == FAT_MAGIC {
        return inspect_fat(data);
    }
    // Thin binaries are little-endian on every platform the companion
    // drives.
    let magic = read_u32_le(data, 0)?;
    if magic == MH_MAGIC || magic == MH_MAGIC_64 {
        return inspect_thin(data);
    }
    None
}

/// Fat headers are big-endian. Architectures are unioned across slices; the
/// UUID is taken from the first slice that carries one.
fn inspect_fat(data: &[u8]) -> Option<BinaryInfo> {
    let nfat_arch = read_u32_be(data, 4)?;
    // A fat header with an absurd slice count is corrupt or not Mach-O at
    // all (Java class files share the magic).
    if nfat_arch == 0 || nfat_arch > 16 {
        return None;
    }
    let mut info = BinaryInfo::default();
    for index in 0..nfat_arch as usize {
        let entry = 8 + index * 20;
        let cputype = read_u32_be(data, entry)?;
        if let Some(name) = arch_name(cputype) {
            info.architectures.insert(name.to_owned());
        }
        let offset = read_u32_be(data, entry + 8)? as usize;
        if info.uuid.is_none()
            && offset < data.len()
            && let Some(slice_info) = inspect_thin(&data[offset..])
        {
            info.uuid = slice_info.uuid;
        }
    }
    (!info.architectures.is_empty()).then_some(info)
}

fn inspect_thin(data: &[u8]) -> Option<BinaryInfo> {
    let magic = read_u32_le(data, 0)?;
    let is_64 = match magic {
        MH_MAGIC_64 => true,
        MH_MAGIC => false,
        _ => return None,
    };
    let cputype = read_u32_le(data, 4)?;
    let ncmds = read_u32_le(data, 16)?;
    let header_size = if is_64 { 32 } else { 28 };

    let mut info = BinaryInfo::default();
    if let Some(name) = arch_name(cputype) {
        info.architectures.insert(name.to_owned());
    }

    let mut cursor = header_size;
    for _ in 0..ncmds.min(1024) {
        let cmd = read_u32_le(data, cursor)?;
        let cmdsize = read_u32_le(data, cursor + 4)? as usize;
        if cmdsize < 8 {
            return None;
        }
        if cmd == LC_UUID && cmdsize >= 24 {
            let bytes: [u8; 16] = data.get(cursor + 8..cursor + 24)?.try_into().ok()?;
            info.uuid = Some(Uuid::from_bytes(bytes));
            break;
        }
        cursor += cmdsize;
    }
    (!info.architectures.is_empty()).then_some(info)
}

fn arch_name(cputype: u32) -> Option<&'static str> {
    match cputype {
        CPU_TYPE_X86 => Some("i386"),
        t if t == CPU_TYPE_X86 | CPU_ARCH_ABI64 => Some("x86_64"),
        CPU_TYPE_ARM => Some("armv7"),
        t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64 => Some("arm64"),
        _ => None,
    }
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Builders for synthetic Mach-O headers used across storage tests.

    use super::*;

    /// A minimal 64-bit thin binary with the given cputype and an optional
    /// LC_UUID command.
    pub(crate) fn thin_binary(cputype: u32, uuid: Option<Uuid>) -> Vec<u8> {
        let mut data = Vec::new();
        let ncmds: u32 = if uuid.is_some() { 1 } else { 0 };
        data.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        data.extend_from_slice(&cputype.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
        data.extend_from_slice(&2u32.to_le_bytes()); // filetype: MH_EXECUTE
        data.extend_from_slice(&ncmds.to_le_bytes());
        data.extend_from_slice(&(ncmds * 24).to_le_bytes()); // sizeofcmds
        data.extend_from_slice(&0u32.to_le_bytes()); // flags
        data.extend_from_slice(&0u32.to_le_bytes()); // reserved
        if let Some(uuid) = uuid {
            data.extend_from_slice(&LC_UUID.to_le_bytes());
            data.extend_from_slice(&24u32.to_le_bytes());
            data.extend_from_slice(uuid.as_bytes());
        }
        data
    }

    pub(crate) const X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
    pub(crate) const ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
}

#[cfg(test)]
mod tests {
    use super::{test_fixtures::*, *};

    #[test]
    fn thin_arm64_with_uuid() {
        let uuid = Uuid::new_v4();
        let data = thin_binary(ARM64, Some(uuid));
        let info = inspect_bytes(&data).expect("valid Mach-O");
        assert_eq!(
            info.architectures,
            BTreeSet::from(["arm64".to_owned()])
        );
        assert_eq!(info.uuid, Some(uuid));
    }

    #[test]
    fn thin_x86_64_without_uuid() {
        let data = thin_binary(X86_64, None);
        let info = inspect_bytes(&data).expect("valid Mach-O");
        assert_eq!(
            info.architectures,
            BTreeSet::from(["x86_64".to_owned()])
        );
        assert_eq!(info.uuid, None);
    }

    #[test]
    fn fat_binary_unions_architectures() {
        let arm = thin_binary(ARM64, None);
        let x86 = thin_binary(X86_64, None);
        // Two fat_arch entries after the 8-byte fat header.
        let arm_offset = 8 + 2 * 20;
        let x86_offset = arm_offset + arm.len();
        let mut data = Vec::new();
        data.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        for (cputype, offset, size) in [
            (ARM64, arm_offset, arm.len()),
            (X86_64, x86_offset, x86.len()),
        ] {
            data.extend_from_slice(&cputype.to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes()); // cpusubtype
            data.extend_from_slice(&(offset as u32).to_be_bytes());
            data.extend_from_slice(&(size as u32).to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes()); // align
        }
        data.extend_from_slice(&arm);
        data.extend_from_slice(&x86);

        let info = inspect_bytes(&data).expect("valid fat Mach-O");
        assert_eq!(
            info.architectures,
            BTreeSet::from(["arm64".to_owned(), "x86_64".to_owned()])
        );
    }

    #[test]
    fn non_macho_yields_none() {
        assert_eq!(inspect_bytes(b"#!/bin/sh\necho hi\n"), None);
        assert_eq!(inspect_bytes(&[]), None);
    }
}
