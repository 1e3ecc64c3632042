// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Turning a working set of patch entries into stored code and written hooks.
//!
//! Building is batched by stage across the whole set: every C file is compiled, then every
//! assembly file is assembled, then every object is extracted. Nothing is written to the image
//! until every stage has succeeded, and the writes themselves happen on a copy of the image that
//! only replaces the original once all of them succeed.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::toolchain::Toolchain;
use super::validate::{image_root, validate_set};
use super::{list, PatchEntryItem, PatchSet, PatchType};
use crate::allocator::{allocate, invalidate, replace};
use crate::io::Image;
use crate::{decode_header, ChunkType, Error, Result};

/// A validated entry and the machine code it produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltPatch {
    pub entry: PatchEntryItem,
    pub code: Vec<u8>,
}

/// The files one entry passes through on its way to machine code.
#[derive(Debug)]
struct Job {
    source: PathBuf,
    patch_type: PatchType,
    thumb_mode: bool,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl Job {
    /// The assembler's input: the compiler's output for C, the source itself for assembly.
    fn assembly(&self) -> PathBuf {
        match self.patch_type {
            PatchType::C => with_suffix(&self.source, ".s"),
            _ => self.source.clone(),
        }
    }

    fn object(&self) -> PathBuf {
        with_suffix(&self.source, ".o")
    }

    /// Where the finished machine code is read from.
    fn binary(&self) -> PathBuf {
        match self.patch_type {
            PatchType::Binary => self.source.clone(),
            _ => with_suffix(&self.source, ".bin"),
        }
    }
}

/// Validates `entries` and produces machine code for each of them.
///
/// The toolchain is only consulted when some entry needs it, and only after every entry has
/// passed validation.
pub fn build(
    image: &Image,
    entries: &[PatchEntryItem],
    toolchain: &mut impl Toolchain,
) -> Result<Vec<BuiltPatch>> {
    let entries = validate_set(image, entries)?;
    let root = image_root(image)?;
    let jobs: Vec<Job> = entries
        .iter()
        .map(|e| Job {
            source: root.join(&e.file_name),
            patch_type: e.patch_type,
            thumb_mode: e.thumb_mode,
        })
        .collect();

    if jobs.iter().any(|j| j.patch_type != PatchType::Binary) {
        toolchain.verify()?;
    }

    for job in jobs.iter().filter(|j| j.patch_type == PatchType::C) {
        toolchain.compile(&job.source, &job.assembly(), job.thumb_mode)?;
    }
    for job in jobs.iter().filter(|j| j.patch_type != PatchType::Binary) {
        toolchain.assemble(&job.assembly(), &job.object(), job.thumb_mode)?;
    }
    for job in jobs.iter().filter(|j| j.patch_type != PatchType::Binary) {
        toolchain.extract(&job.object(), &job.binary())?;
    }

    let mut built = Vec::with_capacity(entries.len());
    for (entry, job) in entries.into_iter().zip(jobs) {
        let binary = job.binary();
        let code = fs::read(&binary).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(binary.clone()),
            _ => Error::Io(e),
        })?;
        debug!("{} is {:#x} bytes", entry.file_name, code.len());
        built.push(BuiltPatch { entry, code });
    }
    Ok(built)
}

/// Invalidates the chunk an entry's code was stored in, if it is still a patch.
fn retire_patch_chunk(image: &mut Image, entry: &PatchEntryItem) -> Result<()> {
    if entry.patch_address == 0 {
        return Ok(());
    }
    let address = entry.patch_address as usize;
    match decode_header(image.bytes(), address) {
        Ok(header) if header.state().original_type() == ChunkType::Patch => {
            invalidate(image, address)
        }
        Ok(header) => {
            warn!(
                "{} points at a {} chunk at {address:#x}, leaving it alone",
                entry.file_name,
                header.state().original_type()
            );
            Ok(())
        }
        Err(e) => {
            warn!("{} points at {address:#x}: {e}", entry.file_name);
            Ok(())
        }
    }
}

/// Puts back the bytes an entry's hook replaced and retires its code.
fn unhook(image: &mut Image, entry: &PatchEntryItem) -> Result<()> {
    if !entry.is_stub() && !entry.substituted_bytes.is_empty() {
        debug!(
            "restoring {:#x} bytes at {:#x}",
            entry.substituted_bytes.len(),
            entry.hook_address
        );
        image.write_at(entry.hook_address as usize, &entry.substituted_bytes)?;
    }
    retire_patch_chunk(image, entry)
}

fn hook(image: &mut Image, entry: &mut PatchEntryItem) -> Result<()> {
    if entry.is_stub() {
        return Ok(());
    }
    let address = entry.hook_address as usize;
    let rendered = entry.hook_string.render(entry.destination());
    entry.substituted_bytes = image.read_at(address, rendered.len())?.to_vec();
    image.write_at(address, &rendered)?;
    info!(
        "hooked {} at {address:#x} -> {:#010x}",
        entry.file_name,
        entry.destination()
    );
    Ok(())
}

fn store_list(
    image: &mut Image,
    previous: Option<usize>,
    entries: &[PatchEntryItem],
) -> Result<usize> {
    let region = image.free_region();
    let payload = list::serialize(entries);
    match previous {
        Some(old) => replace(image, region, old, ChunkType::PatchList, &payload),
        None => allocate(image, region, ChunkType::PatchList, &payload),
    }
}

/// Replaces the patches recorded in `image` with `built`.
///
/// Every patch in `previous` is unhooked and its code retired. Each built patch is then stored
/// in a new chunk, its hook written, and the bytes it replaced recorded. Finally the patch
/// list is rewritten. On any failure `image` is left exactly as it was.
pub fn persist(
    image: &mut Image,
    previous: &PatchSet,
    built: Vec<BuiltPatch>,
) -> Result<PatchSet> {
    let mut scratch = image.clone();
    let region = scratch.free_region();

    for entry in previous.entries.iter().rev() {
        unhook(&mut scratch, entry)?;
    }

    let mut entries = Vec::with_capacity(built.len());
    for BuiltPatch { mut entry, code } in built {
        let address = allocate(&mut scratch, region, ChunkType::Patch, &code)?;
        entry.patch_address = u32::try_from(address).map_err(|_| Error::OutOfSpace {
            footprint: code.len(),
            ceiling: region.ceiling,
        })?;
        hook(&mut scratch, &mut entry)?;
        entries.push(entry);
    }

    let list_address = store_list(&mut scratch, previous.list_address, &entries)?;
    *image = scratch;
    info!("stored {} patches, list at {list_address:#x}", entries.len());
    Ok(PatchSet {
        list_address: Some(list_address),
        entries,
    })
}

/// Builds `working` and stores it in place of `previous`.
///
/// Entries of `previous` missing from `working` are removed.
pub fn apply(
    image: &mut Image,
    previous: &PatchSet,
    working: &[PatchEntryItem],
    toolchain: &mut impl Toolchain,
) -> Result<PatchSet> {
    let built = build(image, working, toolchain)?;
    persist(image, previous, built)
}

/// Removes the patch built from `file_name`: its hook is undone, its code retired, and the
/// list rewritten without it.
pub fn remove(image: &mut Image, set: &PatchSet, file_name: &str) -> Result<PatchSet> {
    let Some(entry) = set.get(file_name) else {
        return Err(Error::FileNotFound(PathBuf::from(file_name)));
    };

    let mut scratch = image.clone();
    unhook(&mut scratch, entry)?;
    let entries: Vec<PatchEntryItem> = set
        .entries
        .iter()
        .filter(|e| e.file_name != file_name)
        .cloned()
        .collect();
    let list_address = store_list(&mut scratch, set.list_address, &entries)?;
    *image = scratch;
    info!("removed {file_name}");
    Ok(PatchSet {
        list_address: Some(list_address),
        entries,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_job_paths() {
        let c = Job {
            source: PathBuf::from("/rom/patches/hook.c"),
            patch_type: PatchType::C,
            thumb_mode: true,
        };
        assert_eq!(c.assembly(), PathBuf::from("/rom/patches/hook.c.s"));
        assert_eq!(c.object(), PathBuf::from("/rom/patches/hook.c.o"));
        assert_eq!(c.binary(), PathBuf::from("/rom/patches/hook.c.bin"));

        let asm = Job {
            source: PathBuf::from("hook.s"),
            patch_type: PatchType::Assembly,
            thumb_mode: false,
        };
        assert_eq!(asm.assembly(), PathBuf::from("hook.s"));
        assert_eq!(asm.binary(), PathBuf::from("hook.s.bin"));

        let bin = Job {
            source: PathBuf::from("hook.bin"),
            patch_type: PatchType::Binary,
            thumb_mode: false,
        };
        assert_eq!(bin.binary(), PathBuf::from("hook.bin"));
    }
}
