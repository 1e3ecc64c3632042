// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::info;

use super::allocator;
use super::config::Config;
use super::display;
use super::io::{self, Image};
use super::patch::build;
use super::patch::toolchain::{verify_toolchain, Toolchain};
use super::patch::validate::{edit_until_valid, OneShot};
use super::patch::{HookString, PatchEntryItem, PatchSet, PatchType};
use super::reference::ReferenceIndex;
use super::scan::{Slot, Stop, Walker};
use super::{ChunkState, ChunkType};

fn open(rom: &Path, config: &Config) -> Result<Image> {
    io::read(rom, &config.profile).with_context(|| format!("could not open {rom:?}"))
}

fn save(image: &Image) -> Result<()> {
    io::save(image).context("could not save the image")
}

/// Prints the chunks stored in a ROM along with what they belong to.
pub fn list(
    write: &mut impl Write,
    rom: &Path,
    config: &Config,
    options: display::Options,
    chunk_type: Option<ChunkType>,
) -> Result<()> {
    let image = open(rom, config)?;
    let index = ReferenceIndex::build(&image);

    writeln!(
        write,
        "{:<24} {:<8} {:<32} {:>8}",
        "Reference", "Address", "Type", "Length"
    )?;
    writeln!(write)?;

    let mut walker = Walker::new(&image, image.free_region().start);
    let mut slack = 0;
    for slot in walker.by_ref() {
        let chunk = match slot {
            Slot::Chunk(chunk) => chunk,
            Slot::Slack { len, .. } => {
                slack += len;
                continue;
            }
        };
        if let ChunkState::Tombstoned(_) = chunk.state() {
            if !options.include_invalidated {
                continue;
            }
        }
        if chunk_type.is_some_and(|t| t != chunk.state().original_type()) {
            continue;
        }
        writeln!(
            write,
            "{:<24} {}",
            index.get(chunk.address()).to_string(),
            display::RomDisplayable::wrap(&chunk, options.clone())
        )?;
    }

    writeln!(write)?;
    let end = match walker.stop() {
        Some(Stop::EndOfFreeSpace(address)) => format!("free space ends at {address:08X}"),
        Some(Stop::ImageEnd(address)) => format!("image ends at {address:08X}"),
        None => return Ok(()),
    };
    writeln!(write, "{end}, {slack:#x} bytes unused")?;
    Ok(())
}

/// Prints the patch list stored in a ROM.
pub fn patches(write: &mut impl Write, rom: &Path, config: &Config) -> Result<()> {
    let image = open(rom, config)?;
    let set = PatchSet::load(&image).context("could not read the patch list")?;
    if set.entries.is_empty() {
        writeln!(write, "no patches")?;
        return Ok(());
    }
    write!(write, "{set}")?;
    Ok(())
}

/// A patch described on the command line.
#[derive(Clone, Debug, Default)]
pub struct NewPatch {
    pub file: PathBuf,
    pub patch_type: Option<PatchType>,
    pub hook_address: Option<usize>,
    pub thumb_mode: bool,
    pub hook_string: Option<HookString>,
    pub description: String,
}

impl NewPatch {
    fn entry(&self) -> Result<PatchEntryItem> {
        let patch_type = match self.patch_type {
            Some(t) => t,
            None => PatchType::from_path(&self.file)
                .ok_or_else(|| anyhow!("cannot tell the type of {:?}; pass --type", self.file))?,
        };
        let hook_address = u32::try_from(self.hook_address.unwrap_or(0))
            .context("hook address does not fit in 32 bits")?;

        // sources are found relative to the working directory, then stored relative to the ROM
        let file = if self.file.is_absolute() {
            self.file.clone()
        } else {
            env::current_dir()?.join(&self.file)
        };

        Ok(PatchEntryItem {
            file_name: file.to_string_lossy().into_owned(),
            patch_type,
            hook_address,
            hook_string: self
                .hook_string
                .clone()
                .unwrap_or_else(|| HookString::default_for(hook_address, self.thumb_mode)),
            thumb_mode: self.thumb_mode,
            description: self.description.clone(),
            ..Default::default()
        })
    }
}

/// Adds a patch to a ROM, rebuilding every patch it holds.
pub fn patch_add(
    write: &mut impl Write,
    rom: &Path,
    config: &Config,
    patch: &NewPatch,
    toolchain: &mut impl Toolchain,
) -> Result<()> {
    let mut image = open(rom, config)?;
    let set = PatchSet::load(&image).context("could not read the patch list")?;

    let Some(entry) = edit_until_valid(&image, &set.entries, &mut OneShot::new(patch.entry()?))
        .with_context(|| format!("{:?} was rejected", patch.file))?
    else {
        bail!("no patch given");
    };

    let mut working = set.entries.clone();
    working.push(entry);
    let updated = build::apply(&mut image, &set, &working, toolchain)?;
    save(&image)?;

    if let Some(entry) = updated.entries.last() {
        info!("added {}", entry.file_name);
        writeln!(
            write,
            "added {} at {:08X}",
            entry.file_name, entry.patch_address
        )?;
    }
    Ok(())
}

/// Removes a patch from a ROM, restoring the bytes its hook replaced.
pub fn patch_remove(
    write: &mut impl Write,
    rom: &Path,
    config: &Config,
    file: &str,
) -> Result<()> {
    let mut image = open(rom, config)?;
    let set = PatchSet::load(&image).context("could not read the patch list")?;
    if set.get(file).is_none() {
        bail!("no patch is built from {file:?}");
    }
    build::remove(&mut image, &set, file)?;
    save(&image)?;
    writeln!(write, "removed {file}")?;
    Ok(())
}

/// Rebuilds every patch in a ROM from its sources.
pub fn patch_rebuild(
    write: &mut impl Write,
    rom: &Path,
    config: &Config,
    toolchain: &mut impl Toolchain,
) -> Result<()> {
    let mut image = open(rom, config)?;
    let set = PatchSet::load(&image).context("could not read the patch list")?;
    let updated = build::apply(&mut image, &set, &set.entries, toolchain)?;
    save(&image)?;
    writeln!(write, "rebuilt {} patches", updated.entries.len())?;
    Ok(())
}

/// Invalidates the chunk at `address`.
pub fn invalidate(
    write: &mut impl Write,
    rom: &Path,
    config: &Config,
    address: usize,
) -> Result<()> {
    let mut image = open(rom, config)?;
    allocator::invalidate(&mut image, address)?;
    save(&image)?;
    writeln!(write, "invalidated {address:08X}")?;
    Ok(())
}

/// Checks that the toolchain is installed.
pub fn toolchain(write: &mut impl Write, config: &Config) -> Result<()> {
    let dir = config
        .toolchain_dir()
        .context("no toolchain directory; pass --toolchain-dir or set $DEVKITARM")?;
    verify_toolchain(&dir)?;
    writeln!(write, "toolchain found in {}", dir.display())?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_patch_entry() {
        let patch = NewPatch {
            file: PathBuf::from("/work/patches/hook.c"),
            hook_address: Some(0x1234),
            thumb_mode: true,
            ..Default::default()
        };
        let entry = patch.entry().expect("entry");
        assert_eq!(entry.patch_type, PatchType::C);
        assert_eq!(entry.hook_address, 0x1234);
        assert_eq!(entry.hook_string.to_string(), "00480047P");
        assert_eq!(entry.file_name, "/work/patches/hook.c");

        let stub = NewPatch {
            file: PathBuf::from("/work/lib.bin"),
            ..Default::default()
        };
        let entry = stub.entry().expect("stub");
        assert!(entry.is_stub());
        assert!(entry.hook_string.is_empty());

        let unknown = NewPatch {
            file: PathBuf::from("/work/README"),
            ..Default::default()
        };
        assert!(unknown.entry().is_err());
    }
}
