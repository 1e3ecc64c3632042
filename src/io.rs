// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Loading, validating, and saving ROM images.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::allocator::FreeRegion;
use crate::{Error, Result};

/// Describes the ROM family an [Image] belongs to.
///
/// The [Default] profile matches the 8 MiB Wario Land 4 cartridge image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RomProfile {
    /// Images smaller than this are rejected.
    pub min_size: usize,

    /// The hard ceiling the image may grow to while allocating chunks.
    pub max_size: usize,

    /// Where [magic](RomProfile::magic) is expected.
    pub magic_offset: usize,

    /// The signature identifying the game.
    pub magic: Vec<u8>,

    /// The first byte of the region chunks may be stored in.
    pub free_space_start: usize,

    /// The value unused bytes in the free space hold.
    pub fill_byte: u8,
}

impl Default for RomProfile {
    fn default() -> Self {
        Self {
            min_size: 0x80_0000,
            max_size: 0x200_0000,
            magic_offset: 0xA0,
            magic: b"WARIOLANDE".to_vec(),
            free_space_start: 0x78_F970,
            fill_byte: 0xFF,
        }
    }
}

impl RomProfile {
    /// Checks that `bytes` is large enough and carries the expected signature.
    pub fn check(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < self.min_size {
            return Err(Error::InvalidImage(format!(
                "image is {:#x} bytes, smaller than the minimum {:#x}",
                bytes.len(),
                self.min_size
            )));
        }
        if self.free_space_start >= self.max_size {
            return Err(Error::InvalidImage(format!(
                "free space starts at {:#x}, past the maximum size {:#x}",
                self.free_space_start, self.max_size
            )));
        }
        if bytes.len() > self.max_size {
            return Err(Error::InvalidImage(format!(
                "image is {:#x} bytes, larger than the maximum {:#x}",
                bytes.len(),
                self.max_size
            )));
        }

        let end = self.magic_offset + self.magic.len();
        if bytes.get(self.magic_offset..end) != Some(self.magic.as_slice()) {
            return Err(Error::InvalidImage(format!(
                "missing signature {:?} at {:#x}",
                String::from_utf8_lossy(&self.magic),
                self.magic_offset
            )));
        }
        Ok(())
    }
}

/// An in-memory copy of a ROM image.
///
/// The image is the only way the store reads or writes ROM bytes. It has a single owner;
/// callers serialize access to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    bytes: Vec<u8>,
    profile: RomProfile,
    path: Option<PathBuf>,
}

impl Image {
    /// Wraps `bytes` after checking them against `profile`.
    pub fn new(bytes: Vec<u8>, profile: RomProfile) -> Result<Self> {
        profile.check(&bytes)?;
        Ok(Self {
            bytes,
            profile,
            path: None,
        })
    }

    /// Associates the image with the file it was loaded from and will be saved to.
    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn profile(&self) -> &RomProfile {
        &self.profile
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The directory containing the image file. Patch sources must live beneath it.
    pub fn directory(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// The region chunks may be allocated in.
    pub fn free_region(&self) -> FreeRegion {
        FreeRegion {
            start: self.profile.free_space_start,
            ceiling: self.profile.max_size,
        }
    }

    /// Borrows `len` bytes at `address`.
    pub fn read_at(&self, address: usize, len: usize) -> Result<&[u8]> {
        self.bytes
            .get(address..address + len)
            .ok_or(Error::Truncated {
                address,
                needed: len,
                available: self.bytes.len().saturating_sub(address),
            })
    }

    /// Overwrites bytes at `address`. Nothing is written unless all of `data` fits.
    pub fn write_at(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let available = self.bytes.len().saturating_sub(address);
        let Some(target) = self.bytes.get_mut(address..address + data.len()) else {
            return Err(Error::Truncated {
                address,
                needed: data.len(),
                available,
            });
        };
        target.copy_from_slice(data);
        Ok(())
    }

    /// Extends the image with fill bytes so that it is at least `len` bytes long.
    pub(crate) fn grow(&mut self, len: usize) -> Result<()> {
        if len > self.profile.max_size {
            return Err(Error::OutOfSpace {
                footprint: len - self.bytes.len(),
                ceiling: self.profile.max_size,
            });
        }
        if len > self.bytes.len() {
            debug!("growing image from {:#x} to {:#x}", self.bytes.len(), len);
            self.bytes.resize(len, self.profile.fill_byte);
        }
        Ok(())
    }
}

/// Reads the image at `path`, validating it against `profile`.
pub fn read(path: &Path, profile: &RomProfile) -> Result<Image> {
    let bytes = fs::read(path)?;
    info!("loaded {:?} ({:#x} bytes)", path, bytes.len());
    Ok(Image::new(bytes, profile.clone())?.with_path(path))
}

/// Writes the full image buffer to `write`.
pub fn write(image: &Image, write: &mut impl Write) -> Result<()> {
    write.write_all(image.bytes())?;
    write.flush()?;
    Ok(())
}

/// Writes the image back to the file it was read from.
pub fn save(image: &Image) -> Result<()> {
    let Some(path) = image.path() else {
        return Err(Error::InvalidImage("image has no file to save to".into()));
    };
    let mut file = fs::File::create(path)?;
    write(image, &mut file)?;
    info!("saved {:?} ({:#x} bytes)", path, image.len());
    Ok(())
}
