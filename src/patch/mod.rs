// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Code patches and the patch list that records them.
//!
//! A [PatchEntryItem] names a source file beneath the image's directory, how it is turned into
//! machine code, and where the game should jump into it. The [build](build) pipeline produces
//! the machine code, stores it as a [Patch](crate::ChunkType::Patch) chunk, and overwrites the
//! bytes at the hook address with a [HookString] that branches into the patch. The complete set
//! of entries is stored in a single [PatchList](crate::ChunkType::PatchList) chunk using the
//! [list] format.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::debug;

use crate::display::{self, DisplayWithOptions};
use crate::io::Image;
use crate::{scan, Chunk, ChunkType, Error, Result, HEADER_SIZE};

pub mod build;
pub mod list;
pub mod toolchain;
pub mod validate;

/// The base of the cartridge ROM in the GBA's address space.
pub const ROM_BUS_BASE: u32 = 0x0800_0000;

/// How a patch's file becomes machine code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PatchType {
    /// Raw machine code, stored as is.
    #[default]
    Binary = 0,

    /// Assembly source, assembled and extracted.
    Assembly = 1,

    /// C source, compiled to assembly first.
    C = 2,
}

impl PatchType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Binary),
            1 => Some(Self::Assembly),
            2 => Some(Self::C),
            _ => None,
        }
    }

    /// Guesses the type from a file's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "bin" => Some(Self::Binary),
            "s" | "asm" => Some(Self::Assembly),
            "c" => Some(Self::C),
            _ => None,
        }
    }
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Binary => "binary",
            Self::Assembly => "assembly",
            Self::C => "c",
        })
    }
}

impl FromStr for PatchType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(Self::Binary),
            "assembly" | "asm" | "s" => Ok(Self::Assembly),
            "c" => Ok(Self::C),
            _ => Err(format!("unknown patch type: {s}")),
        }
    }
}

/// The bytes written over a hook site.
///
/// A hook string may contain a single placeholder. When the hook is written the placeholder is
/// replaced with the 4-byte little endian bus address of the patch's code.
///
/// The textual form is a run of hex byte pairs with an optional `P` standing for the
/// placeholder, e.g. `00480047P` for `ldr r0, [pc, #0]; bx r0; .word patch`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookString {
    bytes: Vec<u8>,
    placeholder: Option<usize>,
}

/// `ldr r0, [pc, #0]` `bx r0`
const THUMB_TRAMPOLINE: [u8; 4] = [0x00, 0x48, 0x00, 0x47];

/// `nop` `ldr r0, [pc, #0]` `bx r0`, for hooks two bytes past a word boundary.
const THUMB_TRAMPOLINE_UNALIGNED: [u8; 6] = [0xC0, 0x46, 0x00, 0x48, 0x00, 0x47];

/// `ldr pc, [pc, #-4]`
const ARM_TRAMPOLINE: [u8; 4] = [0x04, 0xF0, 0x1F, 0xE5];

impl HookString {
    /// Creates a hook string. `placeholder`, if present, is the index in `bytes` the patch
    /// address is inserted before.
    pub fn new(bytes: Vec<u8>, placeholder: Option<usize>) -> Result<Self> {
        if let Some(index) = placeholder {
            if index > bytes.len() {
                return Err(Error::InvalidHookString(format!(
                    "placeholder at {index} is past the end of {} bytes",
                    bytes.len()
                )));
            }
        }
        Ok(Self { bytes, placeholder })
    }

    /// The hook a patch at `hook_address` gets when none is given: nothing for stubs,
    /// otherwise a trampoline that loads the patch address and jumps to it.
    ///
    /// Thumb `ldr` reads its literal from a word-aligned address, so a hook at `4n + 2` is
    /// padded with a `nop` to keep the literal where the load looks for it.
    pub fn default_for(hook_address: u32, thumb_mode: bool) -> Self {
        if hook_address == 0 {
            return Self::default();
        }
        match (thumb_mode, hook_address % 4) {
            (false, _) => Self::trampoline(&ARM_TRAMPOLINE),
            (true, 0) => Self::trampoline(&THUMB_TRAMPOLINE),
            (true, _) => Self::trampoline(&THUMB_TRAMPOLINE_UNALIGNED),
        }
    }

    fn trampoline(code: &[u8]) -> Self {
        Self {
            bytes: code.to_vec(),
            placeholder: Some(code.len()),
        }
    }

    /// Whether this is the Thumb trampoline that only works from a word-aligned hook.
    pub fn needs_word_aligned_hook(&self) -> bool {
        self.bytes == THUMB_TRAMPOLINE && self.placeholder == Some(THUMB_TRAMPOLINE.len())
    }

    /// The literal bytes, without the placeholder.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Index of the placeholder in [bytes](HookString::bytes), if any.
    pub fn placeholder(&self) -> Option<usize> {
        self.placeholder
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.placeholder.is_none()
    }

    /// How many bytes the hook overwrites.
    pub fn written_len(&self) -> usize {
        self.bytes.len() + self.placeholder.map_or(0, |_| 4)
    }

    /// The bytes to write at the hook site for a patch whose code starts at `destination`.
    pub fn render(&self, destination: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.written_len());
        match self.placeholder {
            Some(index) => {
                out.extend_from_slice(&self.bytes[..index]);
                out.extend_from_slice(&destination.to_le_bytes());
                out.extend_from_slice(&self.bytes[index..]);
            }
            None => out.extend_from_slice(&self.bytes),
        }
        out
    }
}

impl fmt::Display for HookString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if self.placeholder == Some(i) {
                f.write_str("P")?;
            }
            write!(f, "{byte:02X}")?;
        }
        if self.placeholder == Some(self.bytes.len()) {
            f.write_str("P")?;
        }
        Ok(())
    }
}

impl FromStr for HookString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        list::parse_hook_string(s)
    }
}

/// A single code patch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchEntryItem {
    /// Path to the patch's source, relative to the image's directory.
    pub file_name: String,

    pub patch_type: PatchType,

    /// Image offset of the hook site, or zero for a stub patch that is only stored.
    pub hook_address: u32,

    /// What is written at the hook site.
    pub hook_string: HookString,

    /// Whether the hook and the patch use Thumb (2-byte) or ARM (4-byte) instructions.
    pub thumb_mode: bool,

    /// Address of the chunk holding the patch's machine code, or zero before the first build.
    pub patch_address: u32,

    /// The bytes the hook replaced, restored when the patch is removed.
    pub substituted_bytes: Vec<u8>,

    pub description: String,
}

impl PatchEntryItem {
    /// A patch with no hook, kept only as stored code.
    pub fn is_stub(&self) -> bool {
        self.hook_address == 0
    }

    /// Index of the placeholder in the hook string, if the hook has one.
    pub fn patch_offset_in_hook_string(&self) -> Option<usize> {
        self.hook_string.placeholder()
    }

    /// The bus address the hook branches to: the first byte of the patch chunk's payload, with
    /// the low bit set for Thumb code.
    pub fn destination(&self) -> u32 {
        let address = ROM_BUS_BASE + self.patch_address + HEADER_SIZE as u32;
        if self.thumb_mode {
            address | 1
        } else {
            address
        }
    }
}

impl fmt::Display for PatchEntryItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_with_options(f, &display::Options::default())
    }
}

impl display::DisplayWithOptions for PatchEntryItem {
    fn fmt_with_options(&self, f: &mut fmt::Formatter, options: &display::Options) -> fmt::Result {
        options.write_indent(f)?;
        let hook = if self.is_stub() {
            "stub".to_string()
        } else {
            format!("{:08X}", self.hook_address)
        };
        write!(
            f,
            "{:<24} {:<8} {:<8} {:08X} {:<5} {}",
            self.file_name,
            self.patch_type,
            hook,
            self.patch_address,
            if self.thumb_mode { "thumb" } else { "arm" },
            self.hook_string
        )?;
        if !self.description.is_empty() {
            write!(f, " {}", self.description)?;
        }
        Ok(())
    }
}

/// The patches recorded in an image, along with where the list itself is stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchSet {
    /// Address of the live patch list chunk, if the image has one.
    pub list_address: Option<usize>,

    pub entries: Vec<PatchEntryItem>,
}

impl PatchSet {
    /// Reads the patch list from `image`. An image without a patch list has no patches.
    ///
    /// A list that cannot be decoded is an error; entries are never silently dropped.
    pub fn load(image: &Image) -> Result<Self> {
        let start = image.free_region().start;
        let Some(address) = scan::find_first(image, start, ChunkType::PatchList) else {
            debug!("no patch list in image");
            return Ok(Self::default());
        };
        let chunk = Chunk::read(image.bytes(), address)?;
        let entries = list::deserialize(chunk.payload())?;
        debug!("loaded {} patches from {address:#x}", entries.len());
        Ok(Self {
            list_address: Some(address),
            entries,
        })
    }

    pub fn get(&self, file_name: &str) -> Option<&PatchEntryItem> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }

    /// Looks up the entry whose code is stored at `address`.
    pub fn by_patch_address(&self, address: usize) -> Option<&PatchEntryItem> {
        self.entries
            .iter()
            .find(|e| e.patch_address != 0 && e.patch_address as usize == address)
    }
}

impl fmt::Display for PatchSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_with_options(f, &display::Options::default())
    }
}

impl display::DisplayWithOptions for PatchSet {
    fn fmt_with_options(&self, f: &mut fmt::Formatter, options: &display::Options) -> fmt::Result {
        options.write_indent(f)?;
        writeln!(
            f,
            "{:<24} {:<8} {:<8} {:<8} {:<5} Hook",
            "File", "Type", "Hook at", "Patch", "Mode"
        )?;
        writeln!(f)?;
        for entry in &self.entries {
            entry.fmt_with_options(f, options)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_patch_type() {
        for t in [PatchType::Binary, PatchType::Assembly, PatchType::C] {
            assert_eq!(Some(t), PatchType::from_code(t.code()));
            assert_eq!(Ok(t), t.to_string().parse::<PatchType>());
        }
        assert_eq!(None, PatchType::from_code(3));
        assert_eq!(
            Some(PatchType::C),
            PatchType::from_path(Path::new("src/hook.C"))
        );
        assert_eq!(
            Some(PatchType::Assembly),
            PatchType::from_path(Path::new("a.s"))
        );
        assert_eq!(None, PatchType::from_path(Path::new("README")));
    }

    #[test]
    fn test_hook_string_render() {
        let hook = HookString::default_for(0x100, true);
        assert_eq!(hook.to_string(), "00480047P");
        assert_eq!(hook.written_len(), 8);
        assert_eq!(
            hook.render(0x0878_0011),
            vec![0x00, 0x48, 0x00, 0x47, 0x11, 0x00, 0x78, 0x08]
        );

        let hook = HookString::new(vec![0xAA, 0xBB], Some(1)).expect("hook");
        assert_eq!(hook.to_string(), "AAPBB");
        assert_eq!(
            hook.render(0x0102_0304),
            vec![0xAA, 0x04, 0x03, 0x02, 0x01, 0xBB]
        );

        assert!(HookString::default_for(0, true).is_empty());
        assert_eq!(HookString::default_for(0x300, false).to_string(), "04F01FE5P");
        assert!(HookString::new(vec![0xAA], Some(2)).is_err());
    }

    #[test]
    fn test_thumb_trampoline_literal_is_word_aligned() {
        for hook_address in [0x200u32, 0x202, 0x2A4C0, 0x2A4C6] {
            let hook = HookString::default_for(hook_address, true);
            let literal = hook_address as usize + hook.placeholder().expect("placeholder");
            // ldr r0, [pc, #0] reads from its own address + 4, rounded down to a word
            let ldr = literal - 4;
            assert_eq!(literal, (ldr + 4) & !3, "hook at {hook_address:#x}");
        }

        let hook = HookString::default_for(0x202, true);
        assert_eq!(hook.to_string(), "C04600480047P");
        assert_eq!(
            hook.render(0x0800_100D),
            vec![0xC0, 0x46, 0x00, 0x48, 0x00, 0x47, 0x0D, 0x10, 0x00, 0x08]
        );
        assert!(!hook.needs_word_aligned_hook());
        assert!(HookString::default_for(0x200, true).needs_word_aligned_hook());
    }

    #[test]
    fn test_destination() {
        let mut entry = PatchEntryItem {
            patch_address: 0x78_F970,
            ..Default::default()
        };
        assert_eq!(entry.destination(), 0x0878_F97C);
        entry.thumb_mode = true;
        assert_eq!(entry.destination(), 0x0878_F97D);
    }
}
