// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! ROM Chunk Store and Patch Builder
//!
//! This crate manages typed, variable-length records ("chunks") stored in the free space of a
//! Game Boy Advance ROM image, and builds code patches that are persisted as chunks and spliced
//! into the game through hooks.
//!
//! # Overview
//!
//! - **[Chunks](Chunk)** are written by the [allocator] into the image's free space, found again
//!   by the [scan] module, and summarized for inspection by the [reference] index. A chunk is
//!   never modified in place: updates tombstone the old chunk and write a new one.
//! - **[Patches](patch::PatchEntryItem)** are C, assembly, or raw binary files which the
//!   [build pipeline](patch::build) turns into machine code, stores as
//!   [Patch](ChunkType::Patch) chunks, and records in a versioned
//!   [patch list](patch::list).
//!
//! # Quick Start
//!
//! Listing the live chunks of a ROM:
//!
//! ```no_run
//! use std::path::Path;
//! use romchunk::{io, scan};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let image = io::read(Path::new("wl4.gba"), &io::RomProfile::default())?;
//!
//!     for chunk in scan::chunks(&image, image.free_region().start) {
//!         println!("{chunk}");
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! Storing a new chunk and saving the image:
//!
//! ```no_run
//! use std::path::Path;
//! use romchunk::{allocator, io, ChunkType};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let mut image = io::read(Path::new("wl4.gba"), &io::RomProfile::default())?;
//!     let region = image.free_region();
//!     let address = allocator::allocate(&mut image, region, ChunkType::LevelName, b"HALL")?;
//!     println!("stored at {address:#x}");
//!     io::save(&image)?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use binrw::binrw;
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};

use crate::display::DisplayWithOptions;

pub mod allocator;
pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod io;
pub mod patch;
pub mod reference;
pub mod scan;

pub use error::{Error, Result};

/// Size of a serialized [ChunkHeader].
pub const HEADER_SIZE: usize = 12;

/// The largest payload a chunk can describe with its split length fields.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Chunks begin on addresses that are a multiple of this value.
pub const CHUNK_ALIGNMENT: usize = 4;

/// Rounds `address` up to the next [CHUNK_ALIGNMENT] boundary. Addresses too close to
/// `usize::MAX` to round up are rounded down instead.
#[inline]
pub fn align(address: usize) -> usize {
    address.saturating_add(CHUNK_ALIGNMENT - 1) & !(CHUNK_ALIGNMENT - 1)
}

/// The closed set of chunk tags.
///
/// Tags are part of the on-disk format. New tags may be appended but existing tags are never
/// renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChunkType {
    /// A tombstone. The chunk's payload is dead but its footprint still occupies the image.
    Invalidation = 0x00,
    RoomHeader = 0x01,
    Door = 0x02,
    Layer = 0x03,
    LevelName = 0x04,
    EntityList = 0x05,
    CameraPointerTable = 0x06,
    CameraBoundary = 0x07,
    /// The serialized [patch list](patch::list).
    PatchList = 0x08,
    /// Machine code produced by the [build pipeline](patch::build).
    Patch = 0x09,
    TilesetForegroundTiles = 0x0A,
    TilesetMap16EventTable = 0x0B,
    TilesetMap16Terrain = 0x0C,
    TilesetMap16Data = 0x0D,
    TilesetPalette = 0x0E,
    EntityTiles = 0x0F,
    EntityPalette = 0x10,
    EntitySetLoadTable = 0x11,
}

impl ChunkType {
    /// Every tag, in tag order.
    pub const ALL: [ChunkType; 18] = [
        Self::Invalidation,
        Self::RoomHeader,
        Self::Door,
        Self::Layer,
        Self::LevelName,
        Self::EntityList,
        Self::CameraPointerTable,
        Self::CameraBoundary,
        Self::PatchList,
        Self::Patch,
        Self::TilesetForegroundTiles,
        Self::TilesetMap16EventTable,
        Self::TilesetMap16Terrain,
        Self::TilesetMap16Data,
        Self::TilesetPalette,
        Self::EntityTiles,
        Self::EntityPalette,
        Self::EntitySetLoadTable,
    ];

    /// The byte stored in a chunk header for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Looks up the type for a header tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    /// The stable, human readable name of this type.
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalidation => "invalidation",
            Self::RoomHeader => "room-header",
            Self::Door => "door",
            Self::Layer => "layer",
            Self::LevelName => "level-name",
            Self::EntityList => "entity-list",
            Self::CameraPointerTable => "camera-pointer-table",
            Self::CameraBoundary => "camera-boundary",
            Self::PatchList => "patch-list",
            Self::Patch => "patch",
            Self::TilesetForegroundTiles => "tileset-fg-tiles",
            Self::TilesetMap16EventTable => "tileset-map16-events",
            Self::TilesetMap16Terrain => "tileset-map16-terrain",
            Self::TilesetMap16Data => "tileset-map16-data",
            Self::TilesetPalette => "tileset-palette",
            Self::EntityTiles => "entity-tiles",
            Self::EntityPalette => "entity-palette",
            Self::EntitySetLoadTable => "entity-set-load-table",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown chunk type: {s}"))
    }
}

/// Whether a chunk is in use or has been superseded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// A chunk whose payload is current.
    Live(ChunkType),
    /// An invalidated chunk, carrying the type it had while it was live.
    Tombstoned(ChunkType),
}

impl ChunkState {
    /// The type the chunk was written with.
    pub fn original_type(&self) -> ChunkType {
        match *self {
            Self::Live(t) | Self::Tombstoned(t) => t,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

/// The 16-bit wrapping byte sum stored in every header.
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
}

/// The fixed-size header that precedes every chunk payload.
///
/// # Structure on Disk
///
/// | Offset | Type      | Description                                                            |
/// |--------|-----------|------------------------------------------------------------------------|
/// | 0      | `[u8; 4]` | Magic: "STAR"                                                          |
/// | 4      | `u16`     | Low 16 bits of the payload length.                                     |
/// | 6      | `u16`     | 16-bit wrapping sum of the payload bytes.                              |
/// | 8      | `u8`      | The current [ChunkType] tag. Zero once the chunk is invalidated.       |
/// | 9      | `u8`      | Bits 16-23 of the payload length.                                      |
/// | 10     | `u8`      | The [ChunkType] tag the chunk was written with.                        |
/// | 11     | `u8`      | Reserved, always zero.                                                 |
///
/// The payload follows immediately. The chunk's footprint, the number of bytes it occupies in
/// the image, is the payload length plus [HEADER_SIZE].
#[binrw]
#[brw(little, magic = b"STAR")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    base_length: u16,
    checksum: u16,
    kind: u8,
    length_extension: u8,
    original_kind: u8,
    reserved: u8,
}

impl ChunkHeader {
    /// Creates a live header describing `payload`.
    ///
    /// `payload` must not be longer than [MAX_PAYLOAD_LEN].
    pub fn new(chunk_type: ChunkType, payload: &[u8]) -> Self {
        let len = payload.len();
        Self {
            base_length: (len & 0xFFFF) as u16,
            checksum: checksum(payload),
            kind: chunk_type.tag(),
            length_extension: ((len >> 16) & 0xFF) as u8,
            original_kind: chunk_type.tag(),
            reserved: 0,
        }
    }

    /// The payload length: `base_length + (length_extension << 16)`.
    pub fn payload_len(&self) -> usize {
        self.base_length as usize + ((self.length_extension as usize) << 16)
    }

    /// The number of bytes this chunk occupies, header included.
    pub fn footprint(&self) -> usize {
        footprint(self)
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn state(&self) -> ChunkState {
        let original = ChunkType::from_tag(self.original_kind).unwrap_or(ChunkType::Invalidation);
        match ChunkType::from_tag(self.kind) {
            Some(ChunkType::Invalidation) | None => ChunkState::Tombstoned(original),
            Some(t) => ChunkState::Live(t),
        }
    }

    /// Returns this header with its type replaced by [ChunkType::Invalidation]. The length
    /// fields, and therefore the footprint, are unchanged.
    pub fn tombstoned(&self) -> Self {
        let original = self.state().original_type();
        Self {
            kind: ChunkType::Invalidation.tag(),
            original_kind: original.tag(),
            ..*self
        }
    }

    /// Serializes the header into its 12-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut writer = Cursor::new(&mut bytes[..]);
        // a fixed-size header always fits its buffer
        if let Err(e) = self.write(&mut writer) {
            unreachable!("chunk header serialization: {e}");
        }
        bytes
    }
}

/// The total footprint of the chunk described by `header`.
pub fn footprint(header: &ChunkHeader) -> usize {
    header.payload_len() + HEADER_SIZE
}

/// Decodes the header at `address` in `bytes`.
///
/// Fails with [Error::Truncated] when either the header or the payload it describes runs past
/// the end of `bytes`, with [Error::NoChunkAt] when no header magic is present, and with
/// [Error::UnknownChunkType] for tags outside [ChunkType].
pub fn decode_header(bytes: &[u8], address: usize) -> Result<ChunkHeader> {
    let available = bytes.len().saturating_sub(address);
    if available < HEADER_SIZE {
        return Err(Error::Truncated {
            address,
            needed: HEADER_SIZE,
            available,
        });
    }

    let mut reader = Cursor::new(&bytes[address..address + HEADER_SIZE]);
    let header = ChunkHeader::read(&mut reader).map_err(|_| Error::NoChunkAt(address))?;

    for tag in [header.kind, header.original_kind] {
        if ChunkType::from_tag(tag).is_none() {
            return Err(Error::UnknownChunkType(tag));
        }
    }

    if header.footprint() > available {
        return Err(Error::Truncated {
            address,
            needed: header.footprint(),
            available,
        });
    }

    Ok(header)
}

/// A chunk read from an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    address: usize,
    header: ChunkHeader,
    payload: &'a [u8],
}

impl<'a> Chunk<'a> {
    /// Reads the chunk whose header begins at `address`.
    pub fn read(bytes: &'a [u8], address: usize) -> Result<Self> {
        let header = decode_header(bytes, address)?;
        let start = address + HEADER_SIZE;
        Ok(Self {
            address,
            header,
            payload: &bytes[start..start + header.payload_len()],
        })
    }

    /// The offset of the chunk header in the image.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn state(&self) -> ChunkState {
        self.header.state()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn footprint(&self) -> usize {
        self.header.footprint()
    }

    /// Whether the payload still sums to the checksum recorded in the header.
    pub fn checksum_ok(&self) -> bool {
        checksum(self.payload) == self.header.checksum
    }
}

impl fmt::Display for Chunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_with_options(f, &display::Options::default())
    }
}

impl display::DisplayWithOptions for Chunk<'_> {
    fn fmt_with_options(&self, f: &mut fmt::Formatter, options: &display::Options) -> fmt::Result {
        options.write_indent(f)?;
        let state = match self.state() {
            ChunkState::Live(t) => format!("{t}"),
            ChunkState::Tombstoned(t) => format!("{t} (invalidated)"),
        };
        write!(
            f,
            "{:08X} {:<32} {:>8X}{}",
            self.address,
            state,
            self.payload.len(),
            if self.checksum_ok() { "" } else { " bad checksum" }
        )?;
        options.write_payload(f, self.payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout() {
        let payload = [1u8, 2, 3, 4, 250];
        let header = ChunkHeader::new(ChunkType::Door, &payload);
        assert_eq!(
            header.to_bytes(),
            *b"STAR\x05\x00\x04\x01\x02\x00\x02\x00"
        );
        assert_eq!(header.payload_len(), 5);
        assert_eq!(footprint(&header), 17);
        assert_eq!(header.state(), ChunkState::Live(ChunkType::Door));
    }

    #[test]
    fn test_extended_length() {
        let payload = vec![0u8; 0x1_0004];
        let header = ChunkHeader::new(ChunkType::Layer, &payload);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[4..6], &[0x04, 0x00]);
        assert_eq!(bytes[9], 0x01);
        assert_eq!(header.payload_len(), 0x1_0004);
        assert_eq!(header.footprint(), 0x1_0004 + HEADER_SIZE);
    }

    #[test]
    fn test_decode_round_trip() {
        let payload = b"level";
        let header = ChunkHeader::new(ChunkType::LevelName, payload);
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);

        let decoded = decode_header(&bytes, 0).expect("header");
        assert_eq!(decoded, header);

        let chunk = Chunk::read(&bytes, 0).expect("chunk");
        assert_eq!(chunk.payload(), payload);
        assert!(chunk.checksum_ok());
    }

    #[test]
    fn test_decode_truncated() {
        let header = ChunkHeader::new(ChunkType::Door, &[0u8; 8]);
        let bytes = header.to_bytes();

        // the header claims 8 payload bytes that are not there
        assert!(matches!(
            decode_header(&bytes, 0),
            Err(Error::Truncated {
                address: 0,
                needed: 20,
                available: 12
            })
        ));
        assert!(matches!(
            decode_header(&bytes[..6], 0),
            Err(Error::Truncated { needed: 12, .. })
        ));
        assert!(matches!(
            decode_header(&bytes, 40),
            Err(Error::Truncated { available: 0, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_header(&[0u8; 16], 0),
            Err(Error::NoChunkAt(0))
        ));
        let mut bytes = ChunkHeader::new(ChunkType::Door, &[]).to_bytes();
        bytes[8] = 0x7F;
        assert!(matches!(
            decode_header(&bytes, 0),
            Err(Error::UnknownChunkType(0x7F))
        ));
    }

    #[test]
    fn test_tombstone_keeps_footprint() {
        let header = ChunkHeader::new(ChunkType::RoomHeader, &[9u8; 44]);
        let dead = header.tombstoned();
        assert_eq!(footprint(&dead), footprint(&header));
        assert_eq!(dead.state(), ChunkState::Tombstoned(ChunkType::RoomHeader));
        assert_eq!(dead.tombstoned(), dead);
    }

    #[test]
    fn test_chunk_type_names() {
        for t in ChunkType::ALL {
            assert_eq!(Ok(t), t.name().parse::<ChunkType>());
            assert_eq!(Some(t), ChunkType::from_tag(t.tag()));
        }
        assert_eq!(Ok(ChunkType::PatchList), "Patch-List".parse::<ChunkType>());
        assert!("nope".parse::<ChunkType>().is_err());
        assert_eq!(None, ChunkType::from_tag(0x12));
    }

    #[test]
    fn test_align() {
        assert_eq!(align(0x1000), 0x1000);
        assert_eq!(align(0x1001), 0x1004);
        assert_eq!(align(0x1014), 0x1014);
        assert_eq!(align(0x1033), 0x1034);
        assert_eq!(align(usize::MAX), usize::MAX - 3);
    }
}
