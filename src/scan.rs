// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Walking the chunks stored in an image's free space.
//!
//! Chunks are laid out back to back on [CHUNK_ALIGNMENT] boundaries. The walk starts at the
//! beginning of the free space and steps from one chunk to the next by its footprint. Runs of
//! fill bytes between chunks are slack and are stepped over one alignment unit at a time. Any
//! other bytes that do not decode as a chunk header mark the end of the free space.

use log::debug;

use crate::io::Image;
use crate::{align, decode_header, Chunk, ChunkState, ChunkType, CHUNK_ALIGNMENT, HEADER_SIZE};

/// One step of a walk over the free space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot<'a> {
    /// A live or invalidated chunk.
    Chunk(Chunk<'a>),

    /// `len` unused fill bytes beginning at `address`.
    Slack { address: usize, len: usize },
}

/// Why a walk stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// The walk reached the end of the image. The value is the first address past the last
    /// chunk or slack run, which may lie beyond the image's length when the last chunk
    /// required alignment padding.
    ImageEnd(usize),

    /// Bytes at this address are neither a chunk nor slack.
    EndOfFreeSpace(usize),
}

/// An iterator over the [Slots](Slot) of an image, beginning at a given address.
pub struct Walker<'a> {
    bytes: &'a [u8],
    fill: u8,
    position: usize,
    stop: Option<Stop>,
}

impl<'a> Walker<'a> {
    pub fn new(image: &'a Image, start: usize) -> Self {
        Self {
            bytes: image.bytes(),
            fill: image.profile().fill_byte,
            position: align(start),
            stop: None,
        }
    }

    /// Where and why the walk ended, once the iterator is exhausted.
    pub fn stop(&self) -> Option<Stop> {
        self.stop
    }

    fn is_fill(&self, address: usize) -> bool {
        let end = (address + CHUNK_ALIGNMENT).min(self.bytes.len());
        self.bytes[address..end].iter().all(|b| *b == self.fill)
    }
}

impl<'a> Iterator for Walker<'a> {
    type Item = Slot<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop.is_some() {
            return None;
        }

        let start = self.position;
        if start >= self.bytes.len() {
            self.stop = Some(Stop::ImageEnd(start));
            return None;
        }

        let mut cursor = start;
        while cursor < self.bytes.len() && self.is_fill(cursor) {
            cursor += CHUNK_ALIGNMENT;
        }
        if cursor > start {
            self.position = cursor;
            return Some(Slot::Slack {
                address: start,
                len: cursor.min(self.bytes.len()) - start,
            });
        }

        let chunk = match Chunk::read(self.bytes, cursor) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("free space ends at {cursor:#x}: {e}");
                self.stop = Some(Stop::EndOfFreeSpace(cursor));
                return None;
            }
        };

        // a footprint that does not move the walk forward ends the free space
        let next = align(cursor + chunk.footprint());
        if chunk.footprint() < HEADER_SIZE || next <= cursor {
            self.stop = Some(Stop::EndOfFreeSpace(cursor));
            return None;
        }
        self.position = next;
        Some(Slot::Chunk(chunk))
    }
}

/// Iterates over every chunk, live or invalidated, from `start` to the end of the free space.
pub fn chunks(image: &Image, start: usize) -> impl Iterator<Item = Chunk<'_>> {
    Walker::new(image, start).filter_map(|slot| match slot {
        Slot::Chunk(chunk) => Some(chunk),
        Slot::Slack { .. } => None,
    })
}

fn matches(state: ChunkState, wanted: ChunkType, include_invalidated: bool) -> bool {
    match state {
        ChunkState::Live(t) => t == wanted,
        ChunkState::Tombstoned(original) => {
            wanted == ChunkType::Invalidation || (include_invalidated && original == wanted)
        }
    }
}

/// Returns the address of the first live chunk of `chunk_type` at or after `start`.
///
/// Tombstones are only returned when `chunk_type` is [ChunkType::Invalidation].
pub fn find_first(image: &Image, start: usize, chunk_type: ChunkType) -> Option<usize> {
    chunks(image, start)
        .find(|chunk| matches(chunk.state(), chunk_type, false))
        .map(|chunk| chunk.address())
}

/// Returns the addresses of every chunk of `chunk_type` at or after `start`, in ascending
/// order.
///
/// When `include_invalidated` is set, chunks originally written as `chunk_type` that have since
/// been invalidated are included.
pub fn find_all(
    image: &Image,
    start: usize,
    chunk_type: ChunkType,
    include_invalidated: bool,
) -> Vec<usize> {
    chunks(image, start)
        .filter(|chunk| matches(chunk.state(), chunk_type, include_invalidated))
        .map(|chunk| chunk.address())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::RomProfile;
    use crate::ChunkHeader;

    fn image_with(chunks: &[(usize, ChunkHeader, usize)]) -> Image {
        let profile = RomProfile {
            min_size: 0x100,
            max_size: 0x400,
            magic_offset: 0,
            magic: b"T".to_vec(),
            free_space_start: 0x40,
            fill_byte: 0xFF,
        };
        let mut bytes = vec![0xFFu8; 0x100];
        bytes[0] = b'T';
        for (address, header, payload_len) in chunks {
            bytes[*address..*address + HEADER_SIZE].copy_from_slice(&header.to_bytes());
            bytes[*address + HEADER_SIZE..*address + HEADER_SIZE + *payload_len].fill(0);
        }
        Image::new(bytes, profile).expect("image")
    }

    #[test]
    fn test_walk_with_slack() {
        let door = ChunkHeader::new(ChunkType::Door, &[0; 6]);
        let layer = ChunkHeader::new(ChunkType::Layer, &[0; 4]);
        let image = image_with(&[(0x40, door, 6), (0x60, layer, 4)]);

        let mut walker = Walker::new(&image, 0x40);
        let slots: Vec<_> = walker.by_ref().collect();
        assert_eq!(slots.len(), 4);
        assert!(matches!(slots[0], Slot::Chunk(c) if c.address() == 0x40));
        // 0x40 + 18 is padded to 0x54
        assert_eq!(
            slots[1],
            Slot::Slack {
                address: 0x54,
                len: 0x0C
            }
        );
        assert!(matches!(slots[2], Slot::Chunk(c) if c.address() == 0x60));
        assert_eq!(
            slots[3],
            Slot::Slack {
                address: 0x70,
                len: 0x90
            }
        );
        assert_eq!(walker.stop(), Some(Stop::ImageEnd(0x100)));
    }

    #[test]
    fn test_find() {
        let door = ChunkHeader::new(ChunkType::Door, &[0; 4]);
        let dead_door = ChunkHeader::new(ChunkType::Door, &[0; 4]).tombstoned();
        let layer = ChunkHeader::new(ChunkType::Layer, &[0; 4]);
        let image = image_with(&[(0x40, dead_door, 4), (0x50, layer, 4), (0x60, door, 4)]);

        assert_eq!(Some(0x60), find_first(&image, 0x40, ChunkType::Door));
        assert_eq!(Some(0x40), find_first(&image, 0x40, ChunkType::Invalidation));
        assert_eq!(None, find_first(&image, 0x40, ChunkType::PatchList));
        assert_eq!(vec![0x60], find_all(&image, 0x40, ChunkType::Door, false));
        assert_eq!(
            vec![0x40, 0x60],
            find_all(&image, 0x40, ChunkType::Door, true)
        );
        assert_eq!(
            vec![0x40],
            find_all(&image, 0x40, ChunkType::Invalidation, false)
        );
    }

    #[test]
    fn test_garbage_ends_free_space() {
        let door = ChunkHeader::new(ChunkType::Door, &[0; 4]);
        let mut image = image_with(&[(0x40, door, 4), (0x80, door, 4)]);
        // an all-zero header right after the first chunk
        let mut bytes = image.bytes().to_vec();
        bytes[0x50..0x5C].fill(0);
        image = Image::new(bytes, image.profile().clone()).expect("image");

        let mut walker = Walker::new(&image, 0x40);
        assert_eq!(walker.by_ref().count(), 1);
        assert_eq!(walker.stop(), Some(Stop::EndOfFreeSpace(0x50)));
        assert_eq!(vec![0x40], find_all(&image, 0x40, ChunkType::Door, true));
    }

    #[test]
    fn test_oversized_header_ends_free_space() {
        let huge = ChunkHeader::new(ChunkType::Layer, &vec![0; 0x2000]);
        let mut bytes = vec![0xFFu8; 0x100];
        bytes[0] = b'T';
        bytes[0x40..0x4C].copy_from_slice(&huge.to_bytes());
        let profile = RomProfile {
            min_size: 0x100,
            max_size: 0x400,
            magic_offset: 0,
            magic: b"T".to_vec(),
            free_space_start: 0x40,
            fill_byte: 0xFF,
        };
        let image = Image::new(bytes, profile).expect("image");
        assert!(find_all(&image, 0x40, ChunkType::Layer, true).is_empty());
    }
}
