// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Placing new chunks in the free space and retiring old ones.

use log::{debug, info};

use crate::io::Image;
use crate::scan::{Slot, Stop, Walker};
use crate::{
    align, decode_header, ChunkHeader, ChunkType, Error, Result, HEADER_SIZE, MAX_PAYLOAD_LEN,
};

/// The part of an image chunks may be stored in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRegion {
    /// Where the first chunk may begin.
    pub start: usize,

    /// No chunk may extend past this address. The image grows up to it when needed.
    pub ceiling: usize,
}

/// Finds the address a chunk of `footprint` bytes would be written to.
///
/// The first run of slack large enough wins. The slack after the last chunk extends to the
/// region's ceiling, growing the image if necessary. Nothing is modified.
pub fn find_space(image: &Image, region: FreeRegion, footprint: usize) -> Result<usize> {
    let ceiling = region.ceiling.min(image.profile().max_size);
    let out_of_space = Error::OutOfSpace { footprint, ceiling };

    let mut walker = Walker::new(image, region.start);
    for slot in walker.by_ref() {
        let Slot::Slack { address, len } = slot else {
            continue;
        };
        let trailing = address + len >= image.len();
        if address + footprint > ceiling {
            return Err(out_of_space);
        }
        if len >= footprint || trailing {
            return Ok(address);
        }
    }

    match walker.stop() {
        Some(Stop::ImageEnd(address)) if address + footprint <= ceiling => Ok(address),
        Some(Stop::EndOfFreeSpace(address)) => {
            debug!("no slack before the end of free space at {address:#x}");
            Err(out_of_space)
        }
        _ => Err(out_of_space),
    }
}

fn write_chunk(
    image: &mut Image,
    address: usize,
    chunk_type: ChunkType,
    payload: &[u8],
) -> Result<()> {
    let header = ChunkHeader::new(chunk_type, payload);
    let end = address + header.footprint();
    image.grow(align(end))?;
    image.write_at(address, &header.to_bytes())?;
    image.write_at(address + HEADER_SIZE, payload)?;
    Ok(())
}

fn check_payload(payload: &[u8], region: FreeRegion) -> Result<usize> {
    let footprint = payload.len() + HEADER_SIZE;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::OutOfSpace {
            footprint,
            ceiling: region.ceiling,
        });
    }
    Ok(footprint)
}

/// Stores `payload` as a new chunk of `chunk_type` and returns its address.
///
/// Fails with [Error::OutOfSpace] when no gap large enough exists below the region's ceiling,
/// in which case the image is left untouched.
pub fn allocate(
    image: &mut Image,
    region: FreeRegion,
    chunk_type: ChunkType,
    payload: &[u8],
) -> Result<usize> {
    let footprint = check_payload(payload, region)?;
    let address = find_space(image, region, footprint)?;
    write_chunk(image, address, chunk_type, payload)?;
    info!(
        "allocated {chunk_type} chunk at {address:#x} ({:#x} byte payload)",
        payload.len()
    );
    Ok(address)
}

/// Marks the chunk at `address` as invalidated.
///
/// Only the header's type changes; the length fields and the payload bytes stay, so the chunk
/// keeps its footprint and the chunks after it stay reachable. Invalidating a chunk twice is
/// harmless.
pub fn invalidate(image: &mut Image, address: usize) -> Result<()> {
    let header = decode_header(image.bytes(), address)?;
    if !header.state().is_live() {
        debug!("chunk at {address:#x} is already invalidated");
        return Ok(());
    }
    image.write_at(address, &header.tombstoned().to_bytes())?;
    info!(
        "invalidated {} chunk at {address:#x}",
        header.state().original_type()
    );
    Ok(())
}

/// Replaces the chunk at `old_address` with a new chunk holding `payload`.
///
/// The old chunk is invalidated and a new one is allocated; the new chunk never reuses the old
/// chunk's space. Space for the new chunk is found before anything is written, so a failed
/// replacement leaves the old chunk live.
pub fn replace(
    image: &mut Image,
    region: FreeRegion,
    old_address: usize,
    chunk_type: ChunkType,
    payload: &[u8],
) -> Result<usize> {
    let footprint = check_payload(payload, region)?;
    decode_header(image.bytes(), old_address)?;
    let address = find_space(image, region, footprint)?;
    invalidate(image, old_address)?;
    write_chunk(image, address, chunk_type, payload)?;
    info!("replaced chunk at {old_address:#x} with {chunk_type} chunk at {address:#x}");
    Ok(address)
}
