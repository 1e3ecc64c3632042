// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Looking up what a stored chunk belongs to.

use std::collections::BTreeMap;
use std::fmt;

use log::warn;

use crate::io::Image;
use crate::patch::PatchSet;
use crate::{scan, Chunk, ChunkType};

/// What a chunk is, and the key it is known by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkReference {
    /// The type that owns the chunk. `None` for the [UNREFERENCED] sentinel.
    pub owner: Option<ChunkType>,

    /// A human readable key, such as a patch's file name.
    pub key: String,
}

/// Returned for addresses that hold no live chunk.
pub static UNREFERENCED: ChunkReference = ChunkReference {
    owner: None,
    key: String::new(),
};

impl ChunkReference {
    pub fn is_referenced(&self) -> bool {
        self.owner.is_some()
    }
}

impl fmt::Display for ChunkReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.owner {
            Some(_) => f.write_str(&self.key),
            None => f.write_str("(unreferenced)"),
        }
    }
}

/// A snapshot of every live chunk in an image, keyed by address.
///
/// The index is not updated when the image changes; build a new one after writing.
#[derive(Clone, Debug, Default)]
pub struct ReferenceIndex {
    references: BTreeMap<usize, ChunkReference>,
}

impl ReferenceIndex {
    pub fn build(image: &Image) -> Self {
        let start = image.free_region().start;
        let patches = match PatchSet::load(image) {
            Ok(set) => set,
            Err(e) => {
                warn!("patch chunks will not be named: {e}");
                PatchSet::default()
            }
        };

        let mut references = BTreeMap::new();
        for chunk_type in ChunkType::ALL {
            if chunk_type == ChunkType::Invalidation {
                continue;
            }
            let addresses = scan::find_all(image, start, chunk_type, false);
            for (ordinal, address) in addresses.into_iter().enumerate() {
                let key = match chunk_type {
                    ChunkType::Patch => match patches.by_patch_address(address) {
                        Some(entry) => entry.file_name.clone(),
                        None => format!("orphaned patch #{ordinal}"),
                    },
                    ChunkType::PatchList => {
                        let count = if patches.list_address == Some(address) {
                            patches.entries.len()
                        } else {
                            Chunk::read(image.bytes(), address)
                                .ok()
                                .and_then(|c| crate::patch::list::deserialize(c.payload()).ok())
                                .map_or(0, |entries| entries.len())
                        };
                        format!("patch list ({count} entries)")
                    }
                    _ => format!("{chunk_type} #{ordinal}"),
                };
                references.insert(
                    address,
                    ChunkReference {
                        owner: Some(chunk_type),
                        key,
                    },
                );
            }
        }
        Self { references }
    }

    /// The reference for the chunk at `address`, or [UNREFERENCED].
    pub fn get(&self, address: usize) -> &ChunkReference {
        self.references.get(&address).unwrap_or(&UNREFERENCED)
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// References in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ChunkReference)> {
        self.references.iter().map(|(a, r)| (*a, r))
    }
}
