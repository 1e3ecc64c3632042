// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Errors produced by the chunk store and the patch pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the library reports.
///
/// Store errors ([Truncated](Error::Truncated), [OutOfSpace](Error::OutOfSpace)) abort the
/// current operation without touching the image. Validation errors are recoverable: the
/// entry that caused them can be corrected and resubmitted. Build errors carry the external
/// tool's diagnostics verbatim.
#[derive(Debug, Error)]
pub enum Error {
    #[error("chunk at {address:#x} needs {needed:#x} bytes but only {available:#x} remain")]
    Truncated {
        address: usize,
        needed: usize,
        available: usize,
    },

    #[error("no space for a chunk of {footprint:#x} bytes below {ceiling:#x}")]
    OutOfSpace { footprint: usize, ceiling: usize },

    #[error("unknown chunk type {0:#04x}")]
    UnknownChunkType(u8),

    #[error("no chunk at {0:#x}")]
    NoChunkAt(usize),

    #[error("corrupt patch list: {0}")]
    CorruptPatchList(String),

    #[error("unsupported patch list version {found} (newest understood is {current})")]
    UnsupportedVersion { found: u8, current: u8 },

    #[error("hook address {address:#x} is not {alignment}-byte aligned")]
    MisalignedHook { address: u32, alignment: u32 },

    #[error("hook at {address:#x} ({len} bytes) is outside the patchable image")]
    HookOutOfBounds { address: u32, len: usize },

    #[error("invalid hook string: {0}")]
    InvalidHookString(String),

    #[error("file not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("{path:?} is not under the image directory {root:?}")]
    FileOutsideImageTree { path: PathBuf, root: PathBuf },

    #[error("another patch already uses the file {0:?}")]
    DuplicateFileName(String),

    #[error("another patch already hooks {0:#x}")]
    DuplicateHookAddress(u32),

    #[error("hook at {address:#x} overlaps the hook at {other:#x}")]
    OverlappingHook { address: u32, other: u32 },

    #[error("the {field} may not contain ';'")]
    ReservedDelimiter { field: &'static str },

    #[error("compiling {file:?} failed:\n{diagnostics}")]
    CompileError { file: PathBuf, diagnostics: String },

    #[error("assembling {file:?} failed:\n{diagnostics}")]
    AssembleError { file: PathBuf, diagnostics: String },

    #[error("extracting {file:?} failed:\n{diagnostics}")]
    ExtractError { file: PathBuf, diagnostics: String },

    #[error("toolchain component missing: {0:?}")]
    MissingComponent(PathBuf),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error came from checking a patch entry and the entry can be corrected
    /// and resubmitted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MisalignedHook { .. }
                | Self::HookOutOfBounds { .. }
                | Self::InvalidHookString(_)
                | Self::FileNotFound(_)
                | Self::FileOutsideImageTree { .. }
                | Self::DuplicateFileName(_)
                | Self::DuplicateHookAddress(_)
                | Self::OverlappingHook { .. }
                | Self::ReservedDelimiter { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
