// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Settings shared by the command line tools.

use std::env;
use std::path::PathBuf;

use log::debug;

use crate::io::RomProfile;
use crate::{Error, Result};

/// Names the toolchain installation directory.
pub const TOOLCHAIN_ENV: &str = "ROMCHUNK_TOOLCHAIN";

/// Set by devkitPro installers; used when [TOOLCHAIN_ENV] is not.
pub const DEVKITARM_ENV: &str = "DEVKITARM";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub profile: RomProfile,

    /// Where the compiler, assembler, and extractor are installed.
    pub toolchain_dir: Option<PathBuf>,
}

impl Config {
    /// Moves the start of the free space, e.g. for hacks that reserve more of the image.
    pub fn with_free_space_start(mut self, start: Option<usize>) -> Self {
        if let Some(start) = start {
            self.profile.free_space_start = start;
        }
        self
    }

    pub fn with_toolchain_dir(mut self, dir: Option<PathBuf>) -> Self {
        if dir.is_some() {
            self.toolchain_dir = dir;
        }
        self
    }

    /// The toolchain directory, falling back to `$DEVKITARM`.
    pub fn toolchain_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.toolchain_dir {
            return Ok(dir.clone());
        }
        match env::var_os(DEVKITARM_ENV) {
            Some(dir) => {
                debug!("using ${DEVKITARM_ENV}: {dir:?}");
                Ok(PathBuf::from(dir))
            }
            None => Err(Error::MissingComponent(PathBuf::from(format!(
                "${TOOLCHAIN_ENV}"
            )))),
        }
    }
}

/// Parses an address written in hex, with or without a `0x` prefix.
pub fn parse_address(s: &str) -> std::result::Result<usize, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    usize::from_str_radix(digits, 16).map_err(|e| format!("invalid address {s:?}: {e}"))
}
