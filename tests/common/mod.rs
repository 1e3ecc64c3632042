// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use romchunk::io::{Image, RomProfile};
use romchunk::patch::toolchain::Toolchain;
use romchunk::{Error, Result};

pub const FREE_SPACE_START: usize = 0x1000;
pub const IMAGE_SIZE: usize = 0x2000;

/// A small stand-in for a cartridge: game code below 0x1000, free space above.
pub fn profile() -> RomProfile {
    RomProfile {
        min_size: IMAGE_SIZE,
        max_size: 0x4000,
        magic_offset: 0xA0,
        magic: b"ROMCHUNK".to_vec(),
        free_space_start: FREE_SPACE_START,
        fill_byte: 0xFF,
    }
}

/// Image bytes with a recognizable pattern in the game code and empty free space.
pub fn rom_bytes() -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i % 251) as u8).collect();
    bytes[FREE_SPACE_START..].fill(0xFF);
    bytes[0xA0..0xA8].copy_from_slice(b"ROMCHUNK");
    bytes
}

pub fn blank_image() -> Image {
    Image::new(rom_bytes(), profile()).expect("image")
}

/// Writes a blank ROM into `dir` and returns its path.
pub fn write_rom(dir: &Path) -> PathBuf {
    let path = dir.join("game.gba");
    fs::write(&path, rom_bytes()).expect("rom");
    path
}

/// A blank image that lives in `dir`, so patch files beneath `dir` resolve.
pub fn image_in(dir: &Path) -> Image {
    blank_image().with_path(&dir.join("game.gba"))
}

/// Machine code the fake assembler emits: `bx lr`, padded.
pub const ASSEMBLED: [u8; 4] = [0x70, 0x47, 0x00, 0x00];

/// A toolchain that records what it was asked to do and writes placeholder outputs.
#[derive(Debug, Default)]
pub struct FakeToolchain {
    pub calls: Vec<String>,

    /// A stage ("compile", "assemble", "extract") that fails.
    pub fail: Option<&'static str>,

    /// Whether verification reports a missing component.
    pub missing: bool,
}

fn name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl FakeToolchain {
    fn stage(&mut self, stage: &'static str, input: &Path) -> Result<()> {
        self.calls.push(format!("{stage} {}", name(input)));
        if self.fail != Some(stage) {
            return Ok(());
        }
        let file = input.to_path_buf();
        let diagnostics = format!("{}: error: fake failure", name(input));
        Err(match stage {
            "compile" => Error::CompileError { file, diagnostics },
            "assemble" => Error::AssembleError { file, diagnostics },
            _ => Error::ExtractError { file, diagnostics },
        })
    }
}

impl Toolchain for FakeToolchain {
    fn verify(&self) -> Result<()> {
        if self.missing {
            return Err(Error::MissingComponent(PathBuf::from(
                "bin/arm-none-eabi-gcc",
            )));
        }
        Ok(())
    }

    fn compile(&mut self, source: &Path, assembly: &Path, _thumb_mode: bool) -> Result<()> {
        self.stage("compile", source)?;
        fs::write(assembly, format!("@ compiled from {}\n", name(source)))?;
        Ok(())
    }

    fn assemble(&mut self, assembly: &Path, object: &Path, _thumb_mode: bool) -> Result<()> {
        self.stage("assemble", assembly)?;
        fs::write(object, ASSEMBLED)?;
        Ok(())
    }

    fn extract(&mut self, object: &Path, binary: &Path) -> Result<()> {
        self.stage("extract", object)?;
        fs::copy(object, binary)?;
        Ok(())
    }
}
