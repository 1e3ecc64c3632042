// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! The external compiler, assembler, and object extractor used to build patches.

use std::env::consts::EXE_SUFFIX;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use log::{debug, info};

use crate::{Error, Result};

/// The three stages of turning patch sources into machine code.
///
/// Each call blocks until the work is done. Implementations report failures with the stage's
/// error kind, carrying the tool's diagnostics.
pub trait Toolchain {
    /// Checks that every component is installed.
    fn verify(&self) -> Result<()>;

    /// Compiles the C file `source` to the assembly file `assembly`.
    fn compile(&mut self, source: &Path, assembly: &Path, thumb_mode: bool) -> Result<()>;

    /// Assembles `assembly` into the object file `object`.
    fn assemble(&mut self, assembly: &Path, object: &Path, thumb_mode: bool) -> Result<()>;

    /// Copies the `.text` section of `object` into the raw binary `binary`.
    fn extract(&mut self, object: &Path, binary: &Path) -> Result<()>;
}

/// Components of the devkitARM toolchain, relative to its installation directory.
pub const COMPILER: &str = "bin/arm-none-eabi-gcc";
pub const ASSEMBLER: &str = "bin/arm-none-eabi-as";
pub const EXTRACTOR: &str = "bin/arm-none-eabi-objcopy";

/// A toolchain installed on disk, run as child processes.
///
/// No timeout is applied; a tool that never exits stalls the build.
#[derive(Clone, Debug)]
pub struct ExternalToolchain {
    install_dir: PathBuf,
}

impl ExternalToolchain {
    pub fn new(install_dir: &Path) -> Self {
        Self {
            install_dir: install_dir.to_path_buf(),
        }
    }

    /// Full path of a component such as [COMPILER].
    pub fn component(&self, name: &str) -> PathBuf {
        self.install_dir.join(format!("{name}{EXE_SUFFIX}"))
    }

    fn run(&self, name: &str, args: &[&OsStr]) -> std::io::Result<Output> {
        let program = self.component(name);
        debug!("running {:?} {:?}", program, args);
        Command::new(&program).args(args).output()
    }
}

/// Verifies that the compiler, assembler, and extractor exist under `install_dir`.
pub fn verify_toolchain(install_dir: &Path) -> Result<()> {
    ExternalToolchain::new(install_dir).verify()
}

fn diagnostics(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

fn mode_flag(thumb_mode: bool) -> &'static str {
    if thumb_mode {
        "-mthumb"
    } else {
        "-marm"
    }
}

impl Toolchain for ExternalToolchain {
    fn verify(&self) -> Result<()> {
        for name in [COMPILER, ASSEMBLER, EXTRACTOR] {
            let path = self.component(name);
            if !path.is_file() {
                return Err(Error::MissingComponent(path));
            }
        }
        Ok(())
    }

    fn compile(&mut self, source: &Path, assembly: &Path, thumb_mode: bool) -> Result<()> {
        info!("compiling {source:?}");
        let failed = |diagnostics| Error::CompileError {
            file: source.to_path_buf(),
            diagnostics,
        };
        let output = self
            .run(
                COMPILER,
                &[
                    OsStr::new("-S"),
                    OsStr::new("-O2"),
                    OsStr::new("-mcpu=arm7tdmi"),
                    OsStr::new(mode_flag(thumb_mode)),
                    OsStr::new("-mthumb-interwork"),
                    OsStr::new("-fno-toplevel-reorder"),
                    OsStr::new("-o"),
                    assembly.as_os_str(),
                    source.as_os_str(),
                ],
            )
            .map_err(|e| failed(e.to_string()))?;

        // the compiler is quiet on success; any diagnostic fails the build
        let text = diagnostics(&output);
        if !output.status.success() || !text.trim().is_empty() {
            return Err(failed(text));
        }
        Ok(())
    }

    fn assemble(&mut self, assembly: &Path, object: &Path, thumb_mode: bool) -> Result<()> {
        info!("assembling {assembly:?}");
        let failed = |diagnostics| Error::AssembleError {
            file: assembly.to_path_buf(),
            diagnostics,
        };
        let output = self
            .run(
                ASSEMBLER,
                &[
                    OsStr::new("-mcpu=arm7tdmi"),
                    OsStr::new("-mthumb-interwork"),
                    OsStr::new(if thumb_mode {
                        "--defsym=THUMB=1"
                    } else {
                        "--defsym=THUMB=0"
                    }),
                    OsStr::new("-o"),
                    object.as_os_str(),
                    assembly.as_os_str(),
                ],
            )
            .map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(diagnostics(&output)));
        }
        Ok(())
    }

    fn extract(&mut self, object: &Path, binary: &Path) -> Result<()> {
        info!("extracting {object:?}");
        let failed = |diagnostics| Error::ExtractError {
            file: object.to_path_buf(),
            diagnostics,
        };
        let output = self
            .run(
                EXTRACTOR,
                &[
                    OsStr::new("-O"),
                    OsStr::new("binary"),
                    OsStr::new("-j"),
                    OsStr::new(".text"),
                    object.as_os_str(),
                    binary.as_os_str(),
                ],
            )
            .map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(diagnostics(&output)));
        }
        Ok(())
    }
}
