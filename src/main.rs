// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use env_logger::Env;
use log::debug;

use romchunk::cli::{self, NewPatch};
use romchunk::config::{self, Config, TOOLCHAIN_ENV};
use romchunk::display;
use romchunk::patch::toolchain::ExternalToolchain;
use romchunk::patch::{HookString, PatchType};
use romchunk::ChunkType;

/// Inspect the chunks stored in a GBA ROM and build code patches into it.
#[derive(Debug, Parser)]
#[clap(name = env!("CARGO_CRATE_NAME"), version)]
#[command(version, about, long_about = None)]
pub struct App {
    #[arg(required = false)]
    rom: Option<PathBuf>,

    /// more logging; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// where arm-none-eabi-gcc, -as, and -objcopy are installed
    #[arg(long, env = TOOLCHAIN_ENV, global = true)]
    toolchain_dir: Option<PathBuf>,

    /// first address of the free space, in hex
    #[arg(long, value_parser = config::parse_address, global = true)]
    free_space_start: Option<usize>,

    #[clap(subcommand)]
    command: Option<CLICommand>,
}

#[derive(Debug, Subcommand)]
enum CLICommand {
    /// List the chunks stored in the ROM
    List {
        /// a GBA ROM
        #[arg(required = true)]
        rom: PathBuf,

        /// include invalidated chunks
        #[clap(short, long)]
        all: bool,

        /// dump each chunk's payload in hex
        #[clap(short, long)]
        payload: bool,

        /// only list chunks of this type
        #[clap(short = 't', long = "type")]
        chunk_type: Option<ChunkType>,
    },

    /// Print the ROM's patch list
    Patches {
        /// a GBA ROM
        #[arg(required = true)]
        rom: PathBuf,
    },

    /// Add, remove, or rebuild patches
    Patch {
        #[clap(subcommand)]
        command: PatchCommand,
    },

    /// Invalidate the chunk at an address
    Invalidate {
        /// the ROM to modify
        #[arg(required = true)]
        rom: PathBuf,

        /// the chunk's address, in hex
        #[arg(required = true, value_parser = config::parse_address)]
        address: usize,
    },

    /// Check that the toolchain is installed
    Toolchain,
}

#[derive(Debug, Subcommand)]
enum PatchCommand {
    /// Build a source file into the ROM and hook it
    Add {
        /// the ROM to modify
        #[arg(required = true)]
        rom: PathBuf,

        /// a C, assembly, or binary file beneath the ROM's directory
        #[arg(required = true)]
        file: PathBuf,

        /// how to build the file; guessed from its extension when omitted
        #[clap(short = 't', long = "type")]
        patch_type: Option<PatchType>,

        /// where to hook the patch, in hex; omit for a stub
        #[clap(long, value_parser = config::parse_address)]
        hook: Option<usize>,

        /// build and hook Thumb code
        #[clap(long)]
        thumb: bool,

        /// bytes to write at the hook, with P marking the patch address
        #[clap(long)]
        hook_string: Option<HookString>,

        #[clap(short, long, default_value = "")]
        description: String,
    },

    /// Remove a patch, restoring the bytes under its hook
    Remove {
        /// the ROM to modify
        #[arg(required = true)]
        rom: PathBuf,

        /// the patch's file, as shown by `patches`
        #[arg(required = true)]
        file: String,
    },

    /// Rebuild every patch from its sources
    Rebuild {
        /// the ROM to modify
        #[arg(required = true)]
        rom: PathBuf,
    },
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> Result<()> {
    let args = App::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(log_filter(args.verbose)))
        .init();

    let config = Config::default()
        .with_free_space_start(args.free_space_start)
        .with_toolchain_dir(args.toolchain_dir);
    debug!("{config:?}");

    // only verified when a build needs it
    let mut toolchain = ExternalToolchain::new(&config.toolchain_dir().unwrap_or_default());
    let mut out = std::io::stdout();

    match args.command {
        Some(command) => match command {
            CLICommand::List {
                rom,
                all,
                payload,
                chunk_type,
            } => {
                let mut options = display::Options {
                    include_invalidated: all,
                    ..Default::default()
                };
                if payload {
                    options.payload_format = display::PayloadFormat::Hex;
                }
                cli::list(&mut out, &rom, &config, options, chunk_type)?
            }
            CLICommand::Patches { rom } => cli::patches(&mut out, &rom, &config)?,
            CLICommand::Patch { command } => match command {
                PatchCommand::Add {
                    rom,
                    file,
                    patch_type,
                    hook,
                    thumb,
                    hook_string,
                    description,
                } => {
                    let patch = NewPatch {
                        file,
                        patch_type,
                        hook_address: hook,
                        thumb_mode: thumb,
                        hook_string,
                        description,
                    };
                    cli::patch_add(&mut out, &rom, &config, &patch, &mut toolchain)?
                }
                PatchCommand::Remove { rom, file } => {
                    cli::patch_remove(&mut out, &rom, &config, &file)?
                }
                PatchCommand::Rebuild { rom } => {
                    cli::patch_rebuild(&mut out, &rom, &config, &mut toolchain)?
                }
            },
            CLICommand::Invalidate { rom, address } => {
                cli::invalidate(&mut out, &rom, &config, address)?
            }
            CLICommand::Toolchain => cli::toolchain(&mut out, &config)?,
        },
        None => match args.rom {
            Some(rom) => cli::list(
                &mut out,
                &rom,
                &config,
                display::Options::default(),
                None,
            )?,
            None => {
                let a = App::command().render_help();
                eprintln!("{}", a);
            }
        },
    }

    Ok(())
}
