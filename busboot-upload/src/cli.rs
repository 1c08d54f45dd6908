// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::num;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use busboot_common::protocol::IAP_UID_LENGTH;

use crate::commands;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "busboot-upload")]
#[command(about = "Firmware upload tool for bus bootloaders (emulated device)")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Device snapshot file
    #[arg(short, long, global = true, default_value = "device.bin")]
    pub device: PathBuf,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a blank device with an empty application area
    Init {
        /// 16-byte chip UID as 32 hex digits
        #[arg(long, value_parser = parse_uid, default_value = "0123456789abcdeffedcba9876543210")]
        uid: [u8; IAP_UID_LENGTH],
    },

    /// Query bootloader version, features and application start
    Identity,

    /// Show boot descriptor, application version and link statistics
    Status,

    /// Read the UID (presses the programming button) and unlock the device
    Unlock,

    /// Upload a firmware image and install its boot descriptor
    Upload {
        /// Firmware binary file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Start address (defaults to the first application address)
        #[arg(short, long, value_parser = parse_maybe_hex, conflicts_with = "diff")]
        address: Option<u32>,

        /// Send a patch against this image, which must be the one installed
        #[arg(long, value_name = "OLD")]
        diff: Option<PathBuf>,

        /// Data bytes per SendData frame
        #[arg(short, long, default_value = "12", value_parser = clap::value_parser!(u8).range(1..=252))]
        frame_size: u8,
    },

    /// Erase the complete application area or an address range
    Erase {
        #[arg(long, value_parser = parse_maybe_hex, requires = "end")]
        start: Option<u32>,

        #[arg(long, value_parser = parse_maybe_hex, requires = "start")]
        end: Option<u32>,
    },

    /// Print a flash range as hex
    Dump {
        #[arg(value_parser = parse_maybe_hex)]
        start: u32,

        #[arg(value_parser = parse_maybe_hex)]
        end: u32,
    },
}

fn parse_maybe_hex(arg: &str) -> Result<u32, num::ParseIntError> {
    if let Some(hex) = arg.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        arg.parse::<u32>()
    }
}

fn parse_uid(arg: &str) -> Result<[u8; IAP_UID_LENGTH], String> {
    if arg.len() != IAP_UID_LENGTH * 2 || !arg.is_ascii() {
        return Err(format!("expected {} hex digits", IAP_UID_LENGTH * 2));
    }
    let mut uid = [0u8; IAP_UID_LENGTH];
    for (byte, pair) in uid.iter_mut().zip(arg.as_bytes().chunks(2)) {
        let digits = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
        *byte = u8::from_str_radix(digits, 16).map_err(|e| e.to_string())?;
    }
    Ok(uid)
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    let path = cli.device.as_path();

    match cli.command {
        Commands::Init { uid } => commands::init(path, uid),
        Commands::Identity => commands::identity(path),
        Commands::Status => commands::status(path),
        Commands::Unlock => commands::unlock(path),
        Commands::Upload {
            file,
            address,
            diff,
            frame_size,
        } => match diff {
            Some(old) => commands::upload_diff(path, &file, &old, frame_size),
            None => commands::upload(path, &file, address, frame_size),
        },
        Commands::Erase { start, end } => commands::erase(path, start.zip(end)),
        Commands::Dump { start, end } => commands::dump(path, start, end),
    }
}
