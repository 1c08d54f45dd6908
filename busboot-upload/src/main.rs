// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware upload tool for bus bootloaders, driving an emulated device.
//!
//! Usage:
//!   busboot-upload init
//!   busboot-upload upload firmware.bin
//!   busboot-upload upload firmware-v2.bin --diff firmware.bin
//!   busboot-upload --device other.bin status

mod cli;
mod commands;
mod device;
mod diff;
mod transport;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    cli::run(args)
}
