// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware-update engine for bus bootloaders.
//!
//! This crate supports both `no_std` (embedded) and `std` (host) environments:
//! - Default: `no_std`, no allocation, no logging
//! - `std` feature: `std::error::Error` for [`UdpState`], used by host tools
//! - `defmt` / `log` features: emit diagnostics through the selected backend
//!
//! The hardware is reached only through the [`Iap`] and [`Link`] traits, so the
//! whole engine runs unchanged against simulated flash on a host.

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
mod fmt;

pub mod checksum;
pub mod decompressor;
pub mod descriptor;
pub mod engine;
pub mod flash_guard;
pub mod iap;
pub mod layout;
pub mod protocol;
pub mod session;

// Re-export commonly used types
pub use decompressor::{CopySource, DecoderState, Decompressor, PatchCommand};
pub use descriptor::AppDescriptionBlock;
pub use engine::{EngineConfig, ProtocolEngine, Version};
pub use flash_guard::FlashGuard;
pub use iap::{Iap, IapStatus, Link, LinkPause, LinkStatistic};
pub use layout::FlashLayout;
pub use protocol::{Command, Response, UdpState, UpdCode};
pub use protocol::{FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, STAGING_BUFFER_SIZE};
pub use session::UpdateSession;
