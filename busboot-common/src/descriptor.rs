// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Application description block stored in the boot descriptor page.

use crate::checksum::flash_crc32;
use crate::iap::Iap;
use crate::layout::FlashLayout;
use crate::protocol::{le_u32, APP_VERSION_LENGTH, BL_ID_STRING};

/// Where the application lives and the CRC it must match.
///
/// Layout on flash (16 bytes, little-endian):
/// - 0x00: start_address
/// - 0x04: end_address (inclusive)
/// - 0x08: crc
/// - 0x0C: app_version_address
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppDescriptionBlock {
    pub start_address: u32,
    pub end_address: u32,
    pub crc: u32,
    pub app_version_address: u32,
}

impl AppDescriptionBlock {
    pub const SIZE: usize = 16;

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            start_address: le_u32(bytes, 0)?,
            end_address: le_u32(bytes, 4)?,
            crc: le_u32(bytes, 8)?,
            app_version_address: le_u32(bytes, 12)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.start_address.to_le_bytes());
        out[4..8].copy_from_slice(&self.end_address.to_le_bytes());
        out[8..12].copy_from_slice(&self.crc.to_le_bytes());
        out[12..16].copy_from_slice(&self.app_version_address.to_le_bytes());
        out
    }

    pub fn read_from<I: Iap + ?Sized>(iap: &I, address: u32) -> Self {
        let mut raw = [0u8; Self::SIZE];
        iap.read(address, &mut raw);
        Self {
            start_address: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            end_address: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            crc: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            app_version_address: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    /// The installed descriptor of `layout`.
    pub fn installed<I: Iap + ?Sized>(layout: &FlashLayout, iap: &I) -> Self {
        Self::read_from(iap, layout.boot_descriptor_address())
    }

    /// Addresses lie inside the application region and are ordered.
    pub fn has_plausible_range(&self, layout: &FlashLayout) -> bool {
        self.start_address >= layout.application_first_address()
            && self.start_address <= layout.flash_end
            && self.end_address <= layout.flash_end
            && self.start_address <= self.end_address
    }

    /// Range is plausible and the application on flash matches the CRC.
    pub fn check_application<I: Iap + ?Sized>(&self, layout: &FlashLayout, iap: &I) -> bool {
        if !self.has_plausible_range(layout) {
            return false;
        }
        let len = self.end_address - self.start_address + 1;
        flash_crc32(iap, self.start_address, len) == self.crc
    }

    /// Base address of the installed image, or the application start when none is valid.
    pub fn firmware_start_address<I: Iap + ?Sized>(&self, layout: &FlashLayout, iap: &I) -> u32 {
        if self.check_application(layout, iap) {
            self.start_address
        } else {
            layout.application_first_address()
        }
    }

    /// Version string the application advertises, or the bootloader id.
    pub fn app_version<I: Iap + ?Sized>(&self, layout: &FlashLayout, iap: &I) -> [u8; APP_VERSION_LENGTH] {
        let address = self.app_version_address;
        if address >= layout.application_first_address() && address < layout.flash_end.saturating_sub(4) {
            let mut version = [0u8; APP_VERSION_LENGTH];
            iap.read(address, &mut version);
            version
        } else {
            BL_ID_STRING
        }
    }
}
