// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash address space: bootloader, boot descriptor page and application region.

use crate::protocol::{FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};

/// Memory boundaries of one part. All `*_end` addresses are inclusive.
///
/// ```text
/// flash_start                                                     flash_end
/// | bootloader ... | (pad) | boot descriptor page | application ...      |
///                          ^ boot_descriptor_address
///                                                 ^ application_first_address
/// ```
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlashLayout {
    pub flash_start: u32,
    pub flash_end: u32,
    pub bootloader_start: u32,
    pub bootloader_end: u32,
}

const fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

impl FlashLayout {
    /// LPC11xx with 64 KiB flash and a 0x2F00-byte bootloader:
    /// descriptor at 0x2F00, application from 0x3000.
    pub const LPC11XX_64K: FlashLayout = FlashLayout::new(0, 0x1_0000, 0, 0x2F00);

    pub const fn new(flash_start: u32, flash_size: u32, bootloader_start: u32, bootloader_size: u32) -> Self {
        Self {
            flash_start,
            flash_end: flash_start.saturating_add(flash_size).saturating_sub(1),
            bootloader_start,
            bootloader_end: bootloader_start.saturating_add(bootloader_size).saturating_sub(1),
        }
    }

    /// Build a layout from exclusive upper bounds, the way linker scripts
    /// export region ends (`top` is one past the last byte).
    pub const fn from_bounds(flash_start: u32, flash_top: u32, bootloader_start: u32, bootloader_top: u32) -> Self {
        Self {
            flash_start,
            flash_end: flash_top.saturating_sub(1),
            bootloader_start,
            bootloader_end: bootloader_top.saturating_sub(1),
        }
    }

    /// Read the layout from linker symbols. `__flash_end` and
    /// `__bootloader_end` point one past the last byte of their region.
    #[cfg(target_os = "none")]
    pub fn from_linker() -> Self {
        unsafe extern "C" {
            static __flash_start: u32;
            static __flash_end: u32;
            static __bootloader_start: u32;
            static __bootloader_end: u32;
        }

        macro_rules! linker_addr {
            ($sym:ident) => {
                unsafe { &$sym as *const u32 as u32 }
            };
        }

        Self::from_bounds(
            linker_addr!(__flash_start),
            linker_addr!(__flash_end),
            linker_addr!(__bootloader_start),
            linker_addr!(__bootloader_end),
        )
    }

    pub const fn flash_size(&self) -> u32 {
        self.flash_end - self.flash_start + 1
    }

    /// First page after the bootloader that leaves a full page for the descriptor.
    pub const fn application_first_address(&self) -> u32 {
        align_up(self.bootloader_end + 1 + FLASH_PAGE_SIZE, FLASH_PAGE_SIZE)
    }

    pub const fn boot_descriptor_address(&self) -> u32 {
        self.application_first_address() - FLASH_PAGE_SIZE
    }

    pub const fn boot_descriptor_page(&self) -> u32 {
        self.page_of(self.boot_descriptor_address())
    }

    // --- Page / sector arithmetic (relative to flash_start) ---

    pub const fn page_of(&self, address: u32) -> u32 {
        (address - self.flash_start) / FLASH_PAGE_SIZE
    }

    pub const fn sector_of(&self, address: u32) -> u32 {
        (address - self.flash_start) / FLASH_SECTOR_SIZE
    }

    pub const fn address_of_page(&self, page: u32) -> u32 {
        self.flash_start + page * FLASH_PAGE_SIZE
    }

    pub const fn address_of_sector(&self, sector: u32) -> u32 {
        self.flash_start + sector * FLASH_SECTOR_SIZE
    }

    pub const fn first_page_of_sector(&self, sector: u32) -> u32 {
        self.page_of(self.address_of_sector(sector))
    }

    pub const fn page_floor(&self, address: u32) -> u32 {
        self.address_of_page(self.page_of(address))
    }

    /// Start of the page following the one containing `address`, unless already aligned.
    pub const fn page_ceil(&self, address: u32) -> u32 {
        let floor = self.page_floor(address);
        if floor == address {
            address
        } else {
            floor + FLASH_PAGE_SIZE
        }
    }

    pub const fn is_page_aligned(&self, address: u32) -> bool {
        (address.wrapping_sub(self.flash_start)) % FLASH_PAGE_SIZE == 0
    }

    pub const fn is_sector_aligned(&self, address: u32) -> bool {
        (address.wrapping_sub(self.flash_start)) % FLASH_SECTOR_SIZE == 0
    }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.flash_start && address <= self.flash_end
    }

    /// `len` bytes from `address` lie entirely inside flash.
    pub fn contains_range(&self, address: u32, len: u32) -> bool {
        if len == 0 {
            return self.contains(address);
        }
        match address.checked_add(len - 1) {
            Some(last) => self.contains(address) && self.contains(last),
            None => false,
        }
    }

    pub const fn is_in_application(&self, address: u32) -> bool {
        address >= self.application_first_address() && address <= self.flash_end
    }
}
