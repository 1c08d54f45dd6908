// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Range-checked erase and program on top of the raw IAP primitive.
//!
//! Nothing in here touches the bootloader pages: every request is checked
//! against the [`FlashLayout`] before it reaches the hardware, and a rejected
//! request leaves flash untouched.

use crate::iap::Iap;
use crate::layout::FlashLayout;
use crate::protocol::{UdpState, PAGES_PER_SECTOR};

/// Round a program request up to the next block size the IAP accepts.
pub const fn program_block_size(count: usize) -> usize {
    if count <= 256 {
        256
    } else if count <= 512 {
        512
    } else if count <= 1024 {
        1024
    } else {
        4096
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlashGuard {
    layout: FlashLayout,
}

impl FlashGuard {
    pub const fn new(layout: FlashLayout) -> Self {
        Self { layout }
    }

    pub const fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// `length` bytes at `start` may be programmed.
    ///
    /// The boot descriptor page is only writable with `is_boot_descriptor` set;
    /// everything else must lie in the application region.
    pub fn address_allowed_to_program(&self, start: u32, length: u32, is_boot_descriptor: bool) -> bool {
        if length == 0 || !self.layout.is_page_aligned(start) {
            return false;
        }
        let Some(end) = start.checked_add(length - 1) else {
            return false;
        };

        if is_boot_descriptor {
            start >= self.layout.boot_descriptor_address() && end < self.layout.application_first_address()
        } else {
            start >= self.layout.application_first_address() && end <= self.layout.flash_end
        }
    }

    pub fn page_allowed_to_erase(&self, page: u32) -> bool {
        page > self.layout.page_of(self.layout.bootloader_end) && page <= self.layout.page_of(self.layout.flash_end)
    }

    pub fn sector_allowed_to_erase(&self, sector: u32) -> bool {
        sector > self.layout.sector_of(self.layout.bootloader_end)
            && sector <= self.layout.sector_of(self.layout.flash_end)
    }

    pub fn erase_page_range<I: Iap + ?Sized>(&self, iap: &mut I, first: u32, last: u32) -> Result<(), UdpState> {
        if first > last || !self.page_allowed_to_erase(first) || !self.page_allowed_to_erase(last) {
            upd_log!(warn, "page erase {}..={} rejected", first, last);
            return Err(UdpState::PageNotAllowedToErase);
        }
        upd_log!(debug, "erase pages {}..={}", first, last);
        iap.erase_pages(first, last).into_result()
    }

    pub fn erase_sector_range<I: Iap + ?Sized>(&self, iap: &mut I, first: u32, last: u32) -> Result<(), UdpState> {
        if first > last || !self.sector_allowed_to_erase(first) || !self.sector_allowed_to_erase(last) {
            upd_log!(warn, "sector erase {}..={} rejected", first, last);
            return Err(UdpState::SectorNotAllowedToErase);
        }
        upd_log!(debug, "erase sectors {}..={}", first, last);
        iap.erase_sectors(first, last).into_result()
    }

    /// Erase every page touched by `start..=end`.
    ///
    /// Short ranges use one page erase. Longer ranges erase the unaligned head
    /// and tail page by page and the whole sectors in between in one go. The
    /// first failing step aborts the rest.
    pub fn erase_range<I: Iap + ?Sized>(
        &self,
        iap: &mut I,
        start: u32,
        end: u32,
        range_check: bool,
    ) -> Result<(), UdpState> {
        let layout = &self.layout;
        if start > end || !layout.contains(start) {
            return Err(UdpState::AddressRangeNotAllowedToErase);
        }
        if range_check && !self.address_allowed_to_program(start, end - start + 1, false) {
            upd_log!(warn, "erase {:#x}..={:#x} outside application", start, end);
            return Err(UdpState::AddressRangeNotAllowedToErase);
        }

        let start_page = layout.page_of(start);
        let end_page = layout.page_of(end);
        if end_page - start_page + 1 < PAGES_PER_SECTOR {
            return self.erase_page_range(iap, start_page, end_page);
        }

        let mut start_sector = layout.sector_of(start);
        if layout.first_page_of_sector(start_sector) != start_page {
            start_sector += 1;
            self.erase_page_range(iap, start_page, layout.first_page_of_sector(start_sector) - 1)?;
        }

        let mut end_sector = layout.sector_of(end);
        let end_sector_first_page = layout.first_page_of_sector(end_sector);
        if end_page - end_sector_first_page + 1 != PAGES_PER_SECTOR {
            self.erase_page_range(iap, end_sector_first_page, end_page)?;
            end_sector = match end_sector.checked_sub(1) {
                Some(sector) => sector,
                None => return Ok(()),
            };
        }

        if start_sector <= end_sector {
            self.erase_sector_range(iap, start_sector, end_sector)?;
        }
        Ok(())
    }

    /// Erase everything after the bootloader, descriptor page included.
    pub fn erase_full_flash<I: Iap + ?Sized>(&self, iap: &mut I) -> Result<(), UdpState> {
        let layout = &self.layout;
        let first = layout.address_of_page(layout.page_of(layout.bootloader_end) + 1);
        self.erase_range(iap, first, layout.flash_end, false)
    }

    pub fn program_page<I: Iap + ?Sized>(
        &self,
        iap: &mut I,
        address: u32,
        data: &[u8],
        is_boot_descriptor: bool,
    ) -> Result<(), UdpState> {
        let allowed = u32::try_from(data.len())
            .is_ok_and(|len| self.address_allowed_to_program(address, len, is_boot_descriptor));
        if !allowed {
            upd_log!(warn, "program {:#x} (+{}) rejected", address, data.len());
            return Err(UdpState::AddressNotAllowedToFlash);
        }

        let result = iap.program(address, data).into_result();
        match result {
            Ok(()) => upd_log!(debug, "programmed {} bytes at {:#x}", data.len(), address),
            Err(state) => upd_log!(error, "program {:#x} failed: {:?}", address, state),
        }
        result
    }

    /// Erase the single page containing `address`.
    pub fn erase_page_at<I: Iap + ?Sized>(&self, iap: &mut I, address: u32) -> Result<(), UdpState> {
        let page = self.layout.page_of(self.layout.page_floor(address));
        self.erase_page_range(iap, page, page)
    }
}
