// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Emulated target: flash array, UID and bus link, persisted between runs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use busboot_common::iap::{Iap, IapStatus, Link, LinkStatistic};
use busboot_common::protocol::{FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, IAP_UID_LENGTH};
use busboot_common::FlashLayout;

/// Flash contents and identity of the emulated part.
#[derive(Serialize, Deserialize)]
pub struct EmulatedDevice {
    pub layout: FlashLayout,
    pub uid: [u8; IAP_UID_LENGTH],
    pub flash: Vec<u8>,
    pub statistic: LinkStatistic,
}

impl EmulatedDevice {
    /// A blank part: bootloader region filled with a marker, everything else erased.
    pub fn new(layout: FlashLayout, uid: [u8; IAP_UID_LENGTH]) -> Self {
        let mut flash = vec![0xFF; layout.flash_size() as usize];
        let bootloader = (layout.bootloader_start - layout.flash_start) as usize
            ..=(layout.bootloader_end - layout.flash_start) as usize;
        flash[bootloader].fill(0xB1);
        Self {
            layout,
            uid,
            flash,
            statistic: LinkStatistic::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read device snapshot {} (run `init` first)", path.display()))?;
        let device: Self = postcard::from_bytes(&bytes).context("Device snapshot is corrupt")?;
        log::debug!("loaded {} bytes of flash from {}", device.flash.len(), path.display());
        Ok(device)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = postcard::to_stdvec(self).context("Failed to serialize device")?;
        fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn offset(&self, address: u32) -> Option<usize> {
        let at = address.checked_sub(self.layout.flash_start)? as usize;
        (at < self.flash.len()).then_some(at)
    }

    /// Flash bytes `start..=end`, clamped to the part.
    pub fn slice(&self, start: u32, end: u32) -> &[u8] {
        match (self.offset(start), self.offset(end)) {
            (Some(first), Some(last)) if first <= last => &self.flash[first..=last],
            _ => &[],
        }
    }

    fn erase(&mut self, address: u32, len: u32) -> IapStatus {
        let Some(at) = self.offset(address) else {
            return IapStatus::InvalidSector;
        };
        match self.flash.get_mut(at..at + len as usize) {
            Some(region) => {
                region.fill(0xFF);
                IapStatus::CmdSuccess
            }
            None => IapStatus::InvalidSector,
        }
    }
}

impl Iap for EmulatedDevice {
    fn erase_pages(&mut self, first: u32, last: u32) -> IapStatus {
        if first > last {
            return IapStatus::InvalidSector;
        }
        log::trace!("IAP erase pages {}..={}", first, last);
        self.erase(self.layout.address_of_page(first), (last - first + 1) * FLASH_PAGE_SIZE)
    }

    fn erase_sectors(&mut self, first: u32, last: u32) -> IapStatus {
        if first > last {
            return IapStatus::InvalidSector;
        }
        log::trace!("IAP erase sectors {}..={}", first, last);
        self.erase(self.layout.address_of_sector(first), (last - first + 1) * FLASH_SECTOR_SIZE)
    }

    fn program(&mut self, address: u32, data: &[u8]) -> IapStatus {
        if !self.layout.is_page_aligned(address) {
            return IapStatus::DstAddrError;
        }
        if ![256, 512, 1024, 4096].contains(&data.len()) {
            return IapStatus::CountError;
        }
        let Some(at) = self.offset(address) else {
            return IapStatus::DstAddrNotMapped;
        };
        let Some(region) = self.flash.get_mut(at..at + data.len()) else {
            return IapStatus::DstAddrNotMapped;
        };
        log::trace!("IAP program {} bytes at {:#x}", data.len(), address);
        // NOR flash: programming only clears bits.
        region.iter_mut().zip(data).for_each(|(cell, byte)| *cell &= byte);
        if region != data {
            return IapStatus::CompareError;
        }
        IapStatus::CmdSuccess
    }

    fn read_uid(&self) -> Result<[u8; IAP_UID_LENGTH], IapStatus> {
        Ok(self.uid)
    }

    fn read(&self, address: u32, buf: &mut [u8]) {
        for (i, out) in buf.iter_mut().enumerate() {
            *out = address
                .checked_add(i as u32)
                .and_then(|a| self.offset(a))
                .map_or(0xFF, |at| self.flash[at]);
        }
    }
}

/// Bus side of the emulated device.
#[derive(Default)]
pub struct EmulatedLink {
    pub statistic: LinkStatistic,
    pub button_pressed: bool,
    pub paused: bool,
    /// Ranges requested with `DumpFlash`.
    pub dumps: Vec<(u32, u32)>,
}

impl Link for EmulatedLink {
    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn is_idle(&self) -> bool {
        !self.paused
    }

    fn programming_button_pressed(&self) -> bool {
        self.button_pressed
    }

    fn statistic(&self) -> LinkStatistic {
        self.statistic
    }

    fn dump(&mut self, start: u32, end: u32) {
        self.dumps.push((start, end));
    }
}
