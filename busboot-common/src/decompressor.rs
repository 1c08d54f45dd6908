// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Streaming decoder for differential firmware updates.
//!
//! The patch stream rebuilds the new image one flash page at a time in a
//! scratchpad. Each command is either a RAW run of literal bytes or a COPY from
//! somewhere the device already has the data:
//!
//! ```text
//! byte 0   : C L n n n n n n    C = COPY (1) / RAW (0), L = long length
//! [byte 1] : n n n n n n n n    low length byte when L is set
//! COPY only: a0 a1 a2           a0 bit 7 set = recent pages, else previous image
//!                                offset = (a0 & 0x7F) << 16 | a1 << 8 | a2
//! RAW only : <length literal bytes>
//! ```
//!
//! Because the new image overwrites the old one in place, the old contents of
//! the last two committed pages are kept in RAM ("recent pages").

use crate::checksum::crc32;
use crate::descriptor::AppDescriptionBlock;
use crate::flash_guard::FlashGuard;
use crate::iap::Iap;
use crate::layout::FlashLayout;
use crate::protocol::{UdpState, FLASH_PAGE_SIZE};

const PAGE: usize = FLASH_PAGE_SIZE as usize;

/// Pages of old flash content kept for COPY commands.
pub const RECENT_PAGES: usize = 2;
pub const RECENT_PAGES_SIZE: usize = RECENT_PAGES * PAGE;

pub const CMD_COPY: u8 = 0x80;
pub const FLAG_LONG: u8 = 0x40;
pub const LENGTH_MASK: u8 = 0x3F;
pub const ADDR_FROM_RECENT: u8 = 0x80;
pub const MAX_SHORT_LENGTH: u16 = LENGTH_MASK as u16;
pub const MAX_LONG_LENGTH: u16 = ((LENGTH_MASK as u16) << 8) | 0xFF;
pub const MAX_COPY_OFFSET: u32 = 0x7F_FFFF;
/// Longest command header: code, long length, three address bytes.
pub const MAX_HEADER_LEN: usize = 5;

// --- Header helpers ---

pub const fn is_copy(b0: u8) -> bool {
    b0 & CMD_COPY != 0
}

pub const fn is_long(b0: u8) -> bool {
    b0 & FLAG_LONG != 0
}

/// Header bytes implied by the first command byte.
pub const fn header_len(b0: u8) -> usize {
    1 + is_long(b0) as usize + if is_copy(b0) { 3 } else { 0 }
}

/// Payload length of a complete header.
pub fn length(header: &[u8]) -> Option<u16> {
    let b0 = *header.first()?;
    let short = u16::from(b0 & LENGTH_MASK);
    if is_long(b0) {
        Some((short << 8) | u16::from(*header.get(1)?))
    } else {
        Some(short)
    }
}

/// Source of a complete COPY header; `None` for RAW headers.
pub fn copy_source(header: &[u8]) -> Option<CopySource> {
    let b0 = *header.first()?;
    if !is_copy(b0) {
        return None;
    }
    let at = 1 + is_long(b0) as usize;
    let address = header.get(at..at + 3)?;
    let offset = (u32::from(address[0] & 0x7F) << 16) | (u32::from(address[1]) << 8) | u32::from(address[2]);
    if address[0] & ADDR_FROM_RECENT != 0 {
        Some(CopySource::RecentPages(offset))
    } else {
        Some(CopySource::PreviousImage(offset))
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySource {
    /// Offset into the old contents of the two previously committed pages.
    RecentPages(u32),
    /// Offset from the start of the image being replaced.
    PreviousImage(u32),
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchCommand {
    Raw { length: u16 },
    Copy { length: u16, source: CopySource },
}

impl PatchCommand {
    pub fn decode(header: &[u8]) -> Option<Self> {
        let b0 = *header.first()?;
        if header.len() < header_len(b0) {
            return None;
        }
        let length = length(header)?;
        match copy_source(header) {
            Some(source) => Some(PatchCommand::Copy { length, source }),
            None => Some(PatchCommand::Raw { length }),
        }
    }

    pub fn length(&self) -> u16 {
        match *self {
            PatchCommand::Raw { length } | PatchCommand::Copy { length, .. } => length,
        }
    }

    /// Header bytes for this command, and how many of them are used.
    ///
    /// Lengths above [`MAX_LONG_LENGTH`] and offsets above [`MAX_COPY_OFFSET`]
    /// are truncated to their field width.
    pub fn encode(&self) -> ([u8; MAX_HEADER_LEN], usize) {
        let mut out = [0u8; MAX_HEADER_LEN];
        let length = self.length() & MAX_LONG_LENGTH;
        let kind = match self {
            PatchCommand::Raw { .. } => 0,
            PatchCommand::Copy { .. } => CMD_COPY,
        };

        let mut len = if length > MAX_SHORT_LENGTH {
            out[0] = kind | FLAG_LONG | (length >> 8) as u8;
            out[1] = length as u8;
            2
        } else {
            out[0] = kind | length as u8;
            1
        };

        if let PatchCommand::Copy { source, .. } = *self {
            let (flag, offset) = match source {
                CopySource::RecentPages(offset) => (ADDR_FROM_RECENT, offset),
                CopySource::PreviousImage(offset) => (0, offset),
            };
            let offset = offset & MAX_COPY_OFFSET;
            out[len] = flag | (offset >> 16) as u8;
            out[len + 1] = (offset >> 8) as u8;
            out[len + 2] = offset as u8;
            len += 3;
        }
        (out, len)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    ExpectCommandByte,
    ExpectCommandParams,
    ExpectRawData,
}

/// Rebuilds pages of a new image from a patch stream and commits them in place.
pub struct Decompressor {
    state: DecoderState,
    cmd_buffer: [u8; MAX_HEADER_LEN],
    cmd_len: usize,
    expected_len: usize,
    raw_remaining: u16,
    scratchpad: [u8; PAGE],
    recent_pages: [u8; RECENT_PAGES_SIZE],
    bytes_to_flash: u16,
    cursor: u32,
    image_start: u32,
    layout: FlashLayout,
}

impl Decompressor {
    /// Start rebuilding an image at `image_start`, which is also the base of
    /// the previous image for COPY commands.
    pub fn new(layout: FlashLayout, image_start: u32) -> Self {
        Self {
            state: DecoderState::ExpectCommandByte,
            cmd_buffer: [0; MAX_HEADER_LEN],
            cmd_len: 0,
            expected_len: 0,
            raw_remaining: 0,
            scratchpad: [0; PAGE],
            recent_pages: [0; RECENT_PAGES_SIZE],
            bytes_to_flash: 0,
            cursor: image_start,
            image_start,
            layout,
        }
    }

    /// Patch against the application currently described by the boot descriptor.
    pub fn for_installed_image<I: Iap + ?Sized>(layout: FlashLayout, iap: &I) -> Self {
        let image_start = AppDescriptionBlock::installed(&layout, iap).firmware_start_address(&layout, iap);
        upd_log!(info, "diff update based at {:#x}", image_start);
        Self::new(layout, image_start)
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn bytes_to_flash(&self) -> u16 {
        self.bytes_to_flash
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn image_start(&self) -> u32 {
        self.image_start
    }

    /// The page rebuilt so far.
    pub fn pending(&self) -> &[u8] {
        &self.scratchpad[..usize::from(self.bytes_to_flash)]
    }

    pub fn crc32(&self) -> u32 {
        crc32(self.pending())
    }

    fn reset_state(&mut self) {
        self.state = DecoderState::ExpectCommandByte;
        self.cmd_len = 0;
        self.expected_len = 0;
        self.raw_remaining = 0;
    }

    /// Feed one byte of the patch stream.
    ///
    /// A command that would overflow the scratchpad or read outside its source
    /// is rejected before any of it executes, and the decoder waits for a new
    /// command byte.
    pub fn put_byte<I: Iap + ?Sized>(&mut self, iap: &I, byte: u8) -> Result<(), UdpState> {
        match self.state {
            DecoderState::ExpectCommandByte => {
                self.cmd_buffer[0] = byte;
                self.cmd_len = 1;
                self.expected_len = header_len(byte);
                if self.expected_len == 1 {
                    return self.execute(iap);
                }
                self.state = DecoderState::ExpectCommandParams;
                Ok(())
            }
            DecoderState::ExpectCommandParams => {
                self.cmd_buffer[self.cmd_len] = byte;
                self.cmd_len += 1;
                if self.cmd_len == self.expected_len {
                    return self.execute(iap);
                }
                Ok(())
            }
            DecoderState::ExpectRawData => {
                let at = usize::from(self.bytes_to_flash);
                let Some(slot) = self.scratchpad.get_mut(at) else {
                    self.reset_state();
                    return Err(UdpState::RamBufferOverflow);
                };
                *slot = byte;
                self.bytes_to_flash += 1;
                self.raw_remaining -= 1;
                if self.raw_remaining == 0 {
                    self.state = DecoderState::ExpectCommandByte;
                }
                Ok(())
            }
        }
    }

    fn execute<I: Iap + ?Sized>(&mut self, iap: &I) -> Result<(), UdpState> {
        let result = self.try_execute(iap);
        if let Err(state) = result {
            upd_log!(warn, "patch command rejected: {:?}", state);
            self.reset_state();
        }
        result
    }

    fn try_execute<I: Iap + ?Sized>(&mut self, iap: &I) -> Result<(), UdpState> {
        let command = PatchCommand::decode(&self.cmd_buffer[..self.cmd_len]).ok_or(UdpState::InvalidData)?;
        let start = usize::from(self.bytes_to_flash);
        let length = usize::from(command.length());
        if start + length > PAGE {
            return Err(UdpState::RamBufferOverflow);
        }

        match command {
            PatchCommand::Raw { length: 0 } => {
                self.state = DecoderState::ExpectCommandByte;
            }
            PatchCommand::Raw { length } => {
                self.raw_remaining = length;
                self.state = DecoderState::ExpectRawData;
            }
            PatchCommand::Copy { source, .. } => {
                let target = &mut self.scratchpad[start..start + length];
                match source {
                    CopySource::RecentPages(offset) => {
                        let offset = offset as usize;
                        let from = self
                            .recent_pages
                            .get(offset..offset + length)
                            .ok_or(UdpState::InvalidData)?;
                        target.copy_from_slice(from);
                    }
                    CopySource::PreviousImage(offset) => {
                        let address = self.image_start.checked_add(offset).ok_or(UdpState::InvalidData)?;
                        if !self.layout.contains_range(address, length as u32) {
                            return Err(UdpState::InvalidData);
                        }
                        iap.read(address, target);
                    }
                }
                self.bytes_to_flash += command.length();
                self.state = DecoderState::ExpectCommandByte;
            }
        }
        Ok(())
    }

    /// Commit the rebuilt page at the cursor and move on to the next page.
    ///
    /// The old page content is remembered for later COPY commands. Flash is only
    /// erased and programmed when the rebuilt bytes differ from what is there.
    pub fn page_completed_do_flash<I: Iap + ?Sized>(&mut self, guard: &FlashGuard, iap: &mut I) -> Result<(), UdpState> {
        let cursor = self.cursor;
        self.recent_pages.copy_within(PAGE.., 0);
        iap.read(cursor, &mut self.recent_pages[PAGE..]);

        let used = usize::from(self.bytes_to_flash);
        let unchanged = self.recent_pages[PAGE..PAGE + used] == self.scratchpad[..used];

        let result = if unchanged {
            upd_log!(debug, "page {:#x} unchanged", cursor);
            Ok(())
        } else {
            guard
                .erase_page_at(iap, cursor)
                .and_then(|()| guard.program_page(iap, cursor, &self.scratchpad, false))
        };

        self.cursor = cursor.wrapping_add(FLASH_PAGE_SIZE);
        self.bytes_to_flash = 0;
        self.scratchpad.fill(0);
        result
    }
}
