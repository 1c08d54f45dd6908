// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Request dispatcher of the update protocol.
//!
//! [`ProtocolEngine::handle_inbound_payload`] takes one received payload and
//! returns the reply. Commands that change state only acknowledge; the host
//! reads their outcome with `SendLastError`. Commands that return data send
//! their own reply, or the error reply when they fail.

use crate::checksum::crc32;
use crate::decompressor::Decompressor;
use crate::descriptor::AppDescriptionBlock;
use crate::flash_guard::{program_block_size, FlashGuard};
use crate::iap::{Iap, Link, LinkPause};
use crate::layout::FlashLayout;
use crate::protocol::{
    BootloaderIdentity, Command, Response, Statistic, UdpState, UpdCode, FLASH_PAGE_SIZE, STAGING_BUFFER_SIZE,
    UID_LENGTH,
};
use crate::session::UpdateSession;

const PAGE: usize = FLASH_PAGE_SIZE as usize;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

/// Capabilities and versions reported in the bootloader identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Accept differential updates.
    pub diff_support: bool,
    /// Accept `DumpFlash`.
    pub debug: bool,
    pub version: Version,
    pub library_version: Version,
    /// Oldest host tool this bootloader talks to.
    pub min_tool_version: Version,
}

impl EngineConfig {
    pub const FEATURE_DIFF: u16 = 0x0100;
    pub const FEATURE_DEBUG: u16 = 0x8000;

    pub const fn features(&self) -> u16 {
        let mut features = 0;
        if self.diff_support {
            features |= Self::FEATURE_DIFF;
        }
        if self.debug {
            features |= Self::FEATURE_DEBUG;
        }
        features
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            diff_support: true,
            debug: false,
            version: Version::new(1, 10),
            library_version: Version::new(0, 1),
            min_tool_version: Version::new(1, 0),
        }
    }
}

pub struct ProtocolEngine<I: Iap, L: Link> {
    config: EngineConfig,
    guard: FlashGuard,
    session: UpdateSession,
    decompressor: Option<Decompressor>,
    iap: I,
    link: L,
}

impl<I: Iap, L: Link> ProtocolEngine<I, L> {
    /// A new engine starts locked.
    pub fn new(layout: FlashLayout, config: EngineConfig, iap: I, link: L) -> Self {
        Self {
            config,
            guard: FlashGuard::new(layout),
            session: UpdateSession::new(),
            decompressor: None,
            iap,
            link,
        }
    }

    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    pub fn decompressor(&self) -> Option<&Decompressor> {
        self.decompressor.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &FlashLayout {
        self.guard.layout()
    }

    pub fn iap(&self) -> &I {
        &self.iap
    }

    pub fn iap_mut(&mut self) -> &mut I {
        &mut self.iap
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_parts(self) -> (I, L) {
        (self.iap, self.link)
    }

    /// Handle one received payload and encode the reply.
    pub fn process(&mut self, buf: &[u8]) -> crate::protocol::Reply {
        self.handle_inbound_payload(buf).encode()
    }

    /// Handle one received payload: code byte followed by the command payload.
    pub fn handle_inbound_payload(&mut self, buf: &[u8]) -> Response {
        let Some((&first, payload)) = buf.split_first() else {
            return self.reject(UdpState::NoData);
        };

        let code = UpdCode::from_byte(first);
        if code == UpdCode::Invalid {
            return self.reject(UdpState::Invalid);
        }
        if !code.spec().accepts(payload.len()) {
            upd_log!(warn, "{:?}: bad payload length {}", code, payload.len());
            return self.reject(UdpState::InvalidData);
        }
        if self.session.is_locked() && !code.allowed_while_locked() {
            upd_log!(warn, "{:?} refused while locked", code);
            return self.reject(UdpState::DeviceLocked);
        }

        match Command::parse(code, payload) {
            Some(command) => self.handle_command(command),
            None => self.reject(UdpState::UnknownCommand),
        }
    }

    fn handle_command(&mut self, command: Command<'_>) -> Response {
        match command {
            Command::UnlockDevice { uid } => self.finish(|engine| engine.handle_unlock(uid)),
            Command::RequestUid => self.reply(|engine| engine.handle_request_uid()),
            Command::AppVersionRequest => self.reply(|engine| Ok(engine.handle_app_version())),
            Command::SendData { offset, data } => {
                self.finish(|engine| engine.session.stage(usize::from(offset), data))
            }
            Command::Program { count, address, crc } => {
                self.finish(|engine| engine.handle_program(usize::from(count), address, crc))
            }
            Command::SendDataToDecompress { data } => {
                self.finish(|engine| engine.handle_send_data_to_decompress(data))
            }
            Command::ProgramDecompressedData { crc } => {
                self.finish(|engine| engine.handle_program_decompressed_data(crc))
            }
            Command::EraseCompleteFlash => self.finish(|engine| engine.handle_erase(None)),
            Command::EraseAddressRange { start, end } => {
                self.finish(|engine| engine.handle_erase(Some((start, end))))
            }
            Command::DumpFlash { start, end } => self.finish(|engine| engine.handle_dump_flash(start, end)),
            Command::RequestStatistic => self.reply(|engine| Ok(engine.handle_request_statistic())),
            Command::SendLastError => Response::LastError(self.session.last_error()),
            Command::UpdateBootDescriptor { count, crc } => {
                self.finish(|engine| engine.handle_update_boot_descriptor(count as usize, crc))
            }
            Command::RequestBootDescriptor => self.reply(|engine| Ok(engine.handle_request_boot_descriptor())),
            Command::RequestBootloaderIdentity { major, minor } => {
                self.reply(|engine| Ok(engine.handle_identity(Version::new(major, minor))))
            }
            Command::RequestData { .. } => self.finish(|_| Err(UdpState::NotImplemented)),
        }
    }

    fn reject(&mut self, state: UdpState) -> Response {
        self.session.set_last_error(state);
        Response::LastError(state)
    }

    /// Run a state-changing handler: record its outcome and acknowledge.
    fn finish(&mut self, handler: impl FnOnce(&mut Self) -> Result<(), UdpState>) -> Response {
        let state = UdpState::from_result(handler(self));
        if !state.is_success() {
            upd_log!(warn, "command failed: {}", state);
        }
        self.session.set_last_error(state);
        Response::Ack
    }

    /// Run a data-returning handler: its reply on success, the error reply otherwise.
    fn reply(&mut self, handler: impl FnOnce(&mut Self) -> Result<Response, UdpState>) -> Response {
        match handler(self) {
            Ok(response) => {
                self.session.set_last_error(UdpState::Success);
                response
            }
            Err(state) => self.reject(state),
        }
    }

    // --- Access control ---

    fn handle_unlock(&mut self, uid: [u8; UID_LENGTH]) -> Result<(), UdpState> {
        let device_uid = self.iap.read_uid().map_err(UdpState::from)?;
        let mut expected = [0u8; UID_LENGTH];
        expected.copy_from_slice(&device_uid[..UID_LENGTH]);

        // Some tools send the UID as little-endian words.
        let mut swapped = expected;
        swapped.chunks_exact_mut(4).for_each(|word| word.reverse());

        if uid != expected && uid != swapped {
            upd_log!(warn, "unlock refused: UID mismatch");
            return Err(UdpState::UidMismatch);
        }

        self.session.unlock();
        self.session.reset_counters();
        self.decompressor = None;
        upd_log!(info, "device unlocked");
        Ok(())
    }

    fn handle_request_uid(&mut self) -> Result<Response, UdpState> {
        if !self.link.programming_button_pressed() {
            return Err(UdpState::DeviceLocked);
        }
        let device_uid = self.iap.read_uid().map_err(UdpState::from)?;
        let mut uid = [0u8; UID_LENGTH];
        uid.copy_from_slice(&device_uid[..UID_LENGTH]);
        Ok(Response::Uid(uid))
    }

    fn handle_app_version(&self) -> Response {
        let layout = self.guard.layout();
        let block = AppDescriptionBlock::installed(layout, &self.iap);
        Response::AppVersion(block.app_version(layout, &self.iap))
    }

    // --- Full image transfer ---

    fn handle_program(&mut self, count: usize, address: u32, crc: u32) -> Result<(), UdpState> {
        if !self.guard.address_allowed_to_program(address, count as u32, false) {
            return Err(UdpState::AddressNotAllowedToFlash);
        }
        if crc32(self.session.staged(count)?) != crc {
            return Err(UdpState::CrcError);
        }

        let block = program_block_size(count);
        if block > STAGING_BUFFER_SIZE {
            return Err(UdpState::RamBufferOverflow);
        }
        if !self.guard.address_allowed_to_program(address, block as u32, false) {
            return Err(UdpState::AddressNotAllowedToFlash);
        }

        let data = self.session.staged(block)?;
        {
            let _pause = LinkPause::new(&mut self.link);
            self.guard.program_page(&mut self.iap, address, data, false)?;
        }
        self.session.record_flashed(block);
        Ok(())
    }

    // --- Differential transfer ---

    fn handle_send_data_to_decompress(&mut self, data: &[u8]) -> Result<(), UdpState> {
        if !self.config.diff_support {
            return Err(UdpState::NotImplemented);
        }
        let layout = *self.guard.layout();
        let iap = &self.iap;
        let decompressor = self
            .decompressor
            .get_or_insert_with(|| Decompressor::for_installed_image(layout, iap));

        for &byte in data {
            decompressor.put_byte(iap, byte)?;
        }
        self.session.record_received(data.len());
        Ok(())
    }

    /// Commit the page the decompressor has assembled.
    ///
    /// Nothing pending, including no patch stream at all, fails the range
    /// check with `AddressNotAllowedToFlash`.
    fn handle_program_decompressed_data(&mut self, crc: u32) -> Result<(), UdpState> {
        if !self.config.diff_support {
            return Err(UdpState::NotImplemented);
        }
        let decompressor = self
            .decompressor
            .as_mut()
            .ok_or(UdpState::AddressNotAllowedToFlash)?;
        let cursor = decompressor.cursor();
        let pending = u32::from(decompressor.bytes_to_flash());

        if !self.guard.address_allowed_to_program(cursor, pending, false) {
            return Err(UdpState::AddressNotAllowedToFlash);
        }
        if decompressor.crc32() != crc {
            return Err(UdpState::CrcError);
        }

        let result = {
            let _pause = LinkPause::new(&mut self.link);
            decompressor.page_completed_do_flash(&self.guard, &mut self.iap)
        };
        if result.is_ok() {
            upd_log!(info, "diff page {:#x} committed", cursor);
        }
        self.session.reset_counters();
        result
    }

    // --- Erase ---

    /// Erase `start..=end` (application only), or everything after the bootloader.
    fn handle_erase(&mut self, range: Option<(u32, u32)>) -> Result<(), UdpState> {
        let result = {
            let _pause = LinkPause::new(&mut self.link);
            match range {
                Some((start, end)) => self.guard.erase_range(&mut self.iap, start, end, true),
                None => self.guard.erase_full_flash(&mut self.iap),
            }
        };
        self.session.reset_counters();
        result
    }

    // --- Diagnostics ---

    fn handle_dump_flash(&mut self, start: u32, end: u32) -> Result<(), UdpState> {
        if !self.config.debug {
            return Err(UdpState::NotImplemented);
        }
        let layout = self.guard.layout();
        let first = start.min(end).max(layout.flash_start);
        let last = start.max(end).min(layout.flash_end);
        if first > last {
            return Err(UdpState::InvalidData);
        }
        self.link.dump(first, last);
        Ok(())
    }

    fn handle_request_statistic(&self) -> Response {
        let link = self.link.statistic();
        Response::Statistic(Statistic {
            disconnect_count: link.disconnect_count,
            repeated_ack_count: link.repeated_ack_count,
            bytes_received: self.session.bytes_received(),
            bytes_flashed: self.session.bytes_flashed(),
        })
    }

    // --- Boot descriptor ---

    /// Install the staged descriptor block.
    ///
    /// The block is checked against the application in flash before the
    /// descriptor page is touched, so an unstartable block never replaces the
    /// installed one. The written page is validated again afterwards.
    fn handle_update_boot_descriptor(&mut self, count: usize, crc: u32) -> Result<(), UdpState> {
        let staged = self.session.staged(count)?;
        if count < AppDescriptionBlock::SIZE || count > PAGE {
            return Err(UdpState::WrongDescriptorBlock);
        }
        if crc32(staged) != crc {
            return Err(UdpState::CrcError);
        }

        let layout = *self.guard.layout();
        let block = AppDescriptionBlock::from_bytes(staged).ok_or(UdpState::WrongDescriptorBlock)?;
        if !block.check_application(&layout, &self.iap) {
            upd_log!(warn, "descriptor {:#x}..={:#x} does not match flash", block.start_address, block.end_address);
            return Err(UdpState::ApplicationNotStartable);
        }

        let address = layout.boot_descriptor_address();
        let mut page = [0xFFu8; PAGE];
        page[..count].copy_from_slice(staged);

        let mut installed = [0u8; PAGE];
        self.iap.read(address, &mut installed);
        if installed == page {
            upd_log!(info, "boot descriptor unchanged");
        } else {
            let _pause = LinkPause::new(&mut self.link);
            self.guard.erase_page_at(&mut self.iap, address)?;
            self.guard.program_page(&mut self.iap, address, &page, true)?;
        }

        if !AppDescriptionBlock::installed(&layout, &self.iap).check_application(&layout, &self.iap) {
            return Err(UdpState::ApplicationNotStartable);
        }

        upd_log!(info, "boot descriptor written: {:#x}..={:#x}", block.start_address, block.end_address);
        self.decompressor = None;
        self.session.reset_counters();
        Ok(())
    }

    fn handle_request_boot_descriptor(&self) -> Response {
        let layout = self.guard.layout();
        let block = AppDescriptionBlock::installed(layout, &self.iap);
        if block.has_plausible_range(layout) {
            Response::BootDescriptor {
                start: block.start_address,
                end: block.end_address,
                crc: block.crc,
            }
        } else {
            Response::BootDescriptor {
                start: u32::MAX,
                end: u32::MAX,
                crc: u32::MAX,
            }
        }
    }

    fn handle_identity(&self, tool: Version) -> Response {
        if tool < self.config.min_tool_version {
            upd_log!(warn, "host tool {}.{} too old", tool.major, tool.minor);
            return Response::VersionMismatch {
                min_major: self.config.min_tool_version.major,
                min_minor: self.config.min_tool_version.minor,
            };
        }
        Response::BootloaderIdentity(BootloaderIdentity {
            major: self.config.version.major,
            minor: self.config.version.minor,
            features: self.config.features(),
            library_major: self.config.library_version.major,
            library_minor: self.config.library_version.minor,
            application_first_address: self.guard.layout().application_first_address(),
        })
    }
}
