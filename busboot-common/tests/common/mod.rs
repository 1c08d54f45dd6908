// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Simulated flash and bus link shared by the integration tests.

#![allow(dead_code)]

use busboot_common::checksum::crc32;
use busboot_common::engine::{EngineConfig, ProtocolEngine};
use busboot_common::iap::{Iap, IapStatus, Link, LinkStatistic};
use busboot_common::layout::FlashLayout;
use busboot_common::protocol::{Command, Response, UdpState, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};
use busboot_common::AppDescriptionBlock;

pub const TEST_UID: [u8; 16] = [
    0x10, 0x11, 0x12, 0x13, 0x20, 0x21, 0x22, 0x23, 0x30, 0x31, 0x32, 0x33, 0x40, 0x41, 0x42, 0x43,
];

pub fn layout() -> FlashLayout {
    FlashLayout::LPC11XX_64K
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    ErasePages(u32, u32),
    EraseSectors(u32, u32),
    Program(u32, usize),
}

/// Flash that behaves like the LPC11xx IAP: erase sets 0xFF, program can only clear bits.
pub struct SimFlash {
    pub layout: FlashLayout,
    pub memory: Vec<u8>,
    pub uid: [u8; 16],
    pub ops: Vec<FlashOp>,
    pub fail_program: Option<IapStatus>,
    pub fail_erase: Option<IapStatus>,
}

impl SimFlash {
    pub fn new(layout: FlashLayout) -> Self {
        Self {
            layout,
            memory: vec![0xFF; layout.flash_size() as usize],
            uid: TEST_UID,
            ops: Vec::new(),
            fail_program: None,
            fail_erase: None,
        }
    }

    fn offset(&self, address: u32) -> usize {
        (address - self.layout.flash_start) as usize
    }

    pub fn bytes(&self, address: u32, len: usize) -> &[u8] {
        let at = self.offset(address);
        &self.memory[at..at + len]
    }

    /// Write directly, bypassing the IAP checks.
    pub fn poke(&mut self, address: u32, data: &[u8]) {
        let at = self.offset(address);
        self.memory[at..at + data.len()].copy_from_slice(data);
    }

    /// Addresses whose content is 0xFF.
    pub fn erased_pages(&self) -> Vec<u32> {
        self.memory
            .chunks(FLASH_PAGE_SIZE as usize)
            .enumerate()
            .filter(|(_, page)| page.iter().all(|&b| b == 0xFF))
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn program_ops(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, FlashOp::Program(..))).count()
    }

    fn erase(&mut self, from: u32, len: u32) {
        let at = self.offset(from);
        self.memory[at..at + len as usize].fill(0xFF);
    }
}

impl Iap for SimFlash {
    fn erase_pages(&mut self, first: u32, last: u32) -> IapStatus {
        self.ops.push(FlashOp::ErasePages(first, last));
        if let Some(status) = self.fail_erase {
            return status;
        }
        if first > last || self.layout.address_of_page(last) > self.layout.flash_end {
            return IapStatus::InvalidSector;
        }
        self.erase(self.layout.address_of_page(first), (last - first + 1) * FLASH_PAGE_SIZE);
        IapStatus::CmdSuccess
    }

    fn erase_sectors(&mut self, first: u32, last: u32) -> IapStatus {
        self.ops.push(FlashOp::EraseSectors(first, last));
        if let Some(status) = self.fail_erase {
            return status;
        }
        if first > last || self.layout.address_of_sector(last) > self.layout.flash_end {
            return IapStatus::InvalidSector;
        }
        self.erase(self.layout.address_of_sector(first), (last - first + 1) * FLASH_SECTOR_SIZE);
        IapStatus::CmdSuccess
    }

    fn program(&mut self, address: u32, data: &[u8]) -> IapStatus {
        self.ops.push(FlashOp::Program(address, data.len()));
        if let Some(status) = self.fail_program {
            return status;
        }
        if !self.layout.is_page_aligned(address) {
            return IapStatus::DstAddrError;
        }
        if ![256, 512, 1024, 4096].contains(&data.len()) {
            return IapStatus::CountError;
        }
        if !self.layout.contains_range(address, data.len() as u32) {
            return IapStatus::DstAddrNotMapped;
        }
        let at = self.offset(address);
        for (cell, &byte) in self.memory[at..at + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        IapStatus::CmdSuccess
    }

    fn read_uid(&self) -> Result<[u8; 16], IapStatus> {
        Ok(self.uid)
    }

    fn read(&self, address: u32, buf: &mut [u8]) {
        for (i, out) in buf.iter_mut().enumerate() {
            let addr = address as usize + i;
            *out = addr
                .checked_sub(self.layout.flash_start as usize)
                .and_then(|at| self.memory.get(at))
                .copied()
                .unwrap_or(0xFF);
        }
    }
}

#[derive(Default)]
pub struct SimLink {
    pub paused: bool,
    pub pause_count: usize,
    pub resume_count: usize,
    pub button: bool,
    pub statistic: LinkStatistic,
    pub dumps: Vec<(u32, u32)>,
}

impl Link for SimLink {
    fn pause(&mut self) {
        self.paused = true;
        self.pause_count += 1;
    }

    fn resume(&mut self) {
        self.paused = false;
        self.resume_count += 1;
    }

    fn is_idle(&self) -> bool {
        true
    }

    fn programming_button_pressed(&self) -> bool {
        self.button
    }

    fn statistic(&self) -> LinkStatistic {
        self.statistic
    }

    fn dump(&mut self, start: u32, end: u32) {
        self.dumps.push((start, end));
    }
}

pub type TestEngine = ProtocolEngine<SimFlash, SimLink>;

pub fn make_engine() -> TestEngine {
    make_engine_with(EngineConfig::default())
}

pub fn make_engine_with(config: EngineConfig) -> TestEngine {
    ProtocolEngine::new(layout(), config, SimFlash::new(layout()), SimLink::default())
}

pub fn make_unlocked_engine() -> TestEngine {
    let mut engine = make_engine();
    let response = send(&mut engine, &Command::UnlockDevice { uid: uid12() });
    assert_eq!(response, Response::Ack);
    assert!(!engine.session().is_locked());
    engine
}

pub fn uid12() -> [u8; 12] {
    let mut uid = [0u8; 12];
    uid.copy_from_slice(&TEST_UID[..12]);
    uid
}

/// Encode `command` and feed it to the engine.
pub fn send(engine: &mut TestEngine, command: &Command<'_>) -> Response {
    let frame = command.encode().expect("command fits in a frame");
    engine.handle_inbound_payload(&frame)
}

pub fn last_error(engine: &mut TestEngine) -> UdpState {
    match send(engine, &Command::SendLastError) {
        Response::LastError(state) => state,
        other => panic!("unexpected reply {other:?}"),
    }
}

/// Stage `data` in staging RAM using fragments of at most `fragment` bytes.
pub fn stage(engine: &mut TestEngine, data: &[u8], fragment: usize) {
    for (i, chunk) in data.chunks(fragment).enumerate() {
        let offset = u8::try_from(i * fragment).expect("offset fits the byte index");
        assert_eq!(send(engine, &Command::SendData { offset, data: chunk }), Response::Ack);
        assert_eq!(last_error(engine), UdpState::Success);
    }
}

/// Deterministic test image.
pub fn make_image(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i >> 8) as u8))
        .collect()
}

/// Program `image` at `address` directly and describe it in the boot descriptor.
pub fn install_image(flash: &mut SimFlash, address: u32, image: &[u8]) -> AppDescriptionBlock {
    flash.poke(address, image);
    let block = AppDescriptionBlock {
        start_address: address,
        end_address: address + image.len() as u32 - 1,
        crc: crc32(image),
        app_version_address: 0,
    };
    let mut page = [0xFFu8; 256];
    page[..16].copy_from_slice(&block.to_bytes());
    flash.poke(flash.layout.boot_descriptor_address(), &page);
    block
}
