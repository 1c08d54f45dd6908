// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Per-connection update state: device lock, staging buffer, counters, last error.

use crate::protocol::{UdpState, STAGING_BUFFER_SIZE};

const DEVICE_LOCKED: u32 = 0x5AA5_5AA5;
const DEVICE_UNLOCKED: u32 = !DEVICE_LOCKED;

pub struct UpdateSession {
    /// Any value other than the unlocked sentinel counts as locked.
    lock_state: u32,
    staging: [u8; STAGING_BUFFER_SIZE],
    write_cursor: u16,
    bytes_received: u16,
    bytes_flashed: u16,
    last_error: UdpState,
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateSession {
    /// A locked session with empty staging buffer.
    pub const fn new() -> Self {
        Self {
            lock_state: DEVICE_LOCKED,
            staging: [0; STAGING_BUFFER_SIZE],
            write_cursor: 0,
            bytes_received: 0,
            bytes_flashed: 0,
            last_error: UdpState::Success,
        }
    }

    pub fn lock(&mut self) {
        self.lock_state = DEVICE_LOCKED;
    }

    pub fn unlock(&mut self) {
        self.lock_state = DEVICE_UNLOCKED;
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state != DEVICE_UNLOCKED
    }

    pub fn reset_counters(&mut self) {
        self.write_cursor = 0;
        self.bytes_received = 0;
        self.bytes_flashed = 0;
    }

    /// Copy `bytes` into the staging buffer at `offset`.
    ///
    /// Nothing is written when the fragment does not fit.
    pub fn stage(&mut self, offset: usize, bytes: &[u8]) -> Result<(), UdpState> {
        let end = offset.checked_add(bytes.len()).ok_or(UdpState::RamBufferOverflow)?;
        let slot = self.staging.get_mut(offset..end).ok_or(UdpState::RamBufferOverflow)?;
        slot.copy_from_slice(bytes);
        self.write_cursor = end as u16;
        self.record_received(bytes.len());
        Ok(())
    }

    /// The first `count` staged bytes.
    pub fn staged(&self, count: usize) -> Result<&[u8], UdpState> {
        self.staging.get(..count).ok_or(UdpState::RamBufferOverflow)
    }

    pub fn record_received(&mut self, count: usize) {
        self.bytes_received = self.bytes_received.wrapping_add(count as u16);
    }

    pub fn record_flashed(&mut self, count: usize) {
        self.bytes_flashed = self.bytes_flashed.wrapping_add(count as u16);
    }

    pub fn last_error(&self) -> UdpState {
        self.last_error
    }

    pub fn set_last_error(&mut self, state: UdpState) {
        self.last_error = state;
    }

    pub fn write_cursor(&self) -> u16 {
        self.write_cursor
    }

    pub fn bytes_received(&self) -> u16 {
        self.bytes_received
    }

    pub fn bytes_flashed(&self) -> u16 {
        self.bytes_flashed
    }
}
