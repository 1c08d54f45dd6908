// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! CRC-32 (ISO-HDLC, seed 0xFFFFFFFF, final complement) over RAM and flash.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::iap::Iap;
use crate::protocol::FLASH_PAGE_SIZE;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// CRC-32 of `len` bytes of flash starting at `address`, read a page at a time.
pub fn flash_crc32<I: Iap + ?Sized>(iap: &I, address: u32, len: u32) -> u32 {
    let mut digest = CRC32.digest();
    let mut buf = [0u8; FLASH_PAGE_SIZE as usize];
    let mut offset = 0u32;

    while offset < len {
        let chunk = (len - offset).min(FLASH_PAGE_SIZE) as usize;
        iap.read(address.wrapping_add(offset), &mut buf[..chunk]);
        digest.update(&buf[..chunk]);
        offset += chunk as u32;
    }

    digest.finalize()
}
