// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Tests for program/erase range checks and the erase plan.

mod common;

use busboot_common::flash_guard::{program_block_size, FlashGuard};
use busboot_common::iap::IapStatus;
use busboot_common::protocol::{UdpState, FLASH_PAGE_SIZE};
use common::{layout, FlashOp, SimFlash};

fn make_guard() -> (FlashGuard, SimFlash) {
    let mut flash = SimFlash::new(layout());
    // Start from a fully programmed part so erased pages are visible.
    flash.memory.fill(0x00);
    (FlashGuard::new(layout()), flash)
}

/// Pages erased by a successful `erase_range(start, end)`.
fn expected_pages(start: u32, end: u32) -> Vec<u32> {
    (start / FLASH_PAGE_SIZE..=end / FLASH_PAGE_SIZE).collect()
}

fn page_erase_calls(flash: &SimFlash) -> usize {
    flash
        .ops
        .iter()
        .filter(|op| matches!(op, FlashOp::ErasePages(..)))
        .count()
}

// =============================================================================
// address_allowed_to_program
// =============================================================================

#[test]
fn test_program_boundaries_sweep() {
    let guard = FlashGuard::new(layout());
    let app = layout().application_first_address();
    let end = layout().flash_end;

    assert!(!guard.address_allowed_to_program(app - FLASH_PAGE_SIZE, 256, false));
    assert!(guard.address_allowed_to_program(app, 256, false));
    assert!(guard.address_allowed_to_program(end + 1 - 256, 256, false));
    assert!(!guard.address_allowed_to_program(end + 1 - 256, 257, false));
    assert!(!guard.address_allowed_to_program(end + 1, 256, false));
    assert!(!guard.address_allowed_to_program(0, 256, false));
}

#[test]
fn test_program_bounds_every_address() {
    let guard = FlashGuard::new(layout());
    let app = u64::from(layout().application_first_address());
    let end = u64::from(layout().flash_end);
    let lengths = [1u32, 255, 256, 257, 512, 1024, 4096];

    // Half-page steps hit every page plus an unaligned address in each.
    let starts = (0..0x1_1000u32).step_by(0x80).chain([0xFFFF_FF00, 0xFFFF_FFFF]);
    for start in starts {
        for len in lengths {
            let last = u64::from(start) + u64::from(len) - 1;
            let expected = start % FLASH_PAGE_SIZE == 0 && u64::from(start) >= app && last <= end;
            assert_eq!(
                guard.address_allowed_to_program(start, len, false),
                expected,
                "start {start:#x} len {len}"
            );
        }
    }
}

#[test]
fn test_program_never_reaches_bootloader_or_past_end() {
    let guard = FlashGuard::new(layout());
    let app = layout().application_first_address();
    let end = layout().flash_end;
    for len in [256u32, 512, 1024, 4096] {
        // Anything starting below the application is refused, however short.
        for start in (0..app).step_by(FLASH_PAGE_SIZE as usize) {
            assert!(!guard.address_allowed_to_program(start, len, false), "{start:#x}+{len}");
        }
        // The last allowed start ends exactly on flash_end; one page later crosses it.
        let last_start = end + 1 - len;
        assert!(guard.address_allowed_to_program(last_start, len, false));
        assert!(!guard.address_allowed_to_program(last_start + FLASH_PAGE_SIZE, len, false));
    }
    assert!(!guard.address_allowed_to_program(app - 1, 2, false));
}

#[test]
fn test_program_requires_alignment_and_length() {
    let guard = FlashGuard::new(layout());
    assert!(!guard.address_allowed_to_program(0x3001, 256, false));
    assert!(!guard.address_allowed_to_program(0x3000, 0, false));
    assert!(!guard.address_allowed_to_program(0xFFFF_FF00, 0x200, false));
}

#[test]
fn test_boot_descriptor_only_with_flag() {
    let guard = FlashGuard::new(layout());
    let desc = layout().boot_descriptor_address();
    assert!(guard.address_allowed_to_program(desc, 256, true));
    assert!(!guard.address_allowed_to_program(desc, 256, false));
    assert!(!guard.address_allowed_to_program(desc, 512, true));
    assert!(!guard.address_allowed_to_program(desc - 256, 256, true));
    assert!(!guard.address_allowed_to_program(0x3000, 256, true));
}

#[test]
fn test_program_block_size_rounding() {
    assert_eq!(program_block_size(1), 256);
    assert_eq!(program_block_size(256), 256);
    assert_eq!(program_block_size(257), 512);
    assert_eq!(program_block_size(1024), 1024);
    assert_eq!(program_block_size(1025), 4096);
}

// =============================================================================
// Page / sector permissions
// =============================================================================

#[test]
fn test_page_allowed_to_erase() {
    let guard = FlashGuard::new(layout());
    assert!(!guard.page_allowed_to_erase(0x2E));
    assert!(guard.page_allowed_to_erase(0x2F));
    assert!(guard.page_allowed_to_erase(0xFF));
    assert!(!guard.page_allowed_to_erase(0x100));
}

#[test]
fn test_sector_allowed_to_erase() {
    let guard = FlashGuard::new(layout());
    assert!(!guard.sector_allowed_to_erase(2));
    assert!(guard.sector_allowed_to_erase(3));
    assert!(guard.sector_allowed_to_erase(15));
    assert!(!guard.sector_allowed_to_erase(16));
}

#[test]
fn test_rejected_range_does_not_touch_hardware() {
    let (guard, mut flash) = make_guard();
    assert_eq!(guard.erase_page_range(&mut flash, 0x10, 0x40), Err(UdpState::PageNotAllowedToErase));
    assert_eq!(guard.erase_sector_range(&mut flash, 3, 16), Err(UdpState::SectorNotAllowedToErase));
    assert!(flash.ops.is_empty());
}

// =============================================================================
// erase_range plan
// =============================================================================

#[test]
fn test_erase_short_range_single_page_call() {
    let (guard, mut flash) = make_guard();
    guard.erase_range(&mut flash, 0x3000, 0x3FFF - 0x100, true).unwrap();
    assert_eq!(flash.ops, vec![FlashOp::ErasePages(0x30, 0x3E)]);
    assert_eq!(flash.erased_pages(), expected_pages(0x3000, 0x3EFF));
}

#[test]
fn test_erase_aligned_sectors_only() {
    let (guard, mut flash) = make_guard();
    guard.erase_range(&mut flash, 0x4000, 0x7FFF, true).unwrap();
    assert_eq!(flash.ops, vec![FlashOp::EraseSectors(4, 7)]);
    assert_eq!(flash.erased_pages(), expected_pages(0x4000, 0x7FFF));
}

#[test]
fn test_erase_unaligned_head_and_tail() {
    let (guard, mut flash) = make_guard();
    guard.erase_range(&mut flash, 0x3500, 0x6234, true).unwrap();
    assert_eq!(
        flash.ops,
        vec![
            FlashOp::ErasePages(0x35, 0x3F),
            FlashOp::ErasePages(0x60, 0x62),
            FlashOp::EraseSectors(4, 5),
        ]
    );
    assert_eq!(flash.erased_pages(), expected_pages(0x3500, 0x6234));
}

#[test]
fn test_erase_straddling_one_boundary_without_middle_sector() {
    let (guard, mut flash) = make_guard();
    guard.erase_range(&mut flash, 0x3800, 0x47FF, true).unwrap();
    assert_eq!(
        flash.ops,
        vec![FlashOp::ErasePages(0x38, 0x3F), FlashOp::ErasePages(0x40, 0x47)]
    );
    assert_eq!(flash.erased_pages(), expected_pages(0x3800, 0x47FF));
}

#[test]
fn test_erase_decomposition_sweep() {
    let ranges = [
        (0x3000, 0x30FF),
        (0x3000, 0xFFFF),
        (0x3100, 0xFFFF),
        (0x3000, 0x3FFF),
        (0x3F00, 0x4FFF),
        (0x5000, 0x50FF),
        (0x5100, 0xA0FF),
        (0xEF00, 0xFFFF),
    ];
    for (start, end) in ranges {
        let (guard, mut flash) = make_guard();
        guard.erase_range(&mut flash, start, end, true).unwrap();
        assert_eq!(flash.erased_pages(), expected_pages(start, end), "range {start:#x}..={end:#x}");

        // Never more than head + tail page erases.
        assert!(page_erase_calls(&flash) <= 2, "range {start:#x}..={end:#x}: {:?}", flash.ops);
    }
}

#[test]
fn test_erase_decomposition_every_range() {
    let (guard, mut flash) = make_guard();
    let first = layout().boot_descriptor_page();
    let last = layout().page_of(layout().flash_end);

    for start_page in first..=last {
        for end_page in start_page..=last {
            // Unaligned inside the page; start stays in the lower half, end in the upper.
            let start = layout().address_of_page(start_page) + (start_page * 29) % 128;
            let end = layout().address_of_page(end_page) + 128 + (end_page * 31) % 128;

            flash.memory.fill(0x00);
            flash.ops.clear();
            guard.erase_range(&mut flash, start, end, false).unwrap();

            let ctx = format!("range {start:#x}..={end:#x}: {:?}", flash.ops);
            assert_eq!(flash.erased_pages(), expected_pages(start, end), "{ctx}");
            assert!(page_erase_calls(&flash) <= 2, "{ctx}");
            let sector_calls = flash.ops.len() - page_erase_calls(&flash);
            assert!(sector_calls <= 1, "{ctx}");
        }
    }
}

#[test]
fn test_erase_range_checks() {
    let (guard, mut flash) = make_guard();
    assert_eq!(
        guard.erase_range(&mut flash, 0x4000, 0x3FFF, false),
        Err(UdpState::AddressRangeNotAllowedToErase)
    );
    assert_eq!(
        guard.erase_range(&mut flash, 0x2000, 0x3FFF, true),
        Err(UdpState::AddressRangeNotAllowedToErase)
    );
    assert_eq!(
        guard.erase_range(&mut flash, 0x3000, 0x1_00FF, true),
        Err(UdpState::AddressRangeNotAllowedToErase)
    );
    assert!(flash.ops.is_empty());
}

#[test]
fn test_erase_full_flash_keeps_bootloader() {
    let (guard, mut flash) = make_guard();
    guard.erase_full_flash(&mut flash).unwrap();
    assert_eq!(flash.erased_pages(), expected_pages(0x2F00, 0xFFFF));
    assert!(flash.bytes(0, 0x2F00).iter().all(|&b| b == 0x00));
}

#[test]
fn test_erase_failure_aborts_plan() {
    let (guard, mut flash) = make_guard();
    flash.fail_erase = Some(IapStatus::Busy);
    assert_eq!(guard.erase_range(&mut flash, 0x3500, 0x6234, true), Err(UdpState::Busy));
    assert_eq!(flash.ops.len(), 1);
}

// =============================================================================
// program_page
// =============================================================================

#[test]
fn test_program_page_writes_application() {
    let (guard, mut flash) = make_guard();
    flash.memory.fill(0xFF);
    guard.program_page(&mut flash, 0x3000, &[0x5A; 256], false).unwrap();
    assert!(flash.bytes(0x3000, 256).iter().all(|&b| b == 0x5A));
}

#[test]
fn test_program_page_rejects_bootloader() {
    let (guard, mut flash) = make_guard();
    assert_eq!(
        guard.program_page(&mut flash, 0x2E00, &[0x5A; 256], false),
        Err(UdpState::AddressNotAllowedToFlash)
    );
    assert!(flash.ops.is_empty());
}

#[test]
fn test_program_page_maps_iap_status() {
    let (guard, mut flash) = make_guard();
    flash.fail_program = Some(IapStatus::SectorNotPreparedForWriteOperation);
    assert_eq!(
        guard.program_page(&mut flash, 0x3000, &[0; 256], false),
        Err(UdpState::SectorNotPrepared)
    );
    assert_eq!(UdpState::from_iap_code(42), UdpState::IapUnknown);
    assert_eq!(UdpState::from_iap_code(11), UdpState::Busy);
}
