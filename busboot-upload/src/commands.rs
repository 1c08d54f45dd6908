// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations for bootloader operations.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use indicatif::{ProgressBar, ProgressStyle};

use busboot_common::protocol::{BootloaderIdentity, Command, Response, FLASH_PAGE_SIZE, IAP_UID_LENGTH, UID_LENGTH};
use busboot_common::{AppDescriptionBlock, EngineConfig, FlashLayout};

use crate::device::EmulatedDevice;
use crate::diff;
use crate::transport::Transport;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const BLOCK_SIZE: usize = FLASH_PAGE_SIZE as usize;

/// Protocol version this tool speaks.
const TOOL_VERSION: (u8, u8) = (1, 0);

/// Marker that precedes the application version string in an image.
const APP_VERSION_MAGIC: &[u8] = b"!AVP!@:";

fn connect(device: &Path) -> Result<Transport> {
    Ok(Transport::new(EmulatedDevice::load(device)?))
}

fn disconnect(transport: Transport, device: &Path) -> Result<()> {
    transport.into_device().save(device)
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Ask for the bootloader identity, failing on a version mismatch.
fn query_identity(transport: &mut Transport) -> Result<BootloaderIdentity> {
    let (major, minor) = TOOL_VERSION;
    match transport.send_recv(&Command::RequestBootloaderIdentity { major, minor })? {
        Response::BootloaderIdentity(identity) => Ok(identity),
        Response::VersionMismatch {
            min_major,
            min_minor,
        } => bail!(
            "Bootloader needs tool version {}.{} or newer (this is {}.{})",
            min_major,
            min_minor,
            major,
            minor
        ),
        Response::LastError(state) => bail!("RequestBootloaderIdentity failed: {}", state),
        response => bail!("Unexpected response: {:?}", response),
    }
}

/// Read the UID with the programming button held, then unlock with it.
fn unlock_device(transport: &mut Transport) -> Result<[u8; UID_LENGTH]> {
    transport.press_programming_button();
    let response = transport.send_recv(&Command::RequestUid);
    transport.release_programming_button();

    let uid = match response? {
        Response::Uid(uid) => uid,
        Response::LastError(state) => bail!("RequestUid failed: {}", state),
        response => bail!("Unexpected response: {:?}", response),
    };
    transport.execute(&Command::UnlockDevice { uid })?;
    log::info!("device unlocked");
    Ok(uid)
}

/// Address of the application version string: the byte after the marker,
/// when it sits past the vector table and leaves room for the string.
fn app_version_offset(image: &[u8]) -> Option<usize> {
    let at = image
        .windows(APP_VERSION_MAGIC.len())
        .position(|window| window == APP_VERSION_MAGIC)?
        + APP_VERSION_MAGIC.len();
    (at > 0xC0 && at < image.len().saturating_sub(12)).then_some(at)
}

fn describe(address: u32, image: &[u8]) -> AppDescriptionBlock {
    AppDescriptionBlock {
        start_address: address,
        end_address: address + image.len() as u32 - 1,
        crc: CRC32.checksum(image),
        app_version_address: app_version_offset(image).map_or(0, |at| address + at as u32),
    }
}

/// Stage and commit the boot descriptor for an image now on flash.
fn install_descriptor(transport: &mut Transport, descriptor: &AppDescriptionBlock) -> Result<()> {
    print!("Writing boot descriptor... ");
    std::io::stdout().flush()?;

    let bytes = descriptor.to_bytes();
    transport.execute(&Command::SendData { offset: 0, data: &bytes })?;
    transport.execute(&Command::UpdateBootDescriptor {
        count: bytes.len() as u32,
        crc: CRC32.checksum(&bytes),
    })?;
    println!("OK");
    Ok(())
}

fn read_image(file: &Path) -> Result<Vec<u8>> {
    let image = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    if image.is_empty() {
        bail!("{} is empty", file.display());
    }
    Ok(image)
}

fn check_fits(layout: &FlashLayout, address: u32, len: usize) -> Result<()> {
    let fits = u32::try_from(len).is_ok_and(|len| layout.contains_range(address, len));
    if !fits || address < layout.application_first_address() {
        bail!(
            "Image of {} bytes at {:#x} does not fit the application area {:#x}..={:#x}",
            len,
            address,
            layout.application_first_address(),
            layout.flash_end
        );
    }
    Ok(())
}

/// Create a fresh device snapshot.
pub fn init(device: &Path, uid: [u8; IAP_UID_LENGTH]) -> Result<()> {
    let layout = FlashLayout::LPC11XX_64K;
    EmulatedDevice::new(layout, uid).save(device)?;
    println!(
        "Created {} ({} KiB flash, bootloader {:#x}..={:#x})",
        device.display(),
        layout.flash_size() / 1024,
        layout.bootloader_start,
        layout.bootloader_end
    );
    Ok(())
}

/// Print bootloader identity.
pub fn identity(device: &Path) -> Result<()> {
    let mut transport = connect(device)?;
    unlock_device(&mut transport)?;
    let identity = query_identity(&mut transport)?;

    println!("Bootloader Identity:");
    println!("  Version:           {}.{}", identity.major, identity.minor);
    println!(
        "  Library:           {}.{}",
        identity.library_major, identity.library_minor
    );
    println!(
        "  Diff support:      {}",
        identity.features & EngineConfig::FEATURE_DIFF != 0
    );
    println!(
        "  Debug:             {}",
        identity.features & EngineConfig::FEATURE_DEBUG != 0
    );
    println!("  Application start: {:#x}", identity.application_first_address);
    disconnect(transport, device)
}

/// Print descriptor, application version and statistics.
pub fn status(device: &Path) -> Result<()> {
    let mut transport = connect(device)?;

    let version = match transport.send_recv(&Command::AppVersionRequest)? {
        Response::AppVersion(version) => version,
        response => bail!("Unexpected response: {:?}", response),
    };
    unlock_device(&mut transport)?;

    println!("Device Status:");
    println!("  App version: {}", String::from_utf8_lossy(&version));
    match transport.send_recv(&Command::RequestBootDescriptor)? {
        Response::BootDescriptor { start, .. } if start == u32::MAX => println!("  Application: none"),
        Response::BootDescriptor { start, end, crc } => {
            println!(
                "  Application: {:#x}..={:#x} ({} bytes, CRC32: 0x{:08x})",
                start,
                end,
                end - start + 1,
                crc
            )
        }
        response => bail!("Unexpected response: {:?}", response),
    }
    match transport.send_recv(&Command::RequestStatistic)? {
        Response::Statistic(stat) => {
            println!("  Disconnects: {}", stat.disconnect_count);
            println!("  Repeated ACKs: {}", stat.repeated_ack_count);
        }
        response => bail!("Unexpected response: {:?}", response),
    }
    disconnect(transport, device)
}

/// Unlock the device and print its UID.
pub fn unlock(device: &Path) -> Result<()> {
    let mut transport = connect(device)?;
    let uid = unlock_device(&mut transport)?;
    println!("Unlocked, UID: {:02x?}", uid);
    disconnect(transport, device)
}

/// Erase the image area, send it page by page and install its descriptor.
pub fn upload(device: &Path, file: &Path, address: Option<u32>, frame_size: u8) -> Result<()> {
    let firmware = read_image(file)?;
    let mut transport = connect(device)?;
    unlock_device(&mut transport)?;
    let identity = query_identity(&mut transport)?;
    let address = address.unwrap_or(identity.application_first_address);

    let layout = transport.device().layout;
    if !layout.is_page_aligned(address) {
        bail!("Start address {:#x} is not page aligned", address);
    }
    check_fits(&layout, address, firmware.len())?;

    let descriptor = describe(address, &firmware);
    println!(
        "Firmware: {} ({} bytes, CRC32: 0x{:08x})",
        file.display(),
        firmware.len(),
        descriptor.crc
    );
    println!("Target:   {:#x}..={:#x}", descriptor.start_address, descriptor.end_address);
    println!();

    print!("Erasing... ");
    std::io::stdout().flush()?;
    transport.execute(&Command::EraseAddressRange {
        start: descriptor.start_address,
        end: descriptor.end_address,
    })?;
    println!("OK");

    let pb = progress_bar(firmware.len() as u64)?;
    for (index, chunk) in firmware.chunks(BLOCK_SIZE).enumerate() {
        let block_address = address + (index * BLOCK_SIZE) as u32;
        if let Err(e) = send_block(&mut transport, block_address, chunk, frame_size) {
            pb.abandon();
            return Err(e.context(format!("Block at {:#x} failed", block_address)));
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_with_message("Upload complete");

    install_descriptor(&mut transport, &descriptor)?;
    disconnect(transport, device)?;

    println!();
    println!("Firmware uploaded successfully!");
    Ok(())
}

/// Stage one block, padded with erased bytes, and program it.
fn send_block(transport: &mut Transport, address: u32, chunk: &[u8], frame_size: u8) -> Result<()> {
    let mut block = [0xFFu8; BLOCK_SIZE];
    block[..chunk.len()].copy_from_slice(chunk);

    let frame_size = usize::from(frame_size);
    for (index, data) in block.chunks(frame_size).enumerate() {
        let offset = u8::try_from(index * frame_size).context("Fragment offset out of range")?;
        transport.execute(&Command::SendData { offset, data })?;
    }
    transport.execute(&Command::Program {
        count: BLOCK_SIZE as u16,
        address,
        crc: CRC32.checksum(&block),
    })
}

/// Send `file` as a patch against `old`, the image currently installed.
pub fn upload_diff(device: &Path, file: &Path, old: &Path, frame_size: u8) -> Result<()> {
    let firmware = read_image(file)?;
    let previous = read_image(old)?;
    let mut transport = connect(device)?;
    unlock_device(&mut transport)?;

    let identity = query_identity(&mut transport)?;
    if identity.features & EngineConfig::FEATURE_DIFF == 0 {
        bail!("Bootloader does not support differential updates");
    }

    let (start, end, crc) = match transport.send_recv(&Command::RequestBootDescriptor)? {
        Response::BootDescriptor { start, end, crc } => (start, end, crc),
        response => bail!("Unexpected response: {:?}", response),
    };
    if start == u32::MAX || crc != CRC32.checksum(&previous) || (end - start + 1) as usize != previous.len() {
        bail!("{} is not the image installed on the device", old.display());
    }
    check_fits(&transport.device().layout, start, firmware.len())?;

    let pages = diff::encode(&previous, &firmware);
    let patch_len: usize = pages.iter().map(|page| page.stream.len()).sum();
    println!(
        "Firmware: {} ({} bytes, patch {} bytes against {})",
        file.display(),
        firmware.len(),
        patch_len,
        old.display()
    );
    println!("Target:   {:#x}", start);
    println!();

    let pb = progress_bar(firmware.len() as u64)?;
    for (index, page) in pages.iter().enumerate() {
        if let Err(e) = send_patch_page(&mut transport, page, frame_size) {
            pb.abandon();
            return Err(e.context(format!("Patch page {} failed", index)));
        }
        pb.inc(page.len as u64);
    }
    pb.finish_with_message("Upload complete");

    install_descriptor(&mut transport, &describe(start, &firmware))?;
    disconnect(transport, device)?;

    println!();
    println!("Firmware patched successfully!");
    Ok(())
}

fn send_patch_page(transport: &mut Transport, page: &diff::PatchPage, frame_size: u8) -> Result<()> {
    for data in page.stream.chunks(usize::from(frame_size)) {
        transport.execute(&Command::SendDataToDecompress { data })?;
    }
    transport.execute(&Command::ProgramDecompressedData { crc: page.crc })
}

/// Erase a range, or the complete application area.
pub fn erase(device: &Path, range: Option<(u32, u32)>) -> Result<()> {
    let mut transport = connect(device)?;
    unlock_device(&mut transport)?;

    let cmd = match range {
        Some((start, end)) => Command::EraseAddressRange { start, end },
        None => Command::EraseCompleteFlash,
    };
    print!("Erasing... ");
    std::io::stdout().flush()?;
    transport.execute(&cmd)?;
    println!("OK");
    disconnect(transport, device)
}

/// Print a flash range as hex.
pub fn dump(device: &Path, start: u32, end: u32) -> Result<()> {
    let mut transport = connect(device)?;
    unlock_device(&mut transport)?;
    transport.execute(&Command::DumpFlash { start, end })?;

    let Some(&(first, last)) = transport.dumps().last() else {
        bail!("Device did not dump anything");
    };
    let bytes = transport.device().slice(first, last);
    for (index, line) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:08x}: {}", first as usize + index * 16, hex.join(" "));
    }
    disconnect(transport, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_version_offset() {
        let mut image = vec![0u8; 0x200];
        image[0x100..0x107].copy_from_slice(APP_VERSION_MAGIC);
        assert_eq!(app_version_offset(&image), Some(0x107));
    }

    #[test]
    fn test_app_version_inside_vector_table_is_ignored() {
        let mut image = vec![0u8; 0x200];
        image[0x10..0x17].copy_from_slice(APP_VERSION_MAGIC);
        assert_eq!(app_version_offset(&image), None);
    }

    #[test]
    fn test_app_version_needs_room_for_string() {
        let mut image = vec![0u8; 0x110];
        image[0x100..0x107].copy_from_slice(APP_VERSION_MAGIC);
        assert_eq!(app_version_offset(&image), None);
    }

    #[test]
    fn test_describe_image() {
        let descriptor = describe(0x3000, &[0xAA; 300]);
        assert_eq!(descriptor.start_address, 0x3000);
        assert_eq!(descriptor.end_address, 0x312B);
        assert_eq!(descriptor.app_version_address, 0);
    }

    #[test]
    fn test_full_and_diff_upload_end_to_end() {
        let dir = std::env::temp_dir().join(format!("busboot-upload-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let device = dir.join("device.bin");
        let old = dir.join("old.bin");
        let new = dir.join("new.bin");

        let mut old_image: Vec<u8> = (0..1500u32).map(|i| (i * 7 % 251) as u8).collect();
        old_image[0x100..0x107].copy_from_slice(APP_VERSION_MAGIC);
        old_image[0x107..0x113].copy_from_slice(b"demo v1.0.0 ");
        let mut new_image = old_image.clone();
        new_image[0x107..0x113].copy_from_slice(b"demo v1.1.0 ");
        new_image.extend_from_slice(&[0x5A; 100]);
        fs::write(&old, &old_image).unwrap();
        fs::write(&new, &new_image).unwrap();

        init(&device, [0x42; 16]).unwrap();
        upload(&device, &old, None, 12).unwrap();
        upload_diff(&device, &new, &old, 32).unwrap();

        let snapshot = EmulatedDevice::load(&device).unwrap();
        let start = snapshot.layout.application_first_address();
        assert_eq!(snapshot.slice(start, start + new_image.len() as u32 - 1), &new_image[..]);

        let mut transport = Transport::new(snapshot);
        match transport.send_recv(&Command::AppVersionRequest).unwrap() {
            Response::AppVersion(version) => assert_eq!(&version, b"demo v1.1.0 "),
            other => panic!("unexpected {:?}", other),
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
