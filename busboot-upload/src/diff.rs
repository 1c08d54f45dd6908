// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Patch stream encoder for differential updates.
//!
//! The device rewrites its image in place, one page at a time, so the encoder
//! keeps a model of the device flash and of its two-page window of old
//! content. A COPY may only reference bytes the model knows the device will
//! hold at the moment that page is decoded.

use std::collections::HashMap;

use busboot_common::checksum::crc32;
use busboot_common::decompressor::{CopySource, PatchCommand, RECENT_PAGES_SIZE};
use busboot_common::protocol::FLASH_PAGE_SIZE;

const PAGE: usize = FLASH_PAGE_SIZE as usize;

/// Shorter matches cost more as a COPY header than as literal bytes.
pub const MIN_MATCH: usize = 6;
const MAX_CANDIDATES: usize = 64;

/// Patch stream and expected CRC of one target page.
#[derive(Debug, Clone)]
pub struct PatchPage {
    pub stream: Vec<u8>,
    pub crc: u32,
    pub len: usize,
}

struct DiffEncoder {
    /// Device flash relative to the image start; `None` where the content is unknown.
    flash: Vec<Option<u8>>,
    /// Old content of the two most recently committed pages.
    recent: Vec<Option<u8>>,
    index: HashMap<[u8; MIN_MATCH], Vec<usize>>,
}

struct Match {
    source: CopySource,
    len: usize,
}

fn match_len(source: &[Option<u8>], at: usize, target: &[u8]) -> usize {
    target
        .iter()
        .enumerate()
        .take_while(|&(j, &byte)| source.get(at + j) == Some(&Some(byte)))
        .count()
}

impl DiffEncoder {
    fn new(old: &[u8], new_len: usize) -> Self {
        let len = old.len().max(new_len).div_ceil(PAGE) * PAGE;
        let mut flash = vec![None; len];
        flash.iter_mut().zip(old).for_each(|(cell, &byte)| *cell = Some(byte));

        let mut encoder = Self {
            flash,
            // The device zeroes its window at start.
            recent: vec![Some(0); RECENT_PAGES_SIZE],
            index: HashMap::new(),
        };
        encoder.index_range(0, old.len());
        encoder
    }

    fn key_at(&self, at: usize) -> Option<[u8; MIN_MATCH]> {
        let mut key = [0u8; MIN_MATCH];
        for (i, slot) in key.iter_mut().enumerate() {
            *slot = (*self.flash.get(at + i)?)?;
        }
        Some(key)
    }

    fn index_range(&mut self, start: usize, end: usize) {
        for at in start..end {
            if let Some(key) = self.key_at(at) {
                self.index.entry(key).or_default().push(at);
            }
        }
    }

    fn find_in_flash(&self, target: &[u8]) -> Option<Match> {
        let key: [u8; MIN_MATCH] = target.get(..MIN_MATCH)?.try_into().ok()?;
        let candidates = self.index.get(&key)?;
        candidates
            .iter()
            .rev()
            .take(MAX_CANDIDATES)
            .map(|&at| (at, match_len(&self.flash, at, target)))
            .max_by_key(|&(_, len)| len)
            .map(|(at, len)| Match {
                source: CopySource::PreviousImage(at as u32),
                len,
            })
    }

    fn find_in_recent(&self, target: &[u8]) -> Option<Match> {
        (0..RECENT_PAGES_SIZE)
            .map(|at| (at, match_len(&self.recent, at, target)))
            .max_by_key(|&(_, len)| len)
            .map(|(at, len)| Match {
                source: CopySource::RecentPages(at as u32),
                len,
            })
    }

    fn encode_page(&mut self, page: usize, data: &[u8]) -> PatchPage {
        let mut stream = Vec::new();
        let mut literal = Vec::new();
        let mut at = 0;

        while at < data.len() {
            let rest = &data[at..];
            let best = [self.find_in_flash(rest), self.find_in_recent(rest)]
                .into_iter()
                .flatten()
                .max_by_key(|m| m.len)
                .filter(|m| m.len >= MIN_MATCH);

            match best {
                Some(found) => {
                    flush_literal(&mut stream, &mut literal);
                    push_command(
                        &mut stream,
                        PatchCommand::Copy {
                            length: found.len as u16,
                            source: found.source,
                        },
                    );
                    at += found.len;
                }
                None => {
                    literal.push(data[at]);
                    at += 1;
                }
            }
        }
        flush_literal(&mut stream, &mut literal);

        self.commit(page, data);
        PatchPage {
            stream,
            crc: crc32(data),
            len: data.len(),
        }
    }

    /// Mirror what the device does after `ProgramDecompressedData`.
    fn commit(&mut self, page: usize, data: &[u8]) {
        let start = page * PAGE;
        self.recent.copy_within(PAGE.., 0);
        self.recent[PAGE..].copy_from_slice(&self.flash[start..start + PAGE]);

        for (i, cell) in self.flash[start..start + PAGE].iter_mut().enumerate() {
            *cell = Some(data.get(i).copied().unwrap_or(0));
        }
        self.index_range(start.saturating_sub(MIN_MATCH - 1), start + PAGE);
    }
}

fn push_command(stream: &mut Vec<u8>, command: PatchCommand) {
    let (header, len) = command.encode();
    stream.extend_from_slice(&header[..len]);
}

fn flush_literal(stream: &mut Vec<u8>, literal: &mut Vec<u8>) {
    if literal.is_empty() {
        return;
    }
    push_command(
        stream,
        PatchCommand::Raw {
            length: literal.len() as u16,
        },
    );
    stream.append(literal);
}

/// Encode `new` as a patch against `old`, which the device holds at the same start address.
pub fn encode(old: &[u8], new: &[u8]) -> Vec<PatchPage> {
    let mut encoder = DiffEncoder::new(old, new.len());
    let pages: Vec<_> = new
        .chunks(PAGE)
        .enumerate()
        .map(|(page, data)| encoder.encode_page(page, data))
        .collect();

    let stream_len: usize = pages.iter().map(|p| p.stream.len()).sum();
    log::info!("diff: {} bytes of image in {} bytes of patch", new.len(), stream_len);
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedDevice;
    use busboot_common::{Decompressor, FlashGuard, FlashLayout};

    const BASE: u32 = 0x3000;

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    /// Install `old`, replay the patch through the device decoder and return the new flash bytes.
    fn apply(old: &[u8], pages: &[PatchPage], new_len: usize) -> Vec<u8> {
        let layout = FlashLayout::LPC11XX_64K;
        let mut device = EmulatedDevice::new(layout, [0; 16]);
        device.flash[BASE as usize..BASE as usize + old.len()].copy_from_slice(old);
        let guard = FlashGuard::new(layout);
        let mut decompressor = Decompressor::new(layout, BASE);

        for page in pages {
            for &byte in &page.stream {
                decompressor.put_byte(&device, byte).unwrap();
            }
            assert_eq!(decompressor.crc32(), page.crc);
            decompressor.page_completed_do_flash(&guard, &mut device).unwrap();
        }
        device.slice(BASE, BASE + new_len as u32 - 1).to_vec()
    }

    fn stream_len(pages: &[PatchPage]) -> usize {
        pages.iter().map(|p| p.stream.len()).sum()
    }

    #[test]
    fn test_identical_image_is_nearly_free() {
        let old = noise(2048, 1);
        let pages = encode(&old, &old);
        assert_eq!(pages.len(), 8);
        assert!(stream_len(&pages) < 100, "{}", stream_len(&pages));
        assert_eq!(apply(&old, &pages, old.len()), old);
    }

    #[test]
    fn test_inserted_bytes_shift_the_image() {
        let old = noise(3000, 2);
        let mut new = vec![0xAB; 10];
        new.extend_from_slice(&old);
        let pages = encode(&old, &new);
        assert!(stream_len(&pages) < new.len() / 4);
        assert_eq!(apply(&old, &pages, new.len()), new);
    }

    #[test]
    fn test_removed_bytes_and_partial_last_page() {
        let old = noise(3000, 3);
        let mut new = old[..500].to_vec();
        new.extend_from_slice(&old[700..]);
        let pages = encode(&old, &new);
        assert_eq!(pages.last().map(|p| p.len), Some(new.len() % PAGE));
        assert_eq!(apply(&old, &pages, new.len()), new);
    }

    #[test]
    fn test_unrelated_image_is_all_literal() {
        let old = noise(1024, 4);
        let new = noise(1500, 5);
        let pages = encode(&old, &new);
        assert!(stream_len(&pages) > new.len());
        assert_eq!(apply(&old, &pages, new.len()), new);
    }

    #[test]
    fn test_growing_image_reuses_rewritten_pages() {
        let old = noise(512, 6);
        let mut new = old.clone();
        new.extend_from_slice(&old);
        new.extend_from_slice(&old);
        let pages = encode(&old, &new);
        assert!(stream_len(&pages) < 200);
        assert_eq!(apply(&old, &pages, new.len()), new);
    }

    /// Build `new` from `old` by a seeded script of copies, inserts and fills.
    fn edited(old: &[u8], seed: u32) -> Vec<u8> {
        let mut state = seed;
        let mut next = |bound: usize| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 8) as usize % bound.max(1)
        };

        let target = 1 + next(12 * 1024);
        let mut new = Vec::with_capacity(target);
        while new.len() < target {
            let len = 1 + next(600);
            match next(4) {
                0 | 1 if !old.is_empty() => {
                    let from = next(old.len());
                    let to = (from + len).min(old.len());
                    new.extend_from_slice(&old[from..to]);
                }
                2 => new.extend(noise(len, seed.wrapping_add(new.len() as u32))),
                _ => {
                    let fill = next(256) as u8;
                    new.resize(new.len() + len, fill);
                }
            }
        }
        new.truncate(target);
        new
    }

    #[test]
    fn test_random_edits_round_trip() {
        for seed in 0..100u32 {
            let old = noise((seed as usize * 61) % (12 * 1024), seed ^ 0x5A5A);
            let new = edited(&old, seed);
            let pages = encode(&old, &new);
            assert_eq!(pages.len(), new.len().div_ceil(PAGE), "seed {seed}");
            assert_eq!(apply(&old, &pages, new.len()), new, "seed {seed}");
        }
    }
}
