// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Hardware collaborators: the in-application-programming (IAP) flash primitive
//! and the bus link the update commands arrive on.

use crate::protocol::{UdpState, IAP_UID_LENGTH};

/// Status word returned by the vendor IAP routines.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IapStatus {
    CmdSuccess = 0,
    InvalidCommand = 1,
    SrcAddrError = 2,
    DstAddrError = 3,
    SrcAddrNotMapped = 4,
    DstAddrNotMapped = 5,
    CountError = 6,
    InvalidSector = 7,
    SectorNotBlank = 8,
    SectorNotPreparedForWriteOperation = 9,
    CompareError = 10,
    Busy = 11,
}

impl IapStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => IapStatus::CmdSuccess,
            1 => IapStatus::InvalidCommand,
            2 => IapStatus::SrcAddrError,
            3 => IapStatus::DstAddrError,
            4 => IapStatus::SrcAddrNotMapped,
            5 => IapStatus::DstAddrNotMapped,
            6 => IapStatus::CountError,
            7 => IapStatus::InvalidSector,
            8 => IapStatus::SectorNotBlank,
            9 => IapStatus::SectorNotPreparedForWriteOperation,
            10 => IapStatus::CompareError,
            11 => IapStatus::Busy,
            _ => return None,
        })
    }

    pub fn into_result(self) -> Result<(), UdpState> {
        match self {
            IapStatus::CmdSuccess => Ok(()),
            other => Err(other.into()),
        }
    }
}

impl From<IapStatus> for UdpState {
    fn from(status: IapStatus) -> Self {
        match status {
            IapStatus::CmdSuccess => UdpState::Success,
            IapStatus::InvalidCommand => UdpState::InvalidCommand,
            IapStatus::SrcAddrError => UdpState::SrcAddrError,
            IapStatus::DstAddrError => UdpState::DstAddrError,
            IapStatus::SrcAddrNotMapped => UdpState::SrcAddrNotMapped,
            IapStatus::DstAddrNotMapped => UdpState::DstAddrNotMapped,
            IapStatus::CountError => UdpState::CountError,
            IapStatus::InvalidSector => UdpState::InvalidSector,
            IapStatus::SectorNotBlank => UdpState::SectorNotBlank,
            IapStatus::SectorNotPreparedForWriteOperation => UdpState::SectorNotPrepared,
            IapStatus::CompareError => UdpState::CompareError,
            IapStatus::Busy => UdpState::Busy,
        }
    }
}

impl UdpState {
    /// Map a raw IAP status word; codes outside the vendor table become `IapUnknown`.
    pub fn from_iap_code(code: u32) -> Self {
        IapStatus::from_code(code).map_or(UdpState::IapUnknown, UdpState::from)
    }
}

/// Flash programming primitive.
///
/// Page and sector numbers are relative to the start of flash. `program`
/// accepts page-aligned blocks of 256, 512, 1024 or 4096 bytes; implementations
/// take care of the prepare/erase/copy sequence of the underlying ROM routine.
pub trait Iap {
    fn erase_pages(&mut self, first: u32, last: u32) -> IapStatus;
    fn erase_sectors(&mut self, first: u32, last: u32) -> IapStatus;
    fn program(&mut self, address: u32, data: &[u8]) -> IapStatus;
    fn read_uid(&self) -> Result<[u8; IAP_UID_LENGTH], IapStatus>;
    /// Memory-mapped read. Addresses outside flash read as erased (0xFF).
    fn read(&self, address: u32, buf: &mut [u8]);
}

/// Transport-level counters reported with `RequestStatistic`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct LinkStatistic {
    pub disconnect_count: u16,
    pub repeated_ack_count: u16,
}

/// The bus link the update requests arrive on.
pub trait Link {
    /// Stop bus reception while flash is unavailable.
    fn pause(&mut self);
    fn resume(&mut self);
    fn is_idle(&self) -> bool;
    fn programming_button_pressed(&self) -> bool;

    fn statistic(&self) -> LinkStatistic {
        LinkStatistic::default()
    }

    /// Debug hook: stream flash contents `start..=end` out on a side channel.
    fn dump(&mut self, _start: u32, _end: u32) {}
}

/// Keeps the link paused for as long as it lives.
pub struct LinkPause<'a, L: Link> {
    link: &'a mut L,
}

impl<'a, L: Link> LinkPause<'a, L> {
    pub fn new(link: &'a mut L) -> Self {
        if !link.is_idle() {
            upd_log!(warn, "pausing link while a transfer is in flight");
        }
        link.pause();
        Self { link }
    }
}

impl<L: Link> Drop for LinkPause<'_, L> {
    fn drop(&mut self) {
        self.link.resume();
    }
}
