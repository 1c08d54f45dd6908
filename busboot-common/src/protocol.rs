// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! UPD/UDP wire protocol shared by the bootloader engine and host tools.
//!
//! A request is one application payload: byte 0 is the [`UpdCode`], the rest is
//! command specific. All multi-byte fields are little-endian. Replies are short
//! (at most [`MAX_REPLY_LENGTH`] bytes), which is why most commands only get an
//! acknowledgement and the outcome is fetched with a follow-up
//! [`UpdCode::SendLastError`].

use core::fmt;

// --- Flash geometry constants ---

pub const FLASH_PAGE_SIZE: u32 = 256;
pub const FLASH_SECTOR_SIZE: u32 = 4096;
pub const PAGES_PER_SECTOR: u32 = FLASH_SECTOR_SIZE / FLASH_PAGE_SIZE;

// --- Protocol sizes ---

/// Largest extended bus frame payload.
pub const MAX_FRAME_LENGTH: usize = 254;
/// Largest command payload after the code byte.
pub const MAX_UPD_PAYLOAD: usize = MAX_FRAME_LENGTH - 1;
/// Staging RAM for `SendData`, five maximum-size fragments.
pub const STAGING_BUFFER_SIZE: usize = 5 * MAX_UPD_PAYLOAD;
/// Longest reply the transport can carry, code byte included.
pub const MAX_REPLY_LENGTH: usize = 13;

pub const UID_LENGTH: usize = 12;
pub const IAP_UID_LENGTH: usize = 16;
pub const APP_VERSION_LENGTH: usize = 12;

/// Reported as application version when no usable version string exists.
pub const BL_ID_STRING: [u8; APP_VERSION_LENGTH] = *b"[SB KNX BL ]";

pub type Frame = heapless::Vec<u8, MAX_FRAME_LENGTH>;
pub type Reply = heapless::Vec<u8, MAX_REPLY_LENGTH>;

// --- Codes ---

/// One-byte request/response code.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdCode {
    Invalid = 0x00,
    SetEmulation = 0x01,
    ResponseBootloaderVersionMismatch = 0xB6,
    ResponseBootloaderIdentity = 0xB7,
    RequestBootloaderIdentity = 0xB8,
    ResponseBootDescriptor = 0xB9,
    RequestBootDescriptor = 0xBA,
    AppVersionResponse = 0xBB,
    AppVersionRequest = 0xBC,
    ResponseUid = 0xBD,
    RequestUid = 0xBE,
    UnlockDevice = 0xBF,
    SendLastError = 0xDC,
    ResponseStatistic = 0xDE,
    RequestStatistic = 0xDF,
    DumpFlash = 0xE7,
    RequestData = 0xE8,
    EraseAddressRange = 0xE9,
    EraseCompleteFlash = 0xEA,
    ProgramDecompressedData = 0xEB,
    SendDataToDecompress = 0xEC,
    UpdateBootDescriptor = 0xED,
    Program = 0xEE,
    SendData = 0xEF,
}

/// Accepted payload length range of one [`UpdCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdCommandSpec {
    pub code: UpdCode,
    pub min_bytes: u8,
    pub max_bytes: u8,
}

impl UpdCommandSpec {
    const fn new(code: UpdCode, min_bytes: u8, max_bytes: u8) -> Self {
        Self {
            code,
            min_bytes,
            max_bytes,
        }
    }

    pub fn accepts(&self, payload_len: usize) -> bool {
        (usize::from(self.min_bytes)..=usize::from(self.max_bytes)).contains(&payload_len)
    }
}

const ANY: u8 = MAX_UPD_PAYLOAD as u8;

/// Command table. Entry 0 is the reserved invalid code.
pub static UPD_COMMAND_TABLE: [UpdCommandSpec; 24] = [
    UpdCommandSpec::new(UpdCode::Invalid, 0, 0),
    UpdCommandSpec::new(UpdCode::SetEmulation, 0, ANY),
    UpdCommandSpec::new(UpdCode::ResponseBootloaderVersionMismatch, 0, ANY),
    UpdCommandSpec::new(UpdCode::ResponseBootloaderIdentity, 0, ANY),
    UpdCommandSpec::new(UpdCode::RequestBootloaderIdentity, 2, 2),
    UpdCommandSpec::new(UpdCode::ResponseBootDescriptor, 0, ANY),
    UpdCommandSpec::new(UpdCode::RequestBootDescriptor, 0, 0),
    UpdCommandSpec::new(UpdCode::AppVersionResponse, 0, ANY),
    UpdCommandSpec::new(UpdCode::AppVersionRequest, 0, 0),
    UpdCommandSpec::new(UpdCode::ResponseUid, 0, ANY),
    UpdCommandSpec::new(UpdCode::RequestUid, 0, 0),
    UpdCommandSpec::new(UpdCode::UnlockDevice, UID_LENGTH as u8, UID_LENGTH as u8),
    UpdCommandSpec::new(UpdCode::SendLastError, 0, 0),
    UpdCommandSpec::new(UpdCode::ResponseStatistic, 0, ANY),
    UpdCommandSpec::new(UpdCode::RequestStatistic, 0, 0),
    UpdCommandSpec::new(UpdCode::DumpFlash, 8, 8),
    UpdCommandSpec::new(UpdCode::RequestData, 0, ANY),
    UpdCommandSpec::new(UpdCode::EraseAddressRange, 8, 8),
    UpdCommandSpec::new(UpdCode::EraseCompleteFlash, 0, 0),
    UpdCommandSpec::new(UpdCode::ProgramDecompressedData, 4, 4),
    UpdCommandSpec::new(UpdCode::SendDataToDecompress, 1, ANY),
    UpdCommandSpec::new(UpdCode::UpdateBootDescriptor, 8, 8),
    UpdCommandSpec::new(UpdCode::Program, 10, 10),
    UpdCommandSpec::new(UpdCode::SendData, 2, ANY),
];

impl UpdCode {
    /// Map a raw byte to its code; unknown bytes map to [`UpdCode::Invalid`].
    pub fn from_byte(byte: u8) -> Self {
        UPD_COMMAND_TABLE
            .iter()
            .map(|spec| spec.code)
            .find(|code| *code as u8 == byte)
            .unwrap_or(UpdCode::Invalid)
    }

    pub fn spec(self) -> &'static UpdCommandSpec {
        UPD_COMMAND_TABLE
            .iter()
            .find(|spec| spec.code == self)
            .unwrap_or(&UPD_COMMAND_TABLE[0])
    }

    /// Commands accepted while the device is locked.
    pub fn allowed_while_locked(self) -> bool {
        matches!(
            self,
            UpdCode::UnlockDevice | UpdCode::RequestUid | UpdCode::AppVersionRequest
        )
    }
}

// --- Results ---

/// Outcome of a command, read back with `SendLastError`.
///
/// The `0x7F..=0x73` block mirrors the flash-programming primitive's status
/// codes one to one; the `0x5F..=0x51` block is protocol level.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum UdpState {
    Success = 0x7F,
    InvalidCommand = 0x7E,
    SrcAddrError = 0x7D,
    DstAddrError = 0x7C,
    SrcAddrNotMapped = 0x7B,
    DstAddrNotMapped = 0x7A,
    CountError = 0x79,
    InvalidSector = 0x78,
    SectorNotBlank = 0x77,
    SectorNotPrepared = 0x76,
    CompareError = 0x75,
    Busy = 0x74,
    IapUnknown = 0x73,

    UnknownCommand = 0x5F,
    CrcError = 0x5E,
    AddressNotAllowedToFlash = 0x5D,
    SectorNotAllowedToErase = 0x5C,
    RamBufferOverflow = 0x5B,
    WrongDescriptorBlock = 0x5A,
    ApplicationNotStartable = 0x59,
    DeviceLocked = 0x58,
    UidMismatch = 0x57,
    EraseFailed = 0x56,
    InvalidData = 0x55,
    NoData = 0x54,
    FlashError = 0x53,
    PageNotAllowedToErase = 0x52,
    AddressRangeNotAllowedToErase = 0x51,

    NotImplemented = 0x02,
    Invalid = 0x01,
}

impl UdpState {
    const ALL: [UdpState; 30] = [
        UdpState::Success,
        UdpState::InvalidCommand,
        UdpState::SrcAddrError,
        UdpState::DstAddrError,
        UdpState::SrcAddrNotMapped,
        UdpState::DstAddrNotMapped,
        UdpState::CountError,
        UdpState::InvalidSector,
        UdpState::SectorNotBlank,
        UdpState::SectorNotPrepared,
        UdpState::CompareError,
        UdpState::Busy,
        UdpState::IapUnknown,
        UdpState::UnknownCommand,
        UdpState::CrcError,
        UdpState::AddressNotAllowedToFlash,
        UdpState::SectorNotAllowedToErase,
        UdpState::RamBufferOverflow,
        UdpState::WrongDescriptorBlock,
        UdpState::ApplicationNotStartable,
        UdpState::DeviceLocked,
        UdpState::UidMismatch,
        UdpState::EraseFailed,
        UdpState::InvalidData,
        UdpState::NoData,
        UdpState::FlashError,
        UdpState::PageNotAllowedToErase,
        UdpState::AddressRangeNotAllowedToErase,
        UdpState::NotImplemented,
        UdpState::Invalid,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| *state as u8 == byte)
    }

    pub fn is_success(self) -> bool {
        self == UdpState::Success
    }

    pub fn from_result(result: Result<(), UdpState>) -> Self {
        match result {
            Ok(()) => UdpState::Success,
            Err(state) => state,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            UdpState::Success => "success",
            UdpState::InvalidCommand => "invalid IAP command",
            UdpState::SrcAddrError => "source address not on a word boundary",
            UdpState::DstAddrError => "destination address not on a correct boundary",
            UdpState::SrcAddrNotMapped => "source address not mapped",
            UdpState::DstAddrNotMapped => "destination address not mapped",
            UdpState::CountError => "byte count is not a supported block size",
            UdpState::InvalidSector => "invalid sector or page number",
            UdpState::SectorNotBlank => "sector is not blank",
            UdpState::SectorNotPrepared => "sector not prepared for write operation",
            UdpState::CompareError => "flash content differs from source",
            UdpState::Busy => "flash interface busy",
            UdpState::IapUnknown => "unknown IAP status",
            UdpState::UnknownCommand => "unknown command",
            UdpState::CrcError => "CRC mismatch",
            UdpState::AddressNotAllowedToFlash => "address not allowed to flash",
            UdpState::SectorNotAllowedToErase => "sector not allowed to erase",
            UdpState::RamBufferOverflow => "RAM buffer overflow",
            UdpState::WrongDescriptorBlock => "wrong boot descriptor block",
            UdpState::ApplicationNotStartable => "application not startable",
            UdpState::DeviceLocked => "device locked",
            UdpState::UidMismatch => "UID mismatch",
            UdpState::EraseFailed => "erase failed",
            UdpState::InvalidData => "invalid data",
            UdpState::NoData => "no data",
            UdpState::FlashError => "flash error",
            UdpState::PageNotAllowedToErase => "page not allowed to erase",
            UdpState::AddressRangeNotAllowedToErase => "address range not allowed to erase",
            UdpState::NotImplemented => "not implemented",
            UdpState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for UdpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), *self as u8)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UdpState {}

// --- Little-endian stream helpers ---

pub fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let field = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([field[0], field[1]]))
}

pub fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let field = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

// --- Requests ---

/// A decoded inbound request. Borrowed data points into the received payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    UnlockDevice { uid: [u8; UID_LENGTH] },
    RequestUid,
    AppVersionRequest,
    /// Stage `data` at byte `offset` of the staging buffer.
    SendData { offset: u8, data: &'a [u8] },
    Program { count: u16, address: u32, crc: u32 },
    SendDataToDecompress { data: &'a [u8] },
    ProgramDecompressedData { crc: u32 },
    EraseCompleteFlash,
    /// Both addresses inclusive.
    EraseAddressRange { start: u32, end: u32 },
    DumpFlash { start: u32, end: u32 },
    RequestStatistic,
    SendLastError,
    UpdateBootDescriptor { count: u32, crc: u32 },
    RequestBootDescriptor,
    RequestBootloaderIdentity { major: u8, minor: u8 },
    RequestData { payload: &'a [u8] },
}

impl<'a> Command<'a> {
    /// Decode the payload of `code`. Response-only and reserved codes yield `None`.
    pub fn parse(code: UpdCode, payload: &'a [u8]) -> Option<Self> {
        let command = match code {
            UpdCode::UnlockDevice => {
                let mut uid = [0u8; UID_LENGTH];
                uid.copy_from_slice(payload.get(..UID_LENGTH)?);
                Command::UnlockDevice { uid }
            }
            UpdCode::RequestUid => Command::RequestUid,
            UpdCode::AppVersionRequest => Command::AppVersionRequest,
            UpdCode::SendData => {
                let (&offset, data) = payload.split_first()?;
                Command::SendData { offset, data }
            }
            UpdCode::Program => Command::Program {
                count: le_u16(payload, 0)?,
                address: le_u32(payload, 2)?,
                crc: le_u32(payload, 6)?,
            },
            UpdCode::SendDataToDecompress => Command::SendDataToDecompress { data: payload },
            UpdCode::ProgramDecompressedData => Command::ProgramDecompressedData {
                crc: le_u32(payload, 0)?,
            },
            UpdCode::EraseCompleteFlash => Command::EraseCompleteFlash,
            UpdCode::EraseAddressRange => Command::EraseAddressRange {
                start: le_u32(payload, 0)?,
                end: le_u32(payload, 4)?,
            },
            UpdCode::DumpFlash => Command::DumpFlash {
                start: le_u32(payload, 0)?,
                end: le_u32(payload, 4)?,
            },
            UpdCode::RequestStatistic => Command::RequestStatistic,
            UpdCode::SendLastError => Command::SendLastError,
            UpdCode::UpdateBootDescriptor => Command::UpdateBootDescriptor {
                count: le_u32(payload, 0)?,
                crc: le_u32(payload, 4)?,
            },
            UpdCode::RequestBootDescriptor => Command::RequestBootDescriptor,
            UpdCode::RequestBootloaderIdentity => Command::RequestBootloaderIdentity {
                major: *payload.first()?,
                minor: *payload.get(1)?,
            },
            UpdCode::RequestData => Command::RequestData { payload },
            UpdCode::Invalid
            | UpdCode::SetEmulation
            | UpdCode::ResponseBootloaderVersionMismatch
            | UpdCode::ResponseBootloaderIdentity
            | UpdCode::ResponseBootDescriptor
            | UpdCode::AppVersionResponse
            | UpdCode::ResponseUid
            | UpdCode::ResponseStatistic => return None,
        };
        Some(command)
    }

    pub fn code(&self) -> UpdCode {
        match self {
            Command::UnlockDevice { .. } => UpdCode::UnlockDevice,
            Command::RequestUid => UpdCode::RequestUid,
            Command::AppVersionRequest => UpdCode::AppVersionRequest,
            Command::SendData { .. } => UpdCode::SendData,
            Command::Program { .. } => UpdCode::Program,
            Command::SendDataToDecompress { .. } => UpdCode::SendDataToDecompress,
            Command::ProgramDecompressedData { .. } => UpdCode::ProgramDecompressedData,
            Command::EraseCompleteFlash => UpdCode::EraseCompleteFlash,
            Command::EraseAddressRange { .. } => UpdCode::EraseAddressRange,
            Command::DumpFlash { .. } => UpdCode::DumpFlash,
            Command::RequestStatistic => UpdCode::RequestStatistic,
            Command::SendLastError => UpdCode::SendLastError,
            Command::UpdateBootDescriptor { .. } => UpdCode::UpdateBootDescriptor,
            Command::RequestBootDescriptor => UpdCode::RequestBootDescriptor,
            Command::RequestBootloaderIdentity { .. } => UpdCode::RequestBootloaderIdentity,
            Command::RequestData { .. } => UpdCode::RequestData,
        }
    }

    /// Encode into one request payload. Fails with `InvalidData` when the
    /// command carries more data than one frame holds.
    pub fn encode(&self) -> Result<Frame, UdpState> {
        let mut frame = Frame::new();
        let mut put = |bytes: &[u8]| {
            frame
                .extend_from_slice(bytes)
                .map_err(|_| UdpState::InvalidData)
        };
        put(&[self.code() as u8])?;
        match *self {
            Command::UnlockDevice { uid } => put(&uid)?,
            Command::SendData { offset, data } => {
                put(&[offset])?;
                put(data)?;
            }
            Command::Program {
                count,
                address,
                crc,
            } => {
                put(&count.to_le_bytes())?;
                put(&address.to_le_bytes())?;
                put(&crc.to_le_bytes())?;
            }
            Command::SendDataToDecompress { data } => put(data)?,
            Command::ProgramDecompressedData { crc } => put(&crc.to_le_bytes())?,
            Command::EraseAddressRange { start, end } | Command::DumpFlash { start, end } => {
                put(&start.to_le_bytes())?;
                put(&end.to_le_bytes())?;
            }
            Command::UpdateBootDescriptor { count, crc } => {
                put(&count.to_le_bytes())?;
                put(&crc.to_le_bytes())?;
            }
            Command::RequestBootloaderIdentity { major, minor } => put(&[major, minor])?,
            Command::RequestData { payload } => put(payload)?,
            Command::RequestUid
            | Command::AppVersionRequest
            | Command::EraseCompleteFlash
            | Command::RequestStatistic
            | Command::SendLastError
            | Command::RequestBootDescriptor => {}
        }
        Ok(frame)
    }
}

// --- Replies ---

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderIdentity {
    pub major: u8,
    pub minor: u8,
    pub features: u16,
    pub library_major: u8,
    pub library_minor: u8,
    pub application_first_address: u32,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistic {
    pub disconnect_count: u16,
    pub repeated_ack_count: u16,
    pub bytes_received: u16,
    pub bytes_flashed: u16,
}

/// Reply to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Transport-level acknowledgement only; the outcome sits in the last-error register.
    Ack,
    LastError(UdpState),
    Uid([u8; UID_LENGTH]),
    AppVersion([u8; APP_VERSION_LENGTH]),
    BootDescriptor { start: u32, end: u32, crc: u32 },
    BootloaderIdentity(BootloaderIdentity),
    VersionMismatch { min_major: u8, min_minor: u8 },
    Statistic(Statistic),
}

fn reply<const N: usize>(code: UpdCode, payload: [u8; N]) -> Reply {
    const { assert!(N < MAX_REPLY_LENGTH) };
    let mut out = Reply::new();
    let pushed = out.push(code as u8).ok().and_then(|()| out.extend_from_slice(&payload).ok());
    debug_assert!(pushed.is_some(), "reply exceeds {} bytes", MAX_REPLY_LENGTH);
    out
}

fn concat<const N: usize>(parts: &[&[u8]]) -> [u8; N] {
    let mut out = [0u8; N];
    let mut at = 0;
    for part in parts {
        out[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    out
}

impl Response {
    /// Encode for the transport. [`Response::Ack`] is empty.
    pub fn encode(&self) -> Reply {
        match *self {
            Response::Ack => Reply::new(),
            Response::LastError(state) => reply(UpdCode::SendLastError, [state as u8]),
            Response::Uid(uid) => reply(UpdCode::ResponseUid, uid),
            Response::AppVersion(version) => reply(UpdCode::AppVersionResponse, version),
            Response::BootDescriptor { start, end, crc } => reply(
                UpdCode::ResponseBootDescriptor,
                concat::<12>(&[
                    &start.to_le_bytes()[..],
                    &end.to_le_bytes()[..],
                    &crc.to_le_bytes()[..],
                ]),
            ),
            Response::BootloaderIdentity(id) => reply(
                UpdCode::ResponseBootloaderIdentity,
                concat::<10>(&[
                    &[id.major, id.minor][..],
                    &id.features.to_le_bytes()[..],
                    &[id.library_major, id.library_minor][..],
                    &id.application_first_address.to_le_bytes()[..],
                ]),
            ),
            Response::VersionMismatch {
                min_major,
                min_minor,
            } => reply(
                UpdCode::ResponseBootloaderVersionMismatch,
                [min_major, min_minor],
            ),
            // Link counters first, as older bootloaders send them alone;
            // the transfer counters are appended.
            Response::Statistic(stat) => reply(
                UpdCode::ResponseStatistic,
                concat::<8>(&[
                    &stat.disconnect_count.to_le_bytes()[..],
                    &stat.repeated_ack_count.to_le_bytes()[..],
                    &stat.bytes_received.to_le_bytes()[..],
                    &stat.bytes_flashed.to_le_bytes()[..],
                ]),
            ),
        }
    }

    /// Decode a reply as received by a host tool.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let Some((&code, payload)) = bytes.split_first() else {
            return Some(Response::Ack);
        };
        let fixed = |len: usize| (payload.len() == len).then_some(payload);
        let response = match UpdCode::from_byte(code) {
            UpdCode::SendLastError => {
                Response::LastError(UdpState::from_byte(*fixed(1)?.first()?)?)
            }
            UpdCode::ResponseUid => {
                let mut uid = [0u8; UID_LENGTH];
                uid.copy_from_slice(fixed(UID_LENGTH)?);
                Response::Uid(uid)
            }
            UpdCode::AppVersionResponse => {
                let mut version = [0u8; APP_VERSION_LENGTH];
                version.copy_from_slice(fixed(APP_VERSION_LENGTH)?);
                Response::AppVersion(version)
            }
            UpdCode::ResponseBootDescriptor => {
                let p = fixed(12)?;
                Response::BootDescriptor {
                    start: le_u32(p, 0)?,
                    end: le_u32(p, 4)?,
                    crc: le_u32(p, 8)?,
                }
            }
            UpdCode::ResponseBootloaderIdentity => {
                let p = fixed(10)?;
                Response::BootloaderIdentity(BootloaderIdentity {
                    major: p[0],
                    minor: p[1],
                    features: le_u16(p, 2)?,
                    library_major: p[4],
                    library_minor: p[5],
                    application_first_address: le_u32(p, 6)?,
                })
            }
            UpdCode::ResponseBootloaderVersionMismatch => {
                let p = fixed(2)?;
                Response::VersionMismatch {
                    min_major: p[0],
                    min_minor: p[1],
                }
            }
            UpdCode::ResponseStatistic => {
                let p = fixed(8).or_else(|| fixed(4))?;
                Response::Statistic(Statistic {
                    disconnect_count: le_u16(p, 0)?,
                    repeated_ack_count: le_u16(p, 2)?,
                    bytes_received: le_u16(p, 4).unwrap_or(0),
                    bytes_flashed: le_u16(p, 6).unwrap_or(0),
                })
            }
            _ => return None,
        };
        Some(response)
    }
}
