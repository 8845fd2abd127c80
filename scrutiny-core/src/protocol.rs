//! Binary protocol spoken with the instrumented firmware: request builders,
//! response interpretation and the frame layout shared by both directions.
//!
//! Frames are length-prefixed:
//! - request:  `[cmd:u8][subfn:u8][len:u16 BE][payload]`
//! - response: `[cmd|0x80:u8][subfn:u8][code:u8][len:u16 BE][payload]`
//!
//! Addresses inside payloads are encoded at the address size negotiated with
//! the device, so [`Protocol`] is stateful: `set_address_size` changes how
//! memory region responses decode.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

use crate::error::ScrutinyError;

/// Length of a firmware ID, in bytes. Displayed as ASCII hex everywhere.
pub const FIRMWARE_ID_LENGTH: usize = 16;

/// Firmware ID embedded in untagged firmware images. A device reporting this
/// value was never run through the tagging step of the build toolchain.
pub const PLACEHOLDER_FIRMWARE_ID: [u8; FIRMWARE_ID_LENGTH] = [
    0xa9, 0x9e, 0x17, 0x3a, 0x5c, 0x40, 0x21, 0x78, 0x6b, 0xf3, 0x8d, 0x0c, 0xe1, 0x54, 0xb2, 0x97,
];

pub const DISCOVER_MAGIC: [u8; 4] = [0x7e, 0x18, 0xfc, 0x68];
pub const CONNECT_MAGIC: [u8; 4] = [0x82, 0x90, 0x22, 0x66];

/// Bit set in the command byte of every response frame.
pub const RESPONSE_FLAG: u8 = 0x80;

pub const REQUEST_HEADER_LENGTH: usize = 4;
pub const RESPONSE_HEADER_LENGTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    GetInfo = 0x01,
    CommControl = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GetInfoSubfn {
    ProtocolVersion = 1,
    SupportedFeatures = 2,
    SpecialMemoryRegionCount = 3,
    SpecialMemoryRegionLocation = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CommControlSubfn {
    Discover = 1,
    Connect = 2,
    Heartbeat = 3,
    Disconnect = 4,
    GetParams = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidRequest = 1,
    UnsupportedFeature = 2,
    Overflow = 3,
    Busy = 4,
    FailureToProceed = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MemoryRangeType {
    ReadOnly = 0,
    Forbidden = 1,
}

/// Address width used to encode and decode memory locations on the wire.
/// The device reports its own width during info polling; anything outside
/// this set is rejected before it can corrupt the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSize {
    S8,
    S16,
    S32,
    S64,
}

impl AddressSize {
    pub fn from_bits(bits: u16) -> Result<Self, ScrutinyError> {
        match bits {
            8 => Ok(AddressSize::S8),
            16 => Ok(AddressSize::S16),
            32 => Ok(AddressSize::S32),
            64 => Ok(AddressSize::S64),
            other => Err(ScrutinyError::UnsupportedAddressSize(other)),
        }
    }

    pub fn bits(&self) -> u16 {
        match self {
            AddressSize::S8 => 8,
            AddressSize::S16 => 16,
            AddressSize::S32 => 32,
            AddressSize::S64 => 64,
        }
    }

    pub fn bytes(&self) -> usize {
        (self.bits() / 8) as usize
    }
}

/// A protocol version accepted by this server. Construction validates
/// support, so a stored value is always usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub fn new(major: u8, minor: u8) -> Result<Self, ScrutinyError> {
        if (major, minor) != (1, 0) {
            return Err(ScrutinyError::UnsupportedVersion { major, minor });
        }
        Ok(ProtocolVersion { major, minor })
    }
}

impl FromStr for ProtocolVersion {
    type Err = ScrutinyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ScrutinyError::Config(format!("invalid protocol version string \"{s}\""));
        let (major, minor) = s.split_once('.').ok_or_else(bad)?;
        let major = major.parse::<u8>().map_err(|_| bad())?;
        let minor = minor.parse::<u8>().map_err(|_| bad())?;
        ProtocolVersion::new(major, minor)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}.{}", self.major, self.minor)
    }
}

/// An outgoing request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub subfn: u8,
    pub payload: Bytes,
}

impl Request {
    pub fn new(command: Command, subfn: u8, payload: Bytes) -> Self {
        Request { command, subfn, payload }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LENGTH + self.payload.len());
        buf.put_u8(self.command.into());
        buf.put_u8(self.subfn);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a single request frame. Used by the device side of the link.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ScrutinyError> {
        if data.len() < REQUEST_HEADER_LENGTH {
            return Err(ScrutinyError::MalformedRequest(format!(
                "frame too short ({} bytes)",
                data.len()
            )));
        }
        let command = Command::try_from(data[0])
            .map_err(|_| ScrutinyError::MalformedRequest(format!("unknown command 0x{:02x}", data[0])))?;
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() != REQUEST_HEADER_LENGTH + length {
            return Err(ScrutinyError::MalformedRequest(format!(
                "length field says {} payload bytes, frame carries {}",
                length,
                data.len() - REQUEST_HEADER_LENGTH
            )));
        }
        Ok(Request {
            command,
            subfn: data[1],
            payload: Bytes::copy_from_slice(&data[REQUEST_HEADER_LENGTH..]),
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Request {} subfn={} payload={} bytes>",
            self.command,
            self.subfn,
            self.payload.len()
        )
    }
}

/// An incoming response frame, before interpretation. `command` and `code`
/// stay raw so that transport reassembly never has to understand them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: u8,
    pub subfn: u8,
    pub code: u8,
    pub payload: Bytes,
}

impl Response {
    pub fn new(command: Command, subfn: u8, code: ResponseCode, payload: Bytes) -> Self {
        Response {
            command: command.into(),
            subfn,
            code: code.into(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LENGTH + self.payload.len());
        buf.put_u8(self.command | RESPONSE_FLAG);
        buf.put_u8(self.subfn);
        buf.put_u8(self.code);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a single complete response frame.
    pub fn from_frame(data: &[u8]) -> Result<Self, ScrutinyError> {
        if data.len() < RESPONSE_HEADER_LENGTH {
            return Err(ScrutinyError::MalformedResponse(format!(
                "frame too short ({} bytes)",
                data.len()
            )));
        }
        if data[0] & RESPONSE_FLAG == 0 {
            return Err(ScrutinyError::MalformedResponse(format!(
                "response flag missing on command byte 0x{:02x}",
                data[0]
            )));
        }
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() != RESPONSE_HEADER_LENGTH + length {
            return Err(ScrutinyError::MalformedResponse(format!(
                "length field says {} payload bytes, frame carries {}",
                length,
                data.len() - RESPONSE_HEADER_LENGTH
            )));
        }
        Ok(Response {
            command: data[0] & !RESPONSE_FLAG,
            subfn: data[1],
            code: data[2],
            payload: Bytes::copy_from_slice(&data[RESPONSE_HEADER_LENGTH..]),
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Response cmd=0x{:02x} subfn={} code={} payload={} bytes>",
            self.command,
            self.subfn,
            self.code,
            self.payload.len()
        )
    }
}

/// Structured content of an `Ok` response, one variant per request kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    ProtocolVersion {
        major: u8,
        minor: u8,
    },
    CommParams {
        max_tx_data_size: u16,
        max_rx_data_size: u16,
        max_bitrate_bps: u32,
        heartbeat_timeout_us: u32,
        rx_timeout_us: u32,
        address_size_bits: u16,
    },
    SupportedFeatures {
        memory_read: bool,
        memory_write: bool,
        datalog_acquire: bool,
        user_command: bool,
    },
    SpecialMemoryRegionCount {
        nbr_readonly: u8,
        nbr_forbidden: u8,
    },
    SpecialMemoryRegionLocation {
        region_type: MemoryRangeType,
        index: u8,
        start: u64,
        end: u64,
    },
    Discover {
        firmware_id: [u8; FIRMWARE_ID_LENGTH],
    },
    Connect {
        session_id: u32,
    },
    Heartbeat {
        session_id: u32,
        challenge_response: u16,
    },
    Disconnect,
}

const FEATURE_MEMORY_READ: u8 = 0x01;
const FEATURE_MEMORY_WRITE: u8 = 0x02;
const FEATURE_DATALOG_ACQUIRE: u8 = 0x04;
const FEATURE_USER_COMMAND: u8 = 0x08;

/// Builds requests and interprets responses at the currently negotiated
/// version and address size.
#[derive(Debug, Clone)]
pub struct Protocol {
    version: ProtocolVersion,
    address_size: AddressSize,
}

impl Protocol {
    pub fn new(version: ProtocolVersion, address_size: AddressSize) -> Self {
        Protocol { version, address_size }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switches to the version reported by the device. Fails on versions this
    /// server does not speak.
    pub fn set_version(&mut self, major: u8, minor: u8) -> Result<(), ScrutinyError> {
        self.version = ProtocolVersion::new(major, minor)?;
        Ok(())
    }

    /// Restores a version already validated at configuration time.
    pub fn reset_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn set_address_size(&mut self, address_size: AddressSize) {
        self.address_size = address_size;
    }

    pub fn address_size(&self) -> AddressSize {
        self.address_size
    }

    pub fn get_protocol_version(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::ProtocolVersion.into(), Bytes::new())
    }

    pub fn get_supported_features(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::SupportedFeatures.into(), Bytes::new())
    }

    pub fn get_special_memory_region_count(&self) -> Request {
        Request::new(
            Command::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionCount.into(),
            Bytes::new(),
        )
    }

    pub fn get_special_memory_region_location(&self, region_type: MemoryRangeType, index: u8) -> Request {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u8(region_type.into());
        payload.put_u8(index);
        Request::new(
            Command::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionLocation.into(),
            payload.freeze(),
        )
    }

    pub fn comm_discover(&self) -> Request {
        Request::new(
            Command::CommControl,
            CommControlSubfn::Discover.into(),
            Bytes::from_static(&DISCOVER_MAGIC),
        )
    }

    pub fn comm_connect(&self) -> Request {
        Request::new(
            Command::CommControl,
            CommControlSubfn::Connect.into(),
            Bytes::from_static(&CONNECT_MAGIC),
        )
    }

    pub fn comm_heartbeat(&self, session_id: u32, challenge: u16) -> Request {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u32(session_id);
        payload.put_u16(challenge);
        Request::new(Command::CommControl, CommControlSubfn::Heartbeat.into(), payload.freeze())
    }

    pub fn comm_disconnect(&self, session_id: u32) -> Request {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(session_id);
        Request::new(Command::CommControl, CommControlSubfn::Disconnect.into(), payload.freeze())
    }

    pub fn comm_get_params(&self) -> Request {
        Request::new(Command::CommControl, CommControlSubfn::GetParams.into(), Bytes::new())
    }

    /// Expected heartbeat response for a given challenge.
    pub fn heartbeat_expected_challenge_response(challenge: u16) -> u16 {
        !challenge
    }

    /// Interprets an `Ok` response body.
    ///
    /// `MalformedResponse` means the frame does not belong to this protocol at
    /// all (unknown command or subfunction) and the comm should be considered
    /// broken. `InvalidPayload` means the frame is well addressed but its
    /// payload does not decode; callers surface that as device-provided
    /// invalid data rather than a transport failure.
    pub fn parse_response(&self, response: &Response) -> Result<ResponseData, ScrutinyError> {
        let command = Command::try_from(response.command).map_err(|_| {
            ScrutinyError::MalformedResponse(format!("unknown command 0x{:02x}", response.command))
        })?;
        match command {
            Command::GetInfo => self.parse_get_info_response(response),
            Command::CommControl => self.parse_comm_control_response(response),
        }
    }

    fn parse_get_info_response(&self, response: &Response) -> Result<ResponseData, ScrutinyError> {
        let subfn = GetInfoSubfn::try_from(response.subfn).map_err(|_| {
            ScrutinyError::MalformedResponse(format!("unknown GetInfo subfunction {}", response.subfn))
        })?;
        let mut payload = response.payload.clone();
        match subfn {
            GetInfoSubfn::ProtocolVersion => {
                if payload.len() != 2 {
                    return Err(invalid_payload("protocol version", &payload));
                }
                Ok(ResponseData::ProtocolVersion {
                    major: payload.get_u8(),
                    minor: payload.get_u8(),
                })
            }
            GetInfoSubfn::SupportedFeatures => {
                if payload.len() != 1 {
                    return Err(invalid_payload("supported features", &payload));
                }
                let bitmask = payload.get_u8();
                Ok(ResponseData::SupportedFeatures {
                    memory_read: bitmask & FEATURE_MEMORY_READ != 0,
                    memory_write: bitmask & FEATURE_MEMORY_WRITE != 0,
                    datalog_acquire: bitmask & FEATURE_DATALOG_ACQUIRE != 0,
                    user_command: bitmask & FEATURE_USER_COMMAND != 0,
                })
            }
            GetInfoSubfn::SpecialMemoryRegionCount => {
                if payload.len() != 2 {
                    return Err(invalid_payload("special region count", &payload));
                }
                Ok(ResponseData::SpecialMemoryRegionCount {
                    nbr_readonly: payload.get_u8(),
                    nbr_forbidden: payload.get_u8(),
                })
            }
            GetInfoSubfn::SpecialMemoryRegionLocation => {
                let address_bytes = self.address_size.bytes();
                if payload.len() != 2 + 2 * address_bytes {
                    return Err(invalid_payload("special region location", &payload));
                }
                let region_type_raw = payload.get_u8();
                let region_type = MemoryRangeType::try_from(region_type_raw).map_err(|_| {
                    ScrutinyError::InvalidPayload(format!("unknown region type {region_type_raw}"))
                })?;
                let index = payload.get_u8();
                let start = self.decode_address(&mut payload);
                let end = self.decode_address(&mut payload);
                Ok(ResponseData::SpecialMemoryRegionLocation {
                    region_type,
                    index,
                    start,
                    end,
                })
            }
        }
    }

    fn parse_comm_control_response(&self, response: &Response) -> Result<ResponseData, ScrutinyError> {
        let subfn = CommControlSubfn::try_from(response.subfn).map_err(|_| {
            ScrutinyError::MalformedResponse(format!("unknown CommControl subfunction {}", response.subfn))
        })?;
        let mut payload = response.payload.clone();
        match subfn {
            CommControlSubfn::Discover => {
                if payload.len() != DISCOVER_MAGIC.len() + FIRMWARE_ID_LENGTH {
                    return Err(invalid_payload("discover", &payload));
                }
                let mut magic = [0u8; 4];
                payload.copy_to_slice(&mut magic);
                if magic != DISCOVER_MAGIC {
                    return Err(ScrutinyError::InvalidPayload("discover magic mismatch".into()));
                }
                let mut firmware_id = [0u8; FIRMWARE_ID_LENGTH];
                payload.copy_to_slice(&mut firmware_id);
                Ok(ResponseData::Discover { firmware_id })
            }
            CommControlSubfn::Connect => {
                if payload.len() != CONNECT_MAGIC.len() + 4 {
                    return Err(invalid_payload("connect", &payload));
                }
                let mut magic = [0u8; 4];
                payload.copy_to_slice(&mut magic);
                if magic != CONNECT_MAGIC {
                    return Err(ScrutinyError::InvalidPayload("connect magic mismatch".into()));
                }
                Ok(ResponseData::Connect {
                    session_id: payload.get_u32(),
                })
            }
            CommControlSubfn::Heartbeat => {
                if payload.len() != 6 {
                    return Err(invalid_payload("heartbeat", &payload));
                }
                Ok(ResponseData::Heartbeat {
                    session_id: payload.get_u32(),
                    challenge_response: payload.get_u16(),
                })
            }
            CommControlSubfn::Disconnect => {
                if !payload.is_empty() {
                    return Err(invalid_payload("disconnect", &payload));
                }
                Ok(ResponseData::Disconnect)
            }
            CommControlSubfn::GetParams => {
                if payload.len() != 17 {
                    return Err(invalid_payload("communication params", &payload));
                }
                Ok(ResponseData::CommParams {
                    max_tx_data_size: payload.get_u16(),
                    max_rx_data_size: payload.get_u16(),
                    max_bitrate_bps: payload.get_u32(),
                    heartbeat_timeout_us: payload.get_u32(),
                    rx_timeout_us: payload.get_u32(),
                    address_size_bits: payload.get_u8() as u16 * 8,
                })
            }
        }
    }

    fn decode_address(&self, payload: &mut Bytes) -> u64 {
        match self.address_size {
            AddressSize::S8 => payload.get_u8() as u64,
            AddressSize::S16 => payload.get_u16() as u64,
            AddressSize::S32 => payload.get_u32() as u64,
            AddressSize::S64 => payload.get_u64(),
        }
    }

    /// Encodes an address at the configured width. The device-side responder
    /// uses this to build region location payloads.
    pub fn encode_address(&self, address: u64, buf: &mut BytesMut) {
        match self.address_size {
            AddressSize::S8 => buf.put_u8(address as u8),
            AddressSize::S16 => buf.put_u16(address as u16),
            AddressSize::S32 => buf.put_u32(address as u32),
            AddressSize::S64 => buf.put_u64(address),
        }
    }
}

fn invalid_payload(what: &str, payload: &Bytes) -> ScrutinyError {
    ScrutinyError::InvalidPayload(format!("{what} payload of {} bytes", payload.len()))
}

/// Feature bitmask used by the device side when answering
/// `GetSupportedFeatures`.
pub fn encode_feature_bitmask(
    memory_read: bool,
    memory_write: bool,
    datalog_acquire: bool,
    user_command: bool,
) -> u8 {
    let mut bitmask = 0u8;
    if memory_read {
        bitmask |= FEATURE_MEMORY_READ;
    }
    if memory_write {
        bitmask |= FEATURE_MEMORY_WRITE;
    }
    if datalog_acquire {
        bitmask |= FEATURE_DATALOG_ACQUIRE;
    }
    if user_command {
        bitmask |= FEATURE_USER_COMMAND;
    }
    bitmask
}
