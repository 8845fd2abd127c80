//! Software device: answers the server protocol over any [`Link`], so the
//! whole stack runs without hardware. Fault injection knobs cover the
//! failure paths the tests exercise.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::device_info::MemoryRegion;
use crate::error::ScrutinyError;
use crate::link::Link;
use crate::protocol::{
    encode_feature_bitmask, AddressSize, Command, CommControlSubfn, GetInfoSubfn, MemoryRangeType,
    Protocol, ProtocolVersion, Request, Response, ResponseCode, CONNECT_MAGIC, DISCOVER_MAGIC,
    FIRMWARE_ID_LENGTH, REQUEST_HEADER_LENGTH,
};

pub struct EmulatedDevice {
    link: Box<dyn Link>,
    rx_buffer: BytesMut,
    protocol: Protocol,
    firmware_id: [u8; FIRMWARE_ID_LENGTH],
    session_id: u32,
    active_session: Option<u32>,
    max_tx_data_size: u16,
    max_rx_data_size: u16,
    max_bitrate_bps: u32,
    rx_timeout_us: u32,
    heartbeat_timeout_us: u32,
    address_size_bits: u16,
    memory_read: bool,
    memory_write: bool,
    datalog_acquire: bool,
    user_command: bool,
    forbidden_regions: Vec<MemoryRegion>,
    readonly_regions: Vec<MemoryRegion>,
    respond_to_heartbeats: bool,
    refuse_info_requests: bool,
    corrupt_info_payloads: bool,
}

impl EmulatedDevice {
    pub fn new(link: Box<dyn Link>) -> Self {
        EmulatedDevice {
            link,
            rx_buffer: BytesMut::new(),
            protocol: Protocol::new(
                ProtocolVersion { major: 1, minor: 0 },
                AddressSize::S32,
            ),
            firmware_id: *b"scrutiny-demo-fw",
            session_id: 0x1234_5678,
            active_session: None,
            max_tx_data_size: 128,
            max_rx_data_size: 128,
            max_bitrate_bps: 100_000,
            rx_timeout_us: 50_000,
            heartbeat_timeout_us: 4_000_000,
            address_size_bits: 32,
            memory_read: true,
            memory_write: true,
            datalog_acquire: true,
            user_command: true,
            forbidden_regions: vec![MemoryRegion { start: 0x1000, end: 0x1fff }],
            readonly_regions: vec![MemoryRegion { start: 0x2000, end: 0x2fff }],
            respond_to_heartbeats: true,
            refuse_info_requests: false,
            corrupt_info_payloads: false,
        }
    }

    pub fn firmware_id(&self) -> [u8; FIRMWARE_ID_LENGTH] {
        self.firmware_id
    }

    pub fn firmware_id_ascii(&self) -> String {
        hex::encode(self.firmware_id)
    }

    pub fn set_firmware_id(&mut self, firmware_id: [u8; FIRMWARE_ID_LENGTH]) {
        self.firmware_id = firmware_id;
    }

    pub fn set_session_id(&mut self, session_id: u32) {
        self.session_id = session_id;
    }

    /// Address size reported in the comm params, in bits. Sizes the server
    /// does not support are reported as-is, which is exactly what the
    /// rejection tests need.
    pub fn set_address_size_bits(&mut self, bits: u16) {
        self.address_size_bits = bits;
        if let Ok(address_size) = AddressSize::from_bits(bits) {
            self.protocol.set_address_size(address_size);
        }
    }

    pub fn set_heartbeat_timeout_us(&mut self, heartbeat_timeout_us: u32) {
        self.heartbeat_timeout_us = heartbeat_timeout_us;
    }

    pub fn set_regions(&mut self, forbidden: Vec<MemoryRegion>, readonly: Vec<MemoryRegion>) {
        self.forbidden_regions = forbidden;
        self.readonly_regions = readonly;
    }

    /// Stops answering heartbeats; everything else keeps working. The server
    /// eventually declares the link dead.
    pub fn set_respond_to_heartbeats(&mut self, respond: bool) {
        self.respond_to_heartbeats = respond;
    }

    /// Makes every `GetInfo` request come back refused.
    pub fn set_refuse_info_requests(&mut self, refuse: bool) {
        self.refuse_info_requests = refuse;
    }

    /// Makes every `GetInfo` answer carry an undecodable payload.
    pub fn set_corrupt_info_payloads(&mut self, corrupt: bool) {
        self.corrupt_info_payloads = corrupt;
    }

    pub fn has_active_session(&self) -> bool {
        self.active_session.is_some()
    }

    /// Drains the link and answers every complete request received.
    pub fn process(&mut self) -> Result<(), ScrutinyError> {
        loop {
            match self.link.receive()? {
                Some(data) => self.rx_buffer.extend_from_slice(&data),
                None => break,
            }
        }

        while self.rx_buffer.len() >= REQUEST_HEADER_LENGTH {
            let length = u16::from_be_bytes([self.rx_buffer[2], self.rx_buffer[3]]) as usize;
            let frame_length = REQUEST_HEADER_LENGTH + length;
            if self.rx_buffer.len() < frame_length {
                break;
            }
            let frame = self.rx_buffer.split_to(frame_length);
            match Request::from_bytes(&frame) {
                Ok(request) => {
                    trace!("Emulated device received {request}");
                    if let Some(response) = self.respond(&request) {
                        self.link.send(&response.to_bytes())?;
                    }
                }
                Err(e) => {
                    warn!("Emulated device dropping junk. {e}");
                    self.rx_buffer.clear();
                }
            }
        }
        Ok(())
    }

    fn respond(&mut self, request: &Request) -> Option<Response> {
        match request.command {
            Command::GetInfo => self.respond_get_info(request),
            Command::CommControl => self.respond_comm_control(request),
        }
    }

    fn respond_get_info(&mut self, request: &Request) -> Option<Response> {
        let Ok(subfn) = GetInfoSubfn::try_from(request.subfn) else {
            return Some(Response::new(
                request.command,
                request.subfn,
                ResponseCode::UnsupportedFeature,
                Bytes::new(),
            ));
        };
        if self.refuse_info_requests {
            return Some(Response::new(
                request.command,
                request.subfn,
                ResponseCode::FailureToProceed,
                Bytes::new(),
            ));
        }
        if self.corrupt_info_payloads {
            return Some(Response::new(
                request.command,
                request.subfn,
                ResponseCode::Ok,
                Bytes::from_static(&[0xde]),
            ));
        }

        let payload = match subfn {
            GetInfoSubfn::ProtocolVersion => {
                let mut payload = BytesMut::with_capacity(2);
                payload.put_u8(self.protocol.version().major);
                payload.put_u8(self.protocol.version().minor);
                payload.freeze()
            }
            GetInfoSubfn::SupportedFeatures => Bytes::copy_from_slice(&[encode_feature_bitmask(
                self.memory_read,
                self.memory_write,
                self.datalog_acquire,
                self.user_command,
            )]),
            GetInfoSubfn::SpecialMemoryRegionCount => {
                let mut payload = BytesMut::with_capacity(2);
                payload.put_u8(self.readonly_regions.len() as u8);
                payload.put_u8(self.forbidden_regions.len() as u8);
                payload.freeze()
            }
            GetInfoSubfn::SpecialMemoryRegionLocation => {
                if request.payload.len() != 2 {
                    return Some(Response::new(
                        request.command,
                        request.subfn,
                        ResponseCode::InvalidRequest,
                        Bytes::new(),
                    ));
                }
                let Ok(region_type) = MemoryRangeType::try_from(request.payload[0]) else {
                    return Some(Response::new(
                        request.command,
                        request.subfn,
                        ResponseCode::InvalidRequest,
                        Bytes::new(),
                    ));
                };
                let index = request.payload[1] as usize;
                let regions = match region_type {
                    MemoryRangeType::Forbidden => &self.forbidden_regions,
                    MemoryRangeType::ReadOnly => &self.readonly_regions,
                };
                let Some(region) = regions.get(index) else {
                    return Some(Response::new(
                        request.command,
                        request.subfn,
                        ResponseCode::Overflow,
                        Bytes::new(),
                    ));
                };
                let mut payload = BytesMut::new();
                payload.put_u8(region_type.into());
                payload.put_u8(index as u8);
                self.protocol.encode_address(region.start, &mut payload);
                self.protocol.encode_address(region.end, &mut payload);
                payload.freeze()
            }
        };
        Some(Response::new(request.command, request.subfn, ResponseCode::Ok, payload))
    }

    fn respond_comm_control(&mut self, request: &Request) -> Option<Response> {
        let Ok(subfn) = CommControlSubfn::try_from(request.subfn) else {
            return Some(Response::new(
                request.command,
                request.subfn,
                ResponseCode::UnsupportedFeature,
                Bytes::new(),
            ));
        };
        match subfn {
            CommControlSubfn::Discover => {
                if request.payload.as_ref() != DISCOVER_MAGIC.as_slice() {
                    return None;
                }
                let mut payload = BytesMut::with_capacity(DISCOVER_MAGIC.len() + FIRMWARE_ID_LENGTH);
                payload.put_slice(&DISCOVER_MAGIC);
                payload.put_slice(&self.firmware_id);
                Some(Response::new(request.command, request.subfn, ResponseCode::Ok, payload.freeze()))
            }
            CommControlSubfn::Connect => {
                if request.payload.as_ref() != CONNECT_MAGIC.as_slice() {
                    return None;
                }
                self.active_session = Some(self.session_id);
                debug!("Emulated device opened session 0x{:08x}", self.session_id);
                let mut payload = BytesMut::with_capacity(CONNECT_MAGIC.len() + 4);
                payload.put_slice(&CONNECT_MAGIC);
                payload.put_u32(self.session_id);
                Some(Response::new(request.command, request.subfn, ResponseCode::Ok, payload.freeze()))
            }
            CommControlSubfn::Heartbeat => {
                if !self.respond_to_heartbeats {
                    return None;
                }
                if request.payload.len() != 6 {
                    return Some(Response::new(
                        request.command,
                        request.subfn,
                        ResponseCode::InvalidRequest,
                        Bytes::new(),
                    ));
                }
                let session_id = u32::from_be_bytes([
                    request.payload[0],
                    request.payload[1],
                    request.payload[2],
                    request.payload[3],
                ]);
                let challenge = u16::from_be_bytes([request.payload[4], request.payload[5]]);
                if self.active_session != Some(session_id) {
                    return Some(Response::new(
                        request.command,
                        request.subfn,
                        ResponseCode::FailureToProceed,
                        Bytes::new(),
                    ));
                }
                let mut payload = BytesMut::with_capacity(6);
                payload.put_u32(session_id);
                payload.put_u16(Protocol::heartbeat_expected_challenge_response(challenge));
                Some(Response::new(request.command, request.subfn, ResponseCode::Ok, payload.freeze()))
            }
            CommControlSubfn::Disconnect => {
                debug!("Emulated device closing session");
                self.active_session = None;
                Some(Response::new(request.command, request.subfn, ResponseCode::Ok, Bytes::new()))
            }
            CommControlSubfn::GetParams => {
                let mut payload = BytesMut::with_capacity(17);
                payload.put_u16(self.max_tx_data_size);
                payload.put_u16(self.max_rx_data_size);
                payload.put_u32(self.max_bitrate_bps);
                payload.put_u32(self.heartbeat_timeout_us);
                payload.put_u32(self.rx_timeout_us);
                payload.put_u8((self.address_size_bits / 8) as u8);
                Some(Response::new(request.command, request.subfn, ResponseCode::Ok, payload.freeze()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DummyLink;

    fn emulator() -> (EmulatedDevice, DummyLink) {
        let mut link = DummyLink::new();
        link.open().unwrap();
        let endpoint = link.endpoint();
        (EmulatedDevice::new(Box::new(endpoint)), link)
    }

    fn exchange(emulator: &mut EmulatedDevice, link: &mut DummyLink, request: Request) -> Response {
        link.send(&request.to_bytes()).unwrap();
        emulator.process().unwrap();
        Response::from_frame(&link.receive().unwrap().unwrap()).unwrap()
    }

    fn host_protocol() -> Protocol {
        Protocol::new(ProtocolVersion::new(1, 0).unwrap(), AddressSize::S32)
    }

    #[test]
    fn test_discover_reports_firmware_id() {
        let (mut emulator, mut link) = emulator();
        emulator.set_firmware_id([0x5a; 16]);
        let response = exchange(&mut emulator, &mut link, host_protocol().comm_discover());
        let data = host_protocol().parse_response(&response).unwrap();
        assert_eq!(
            data,
            crate::protocol::ResponseData::Discover { firmware_id: [0x5a; 16] }
        );
    }

    #[test]
    fn test_connect_then_heartbeat() {
        let (mut emulator, mut link) = emulator();
        emulator.set_session_id(0xcafe_f00d);

        let response = exchange(&mut emulator, &mut link, host_protocol().comm_connect());
        let data = host_protocol().parse_response(&response).unwrap();
        assert_eq!(data, crate::protocol::ResponseData::Connect { session_id: 0xcafe_f00d });
        assert!(emulator.has_active_session());

        let response = exchange(
            &mut emulator,
            &mut link,
            host_protocol().comm_heartbeat(0xcafe_f00d, 0x0042),
        );
        let data = host_protocol().parse_response(&response).unwrap();
        assert_eq!(
            data,
            crate::protocol::ResponseData::Heartbeat {
                session_id: 0xcafe_f00d,
                challenge_response: Protocol::heartbeat_expected_challenge_response(0x0042),
            }
        );
    }

    #[test]
    fn test_heartbeat_with_wrong_session_is_refused() {
        let (mut emulator, mut link) = emulator();
        exchange(&mut emulator, &mut link, host_protocol().comm_connect());
        let response = exchange(&mut emulator, &mut link, host_protocol().comm_heartbeat(0x1111, 0));
        assert_eq!(response.code, u8::from(ResponseCode::FailureToProceed));
    }

    #[test]
    fn test_silent_heartbeats() {
        let (mut emulator, mut link) = emulator();
        exchange(&mut emulator, &mut link, host_protocol().comm_connect());
        emulator.set_respond_to_heartbeats(false);
        link.send(&host_protocol().comm_heartbeat(0x1234_5678, 0).to_bytes()).unwrap();
        emulator.process().unwrap();
        assert!(link.receive().unwrap().is_none());
    }

    #[test]
    fn test_region_location_out_of_range() {
        let (mut emulator, mut link) = emulator();
        let response = exchange(
            &mut emulator,
            &mut link,
            host_protocol().get_special_memory_region_location(MemoryRangeType::Forbidden, 5),
        );
        assert_eq!(response.code, u8::from(ResponseCode::Overflow));
    }
}
