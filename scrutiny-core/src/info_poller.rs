//! Walks the fixed interrogation sequence that fills a [`DeviceInfo`].
//!
//! Linear except for the memory region steps, which enqueue one request per
//! region in a single batch. Terminates in `Done` or `Error`; both hold
//! until the device handler stops the poller.

use std::cell::RefCell;
use std::rc::Rc;

use strum_macros::Display;
use tracing::{debug, error};

use crate::device_info::{DeviceInfo, MemoryRegion, SupportedFeatureMap};
use crate::dispatcher::{RequestDispatcher, RequestPriority};
use crate::error::ScrutinyError;
use crate::protocol::{MemoryRangeType, Protocol, Request, ResponseCode, ResponseData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PollerFsmState {
    Init,
    GetProtocolVersion,
    GetCommParams,
    GetSupportedFeatures,
    GetSpecialMemoryRegionCount,
    GetForbiddenMemoryRegions,
    GetReadOnlyMemoryRegions,
    Done,
    Error,
}

/// Invoked right after the protocol version is polled, before any further
/// step. Failing sends the poller to `Error`.
pub type ProtocolVersionCallback = Box<dyn FnMut(u8, u8) -> Result<(), ScrutinyError>>;

/// Invoked right after communication parameters are polled, with the partial
/// info gathered so far. Failing sends the poller to `Error`.
pub type CommParamCallback = Box<dyn FnMut(&DeviceInfo) -> Result<(), ScrutinyError>>;

pub(crate) struct PollerShared {
    fsm_state: PollerFsmState,
    last_fsm_state: PollerFsmState,
    stop_requested: bool,
    request_pending: bool,
    request_failed: bool,
    forbidden_memory_region_count: Option<usize>,
    readonly_memory_region_count: Option<usize>,
    error_message: String,
    info: DeviceInfo,
}

impl PollerShared {
    fn new() -> Self {
        PollerShared {
            fsm_state: PollerFsmState::Init,
            last_fsm_state: PollerFsmState::Init,
            stop_requested: false,
            request_pending: false,
            request_failed: false,
            forbidden_memory_region_count: None,
            readonly_memory_region_count: None,
            error_message: String::new(),
            info: DeviceInfo::default(),
        }
    }

    fn reset(&mut self) {
        self.fsm_state = PollerFsmState::Init;
        self.last_fsm_state = PollerFsmState::Init;
        self.stop_requested = false;
        self.request_pending = false;
        self.request_failed = false;
        self.forbidden_memory_region_count = None;
        self.readonly_memory_region_count = None;
        self.error_message.clear();
        self.info.clear();
    }

    fn handle_success(&mut self, code: ResponseCode, data: Option<ResponseData>) {
        debug!("Success callback in state {}. Response Code = {code}", self.fsm_state);
        let mut must_process = !self.stop_requested;

        if code != ResponseCode::Ok {
            self.request_failed = true;
            self.error_message = format!(
                "Device refused to give {}. Response Code = {code}",
                subject(self.fsm_state)
            );
            must_process = false;
        } else if data.is_none() {
            self.request_failed = true;
            self.error_message = format!(
                "Device gave invalid data when polling for {}. Response Code = {code}",
                subject(self.fsm_state)
            );
            must_process = false;
        }

        if must_process {
            match (self.fsm_state, data) {
                (PollerFsmState::GetProtocolVersion, Some(ResponseData::ProtocolVersion { major, minor })) => {
                    self.info.protocol_major = Some(major);
                    self.info.protocol_minor = Some(minor);
                }
                (
                    PollerFsmState::GetCommParams,
                    Some(ResponseData::CommParams {
                        max_tx_data_size,
                        max_rx_data_size,
                        max_bitrate_bps,
                        heartbeat_timeout_us,
                        rx_timeout_us,
                        address_size_bits,
                    }),
                ) => {
                    self.info.max_tx_data_size = Some(max_tx_data_size);
                    self.info.max_rx_data_size = Some(max_rx_data_size);
                    self.info.max_bitrate_bps = Some(max_bitrate_bps);
                    self.info.heartbeat_timeout_us = Some(heartbeat_timeout_us);
                    self.info.rx_timeout_us = Some(rx_timeout_us);
                    self.info.address_size_bits = Some(address_size_bits);
                }
                (
                    PollerFsmState::GetSupportedFeatures,
                    Some(ResponseData::SupportedFeatures {
                        memory_read,
                        memory_write,
                        datalog_acquire,
                        user_command,
                    }),
                ) => {
                    self.info.supported_feature_map = Some(SupportedFeatureMap {
                        memory_read,
                        memory_write,
                        datalog_acquire,
                        user_command,
                    });
                }
                (
                    PollerFsmState::GetSpecialMemoryRegionCount,
                    Some(ResponseData::SpecialMemoryRegionCount {
                        nbr_readonly,
                        nbr_forbidden,
                    }),
                ) => {
                    self.readonly_memory_region_count = Some(nbr_readonly as usize);
                    self.forbidden_memory_region_count = Some(nbr_forbidden as usize);
                }
                (
                    PollerFsmState::GetForbiddenMemoryRegions,
                    Some(ResponseData::SpecialMemoryRegionLocation { start, end, .. }),
                ) => {
                    self.info
                        .forbidden_memory_regions
                        .get_or_insert_with(Vec::new)
                        .push(MemoryRegion { start, end });
                }
                (
                    PollerFsmState::GetReadOnlyMemoryRegions,
                    Some(ResponseData::SpecialMemoryRegionLocation { start, end, .. }),
                ) => {
                    self.info
                        .readonly_memory_regions
                        .get_or_insert_with(Vec::new)
                        .push(MemoryRegion { start, end });
                }
                _ => {
                    self.fsm_state = PollerFsmState::Error;
                    self.error_message = "Internal error - Got response for unhandled parameter".to_string();
                }
            }
        }

        self.completed();
    }

    fn handle_failure(&mut self) {
        debug!("Failure callback in state {}", self.fsm_state);
        if !self.stop_requested {
            self.request_failed = true;
            self.error_message = format!("Failed to get {}", subject(self.fsm_state));
        }
        self.completed();
    }

    fn completed(&mut self) {
        self.request_pending = false;
        if self.stop_requested {
            // Keep the stop flag armed so the next process() tick finishes
            // the teardown instead of restarting the sequence.
            self.reset();
            self.stop_requested = true;
        }
    }
}

fn subject(state: PollerFsmState) -> &'static str {
    match state {
        PollerFsmState::GetProtocolVersion => "protocol version",
        PollerFsmState::GetCommParams => "communication params",
        PollerFsmState::GetSupportedFeatures => "supported features",
        PollerFsmState::GetSpecialMemoryRegionCount => "special region count",
        PollerFsmState::GetForbiddenMemoryRegions => "forbidden region list",
        PollerFsmState::GetReadOnlyMemoryRegions => "readonly region list",
        _ => "unexpected data",
    }
}

pub struct InfoPoller {
    protocol: Rc<RefCell<Protocol>>,
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    priority: RequestPriority,
    started: bool,
    protocol_version_callback: Option<ProtocolVersionCallback>,
    comm_param_callback: Option<CommParamCallback>,
    shared: Rc<RefCell<PollerShared>>,
}

impl InfoPoller {
    pub fn new(
        protocol: Rc<RefCell<Protocol>>,
        dispatcher: Rc<RefCell<RequestDispatcher>>,
        priority: RequestPriority,
        protocol_version_callback: Option<ProtocolVersionCallback>,
        comm_param_callback: Option<CommParamCallback>,
    ) -> Self {
        InfoPoller {
            protocol,
            dispatcher,
            priority,
            started: false,
            protocol_version_callback,
            comm_param_callback,
            shared: Rc::new(RefCell::new(PollerShared::new())),
        }
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    /// Requests a teardown. The machine resets on the next `process()` tick
    /// that sees no request in flight; a response landing in between has its
    /// payload discarded.
    pub fn stop(&mut self) {
        self.shared.borrow_mut().stop_requested = true;
    }

    pub fn done(&self) -> bool {
        self.shared.borrow().fsm_state == PollerFsmState::Done
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.borrow().fsm_state == PollerFsmState::Error
    }

    pub fn get_device_info(&self) -> DeviceInfo {
        self.shared.borrow().info.clone()
    }

    pub fn get_error_message(&self) -> String {
        self.shared.borrow().error_message.clone()
    }

    pub fn process(&mut self) {
        if !self.started {
            self.shared.borrow_mut().reset();
            return;
        }
        {
            let mut shared = self.shared.borrow_mut();
            if shared.stop_requested && !shared.request_pending {
                self.started = false;
                shared.reset();
                return;
            }
        }

        let (state, state_entry) = {
            let shared = self.shared.borrow();
            (shared.fsm_state, shared.fsm_state != shared.last_fsm_state)
        };
        let mut next_state = state;

        match state {
            PollerFsmState::Init => {
                next_state = PollerFsmState::GetProtocolVersion;
            }

            PollerFsmState::GetProtocolVersion => {
                if state_entry {
                    let request = self.protocol.borrow().get_protocol_version();
                    self.register_single(request);
                }
                let (failed, pending) = self.flags();
                if failed {
                    next_state = PollerFsmState::Error;
                } else if !pending {
                    let version = {
                        let shared = self.shared.borrow();
                        (shared.info.protocol_major, shared.info.protocol_minor)
                    };
                    next_state = match self.run_protocol_version_callback(version) {
                        Ok(()) => PollerFsmState::GetCommParams,
                        Err(e) => {
                            error!("Error while processing protocol version. {e}");
                            PollerFsmState::Error
                        }
                    };
                }
            }

            PollerFsmState::GetCommParams => {
                if state_entry {
                    let request = self.protocol.borrow().comm_get_params();
                    self.register_single(request);
                }
                let (failed, pending) = self.flags();
                if failed {
                    next_state = PollerFsmState::Error;
                } else if !pending {
                    let partial_info = self.shared.borrow().info.clone();
                    next_state = match self.run_comm_param_callback(&partial_info) {
                        Ok(()) => PollerFsmState::GetSupportedFeatures,
                        Err(e) => {
                            error!("Error while processing communication params. {e}");
                            PollerFsmState::Error
                        }
                    };
                }
            }

            PollerFsmState::GetSupportedFeatures => {
                if state_entry {
                    let request = self.protocol.borrow().get_supported_features();
                    self.register_single(request);
                }
                let (failed, pending) = self.flags();
                if failed {
                    next_state = PollerFsmState::Error;
                } else if !pending {
                    next_state = PollerFsmState::GetSpecialMemoryRegionCount;
                }
            }

            PollerFsmState::GetSpecialMemoryRegionCount => {
                if state_entry {
                    {
                        let mut shared = self.shared.borrow_mut();
                        shared.forbidden_memory_region_count = None;
                        shared.readonly_memory_region_count = None;
                    }
                    let request = self.protocol.borrow().get_special_memory_region_count();
                    self.register_single(request);
                }
                let (failed, pending) = self.flags();
                if failed {
                    next_state = PollerFsmState::Error;
                } else if !pending {
                    next_state = PollerFsmState::GetForbiddenMemoryRegions;
                }
            }

            PollerFsmState::GetForbiddenMemoryRegions => {
                if state_entry {
                    let count = {
                        let mut shared = self.shared.borrow_mut();
                        shared.info.forbidden_memory_regions = Some(Vec::new());
                        shared.forbidden_memory_region_count.unwrap_or(0)
                    };
                    self.register_region_batch(MemoryRangeType::Forbidden, count);
                }
                let shared = self.shared.borrow();
                if shared.request_failed {
                    next_state = PollerFsmState::Error;
                } else if shared.info.forbidden_memory_regions.as_ref().map_or(0, Vec::len)
                    >= shared.forbidden_memory_region_count.unwrap_or(0)
                {
                    next_state = PollerFsmState::GetReadOnlyMemoryRegions;
                }
            }

            PollerFsmState::GetReadOnlyMemoryRegions => {
                if state_entry {
                    let count = {
                        let mut shared = self.shared.borrow_mut();
                        shared.info.readonly_memory_regions = Some(Vec::new());
                        shared.readonly_memory_region_count.unwrap_or(0)
                    };
                    self.register_region_batch(MemoryRangeType::ReadOnly, count);
                }
                let shared = self.shared.borrow();
                if shared.request_failed {
                    next_state = PollerFsmState::Error;
                } else if shared.info.readonly_memory_regions.as_ref().map_or(0, Vec::len)
                    >= shared.readonly_memory_region_count.unwrap_or(0)
                {
                    next_state = PollerFsmState::Done;
                }
            }

            PollerFsmState::Done | PollerFsmState::Error => {}
        }

        let mut shared = self.shared.borrow_mut();
        if next_state != shared.fsm_state {
            debug!("Moving state machine to {next_state}");
        }
        shared.last_fsm_state = state;
        shared.fsm_state = next_state;
    }

    fn flags(&self) -> (bool, bool) {
        let shared = self.shared.borrow();
        (shared.request_failed, shared.request_pending)
    }

    fn run_protocol_version_callback(
        &mut self,
        version: (Option<u8>, Option<u8>),
    ) -> Result<(), ScrutinyError> {
        let (Some(major), Some(minor)) = version else {
            return Err(ScrutinyError::InvalidDeviceData("protocol version"));
        };
        match self.protocol_version_callback.as_mut() {
            Some(callback) => callback(major, minor),
            None => Ok(()),
        }
    }

    fn run_comm_param_callback(&mut self, partial_info: &DeviceInfo) -> Result<(), ScrutinyError> {
        match self.comm_param_callback.as_mut() {
            Some(callback) => callback(partial_info),
            None => Ok(()),
        }
    }

    fn register_single(&mut self, request: Request) {
        self.register(request);
        self.shared.borrow_mut().request_pending = true;
    }

    fn register_region_batch(&mut self, region_type: MemoryRangeType, count: usize) {
        for index in 0..count {
            let request = self
                .protocol
                .borrow()
                .get_special_memory_region_location(region_type, index as u8);
            self.register(request);
        }
    }

    fn register(&mut self, request: Request) {
        let success = {
            let shared = Rc::clone(&self.shared);
            Box::new(move |_request: &Request, code: ResponseCode, data: Option<ResponseData>| {
                shared.borrow_mut().handle_success(code, data);
            })
        };
        let failure = {
            let shared = Rc::clone(&self.shared);
            Box::new(move |_request: &Request| {
                shared.borrow_mut().handle_failure();
            })
        };
        self.dispatcher
            .borrow_mut()
            .register_request(request, success, failure, self.priority);
    }

    #[cfg(test)]
    pub(crate) fn force_done_with_incomplete_info(&mut self) {
        let mut shared = self.shared.borrow_mut();
        shared.info.clear();
        shared.fsm_state = PollerFsmState::Done;
        shared.last_fsm_state = PollerFsmState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AddressSize, ProtocolVersion};

    struct Fixture {
        poller: InfoPoller,
        dispatcher: Rc<RefCell<RequestDispatcher>>,
    }

    fn fixture() -> Fixture {
        let protocol = Rc::new(RefCell::new(Protocol::new(
            ProtocolVersion::new(1, 0).unwrap(),
            AddressSize::S32,
        )));
        let dispatcher = Rc::new(RefCell::new(RequestDispatcher::new()));
        let poller = InfoPoller::new(
            Rc::clone(&protocol),
            Rc::clone(&dispatcher),
            RequestPriority::PollInfo,
            None,
            None,
        );
        Fixture { poller, dispatcher }
    }

    fn complete_next(fixture: &Fixture, data: ResponseData) {
        let mut record = fixture.dispatcher.borrow_mut().next().unwrap();
        record.complete_success(ResponseCode::Ok, Some(data));
    }

    fn drive_to_done(fixture: &mut Fixture, forbidden: &[(u64, u64)], readonly: &[(u64, u64)]) {
        fixture.poller.start();
        fixture.poller.process(); // Init -> GetProtocolVersion
        fixture.poller.process(); // registers the request
        complete_next(fixture, ResponseData::ProtocolVersion { major: 1, minor: 0 });
        fixture.poller.process(); // -> GetCommParams
        fixture.poller.process();
        complete_next(
            fixture,
            ResponseData::CommParams {
                max_tx_data_size: 128,
                max_rx_data_size: 128,
                max_bitrate_bps: 100_000,
                heartbeat_timeout_us: 4_000_000,
                rx_timeout_us: 50_000,
                address_size_bits: 32,
            },
        );
        fixture.poller.process(); // -> GetSupportedFeatures
        fixture.poller.process();
        complete_next(
            fixture,
            ResponseData::SupportedFeatures {
                memory_read: true,
                memory_write: true,
                datalog_acquire: true,
                user_command: true,
            },
        );
        fixture.poller.process(); // -> GetSpecialMemoryRegionCount
        fixture.poller.process();
        complete_next(
            fixture,
            ResponseData::SpecialMemoryRegionCount {
                nbr_readonly: readonly.len() as u8,
                nbr_forbidden: forbidden.len() as u8,
            },
        );
        fixture.poller.process(); // -> GetForbiddenMemoryRegions
        fixture.poller.process(); // registers the batch
        for &(start, end) in forbidden {
            complete_next(
                fixture,
                ResponseData::SpecialMemoryRegionLocation {
                    region_type: MemoryRangeType::Forbidden,
                    index: 0,
                    start,
                    end,
                },
            );
        }
        fixture.poller.process(); // -> GetReadOnlyMemoryRegions
        fixture.poller.process();
        for &(start, end) in readonly {
            complete_next(
                fixture,
                ResponseData::SpecialMemoryRegionLocation {
                    region_type: MemoryRangeType::ReadOnly,
                    index: 0,
                    start,
                    end,
                },
            );
        }
        fixture.poller.process(); // -> Done
    }

    #[test]
    fn test_full_sequence_populates_info() {
        let mut fixture = fixture();
        drive_to_done(&mut fixture, &[(0x1000, 0x1fff)], &[(0x2000, 0x2fff)]);
        assert!(fixture.poller.done());
        let info = fixture.poller.get_device_info();
        assert!(info.all_ready());
        assert_eq!(
            info.forbidden_memory_regions.unwrap(),
            vec![MemoryRegion { start: 0x1000, end: 0x1fff }]
        );
        assert_eq!(
            info.readonly_memory_regions.unwrap(),
            vec![MemoryRegion { start: 0x2000, end: 0x2fff }]
        );
        assert_eq!(info.supported_feature_map.unwrap().user_command, true);
    }

    #[test]
    fn test_zero_regions_complete_immediately() {
        let mut fixture = fixture();
        drive_to_done(&mut fixture, &[], &[]);
        assert!(fixture.poller.done());
        let info = fixture.poller.get_device_info();
        assert_eq!(info.forbidden_memory_regions.unwrap().len(), 0);
        assert_eq!(info.readonly_memory_regions.unwrap().len(), 0);
    }

    #[test]
    fn test_refused_response_sets_stage_message() {
        let fixture_cell = &mut fixture();
        fixture_cell.poller.start();
        fixture_cell.poller.process();
        fixture_cell.poller.process();

        let mut record = fixture_cell.dispatcher.borrow_mut().next().unwrap();
        record.complete_success(ResponseCode::FailureToProceed, None);
        fixture_cell.poller.process();

        assert!(fixture_cell.poller.is_in_error());
        assert_eq!(
            fixture_cell.poller.get_error_message(),
            "Device refused to give protocol version. Response Code = FailureToProceed"
        );
    }

    #[test]
    fn test_invalid_payload_sets_stage_message() {
        let fixture_cell = &mut fixture();
        fixture_cell.poller.start();
        fixture_cell.poller.process();
        fixture_cell.poller.process();

        let mut record = fixture_cell.dispatcher.borrow_mut().next().unwrap();
        record.complete_success(ResponseCode::Ok, None);
        fixture_cell.poller.process();

        assert!(fixture_cell.poller.is_in_error());
        assert_eq!(
            fixture_cell.poller.get_error_message(),
            "Device gave invalid data when polling for protocol version. Response Code = Ok"
        );
    }

    #[test]
    fn test_dispatcher_failure_sets_stage_message() {
        let fixture_cell = &mut fixture();
        fixture_cell.poller.start();
        fixture_cell.poller.process();
        fixture_cell.poller.process();
        complete_next(fixture_cell, ResponseData::ProtocolVersion { major: 1, minor: 0 });
        fixture_cell.poller.process();
        fixture_cell.poller.process();

        let mut record = fixture_cell.dispatcher.borrow_mut().next().unwrap();
        record.complete_failure();
        fixture_cell.poller.process();

        assert!(fixture_cell.poller.is_in_error());
        assert_eq!(
            fixture_cell.poller.get_error_message(),
            "Failed to get communication params"
        );
        // The info keeps what earlier stages gathered, nothing more.
        let info = fixture_cell.poller.get_device_info();
        assert_eq!(info.protocol_major, Some(1));
        assert!(info.max_tx_data_size.is_none());
    }

    #[test]
    fn test_version_callback_error_stops_the_poll() {
        let protocol = Rc::new(RefCell::new(Protocol::new(
            ProtocolVersion::new(1, 0).unwrap(),
            AddressSize::S32,
        )));
        let dispatcher = Rc::new(RefCell::new(RequestDispatcher::new()));
        let mut poller = InfoPoller::new(
            Rc::clone(&protocol),
            Rc::clone(&dispatcher),
            RequestPriority::PollInfo,
            Some(Box::new(|major, minor| {
                Err(ScrutinyError::UnsupportedVersion { major, minor })
            })),
            None,
        );
        poller.start();
        poller.process();
        poller.process();
        let mut record = dispatcher.borrow_mut().next().unwrap();
        record.complete_success(ResponseCode::Ok, Some(ResponseData::ProtocolVersion { major: 2, minor: 1 }));
        poller.process();
        assert!(poller.is_in_error());
    }

    #[test]
    fn test_stop_with_pending_request_discards_late_payload() {
        let fixture_cell = &mut fixture();
        fixture_cell.poller.start();
        fixture_cell.poller.process();
        fixture_cell.poller.process();

        fixture_cell.poller.stop();
        // The pending request keeps the machine alive for one more tick.
        fixture_cell.poller.process();

        let mut record = fixture_cell.dispatcher.borrow_mut().next().unwrap();
        record.complete_success(ResponseCode::Ok, Some(ResponseData::ProtocolVersion { major: 1, minor: 0 }));

        fixture_cell.poller.process();
        assert!(!fixture_cell.poller.done());
        assert!(!fixture_cell.poller.is_in_error());
        assert!(fixture_cell.poller.get_device_info().protocol_major.is_none());

        // A later start runs a fresh sequence from scratch.
        fixture_cell.poller.start();
        fixture_cell.poller.process();
        assert!(!fixture_cell.poller.done());
    }
}
