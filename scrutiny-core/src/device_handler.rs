//! Connection lifecycle owner: discovery, session establishment, capability
//! polling, steady state and teardown.
//!
//! Everything advances from `process()`, one cooperative tick at a time:
//! generators first, then transport I/O, then one FSM transition. A request
//! completed during the I/O phase is therefore visible to the FSM within the
//! same tick.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, error, info, warn};

use crate::comm_handler::CommHandler;
use crate::datastore::Datastore;
use crate::device_info::DeviceInfo;
use crate::device_searcher::DeviceSearcher;
use crate::dispatcher::{RequestDispatcher, RequestPriority, RequestRecord};
use crate::error::ScrutinyError;
use crate::heartbeat_generator::HeartbeatGenerator;
use crate::info_poller::{CommParamCallback, InfoPoller, ProtocolVersionCallback};
use crate::link::{make_link, Link, LinkConfig, LinkType};
use crate::protocol::{
    AddressSize, Protocol, ProtocolVersion, Response, ResponseCode, ResponseData,
    PLACEHOLDER_FIRMWARE_ID,
};
use crate::session_initializer::SessionInitializer;

/// Connection state observable by consumers. Derived from the FSM, never
/// written directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ConnectionStatus {
    Unknown,
    Disconnected,
    Connecting,
    ConnectedNotReady,
    ConnectedReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum FsmState {
    Init,
    Discovering,
    Connecting,
    PollingInfo,
    Ready,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceHandlerConfig {
    /// Seconds to wait for a response before dropping the pending request.
    pub response_timeout: f64,
    /// Seconds without a valid heartbeat answer before the link is declared dead.
    pub heartbeat_timeout: f64,
    /// Address size the protocol codec starts with, in bits.
    pub default_address_size: u16,
    /// Protocol version spoken until the device reports its own, as "major.minor".
    pub default_protocol_version: String,
    pub link_type: LinkType,
    pub link_config: LinkConfig,
}

impl Default for DeviceHandlerConfig {
    fn default() -> Self {
        DeviceHandlerConfig {
            response_timeout: 1.0,
            heartbeat_timeout: 4.0,
            default_address_size: 32,
            default_protocol_version: "1.0".to_string(),
            link_type: LinkType::None,
            link_config: LinkConfig::default(),
        }
    }
}

/// Invoked exactly once when a requested disconnection finishes, with the
/// round-trip outcome.
pub type DisconnectCallback = Box<dyn FnOnce(bool)>;

#[derive(Default)]
struct DisconnectState {
    complete: bool,
    callback: Option<DisconnectCallback>,
}

pub struct DeviceHandler {
    datastore: Rc<RefCell<Datastore>>,
    protocol: Rc<RefCell<Protocol>>,
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    comm_handler: CommHandler,
    device_searcher: DeviceSearcher,
    session_initializer: SessionInitializer,
    heartbeat_generator: HeartbeatGenerator,
    info_poller: InfoPoller,
    config: DeviceHandlerConfig,
    default_version: ProtocolVersion,
    default_address_size: AddressSize,
    heartbeat_timeout: Duration,
    fsm_state: FsmState,
    last_fsm_state: FsmState,
    active_request_record: Option<RequestRecord>,
    connected: bool,
    session_id: Option<u32>,
    device_id: Option<String>,
    device_info: DeviceInfo,
    comm_broken: bool,
    comm_broken_count: u64,
    disconnection_requested: bool,
    disconnect: Rc<RefCell<DisconnectState>>,
}

impl DeviceHandler {
    pub fn new(config: DeviceHandlerConfig, datastore: Rc<RefCell<Datastore>>) -> Result<Self, ScrutinyError> {
        let default_version: ProtocolVersion = config.default_protocol_version.parse()?;
        let default_address_size = AddressSize::from_bits(config.default_address_size)
            .map_err(|e| ScrutinyError::Config(e.to_string()))?;

        let protocol = Rc::new(RefCell::new(Protocol::new(default_version, default_address_size)));
        let dispatcher = Rc::new(RefCell::new(RequestDispatcher::new()));

        let device_searcher = DeviceSearcher::new(
            Rc::clone(&protocol),
            Rc::clone(&dispatcher),
            RequestPriority::Discover,
        );
        let session_initializer = SessionInitializer::new(
            Rc::clone(&protocol),
            Rc::clone(&dispatcher),
            RequestPriority::Connect,
        );
        let mut heartbeat_generator = HeartbeatGenerator::new(
            Rc::clone(&protocol),
            Rc::clone(&dispatcher),
            RequestPriority::Heartbeat,
        );
        heartbeat_generator.set_interval(Duration::from_secs_f64(
            (config.heartbeat_timeout * 0.75).max(0.5),
        ));

        let protocol_version_callback: ProtocolVersionCallback = {
            let protocol = Rc::clone(&protocol);
            Box::new(move |major, minor| {
                info!("Configuring protocol to V{major}.{minor}");
                protocol.borrow_mut().set_version(major, minor)
            })
        };
        let comm_param_callback: CommParamCallback = {
            let protocol = Rc::clone(&protocol);
            let heartbeat = heartbeat_generator.shared();
            Box::new(move |partial_info: &DeviceInfo| {
                let bits = partial_info
                    .address_size_bits
                    .ok_or(ScrutinyError::InvalidDeviceData("address size"))?;
                let address_size = AddressSize::from_bits(bits)?;
                let heartbeat_timeout_us = partial_info
                    .heartbeat_timeout_us
                    .ok_or(ScrutinyError::InvalidDeviceData("heartbeat timeout"))?;
                info!(
                    "Device has an address size of {bits} bits. \
                     Configuring protocol to encode/decode them accordingly."
                );
                protocol.borrow_mut().set_address_size(address_size);
                heartbeat.borrow_mut().interval = Duration::from_secs_f64(
                    (heartbeat_timeout_us as f64 / 1_000_000.0 * 0.75).max(0.5),
                );
                Ok(())
            })
        };
        let info_poller = InfoPoller::new(
            Rc::clone(&protocol),
            Rc::clone(&dispatcher),
            RequestPriority::PollInfo,
            Some(protocol_version_callback),
            Some(comm_param_callback),
        );

        let comm_handler = CommHandler::new(Duration::from_secs_f64(config.response_timeout));
        let heartbeat_timeout = Duration::from_secs_f64(config.heartbeat_timeout);

        let mut handler = DeviceHandler {
            datastore,
            protocol,
            dispatcher,
            comm_handler,
            device_searcher,
            session_initializer,
            heartbeat_generator,
            info_poller,
            config,
            default_version,
            default_address_size,
            heartbeat_timeout,
            fsm_state: FsmState::Init,
            last_fsm_state: FsmState::Init,
            active_request_record: None,
            connected: false,
            session_id: None,
            device_id: None,
            device_info: DeviceInfo::default(),
            comm_broken: false,
            comm_broken_count: 0,
            disconnection_requested: false,
            disconnect: Rc::new(RefCell::new(DisconnectState::default())),
        };
        handler.reset_comm();
        Ok(handler)
    }

    /// Opens the communication channel selected by the configuration.
    /// `link_type = none` leaves communication closed.
    pub fn init_comm(&mut self) -> Result<(), ScrutinyError> {
        match make_link(self.config.link_type, &self.config.link_config)? {
            Some(link) => self.init_comm_with_link(link),
            None => Ok(()),
        }
    }

    /// Opens communication on a caller-supplied link. Lets a test or a demo
    /// setup keep the device side of an in-process link.
    pub fn init_comm_with_link(&mut self, link: Box<dyn Link>) -> Result<(), ScrutinyError> {
        self.comm_handler.open(link)?;
        self.reset_comm();
        Ok(())
    }

    /// Stops all communication with the device.
    pub fn stop_comm(&mut self) {
        self.comm_handler.close();
        self.reset_comm();
    }

    /// Requests a graceful disconnection. The FSM reaches `Disconnecting` on
    /// a later tick; `callback` fires once with the round-trip outcome.
    pub fn send_disconnect(&mut self, callback: Option<DisconnectCallback>) {
        debug!("Disconnection requested.");
        self.disconnection_requested = true;
        self.disconnect.borrow_mut().callback = callback;
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        if self.connected {
            if self.fsm_state == FsmState::Ready {
                ConnectionStatus::ConnectedReady
            } else {
                ConnectionStatus::ConnectedNotReady
            }
        } else if self.comm_broken {
            ConnectionStatus::Disconnected
        } else if self.fsm_state == FsmState::Connecting {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn get_device_id(&self) -> Option<String> {
        self.device_id.clone()
    }

    /// Snapshot of the last fully polled device information.
    pub fn get_device_info(&self) -> DeviceInfo {
        self.device_info.clone()
    }

    /// Number of transport-level failures since construction. Grows
    /// monotonically; protocol-semantic errors do not count.
    pub fn comm_broken_count(&self) -> u64 {
        self.comm_broken_count
    }

    pub fn comm_link(&self) -> Option<&dyn Link> {
        self.comm_handler.link()
    }

    pub fn datastore(&self) -> Rc<RefCell<Datastore>> {
        Rc::clone(&self.datastore)
    }

    /// Advances everything one cooperative tick.
    pub fn process(&mut self) {
        self.device_searcher.process();
        self.heartbeat_generator.process();
        self.info_poller.process();
        self.session_initializer.process();

        self.handle_comm();
        self.do_state_machine();
    }

    /// Sets communication state back to a fresh start.
    fn reset_comm(&mut self) {
        if self.comm_broken && self.device_id.is_some() {
            info!("Communication with device stopped. Searching for a new device");
        }

        self.connected = false;
        self.fsm_state = FsmState::Init;
        self.last_fsm_state = FsmState::Init;

        // Generators first so the completions triggered by the flush below
        // land on disarmed state.
        self.device_searcher.stop();
        self.heartbeat_generator.stop();
        self.info_poller.stop();
        self.session_initializer.stop();
        if let Some(mut record) = self.active_request_record.take() {
            record.complete_failure();
        }
        self.dispatcher.borrow_mut().clear();
        self.comm_handler.reset();

        self.device_id = None;
        self.comm_broken = false;
        self.session_id = None;
        self.disconnection_requested = false;
        {
            let mut disconnect = self.disconnect.borrow_mut();
            disconnect.complete = false;
            disconnect.callback = None;
        }

        let mut protocol = self.protocol.borrow_mut();
        protocol.set_address_size(self.default_address_size);
        protocol.reset_version(self.default_version);
    }

    /// Exchanges requests and responses with the device: sends the next
    /// dispatched record when idle, otherwise resolves the pending one
    /// (response, timeout or spurious transport state).
    fn handle_comm(&mut self) {
        self.comm_handler.process();

        if self.comm_handler.is_open() {
            if let Some(record) = self.active_request_record.as_mut() {
                if self.comm_handler.has_timed_out() {
                    debug!("Request timed out. {}", record.request());
                    self.comm_broken = true;
                    self.comm_handler.clear_timeout();
                    record.complete_failure();
                } else if self.comm_handler.waiting_response() {
                    if self.comm_handler.response_available() {
                        if let Some(response) = self.comm_handler.get_response() {
                            match interpret_response(&self.protocol, &response) {
                                Ok((code, data)) => record.complete_success(code, data),
                                Err(e) => {
                                    error!("Invalid response received. {e}");
                                    self.comm_broken = true;
                                    record.complete_failure();
                                }
                            }
                        }
                    }
                } else {
                    // The comm handler went back to idle on its own: a valid
                    // frame arrived that was not the pending response.
                    self.comm_broken = true;
                    self.comm_handler.reset();
                    record.complete_failure();
                }

                if self.active_request_record.as_ref().is_some_and(RequestRecord::is_completed) {
                    self.active_request_record = None;
                }
            } else if let Some(mut record) = self.dispatcher.borrow_mut().next() {
                match self.comm_handler.send_request(record.request()) {
                    Ok(()) => self.active_request_record = Some(record),
                    Err(e) => {
                        error!("Failed to send request. {e}");
                        self.comm_broken = true;
                        record.complete_failure();
                    }
                }
            }
        }

        self.comm_handler.process();
    }

    fn do_state_machine(&mut self) {
        if self.comm_broken {
            self.comm_broken_count += 1;
            self.fsm_state = FsmState::Init;
        }

        if self.connected
            && self.heartbeat_generator.last_valid_heartbeat_timestamp().elapsed() > self.heartbeat_timeout
        {
            self.comm_broken = true;
        }

        let state_entry = self.fsm_state != self.last_fsm_state;
        let mut next_state = self.fsm_state;

        match self.fsm_state {
            FsmState::Init => {
                self.reset_comm();
                if self.comm_handler.is_open() {
                    next_state = FsmState::Discovering;
                }
            }

            FsmState::Discovering => {
                if state_entry {
                    self.device_searcher.start();
                }
                if let Some(found_device_id) = self.device_searcher.get_found_device_ascii() {
                    if self.device_id.is_none() {
                        info!("Found a device - {found_device_id}");
                        if found_device_id == hex::encode(PLACEHOLDER_FIRMWARE_ID) {
                            warn!(
                                "Firmware ID of this device is a default placeholder. \
                                 Firmware might not have been tagged with a valid ID in the build toolchain."
                            );
                        }
                        self.device_id = Some(found_device_id);
                    }
                }
                if self.device_id.is_some() {
                    self.device_searcher.stop();
                    next_state = FsmState::Connecting;
                }
            }

            FsmState::Connecting => {
                if state_entry {
                    self.session_initializer.start();
                }
                if self.session_initializer.connection_successful() {
                    self.session_initializer.stop();
                    match self.session_initializer.get_session_id() {
                        Some(session_id) => {
                            debug!("Session ID set : 0x{session_id:08x}");
                            self.session_id = Some(session_id);
                            self.heartbeat_generator.set_session_id(session_id);
                            self.heartbeat_generator.start();
                            self.connected = true;
                            info!(
                                "Connected to device {} with session ID 0x{session_id:08X}",
                                self.device_id.as_deref().unwrap_or("<unknown>")
                            );
                            next_state = FsmState::PollingInfo;
                        }
                        None => {
                            self.comm_broken = true;
                        }
                    }
                } else if self.session_initializer.is_in_error() {
                    self.session_initializer.stop();
                    self.comm_broken = true;
                } else if self.disconnection_requested {
                    next_state = FsmState::Disconnecting;
                }
            }

            FsmState::PollingInfo => {
                if self.disconnection_requested {
                    next_state = FsmState::Disconnecting;
                }
                if state_entry {
                    self.info_poller.start();
                }
                if self.info_poller.is_in_error() {
                    info!("Impossible to poll data from the device. Restarting communication");
                    debug!("{}", self.info_poller.get_error_message());
                    next_state = FsmState::Init;
                } else if self.info_poller.done() {
                    self.device_info = self.info_poller.get_device_info();
                    self.info_poller.stop();
                    if self.device_info.all_ready() {
                        next_state = FsmState::Ready;
                    } else {
                        error!("Data polled from device is incomplete. Restarting communication.");
                        debug!("{}", self.device_info);
                        next_state = FsmState::Init;
                    }
                }
            }

            FsmState::Ready => {
                if state_entry {
                    info!(
                        "Communication with device {} fully ready",
                        self.device_id.as_deref().unwrap_or("<unknown>")
                    );
                    debug!("Device information : {}", self.device_info);
                }
                if self.disconnection_requested {
                    next_state = FsmState::Disconnecting;
                }
            }

            FsmState::Disconnecting => {
                if state_entry {
                    self.disconnect.borrow_mut().complete = false;
                }
                if !self.connected {
                    next_state = FsmState::Init;
                } else if state_entry {
                    match self.session_id {
                        Some(session_id) => self.register_disconnect_request(session_id),
                        None => next_state = FsmState::Init,
                    }
                }
                if self.disconnect.borrow().complete {
                    next_state = FsmState::Init;
                }
            }
        }

        self.last_fsm_state = self.fsm_state;
        if next_state != self.fsm_state {
            debug!("Moving FSM to state {next_state}");
        }
        self.fsm_state = next_state;
    }

    fn register_disconnect_request(&mut self, session_id: u32) {
        let request = self.protocol.borrow().comm_disconnect(session_id);
        let success = {
            let disconnect = Rc::clone(&self.disconnect);
            Box::new(move |_: &crate::protocol::Request, _: ResponseCode, _: Option<ResponseData>| {
                let mut disconnect = disconnect.borrow_mut();
                disconnect.complete = true;
                if let Some(callback) = disconnect.callback.take() {
                    callback(true);
                }
            })
        };
        let failure = {
            let disconnect = Rc::clone(&self.disconnect);
            Box::new(move |_: &crate::protocol::Request| {
                let mut disconnect = disconnect.borrow_mut();
                disconnect.complete = true;
                if let Some(callback) = disconnect.callback.take() {
                    callback(false);
                }
            })
        };
        self.dispatcher
            .borrow_mut()
            .register_request(request, success, failure, RequestPriority::Disconnect);
    }

    #[cfg(test)]
    pub(crate) fn info_poller_mut(&mut self) -> &mut InfoPoller {
        &mut self.info_poller
    }
}

fn interpret_response(
    protocol: &Rc<RefCell<Protocol>>,
    response: &Response,
) -> Result<(ResponseCode, Option<ResponseData>), ScrutinyError> {
    let code = ResponseCode::try_from(response.code).map_err(|_| {
        ScrutinyError::MalformedResponse(format!("unknown response code {}", response.code))
    })?;
    if code != ResponseCode::Ok {
        return Ok((code, None));
    }
    match protocol.borrow().parse_response(response) {
        Ok(data) => Ok((code, Some(data))),
        Err(ScrutinyError::InvalidPayload(reason)) => {
            warn!("Device sent an undecodable payload. {reason}");
            Ok((code, None))
        }
        Err(e) => Err(e),
    }
}
