//! Sends recurring session heartbeats and tracks the last valid answer.
//!
//! The generator only produces requests; liveness enforcement is the device
//! handler's job, based on [`HeartbeatGenerator::last_valid_heartbeat_timestamp`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dispatcher::{RequestDispatcher, RequestPriority};
use crate::protocol::{Protocol, Request, ResponseCode, ResponseData};

pub(crate) struct HeartbeatState {
    armed: bool,
    pending: bool,
    pub(crate) interval: Duration,
    session_id: Option<u32>,
    challenge: u16,
    last_request_at: Option<Instant>,
    last_valid_heartbeat: Instant,
}

pub struct HeartbeatGenerator {
    protocol: Rc<RefCell<Protocol>>,
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    priority: RequestPriority,
    started: bool,
    shared: Rc<RefCell<HeartbeatState>>,
}

impl HeartbeatGenerator {
    pub fn new(
        protocol: Rc<RefCell<Protocol>>,
        dispatcher: Rc<RefCell<RequestDispatcher>>,
        priority: RequestPriority,
    ) -> Self {
        HeartbeatGenerator {
            protocol,
            dispatcher,
            priority,
            started: false,
            shared: Rc::new(RefCell::new(HeartbeatState {
                armed: false,
                pending: false,
                interval: Duration::from_secs(3),
                session_id: None,
                challenge: 0,
                last_request_at: None,
                last_valid_heartbeat: Instant::now(),
            })),
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.shared.borrow_mut().interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.shared.borrow().interval
    }

    pub fn set_session_id(&mut self, session_id: u32) {
        self.shared.borrow_mut().session_id = Some(session_id);
    }

    pub fn start(&mut self) {
        self.started = true;
        let mut state = self.shared.borrow_mut();
        state.armed = true;
        state.pending = false;
        state.challenge = 0;
        // First beat one full interval after start, so session establishment
        // and info polling are never queued behind a heartbeat.
        state.last_request_at = Some(Instant::now());
        state.last_valid_heartbeat = Instant::now();
    }

    pub fn stop(&mut self) {
        self.started = false;
        let mut state = self.shared.borrow_mut();
        state.armed = false;
        state.session_id = None;
    }

    pub fn process(&mut self) {
        if !self.started {
            return;
        }
        let request = {
            let state = self.shared.borrow();
            let due = !state.pending
                && state
                    .last_request_at
                    .is_none_or(|last| last.elapsed() >= state.interval);
            match (due, state.session_id) {
                (true, Some(session_id)) => {
                    Some(self.protocol.borrow().comm_heartbeat(session_id, state.challenge))
                }
                _ => None,
            }
        };
        if let Some(request) = request {
            self.register(request);
            let mut state = self.shared.borrow_mut();
            state.pending = true;
            state.last_request_at = Some(Instant::now());
        }
    }

    /// Instant of the last heartbeat the device answered correctly. Reset on
    /// `start` so a fresh session begins with a full timeout budget.
    pub fn last_valid_heartbeat_timestamp(&self) -> Instant {
        self.shared.borrow().last_valid_heartbeat
    }

    pub(crate) fn shared(&self) -> Rc<RefCell<HeartbeatState>> {
        Rc::clone(&self.shared)
    }

    fn register(&self, request: Request) {
        let success = {
            let shared = Rc::clone(&self.shared);
            Box::new(move |_request: &Request, code: ResponseCode, data: Option<ResponseData>| {
                let mut state = shared.borrow_mut();
                state.pending = false;
                if !state.armed {
                    return;
                }
                match (code, data) {
                    (
                        ResponseCode::Ok,
                        Some(ResponseData::Heartbeat {
                            session_id,
                            challenge_response,
                        }),
                    ) if Some(session_id) == state.session_id
                        && challenge_response == Protocol::heartbeat_expected_challenge_response(state.challenge) =>
                    {
                        state.last_valid_heartbeat = Instant::now();
                        state.challenge = state.challenge.wrapping_add(1);
                    }
                    (code, _) => {
                        debug!("Heartbeat got an unusable answer. Response Code = {code}");
                    }
                }
            })
        };
        let failure = {
            let shared = Rc::clone(&self.shared);
            Box::new(move |_request: &Request| {
                shared.borrow_mut().pending = false;
            })
        };
        self.dispatcher
            .borrow_mut()
            .register_request(request, success, failure, self.priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AddressSize, ProtocolVersion};

    fn generator() -> (HeartbeatGenerator, Rc<RefCell<RequestDispatcher>>) {
        let protocol = Rc::new(RefCell::new(Protocol::new(
            ProtocolVersion::new(1, 0).unwrap(),
            AddressSize::S32,
        )));
        let dispatcher = Rc::new(RefCell::new(RequestDispatcher::new()));
        let generator = HeartbeatGenerator::new(protocol, Rc::clone(&dispatcher), RequestPriority::Heartbeat);
        (generator, dispatcher)
    }

    #[test]
    fn test_valid_answer_refreshes_timestamp() {
        let (mut generator, dispatcher) = generator();
        generator.set_interval(Duration::from_millis(0));
        generator.set_session_id(0xdead_beef);
        generator.start();
        let started_at = generator.last_valid_heartbeat_timestamp();

        generator.process();
        let mut record = dispatcher.borrow_mut().next().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        record.complete_success(
            ResponseCode::Ok,
            Some(ResponseData::Heartbeat {
                session_id: 0xdead_beef,
                challenge_response: Protocol::heartbeat_expected_challenge_response(0),
            }),
        );
        assert!(generator.last_valid_heartbeat_timestamp() > started_at);
    }

    #[test]
    fn test_wrong_challenge_does_not_refresh() {
        let (mut generator, dispatcher) = generator();
        generator.set_interval(Duration::from_millis(0));
        generator.set_session_id(0xdead_beef);
        generator.start();
        let started_at = generator.last_valid_heartbeat_timestamp();

        generator.process();
        let mut record = dispatcher.borrow_mut().next().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        record.complete_success(
            ResponseCode::Ok,
            Some(ResponseData::Heartbeat {
                session_id: 0xdead_beef,
                challenge_response: 0x1234,
            }),
        );
        assert_eq!(generator.last_valid_heartbeat_timestamp(), started_at);
    }

    #[test]
    fn test_no_request_without_session() {
        let (mut generator, dispatcher) = generator();
        generator.set_interval(Duration::from_millis(0));
        generator.start();
        generator.process();
        assert!(dispatcher.borrow().is_empty());
    }

    #[test]
    fn test_waits_for_interval_between_beats() {
        let (mut generator, dispatcher) = generator();
        generator.set_interval(Duration::from_millis(0));
        generator.set_session_id(1);
        generator.start();

        generator.process();
        assert_eq!(dispatcher.borrow().len(), 1);
        dispatcher.borrow_mut().next().unwrap().complete_failure();

        generator.set_interval(Duration::from_secs(60));
        generator.process();
        assert!(dispatcher.borrow().is_empty());
    }

    #[test]
    fn test_first_beat_waits_one_interval_after_start() {
        let (mut generator, dispatcher) = generator();
        generator.set_interval(Duration::from_secs(60));
        generator.set_session_id(1);
        generator.start();
        generator.process();
        assert!(dispatcher.borrow().is_empty());
    }
}
