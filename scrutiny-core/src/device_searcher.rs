//! Broadcasts discovery requests and reports the first firmware ID seen.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dispatcher::{RequestDispatcher, RequestPriority};
use crate::protocol::{Protocol, Request, ResponseCode, ResponseData, FIRMWARE_ID_LENGTH};

const DISCOVER_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct SearcherState {
    armed: bool,
    pending: bool,
    found_device: Option<[u8; FIRMWARE_ID_LENGTH]>,
    last_request_at: Option<Instant>,
}

/// Never terminates on its own: it keeps broadcasting until the device
/// handler stops it after latching a device ID.
pub struct DeviceSearcher {
    protocol: Rc<RefCell<Protocol>>,
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    priority: RequestPriority,
    started: bool,
    shared: Rc<RefCell<SearcherState>>,
}

impl DeviceSearcher {
    pub fn new(
        protocol: Rc<RefCell<Protocol>>,
        dispatcher: Rc<RefCell<RequestDispatcher>>,
        priority: RequestPriority,
    ) -> Self {
        DeviceSearcher {
            protocol,
            dispatcher,
            priority,
            started: false,
            shared: Rc::new(RefCell::new(SearcherState::default())),
        }
    }

    pub fn start(&mut self) {
        self.started = true;
        let mut state = self.shared.borrow_mut();
        *state = SearcherState::default();
        state.armed = true;
    }

    /// Disarms the searcher. The latest result stays readable until the next
    /// `start`, and a response landing after this point is discarded.
    pub fn stop(&mut self) {
        self.started = false;
        self.shared.borrow_mut().armed = false;
    }

    pub fn process(&mut self) {
        if !self.started {
            return;
        }
        let due = {
            let state = self.shared.borrow();
            !state.pending
                && state
                    .last_request_at
                    .is_none_or(|last| last.elapsed() >= DISCOVER_INTERVAL)
        };
        if due {
            let request = self.protocol.borrow().comm_discover();
            self.register(request);
            let mut state = self.shared.borrow_mut();
            state.pending = true;
            state.last_request_at = Some(Instant::now());
        }
    }

    pub fn get_found_device(&self) -> Option<[u8; FIRMWARE_ID_LENGTH]> {
        self.shared.borrow().found_device
    }

    /// Firmware ID of the discovered device, in display form.
    pub fn get_found_device_ascii(&self) -> Option<String> {
        self.get_found_device().map(hex::encode)
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
                    (ResponseCode::Ok, Some(ResponseData::Discover { firmware_id })) => {
                        state.found_device = Some(firmware_id);
                    }
                    (code, _) => debug!("Discovery got no usable answer. Response Code = {code}"),
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

    fn searcher() -> (DeviceSearcher, Rc<RefCell<RequestDispatcher>>) {
        let protocol = Rc::new(RefCell::new(Protocol::new(
            ProtocolVersion::new(1, 0).unwrap(),
            AddressSize::S32,
        )));
        let dispatcher = Rc::new(RefCell::new(RequestDispatcher::new()));
        let searcher = DeviceSearcher::new(protocol, Rc::clone(&dispatcher), RequestPriority::Discover);
        (searcher, dispatcher)
    }

    #[test]
    fn test_broadcast_until_found() {
        let (mut searcher, dispatcher) = searcher();
        searcher.process();
        assert!(dispatcher.borrow().is_empty());

        searcher.start();
        searcher.process();
        assert_eq!(dispatcher.borrow().len(), 1);

        // One request in flight at a time.
        searcher.process();
        assert_eq!(dispatcher.borrow().len(), 1);

        let mut record = dispatcher.borrow_mut().next().unwrap();
        record.complete_success(
            ResponseCode::Ok,
            Some(ResponseData::Discover { firmware_id: [0xab; 16] }),
        );
        assert_eq!(searcher.get_found_device_ascii().unwrap(), "ab".repeat(16));
    }

    #[test]
    fn test_late_response_after_stop_is_discarded() {
        let (mut searcher, dispatcher) = searcher();
        searcher.start();
        searcher.process();
        let mut record = dispatcher.borrow_mut().next().unwrap();
        searcher.stop();
        record.complete_success(
            ResponseCode::Ok,
            Some(ResponseData::Discover { firmware_id: [0xab; 16] }),
        );
        assert!(searcher.get_found_device().is_none());
    }
}
