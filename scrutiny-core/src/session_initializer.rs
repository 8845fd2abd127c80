//! Performs the connect handshake and captures the session ID.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error};

use crate::dispatcher::{RequestDispatcher, RequestPriority};
use crate::protocol::{Protocol, Request, ResponseCode, ResponseData};

#[derive(Default)]
struct SessionState {
    armed: bool,
    attempted: bool,
    pending: bool,
    success: bool,
    error: bool,
    session_id: Option<u32>,
}

/// Sends a single connect request per `start`. A refused or undecodable
/// answer leaves it in a persistent error state until restarted.
pub struct SessionInitializer {
    protocol: Rc<RefCell<Protocol>>,
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    priority: RequestPriority,
    started: bool,
    shared: Rc<RefCell<SessionState>>,
}

impl SessionInitializer {
    pub fn new(
        protocol: Rc<RefCell<Protocol>>,
        dispatcher: Rc<RefCell<RequestDispatcher>>,
        priority: RequestPriority,
    ) -> Self {
        SessionInitializer {
            protocol,
            dispatcher,
            priority,
            started: false,
            shared: Rc::new(RefCell::new(SessionState::default())),
        }
    }

    pub fn start(&mut self) {
        self.started = true;
        let mut state = self.shared.borrow_mut();
        *state = SessionState::default();
        state.armed = true;
    }

    /// Disarms the initializer. Results stay readable until the next `start`.
    pub fn stop(&mut self) {
        self.started = false;
        self.shared.borrow_mut().armed = false;
    }

    pub fn process(&mut self) {
        if !self.started {
            return;
        }
        let must_send = {
            let state = self.shared.borrow();
            !state.attempted && !state.pending
        };
        if must_send {
            let request = self.protocol.borrow().comm_connect();
            self.register(request);
            let mut state = self.shared.borrow_mut();
            state.attempted = true;
            state.pending = true;
        }
    }

    pub fn connection_successful(&self) -> bool {
        self.shared.borrow().success
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.borrow().error
    }

    pub fn get_session_id(&self) -> Option<u32> {
        self.shared.borrow().session_id
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
                    (ResponseCode::Ok, Some(ResponseData::Connect { session_id })) => {
                        debug!("Device accepted the connection request");
                        state.session_id = Some(session_id);
                        state.success = true;
                    }
                    (code, _) => {
                        error!("Device refused the connection request. Response Code = {code}");
                        state.error = true;
                    }
                }
            })
        };
        let failure = {
            let shared = Rc::clone(&self.shared);
            Box::new(move |_request: &Request| {
                let mut state = shared.borrow_mut();
                state.pending = false;
                if state.armed {
                    state.error = true;
                }
            })
        };
        self.dispatcher
            .borrow_mut()
            .register_request(request, success, failure, self.priority);
    }
}
