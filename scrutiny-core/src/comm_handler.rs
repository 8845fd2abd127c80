//! Transport-level request/response pump.
//!
//! One request outstanding at a time. The handler reassembles response
//! frames from whatever the link delivers, matches them against the pending
//! request and accounts for the response timeout. A frame that does not
//! match the pending request sends the handler back to idle, which upper
//! layers treat as a broken comm.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::ScrutinyError;
use crate::link::Link;
use crate::protocol::{Request, Response, RESPONSE_HEADER_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    WaitingResponse,
    ResponseAvailable,
}

pub struct CommHandler {
    link: Option<Box<dyn Link>>,
    response_timeout: Duration,
    rx_buffer: BytesMut,
    state: RxState,
    pending: Option<(u8, u8)>,
    sent_at: Option<Instant>,
    timed_out: bool,
    response: Option<Response>,
}

impl CommHandler {
    pub fn new(response_timeout: Duration) -> Self {
        CommHandler {
            link: None,
            response_timeout,
            rx_buffer: BytesMut::new(),
            state: RxState::Idle,
            pending: None,
            sent_at: None,
            timed_out: false,
            response: None,
        }
    }

    pub fn open(&mut self, mut link: Box<dyn Link>) -> Result<(), ScrutinyError> {
        link.open()?;
        self.link = Some(link);
        self.reset();
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.reset();
    }

    pub fn is_open(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_open())
    }

    pub fn link(&self) -> Option<&dyn Link> {
        self.link.as_deref()
    }

    /// Pumps the link once: drains received bytes, decodes complete frames
    /// and updates the timeout flag.
    pub fn process(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if !link.is_open() {
            return;
        }

        loop {
            match link.receive() {
                Ok(Some(data)) => self.rx_buffer.extend_from_slice(&data),
                Ok(None) => break,
                Err(e) => {
                    warn!("Link receive error. {e}");
                    break;
                }
            }
        }

        self.decode_frames();

        if self.state == RxState::WaitingResponse
            && self.sent_at.is_some_and(|sent_at| sent_at.elapsed() > self.response_timeout)
        {
            self.timed_out = true;
        }
    }

    pub fn send_request(&mut self, request: &Request) -> Result<(), ScrutinyError> {
        let link = self.link.as_mut().ok_or(ScrutinyError::LinkNotOpen)?;
        if self.state != RxState::Idle {
            // Stale leftovers from an abandoned exchange; the new request owns
            // the channel now.
            debug!("Discarding leftover rx state before sending. {request}");
        }
        link.send(&request.to_bytes())?;
        self.pending = Some((request.command.into(), request.subfn));
        self.sent_at = Some(Instant::now());
        self.state = RxState::WaitingResponse;
        self.timed_out = false;
        self.response = None;
        Ok(())
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn clear_timeout(&mut self) {
        self.timed_out = false;
        self.state = RxState::Idle;
        self.pending = None;
        self.sent_at = None;
    }

    /// True from request transmission until the response is consumed or the
    /// handler gives up on it.
    pub fn waiting_response(&self) -> bool {
        matches!(self.state, RxState::WaitingResponse | RxState::ResponseAvailable)
    }

    pub fn response_available(&self) -> bool {
        self.state == RxState::ResponseAvailable
    }

    pub fn get_response(&mut self) -> Option<Response> {
        let response = self.response.take();
        if response.is_some() {
            self.state = RxState::Idle;
            self.pending = None;
            self.sent_at = None;
        }
        response
    }

    /// Drops every transport-level state except the link itself.
    pub fn reset(&mut self) {
        self.rx_buffer.clear();
        self.state = RxState::Idle;
        self.pending = None;
        self.sent_at = None;
        self.timed_out = false;
        self.response = None;
    }

    fn decode_frames(&mut self) {
        while self.rx_buffer.len() >= RESPONSE_HEADER_LENGTH {
            let length = u16::from_be_bytes([self.rx_buffer[3], self.rx_buffer[4]]) as usize;
            let frame_length = RESPONSE_HEADER_LENGTH + length;
            if self.rx_buffer.len() < frame_length {
                break;
            }
            let frame = self.rx_buffer.split_to(frame_length);
            match Response::from_frame(&frame) {
                Ok(response) => self.accept_frame(response),
                Err(e) => {
                    // No resync point in the stream once framing is lost.
                    warn!("Dropping undecodable data from link. {e}");
                    self.rx_buffer.clear();
                }
            }
        }
    }

    fn accept_frame(&mut self, response: Response) {
        match self.state {
            RxState::WaitingResponse if self.pending == Some((response.command, response.subfn)) => {
                self.response = Some(response);
                self.state = RxState::ResponseAvailable;
            }
            RxState::WaitingResponse => {
                warn!("Received a response that does not match the pending request. {response}");
                self.state = RxState::Idle;
                self.pending = None;
                self.sent_at = None;
            }
            _ => {
                debug!("Discarding unsolicited response. {response}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DummyLink;
    use crate::protocol::{Command, Protocol, ProtocolVersion, AddressSize, ResponseCode};
    use bytes::Bytes;

    fn open_handler(timeout: Duration) -> (CommHandler, crate::link::DummyLinkEndpoint) {
        let link = DummyLink::new();
        let endpoint = link.endpoint();
        let mut handler = CommHandler::new(timeout);
        handler.open(Box::new(link)).unwrap();
        (handler, endpoint)
    }

    fn protocol() -> Protocol {
        Protocol::new(ProtocolVersion::new(1, 0).unwrap(), AddressSize::S32)
    }

    #[test]
    fn test_response_delivery() {
        let (mut handler, mut endpoint) = open_handler(Duration::from_secs(1));
        let request = protocol().get_protocol_version();
        handler.send_request(&request).unwrap();
        assert!(handler.waiting_response());
        assert!(!handler.response_available());

        let response = Response::new(Command::GetInfo, request.subfn, ResponseCode::Ok, Bytes::from_static(&[1, 0]));
        endpoint.send(&response.to_bytes()).unwrap();
        handler.process();

        assert!(handler.response_available());
        assert_eq!(handler.get_response().unwrap(), response);
        assert!(!handler.waiting_response());
    }

    #[test]
    fn test_timeout_detection() {
        let (mut handler, _endpoint) = open_handler(Duration::from_millis(5));
        handler.send_request(&protocol().get_protocol_version()).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        handler.process();
        assert!(handler.has_timed_out());
        handler.clear_timeout();
        assert!(!handler.has_timed_out());
        assert!(!handler.waiting_response());
    }

    #[test]
    fn test_mismatched_response_goes_idle() {
        let (mut handler, mut endpoint) = open_handler(Duration::from_secs(1));
        handler.send_request(&protocol().get_protocol_version()).unwrap();

        let other = Response::new(Command::CommControl, 3, ResponseCode::Ok, Bytes::new());
        endpoint.send(&other.to_bytes()).unwrap();
        handler.process();

        assert!(!handler.waiting_response());
        assert!(!handler.response_available());
        assert!(!handler.has_timed_out());
    }

    #[test]
    fn test_fragmented_frame_reassembly() {
        let (mut handler, mut endpoint) = open_handler(Duration::from_secs(1));
        let request = protocol().get_protocol_version();
        handler.send_request(&request).unwrap();

        let bytes = Response::new(Command::GetInfo, request.subfn, ResponseCode::Ok, Bytes::from_static(&[1, 0]))
            .to_bytes();
        endpoint.send(&bytes[..3]).unwrap();
        handler.process();
        assert!(!handler.response_available());
        endpoint.send(&bytes[3..]).unwrap();
        handler.process();
        assert!(handler.response_available());
    }
}
