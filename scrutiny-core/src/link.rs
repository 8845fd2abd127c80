//! Device links: the byte transports the comm handler pumps.
//!
//! Links are datagram-oriented and non-blocking. `receive` returns whatever
//! arrived since the last call, or `None` when the wire is silent.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::UdpSocket;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::debug;

use crate::error::ScrutinyError;

pub trait Link {
    fn open(&mut self) -> Result<(), ScrutinyError>;
    fn close(&mut self);
    fn send(&mut self, data: &[u8]) -> Result<(), ScrutinyError>;
    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScrutinyError>;
    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LinkType {
    None,
    Udp,
    Dummy,
    ThreadSafeDummy,
}

/// Opaque link settings handed to the selected link implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Builds the link selected by the configuration. `LinkType::None` yields no
/// link at all; communication stays closed.
pub fn make_link(link_type: LinkType, config: &LinkConfig) -> Result<Option<Box<dyn Link>>, ScrutinyError> {
    match link_type {
        LinkType::None => Ok(None),
        LinkType::Udp => {
            let host = config
                .host
                .clone()
                .ok_or_else(|| ScrutinyError::Config("udp link requires a host".into()))?;
            let port = config
                .port
                .ok_or_else(|| ScrutinyError::Config("udp link requires a port".into()))?;
            Ok(Some(Box::new(UdpLink::new(host, port))))
        }
        LinkType::Dummy => Ok(Some(Box::new(DummyLink::new()))),
        LinkType::ThreadSafeDummy => Ok(Some(Box::new(ThreadSafeDummyLink::new()))),
    }
}

/// Non-blocking UDP datagram link.
pub struct UdpLink {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
}

impl UdpLink {
    pub fn new(host: String, port: u16) -> Self {
        UdpLink { host, port, socket: None }
    }
}

impl Link for UdpLink {
    fn open(&mut self) -> Result<(), ScrutinyError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;
        socket.connect((self.host.as_str(), self.port))?;
        debug!("UDP link open towards {}:{}", self.host, self.port);
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ScrutinyError> {
        let socket = self.socket.as_ref().ok_or(ScrutinyError::LinkNotOpen)?;
        socket.send(data)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScrutinyError> {
        let socket = self.socket.as_ref().ok_or(ScrutinyError::LinkNotOpen)?;
        let mut buffer = vec![0u8; 4096];
        match socket.recv(&mut buffer) {
            Ok(size) => {
                buffer.truncate(size);
                Ok(Some(buffer))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

#[derive(Default)]
struct DummyQueues {
    to_device: VecDeque<Vec<u8>>,
    to_host: VecDeque<Vec<u8>>,
}

/// In-process loopback link. The host side implements [`Link`]; the device
/// side is obtained with [`DummyLink::endpoint`] and also implements
/// [`Link`], so a device responder can sit on the other end.
pub struct DummyLink {
    queues: Rc<RefCell<DummyQueues>>,
    open: bool,
}

impl DummyLink {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        DummyLink {
            queues: Rc::new(RefCell::new(DummyQueues::default())),
            open: false,
        }
    }

    pub fn endpoint(&self) -> DummyLinkEndpoint {
        DummyLinkEndpoint {
            queues: Rc::clone(&self.queues),
        }
    }
}

impl Link for DummyLink {
    fn open(&mut self) -> Result<(), ScrutinyError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        let mut queues = self.queues.borrow_mut();
        queues.to_device.clear();
        queues.to_host.clear();
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ScrutinyError> {
        if !self.open {
            return Err(ScrutinyError::LinkNotOpen);
        }
        self.queues.borrow_mut().to_device.push_back(data.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScrutinyError> {
        if !self.open {
            return Err(ScrutinyError::LinkNotOpen);
        }
        Ok(self.queues.borrow_mut().to_host.pop_front())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Device side of a [`DummyLink`].
pub struct DummyLinkEndpoint {
    queues: Rc<RefCell<DummyQueues>>,
}

impl Link for DummyLinkEndpoint {
    fn open(&mut self) -> Result<(), ScrutinyError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn send(&mut self, data: &[u8]) -> Result<(), ScrutinyError> {
        self.queues.borrow_mut().to_host.push_back(data.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScrutinyError> {
        Ok(self.queues.borrow_mut().to_device.pop_front())
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// [`DummyLink`] variant whose device endpoint is `Send`, for responders
/// running on another thread.
pub struct ThreadSafeDummyLink {
    queues: Arc<Mutex<DummyQueues>>,
    open: bool,
}

impl ThreadSafeDummyLink {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        ThreadSafeDummyLink {
            queues: Arc::new(Mutex::new(DummyQueues::default())),
            open: false,
        }
    }

    pub fn endpoint(&self) -> ThreadSafeDummyLinkEndpoint {
        ThreadSafeDummyLinkEndpoint {
            queues: Arc::clone(&self.queues),
        }
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, DummyQueues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Link for ThreadSafeDummyLink {
    fn open(&mut self) -> Result<(), ScrutinyError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        let mut queues = self.queues();
        queues.to_device.clear();
        queues.to_host.clear();
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ScrutinyError> {
        if !self.open {
            return Err(ScrutinyError::LinkNotOpen);
        }
        self.queues().to_device.push_back(data.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScrutinyError> {
        if !self.open {
            return Err(ScrutinyError::LinkNotOpen);
        }
        Ok(self.queues().to_host.pop_front())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Device side of a [`ThreadSafeDummyLink`].
pub struct ThreadSafeDummyLinkEndpoint {
    queues: Arc<Mutex<DummyQueues>>,
}

impl ThreadSafeDummyLinkEndpoint {
    fn queues(&self) -> std::sync::MutexGuard<'_, DummyQueues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Link for ThreadSafeDummyLinkEndpoint {
    fn open(&mut self) -> Result<(), ScrutinyError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn send(&mut self, data: &[u8]) -> Result<(), ScrutinyError> {
        self.queues().to_host.push_back(data.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScrutinyError> {
        Ok(self.queues().to_device.pop_front())
    }

    fn is_open(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_link_round_trip() {
        let mut link = DummyLink::new();
        let mut endpoint = link.endpoint();

        assert!(matches!(link.send(&[1, 2, 3]), Err(ScrutinyError::LinkNotOpen)));
        link.open().unwrap();

        link.send(&[1, 2, 3]).unwrap();
        assert_eq!(endpoint.receive().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(endpoint.receive().unwrap(), None);

        endpoint.send(&[4, 5]).unwrap();
        assert_eq!(link.receive().unwrap(), Some(vec![4, 5]));
    }

    #[test]
    fn test_thread_safe_dummy_link_crosses_threads() {
        let mut link = ThreadSafeDummyLink::new();
        let mut endpoint = link.endpoint();
        link.open().unwrap();
        link.send(&[9]).unwrap();

        let handle = std::thread::spawn(move || {
            let received = endpoint.receive().unwrap();
            endpoint.send(&[10]).unwrap();
            received
        });
        assert_eq!(handle.join().unwrap(), Some(vec![9]));
        assert_eq!(link.receive().unwrap(), Some(vec![10]));
    }

    #[test]
    fn test_factory_requires_udp_settings() {
        assert!(make_link(LinkType::None, &LinkConfig::default()).unwrap().is_none());
        assert!(make_link(LinkType::Udp, &LinkConfig::default()).is_err());
        let config = LinkConfig {
            host: Some("127.0.0.1".into()),
            port: Some(8765),
        };
        assert!(make_link(LinkType::Udp, &config).unwrap().is_some());
    }
}
