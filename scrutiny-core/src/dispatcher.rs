//! Priority queue of outgoing requests, each carrying its completion
//! continuations. Lower priority value means more urgent; records of equal
//! priority leave in registration order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use num_enum::IntoPrimitive;
use tracing::debug;

use crate::protocol::{Request, ResponseCode, ResponseData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum RequestPriority {
    Disconnect = 0,
    Heartbeat = 1,
    Connect = 2,
    PollInfo = 5,
    Discover = 10,
}

pub type SuccessCallback = Box<dyn FnOnce(&Request, ResponseCode, Option<ResponseData>)>;
pub type FailureCallback = Box<dyn FnOnce(&Request)>;

/// A queued request and its continuations. Completion fires exactly one of
/// the two callbacks, exactly once.
pub struct RequestRecord {
    request: Request,
    success_callback: Option<SuccessCallback>,
    failure_callback: Option<FailureCallback>,
    completed: bool,
}

impl RequestRecord {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn complete_success(&mut self, code: ResponseCode, data: Option<ResponseData>) {
        self.failure_callback = None;
        if let Some(callback) = self.success_callback.take() {
            callback(&self.request, code, data);
        }
        self.completed = true;
    }

    pub fn complete_failure(&mut self) {
        self.success_callback = None;
        if let Some(callback) = self.failure_callback.take() {
            callback(&self.request);
        }
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

struct QueuedRecord {
    priority: u8,
    seq: u64,
    record: RequestRecord,
}

impl PartialEq for QueuedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRecord {}

impl PartialOrd for QueuedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRecord {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

pub struct RequestDispatcher {
    queue: BinaryHeap<QueuedRecord>,
    next_seq: u64,
}

impl RequestDispatcher {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        RequestDispatcher {
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn register_request(
        &mut self,
        request: Request,
        success_callback: SuccessCallback,
        failure_callback: FailureCallback,
        priority: RequestPriority,
    ) {
        debug!("Registering request {request} at priority {:?}", priority);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedRecord {
            priority: priority.into(),
            seq,
            record: RequestRecord {
                request,
                success_callback: Some(success_callback),
                failure_callback: Some(failure_callback),
                completed: false,
            },
        });
    }

    /// Pops the most urgent pending record, if any.
    pub fn next(&mut self) -> Option<RequestRecord> {
        self.queue.pop().map(|queued| queued.record)
    }

    /// Fails out every queued record. Run when communication resets so no
    /// request registered against a dead session survives into the next one.
    /// Completing instead of dropping lets the owning generators clear their
    /// pending flags.
    pub fn clear(&mut self) {
        let mut drained = 0usize;
        while let Some(mut queued) = self.queue.pop() {
            queued.record.complete_failure();
            drained += 1;
        }
        if drained > 0 {
            debug!("Flushed {drained} queued request(s)");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AddressSize, Protocol, ProtocolVersion};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn protocol() -> Protocol {
        Protocol::new(ProtocolVersion::new(1, 0).unwrap(), AddressSize::S32)
    }

    fn noop_success() -> SuccessCallback {
        Box::new(|_, _, _| {})
    }

    fn noop_failure() -> FailureCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_priority_order() {
        let proto = protocol();
        let mut dispatcher = RequestDispatcher::new();
        dispatcher.register_request(proto.comm_discover(), noop_success(), noop_failure(), RequestPriority::Discover);
        dispatcher.register_request(proto.comm_connect(), noop_success(), noop_failure(), RequestPriority::Connect);
        dispatcher.register_request(
            proto.comm_heartbeat(1, 2),
            noop_success(),
            noop_failure(),
            RequestPriority::Heartbeat,
        );

        assert_eq!(dispatcher.next().unwrap().request(), &proto.comm_heartbeat(1, 2));
        assert_eq!(dispatcher.next().unwrap().request(), &proto.comm_connect());
        assert_eq!(dispatcher.next().unwrap().request(), &proto.comm_discover());
        assert!(dispatcher.next().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let proto = protocol();
        let mut dispatcher = RequestDispatcher::new();
        for index in 0..4u8 {
            dispatcher.register_request(
                proto.get_special_memory_region_location(crate::protocol::MemoryRangeType::Forbidden, index),
                noop_success(),
                noop_failure(),
                RequestPriority::PollInfo,
            );
        }
        for index in 0..4u8 {
            let record = dispatcher.next().unwrap();
            assert_eq!(record.request().payload[1], index);
        }
    }

    #[test]
    fn test_completion_fires_exactly_one_callback() {
        let proto = protocol();
        let outcome = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::new();

        let success_log = Rc::clone(&outcome);
        let failure_log = Rc::clone(&outcome);
        dispatcher.register_request(
            proto.get_protocol_version(),
            Box::new(move |_, code, _| success_log.borrow_mut().push(format!("success:{code}"))),
            Box::new(move |_| failure_log.borrow_mut().push("failure".into())),
            RequestPriority::PollInfo,
        );

        let mut record = dispatcher.next().unwrap();
        assert!(!record.is_completed());
        record.complete_success(ResponseCode::Ok, None);
        assert!(record.is_completed());
        record.complete_failure();
        assert_eq!(*outcome.borrow(), vec!["success:Ok".to_string()]);
    }
}
