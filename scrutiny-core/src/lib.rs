//! Server-side device-interaction core of the Scrutiny embedded debugger.
//!
//! The device handler owns the connection lifecycle with an instrumented
//! firmware target; the info poller interrogates its capabilities; the
//! active SFD handler binds the matching firmware description to the
//! datastore. Everything is single-threaded and cooperative: a host driver
//! calls `process()` on the handlers periodically and nothing ever blocks.

pub mod active_sfd_handler;
pub mod comm_handler;
pub mod datastore;
pub mod device_handler;
pub mod device_info;
pub mod device_searcher;
pub mod dispatcher;
pub mod emulator;
pub mod error;
pub mod heartbeat_generator;
pub mod info_poller;
pub mod link;
pub mod protocol;
pub mod session_initializer;
pub mod sfd;


// Re-export commonly used types
pub use active_sfd_handler::{ActiveSfdHandler, DeviceStatusSource, SfdLoadedCallback, SfdUnloadedCallback};
pub use comm_handler::CommHandler;
pub use datastore::{Datastore, DatastoreEntry, EntryType, VariableDef, VariableType};
pub use device_handler::{ConnectionStatus, DeviceHandler, DeviceHandlerConfig, DisconnectCallback};
pub use device_info::{DeviceInfo, MemoryRegion, SupportedFeatureMap};
pub use dispatcher::{RequestDispatcher, RequestPriority};
pub use emulator::EmulatedDevice;
pub use error::ScrutinyError;
pub use link::{DummyLink, Link, LinkConfig, LinkType, ThreadSafeDummyLink, UdpLink};
pub use protocol::{Protocol, ResponseCode, FIRMWARE_ID_LENGTH, PLACEHOLDER_FIRMWARE_ID};
pub use sfd::{FirmwareDescription, SfdStorage};
