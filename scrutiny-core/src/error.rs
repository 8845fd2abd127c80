use std::io;
use thiserror::Error;

/// The primary error type for the `scrutiny-core` library.
#[derive(Error, Debug)]
pub enum ScrutinyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("link is not open")]
    LinkNotOpen,

    #[error("unsupported protocol version V{major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("device has an address size of {0} bits, this server only supports 8, 16, 32 and 64 bits")]
    UnsupportedAddressSize(u16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("response payload does not decode: {0}")]
    InvalidPayload(String),

    #[error("device reported an invalid {0}")]
    InvalidDeviceData(&'static str),

    #[error("firmware ID {0} is not installed")]
    NotInstalled(String),

    #[error("duplicate datastore entry \"{0}\"")]
    DuplicateEntry(String),
}
