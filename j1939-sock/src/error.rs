use std::{error, fmt};

/// Errors surfaced by the endpoint layer.
///
/// All variants are plain kinds so an error can be stored on an endpoint
/// and handed back from a later call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed address, option or parameter group.
    InvalidArgument,
    /// Interface not found, or not a CAN device.
    NoSuchDevice,
    /// Send without a destination and no peer assigned.
    DestinationRequired,
    /// Endpoint not in the state the operation requires.
    BadState,
    /// Broadcast target without broadcast permission.
    AccessDenied,
    /// Operation reserved to privileged endpoints.
    PermissionDenied,
    /// Numeric argument outside its domain.
    OutOfDomain,
    /// Requested address not available on this endpoint.
    AddressNotAvailable,
    /// Unknown endpoint option.
    NoProtocolOption,
    /// Continuation does not line up with the datagram in flight.
    InputOutput,
    /// No message of the desired type.
    NoMessage,
    /// No matching transport session.
    NotFound,
    /// The operation would block.
    WouldBlock,
    /// Blocked operation interrupted.
    Interrupted,
    /// Buffer space exhausted.
    NoMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Error::InvalidArgument => "invalid argument",
                Error::NoSuchDevice => "no such device",
                Error::DestinationRequired => "destination address required",
                Error::BadState => "endpoint in bad state",
                Error::AccessDenied => "access denied",
                Error::PermissionDenied => "operation not permitted",
                Error::OutOfDomain => "argument out of domain",
                Error::AddressNotAvailable => "address not available",
                Error::NoProtocolOption => "protocol option not available",
                Error::InputOutput => "input/output error",
                Error::NoMessage => "no message of desired type",
                Error::NotFound => "no such session",
                Error::WouldBlock => "operation would block",
                Error::Interrupted => "interrupted",
                Error::NoMemory => "out of buffer space",
            }
        )
    }
}

impl error::Error for Error {}
