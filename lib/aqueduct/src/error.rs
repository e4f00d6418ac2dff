use std::io;
use std::net;

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors are split into a non-fatal back-pressure signal (`Wait`) and a
/// fatal kind. `Wait` means the operation should be retried on a later
/// duty cycle; it is never reported to clients.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DriverError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ErrorKind {
    /// Channel URI could not be parsed or carries inconsistent parameters.
    InvalidChannel(String),
    /// A client command referenced an unknown registration.
    UnknownRegistration(String),
    /// A command conflicts with live state (e.g. session-id collision with
    /// different geometry).
    ClashingState(String),
    /// Malformed or impossible inbound frame.
    Protocol(String),
    /// Driver configuration rejected at start-up.
    InvalidConfig(String),
    /// Storage allocation (log buffer, counters, CnC) failed.
    Resource(String),
    /// Generic client command failure.
    Generic(String),
    Io(io::ErrorKind),
    AddrParse,
}

impl ErrorKind {
    /// Stable error codes reported to clients in ON_ERROR responses.
    #[inline]
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::Generic(_) => 0,
            ErrorKind::InvalidChannel(_) => 1,
            ErrorKind::UnknownRegistration(_) => 2,
            ErrorKind::ClashingState(_) => 3,
            ErrorKind::Protocol(_) => 4,
            ErrorKind::InvalidConfig(_) => 5,
            ErrorKind::Resource(_) => 6,
            ErrorKind::Io(_) => 7,
            ErrorKind::AddrParse => 8,
        }
    }

    #[inline]
    pub fn message(&self) -> String {
        match self {
            ErrorKind::Generic(msg)
            | ErrorKind::InvalidChannel(msg)
            | ErrorKind::UnknownRegistration(msg)
            | ErrorKind::ClashingState(msg)
            | ErrorKind::Protocol(msg)
            | ErrorKind::InvalidConfig(msg)
            | ErrorKind::Resource(msg) => msg.clone(),
            ErrorKind::Io(kind) => format!("io error: {:?}", kind),
            ErrorKind::AddrParse => "malformed socket address".to_string(),
        }
    }
}

impl From<io::Error> for DriverError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => DriverError::Wait,
            kind => DriverError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for DriverError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        DriverError::Fatal(ErrorKind::AddrParse)
    }
}

pub trait ErrorUtils {
    /// True only for fatal failures; `Wait` does not count.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for DriverResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(DriverError::Wait) => false,
            _ => true,
        }
    }
}
