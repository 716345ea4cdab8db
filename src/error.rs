use std::io;

use thiserror::Error;

/// Errors surfaced by the secure socket layer.
///
/// Every variant maps onto a POSIX errno through [`Error::errno`], which is
/// how callers of the socket vtable observe failures. Engine specific codes
/// never appear here; they are translated at the layer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Operation would block, try again")]
    WouldBlock,

    #[error("Handshake in progress")]
    InProgress,

    #[error("Out of secure socket contexts or engine memory")]
    NoMemory,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Socket option not supported")]
    OptionNotSupported,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Protocol not supported")]
    ProtocolNotSupported,

    #[error("Protocol wrong type for socket")]
    WrongProtocolType,

    #[error("Address family not supported")]
    AddressFamilyNotSupported,

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Socket is already bound to another peer")]
    AlreadyConnected,

    #[error("Destination address required")]
    DestinationRequired,

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Timed out")]
    TimedOut,

    #[error("I/O error")]
    Io,

    #[error("Bad descriptor")]
    BadDescriptor,

    #[error("No credential found for sec tag")]
    NoCredential,

    #[error("Credential already exists")]
    AlreadyExists,

    #[error("Context busy")]
    Busy,

    #[error("OS error {0}")]
    Os(i32),
}

impl Error {
    /// The errno value a BSD socket caller would observe.
    pub fn errno(&self) -> i32 {
        match self {
            Error::WouldBlock => libc::EAGAIN,
            Error::InProgress => libc::EINPROGRESS,
            Error::NoMemory => libc::ENOMEM,
            Error::InvalidArgument => libc::EINVAL,
            Error::OptionNotSupported => libc::ENOPROTOOPT,
            Error::NotSupported => libc::EOPNOTSUPP,
            Error::ProtocolNotSupported => libc::EPROTONOSUPPORT,
            Error::WrongProtocolType => libc::EPROTOTYPE,
            Error::AddressFamilyNotSupported => libc::EAFNOSUPPORT,
            Error::NotConnected => libc::ENOTCONN,
            Error::AlreadyConnected => libc::EISCONN,
            Error::DestinationRequired => libc::EDESTADDRREQ,
            Error::ConnectionAborted => libc::ECONNABORTED,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Io => libc::EIO,
            Error::BadDescriptor => libc::EBADF,
            Error::NoCredential => libc::ENOENT,
            Error::AlreadyExists => libc::EEXIST,
            Error::Busy => libc::EBUSY,
            Error::Os(code) => *code,
        }
    }

    /// True for the "try again" status, which is not a failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::NotConnected => Error::NotConnected,
            io::ErrorKind::ConnectionAborted => Error::ConnectionAborted,
            io::ErrorKind::InvalidInput => Error::InvalidArgument,
            _ => e.raw_os_error().map(Error::Os).unwrap_or(Error::Io),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::from_raw_os_error(e.errno())
    }
}
