use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

use crate::nt_status::NTStatus;

#[derive(Debug)]
pub enum SMBError {
    ParseError(SMBParseError),
    PayloadTooSmall(SMBPayloadTooSmallError),
    PreconditionFailed(SMBPreconditionFailedError),
    IOError(SMBIOError),
    ProtocolViolation(SMBProtocolViolationError),
    ResponseError(SMBResponseError),
    BreakFailed(SMBBreakFailedError),
}

/// Coarse classification used by callers deciding whether to retry, reopen or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SMBErrorKind {
    /// Connection loss, timeouts and other failures to get a request to the server.
    Transport,
    /// The peer violated the protocol (bad payloads, invalid lease states, stale acknowledgments).
    Protocol,
    /// The caller misused the API.
    Usage,
    /// The server rejected a well-formed request.
    Server,
}

impl SMBError {
    pub fn parse_error<T: Into<SMBParseError>>(error: T) -> Self {
        Self::ParseError(error.into())
    }

    pub fn payload_too_small<T: Into<usize>, U: Into<usize>>(expected: T, actual: U) -> Self {
        Self::PayloadTooSmall((expected, actual).into())
    }

    pub fn precondition_failed<T: Into<SMBPreconditionFailedError>>(error: T) -> Self {
        Self::PreconditionFailed(error.into())
    }

    pub fn io_error<T: Into<SMBIOError>>(error: T) -> Self {
        Self::IOError(error.into())
    }

    pub fn protocol_violation<T: Into<SMBProtocolViolationError>>(error: T) -> Self {
        Self::ProtocolViolation(error.into())
    }

    pub fn response_error(status: NTStatus) -> Self {
        Self::ResponseError(status.into())
    }

    pub fn break_failed(sequence: u64, source: Arc<SMBError>) -> Self {
        Self::BreakFailed(SMBBreakFailedError { sequence, source })
    }

    pub fn kind(&self) -> SMBErrorKind {
        match self {
            Self::IOError(_) => SMBErrorKind::Transport,
            Self::ParseError(_) | Self::PayloadTooSmall(_) | Self::ProtocolViolation(_) => SMBErrorKind::Protocol,
            Self::PreconditionFailed(_) => SMBErrorKind::Usage,
            Self::ResponseError(x) if x.status.is_protocol_violation() => SMBErrorKind::Protocol,
            Self::ResponseError(_) => SMBErrorKind::Server,
            Self::BreakFailed(x) => x.source.kind(),
        }
    }

    pub fn status(&self) -> Option<NTStatus> {
        match self {
            Self::ResponseError(x) => Some(x.status),
            Self::BreakFailed(x) => x.source.status(),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct SMBParseError {
    error: Box<dyn Error + Send + Sync>,
}

impl<T: Into<Box<dyn Error + Send + Sync>>> From<T> for SMBParseError {
    fn from(value: T) -> Self {
        Self {
            error: value.into()
        }
    }
}

impl Display for SMBParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse failed with error: {}", self.error)
    }
}

#[derive(Debug)]
pub struct SMBPayloadTooSmallError {
    expected: usize,
    actual: usize,
}

impl<T: Into<usize>, U: Into<usize>> From<(T, U)> for SMBPayloadTooSmallError {
    fn from(value: (T, U)) -> Self {
        Self {
            expected: value.0.into(),
            actual: value.1.into(),
        }
    }
}

impl Display for SMBPayloadTooSmallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Expected {} bytes, was actually {} bytes", self.expected, self.actual)
    }
}

#[derive(Debug)]
pub struct SMBPreconditionFailedError {
    message: String,
}

impl<T: Into<String>> From<T> for SMBPreconditionFailedError {
    fn from(value: T) -> Self {
        Self {
            message: value.into()
        }
    }
}

impl Display for SMBPreconditionFailedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation failed with unmet precondition: {}", self.message)
    }
}

#[derive(Debug)]
pub struct SMBIOError {
    error: io::Error,
}

impl<T: Into<io::Error>> From<T> for SMBIOError {
    fn from(value: T) -> Self {
        Self {
            error: value.into()
        }
    }
}

impl Display for SMBIOError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SMB I/O operation failed with error: {}", self.error)
    }
}

#[derive(Debug)]
pub struct SMBProtocolViolationError {
    message: String,
}

impl<T: Into<String>> From<T> for SMBProtocolViolationError {
    fn from(value: T) -> Self {
        Self {
            message: value.into()
        }
    }
}

impl Display for SMBProtocolViolationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Protocol violation: {}", self.message)
    }
}

#[derive(Debug)]
pub struct SMBResponseError {
    status: NTStatus,
}

impl From<NTStatus> for SMBResponseError {
    fn from(status: NTStatus) -> Self {
        Self { status }
    }
}

impl Display for SMBResponseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server responded with {:?} ({:#010x})", self.status, self.status as u32)
    }
}

#[derive(Debug)]
pub struct SMBBreakFailedError {
    sequence: u64,
    source: Arc<SMBError>,
}

impl SMBBreakFailedError {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn cause(&self) -> &SMBError {
        &self.source
    }
}

impl Display for SMBBreakFailedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lease break {} did not resolve: {}", self.sequence, self.source)
    }
}

impl Display for SMBError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParseError(x) => write!(f, "{}", x),
            Self::PayloadTooSmall(x) => write!(f, "{}", x),
            Self::PreconditionFailed(x) => write!(f, "{}", x),
            Self::IOError(x) => write!(f, "{}", x),
            Self::ProtocolViolation(x) => write!(f, "{}", x),
            Self::ResponseError(x) => write!(f, "{}", x),
            Self::BreakFailed(x) => write!(f, "{}", x),
        }
    }
}

impl Error for SMBError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ParseError(x) => Some(x.error.as_ref()),
            Self::IOError(x) => Some(&x.error),
            Self::BreakFailed(x) => Some(x.source.as_ref()),
            _ => None,
        }
    }
}
