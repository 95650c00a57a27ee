//! Error types for the SOCKS dialer and the control-port session.
//!
//! Every failure carries a category tag ([`ErrorKind`]), the name of the
//! operation that produced it, a human-readable message and, where one
//! exists, the underlying cause.

use std::fmt;
use std::io;
use thiserror::Error;

/// Boxed cause attached to an [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or argument. Caller error, never retried.
    Config,
    /// SOCKS connection or handshake failure.
    Dial,
    /// Control-port authentication failure.
    Auth,
    /// The daemon rejected a control command.
    Command {
        /// The status code returned by the daemon.
        code: u16,
    },
    /// Unexpected reply format.
    Protocol,
    /// A requested key or field was absent from the reply.
    NotFound,
    /// Generic I/O failure.
    Io,
    /// The caller cancelled the operation.
    Cancelled,
    /// A deadline expired.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("invalid configuration"),
            ErrorKind::Dial => f.write_str("dial failed"),
            ErrorKind::Auth => f.write_str("authentication failed"),
            ErrorKind::Command { code } => write!(f, "command rejected (code {})", code),
            ErrorKind::Protocol => f.write_str("protocol error"),
            ErrorKind::NotFound => f.write_str("not found"),
            ErrorKind::Io => f.write_str("I/O error"),
            ErrorKind::Cancelled => f.write_str("cancelled"),
            ErrorKind::Timeout => f.write_str("timed out"),
        }
    }
}

/// The error type for all operations in this crate.
#[derive(Error, Debug)]
#[error("{op}: {kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    op: &'static str,
    message: String,
    #[source]
    source: Option<BoxError>,
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an error without an underlying cause.
    pub fn new(kind: ErrorKind, op: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn config(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, op, message)
    }

    pub(crate) fn dial(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dial, op, message)
    }

    pub(crate) fn auth(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, op, message)
    }

    pub(crate) fn command(op: &'static str, code: u16, line: impl Into<String>) -> Self {
        Self::new(ErrorKind::Command { code }, op, line)
    }

    pub(crate) fn protocol(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, op, message)
    }

    pub(crate) fn not_found(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, op, message)
    }

    pub(crate) fn cancelled(op: &'static str) -> Self {
        Self::new(ErrorKind::Cancelled, op, "operation cancelled")
    }

    pub(crate) fn timeout(op: &'static str) -> Self {
        Self::new(ErrorKind::Timeout, op, "deadline exceeded")
    }

    /// Wrap an I/O error, keeping it as the cause.
    pub(crate) fn io(op: &'static str, err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Self::new(kind, op, err.to_string()).with_source(err)
    }

    /// Re-tag the operation name, keeping everything else.
    pub(crate) fn in_op(mut self, op: &'static str) -> Self {
        self.op = op;
        self
    }

    /// The category of this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The operation that failed.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// The failure message. For command failures this is the raw reply line.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is a cancellation or deadline expiry.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled | ErrorKind::Timeout)
    }

    /// The control reply status for command failures.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.kind {
            ErrorKind::Command { code } => Some(StatusCode::from_u16(code)),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io("io", err)
    }
}

/// Control reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 250 - OK
    Ok = 250,
    /// 251 - Operation was unnecessary
    OperationUnnecessary = 251,
    /// 451 - Resource exhausted
    ResourceExhausted = 451,
    /// 500 - Syntax error: protocol
    SyntaxErrorProtocol = 500,
    /// 510 - Unrecognized command
    UnrecognizedCommand = 510,
    /// 511 - Unimplemented command
    UnimplementedCommand = 511,
    /// 512 - Syntax error in command argument
    SyntaxErrorArgument = 512,
    /// 513 - Unrecognized command argument
    UnrecognizedArgument = 513,
    /// 514 - Authentication required
    AuthenticationRequired = 514,
    /// 515 - Bad authentication
    BadAuthentication = 515,
    /// 550 - Unspecified error
    UnspecifiedError = 550,
    /// 551 - Internal error
    InternalError = 551,
    /// 552 - Unrecognized entity
    UnrecognizedEntity = 552,
    /// 553 - Invalid configuration value
    InvalidConfigValue = 553,
    /// 555 - Unmanaged entity
    UnmanagedEntity = 555,
    /// 650 - Asynchronous event notification
    AsyncEvent = 650,
    /// Unknown status code
    Unknown = 0,
}

impl StatusCode {
    /// Parse a status code from a u16 value.
    pub fn from_u16(code: u16) -> Self {
        match code {
            250 => StatusCode::Ok,
            251 => StatusCode::OperationUnnecessary,
            451 => StatusCode::ResourceExhausted,
            500 => StatusCode::SyntaxErrorProtocol,
            510 => StatusCode::UnrecognizedCommand,
            511 => StatusCode::UnimplementedCommand,
            512 => StatusCode::SyntaxErrorArgument,
            513 => StatusCode::UnrecognizedArgument,
            514 => StatusCode::AuthenticationRequired,
            515 => StatusCode::BadAuthentication,
            550 => StatusCode::UnspecifiedError,
            551 => StatusCode::InternalError,
            552 => StatusCode::UnrecognizedEntity,
            553 => StatusCode::InvalidConfigValue,
            555 => StatusCode::UnmanagedEntity,
            650 => StatusCode::AsyncEvent,
            _ => StatusCode::Unknown,
        }
    }

    /// Check if this status code indicates success.
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::OperationUnnecessary)
    }

    /// Check if this status code aborts a command.
    pub fn is_error(code: u16) -> bool {
        (500..600).contains(&code)
    }

    /// Check if this is an asynchronous notification line.
    pub fn is_async(code: u16) -> bool {
        (600..700).contains(&code)
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode::from_u16(code)
    }
}
