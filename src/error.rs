//! `prequel` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io};

use crate::{
    common::unit_error,
    decode::DecodeError,
    postgres::{ProtocolError, ServerError},
    sql::ParseError,
};

/// A specialized [`Result`] type for `prequel` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `prequel` library.
pub struct Error {
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    /// Returns the error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Consume self into the error kind.
    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// Returns the backtrace captured when the error was constructed.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns the server error when this error carries one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Server(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` for a blocking wait that reached its deadline.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut(_))
    }

    pub(crate) fn invalid_argument(reason: impl Into<Cow<'static, str>>) -> Error {
        InvalidArgument { reason: reason.into() }.into()
    }

    pub(crate) fn missing_parameter(index: usize) -> Error {
        MissingParameter { index }.into()
    }
}

/// All possible error kind from the `prequel` library.
pub enum ErrorKind {
    /// Caller precondition violated.
    InvalidArgument(InvalidArgument),
    /// The SQL preparser rejected the input.
    Parse(ParseError),
    /// A statement was submitted with an unbound parameter slot.
    MissingParameter(MissingParameter),
    /// Socket read or write failure; the connection moved to failure.
    Io(io::Error),
    /// Backend sent something this library cannot accept; the connection
    /// moved to failure.
    Protocol(ProtocolError),
    /// A blocking wait reached its deadline; the wait can be retried.
    TimedOut(TimedOut),
    /// The server reported an error for the current request.
    Server(ServerError),
    /// The server requested an unsupported authentication scheme.
    UnsupportedAuth(UnsupportedAuth),
    /// Connection configuration could not be assembled.
    #[cfg(feature = "tokio")]
    Config(crate::connection::ConfigError),
    /// A row value could not be decoded.
    Decode(DecodeError),
}

unit_error! {
    /// A blocking wait reached its deadline before the awaited condition.
    pub TimedOut: "timed out"
}

unit_error! {
    /// The server requested an authentication scheme that requires an
    /// external agent.
    pub UnsupportedAuth: "auth method is not supported"
}

/// Caller precondition violated.
pub struct InvalidArgument {
    reason: Cow<'static, str>,
}

impl std::error::Error for InvalidArgument { }

impl fmt::Display for InvalidArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl fmt::Debug for InvalidArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A parameter slot was left unbound at submission.
pub struct MissingParameter {
    index: usize,
}

impl MissingParameter {
    /// Returns the zero based slot index.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::error::Error for MissingParameter { }

impl fmt::Display for MissingParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter {} is not bound", self.index)
    }
}

impl fmt::Debug for MissingParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<InvalidArgument>e => ErrorKind::InvalidArgument(e));
from!(<ParseError>e => ErrorKind::Parse(e));
from!(<MissingParameter>e => ErrorKind::MissingParameter(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<TimedOut>e => ErrorKind::TimedOut(e));
from!(<ServerError>e => ErrorKind::Server(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
#[cfg(feature = "tokio")]
from!(<crate::connection::ConfigError>e => ErrorKind::Config(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => e.fmt(f),
            Self::Parse(e) => e.fmt(f),
            Self::MissingParameter(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::TimedOut(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            #[cfg(feature = "tokio")]
            Self::Config(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
