//! Protocol level errors and server diagnostics.
use std::{fmt, str::Utf8Error};

use bytes::{Buf, Bytes};

use super::backend::BackendMessage;
use crate::{common::ByteStr, ext::BytesExt};

/// An error when translating buffer from postgres.
pub enum ProtocolError {
    /// Backend sent a message that is invalid at the current phase.
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    /// Backend requested an authentication type this library does not know.
    UnknownAuth {
        auth: u32,
    },
    /// Backend sent a non UTF-8 string.
    Utf8(Utf8Error),
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }
}

impl From<Utf8Error> for ProtocolError {
    fn from(err: Utf8Error) -> Self {
        Self::Utf8(err)
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected { expect, found, phase } => {
                match expect {
                    Some(expect) => write!(
                        f, "expected {}, found {}({})",
                        BackendMessage::message_name(*expect),
                        BackendMessage::message_name(*found),
                        *found as char,
                    )?,
                    None => write!(
                        f, "unexpected message {}({})",
                        BackendMessage::message_name(*found),
                        *found as char,
                    )?,
                }
                if let Some(phase) = phase {
                    write!(f, " in {phase}")?;
                }
                Ok(())
            },
            Self::UnknownAuth { auth } => write!(f, "unknown authentication type {auth}"),
            Self::Utf8(err) => write!(f, "non UTF-8 server string: {err}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Parsed fields of an `ErrorResponse` or `NoticeResponse`.
///
/// Field meanings per [Section 53.8][53_8]. Unrecognized field types
/// are silently ignored, as the protocol requires.
///
/// [53_8]: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Default, Clone)]
pub struct ServerFields {
    /// `S` — Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    /// (possibly localized).
    pub severity: ByteStr,
    /// `V` — Severity, non-localized. Present in 9.6 and later.
    pub severity_nonlocalized: Option<ByteStr>,
    /// `C` — the SQLSTATE code.
    pub code: ByteStr,
    /// `M` — the primary human-readable error message.
    pub message: ByteStr,
    /// `D` — an optional secondary error message.
    pub detail: Option<ByteStr>,
    /// `H` — an optional suggestion what to do about the problem.
    pub hint: Option<ByteStr>,
    /// `P` — error cursor position as an index into the original query string,
    /// measured in characters, 1 based.
    pub position: Option<u32>,
    /// `p` — error cursor position into an internally generated command.
    pub internal_position: Option<u32>,
    /// `q` — the text of a failed internally-generated command.
    pub internal_query: Option<ByteStr>,
    /// `W` — context in which the error occurred, one entry per line.
    pub where_: Option<ByteStr>,
    /// `s` — schema name.
    pub schema: Option<ByteStr>,
    /// `t` — table name.
    pub table: Option<ByteStr>,
    /// `c` — column name.
    pub column: Option<ByteStr>,
    /// `d` — data type name.
    pub data_type: Option<ByteStr>,
    /// `n` — constraint name.
    pub constraint: Option<ByteStr>,
    /// `F` — source file name where the error was reported.
    pub file: Option<ByteStr>,
    /// `L` — source line where the error was reported.
    pub line: Option<u32>,
    /// `R` — source routine reporting the error.
    pub routine: Option<ByteStr>,
}

impl ServerFields {
    /// Parse a field list.
    ///
    /// The body consists of one or more identified fields, followed by a
    /// zero byte as a terminator; fields can appear in any order.
    pub fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Self::default();
        loop {
            if !body.has_remaining() {
                break;
            }
            let code = body.get_u8();
            if code == 0 {
                break;
            }
            let value = body.get_nul_bytestr()?;
            match code {
                b'S' => fields.severity = value,
                b'V' => fields.severity_nonlocalized = Some(value),
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'p' => fields.internal_position = value.parse().ok(),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.where_ = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {},
            }
        }
        Ok(fields)
    }
}

impl fmt::Display for ServerFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if !self.code.is_empty() {
            write!(f, " ({})", self.code)?;
        }
        Ok(())
    }
}

/// An error reported by the server through `ErrorResponse`.
///
/// The connection usually stays usable after a server error outside of the
/// session establishment; the failed transaction block (if any) must be
/// ended before new queries are accepted.
#[derive(Clone)]
pub struct ServerError {
    fields: ServerFields,
}

impl ServerError {
    pub(crate) fn new(fields: ServerFields) -> Self {
        Self { fields }
    }

    /// Returns the SQLSTATE code.
    pub fn code(&self) -> &str {
        &self.fields.code
    }

    /// Returns the severity.
    pub fn severity(&self) -> &str {
        &self.fields.severity
    }

    /// Returns the primary human-readable message.
    pub fn message(&self) -> &str {
        &self.fields.message
    }

    /// Returns all reported fields.
    pub fn fields(&self) -> &ServerFields {
        &self.fields
    }
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fields, f)
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_fields() {
        let body = Bytes::from_static(
            b"SERROR\0VERROR\0C42601\0Msyntax error at or near \"FROM\"\0P15\0Fscan.l\0L1145\0\0",
        );
        let fields = ServerFields::parse(body).unwrap();
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, "42601");
        assert_eq!(fields.message, "syntax error at or near \"FROM\"");
        assert_eq!(fields.position, Some(15));
        assert_eq!(fields.line, Some(1145));
        assert_eq!(fields.routine, None);
    }
}
