//! The [`Data`] value carrier.
use bytes::Bytes;

use crate::postgres::PgFormat;

/// An owned, typed byte payload exchanged with the server.
///
/// `Data` is the boundary between native values and the wire: a parameter is
/// bound as `Data`, a column value is read back as `Data`. The payload is
/// interpreted according to its [`PgFormat`].
///
/// Ownership is exclusive, copies are explicit via [`Clone`].
pub struct Data {
    format: PgFormat,
    bytes: Bytes,
}

impl Data {
    /// Create text format data from a string.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            format: PgFormat::Text,
            bytes: Bytes::from(value.into().into_bytes()),
        }
    }

    /// Create binary format data from raw bytes.
    pub fn binary(value: impl Into<Bytes>) -> Self {
        Self {
            format: PgFormat::Binary,
            bytes: value.into(),
        }
    }

    /// Create data with an explicit format.
    pub fn new(format: PgFormat, bytes: Bytes) -> Self {
        Self { format, bytes }
    }

    /// Returns the data format.
    pub const fn format(&self) -> PgFormat {
        self.format
    }

    /// Returns the raw payload.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the payload as `str` for text format data.
    ///
    /// Returns [`None`] for binary format or non UTF-8 payload.
    pub fn as_str(&self) -> Option<&str> {
        match self.format {
            PgFormat::Text => std::str::from_utf8(&self.bytes).ok(),
            PgFormat::Binary => None,
        }
    }

    /// Consume self into the payload.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl Clone for Data {
    fn clone(&self) -> Self {
        Self { format: self.format, bytes: self.bytes.clone() }
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format && self.bytes == other.bytes
    }
}

impl Eq for Data { }

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Data");
        dbg.field("format", &self.format);
        match self.as_str() {
            Some(text) => dbg.field("bytes", &text),
            None => dbg.field("bytes", &"<BINARY>"),
        };
        dbg.finish()
    }
}
