//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Column`]
//! - [`Index`]
use bytes::{Buf, Bytes};

use crate::{
    common::ByteStr,
    data::Data,
    decode::{Decode, DecodeError},
    ext::BytesExt,
    postgres::{Oid, PgFormat},
};

// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
// table_oid
// attribute_len
// oid
// data_type_size
// type_modifier
// format_code
const SUFFIX: usize = size_of::<u32>()
    + size_of::<u16>()
    + size_of::<u32>()
    + size_of::<i16>()
    + size_of::<i32>()
    + size_of::<u16>();

const OID_OFFSET: usize = size_of::<u32>() + size_of::<u16>();

const FORMAT_OFFSET: usize = size_of::<u32>()
    + size_of::<u16>()
    + size_of::<u32>()
    + size_of::<i16>()
    + size_of::<i32>();

/// One row of a query result.
///
/// A `Row` borrows nothing: the column layout and the values are cheap
/// slices of the `RowDescription` and `DataRow` wire buffers.
#[derive(Clone)]
pub struct Row {
    field_len: u16,
    body: Bytes,
    values: Bytes,
}

impl Row {
    /// Layout template from a `RowDescription` message body.
    pub(crate) fn new(mut bytes: Bytes) -> Self {
        Self {
            field_len: bytes.get_u16(),
            body: bytes,
            values: Bytes::new(),
        }
    }

    /// Complete row from a `DataRow` message body sharing this layout.
    pub(crate) fn inner_clone(&self, mut bytes: Bytes) -> Row {
        assert_eq!(
            self.field_len, bytes.get_u16(),
            "RowDescription len missmatch with DataRow len"
        );
        Self {
            field_len: self.field_len,
            body: self.body.clone(),
            values: bytes,
        }
    }

    /// Returns `true` if row contains no columns.
    pub const fn is_empty(&self) -> bool {
        self.field_len == 0
    }

    /// Returns the number of fields/column.
    pub const fn len(&self) -> u16 {
        self.field_len
    }

    /// Get the column at `idx`, by position or by name.
    pub fn column<I: Index>(&self, idx: I) -> Result<Column, DecodeError> {
        let (offset, nul, nth) = idx.position(&self.body, self.field_len)?;

        let name = ByteStr::from_utf8(self.body.slice(offset..nul))?;

        // a description template carries no values, its columns read as NULL
        let mut values = self.values.clone();
        let mut value = None;
        if !values.is_empty() {
            for _ in 0..=nth {
                let len = values.get_i32();
                value = match len {
                    -1 => None,
                    _ => Some(values.split_to(len as usize)),
                };
            }
        }

        Ok(Column::new(name, &self.body[nul + 1..], value))
    }

    /// Get and decode the column at `idx`.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        R::decode(self.column(idx)?)
    }
}

impl IntoIterator for Row {
    type Item = Result<Column, DecodeError>;

    type IntoIter = IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            field_len: self.field_len,
            body: self.body,
            values: self.values,
            iter_n: 0,
        }
    }
}

/// [`IntoIterator`] implementation from [`Row`].
#[derive(Debug)]
pub struct IntoIter {
    field_len: u16,
    body: Bytes,
    values: Bytes,

    iter_n: u16,
}

impl Iterator for IntoIter {
    type Item = Result<Column, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.iter_n == self.field_len {
            return None
        }

        let field_name = match self.body.get_nul_bytestr() {
            Ok(ok) => ok,
            Err(err) => {
                self.iter_n = self.field_len;
                return Some(Err(err.into()))
            },
        };
        let column = self.body.split_to(SUFFIX);
        let len = self.values.get_i32();
        let value = match len {
            -1 => None,
            _ => Some(self.values.split_to(len as usize)),
        };
        self.iter_n += 1;

        Some(Ok(Column::new(field_name, &column, value)))
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_map();
        let mut b = self.body.clone();
        let mut v = self.values.clone();
        for _ in 0..self.field_len {
            let Ok(key) = b.get_nul_bytestr() else { break };
            b.advance(SUFFIX);
            let len = v.get_i32();
            dbg.key(&key.as_str());
            match len {
                -1 => dbg.value(&format_args!("NULL")),
                len => dbg.value(&String::from_utf8_lossy(&v.split_to(len as usize))),
            };
        }
        dbg.finish()
    }
}

/// Postgres column.
#[derive(Debug, Clone)]
pub struct Column {
    oid: Oid,
    format: PgFormat,
    value: Option<Bytes>,
    name: ByteStr,
}

impl Column {
    /// `body` is start of data **after** field name
    fn new(name: ByteStr, body: &[u8], value: Option<Bytes>) -> Self {
        let format_code = (&mut &body[FORMAT_OFFSET..]).get_u16();
        Self {
            name,
            oid: (&mut &body[OID_OFFSET..]).get_u32(),
            format: PgFormat::from_format_code(format_code).unwrap_or(PgFormat::Text),
            value,
        }
    }

    /// A column detached from any row description, used when decoding
    /// elements of an array literal.
    pub(crate) fn synthetic(format: PgFormat, value: Option<Bytes>) -> Self {
        Self {
            name: ByteStr::default(),
            oid: 0,
            format,
            value,
        }
    }

    /// Returns the column type [`Oid`].
    pub const fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns the column value format.
    pub const fn format(&self) -> PgFormat {
        self.format
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Extract the inner bytes as slice.
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Copy the value out as [`Data`] carrying the column format.
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn data(&self) -> Option<Data> {
        self.value
            .as_ref()
            .map(|value| Data::new(self.format, value.clone()))
    }

    /// Consume self into the inner [`Bytes`].
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// Try consume self into the inner [`Bytes`].
    ///
    /// Return [`DecodeError::Null`] if value is `NULL`.
    pub fn try_into_value(self) -> Result<Bytes, DecodeError> {
        self.value.ok_or(DecodeError::Null)
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns (bytes start offset, nul string index, nth column).
    fn position(self, body: &[u8], len: u16) -> Result<(usize,usize,u16), DecodeError>;
}

fn field_positions(body: &[u8], len: u16) -> impl Iterator<Item = (usize, usize, u16)> + '_ {
    let mut offset = 0usize;
    (0..len).map_while(move |nth| {
        let nul = body.get(offset..)?.iter().position(|b| *b == 0)? + offset;
        let field = (offset, nul, nth);
        offset = nul + 1 + SUFFIX;
        Some(field)
    })
}

impl Index for usize {
    fn position(self, body: &[u8], len: u16) -> Result<(usize,usize,u16), DecodeError> {
        field_positions(body, len)
            .find(|(_, _, nth)| *nth as usize == self)
            .ok_or(DecodeError::IndexOutOfBounds(self))
    }
}

impl Index for &str {
    fn position(self, body: &[u8], len: u16) -> Result<(usize,usize,u16), DecodeError> {
        field_positions(body, len)
            .find(|(offset, nul, _)| &body[*offset..*nul] == self.as_bytes())
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn description(fields: &[(&str, Oid, u16)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(fields.len() as u16);
        for (name, oid, format) in fields {
            buf.put(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(0); // table oid
            buf.put_u16(0); // attribute
            buf.put_u32(*oid);
            buf.put_i16(4); // type size
            buf.put_i32(-1); // type modifier
            buf.put_u16(*format);
        }
        buf.freeze()
    }

    fn data_row(values: &[Option<&[u8]>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put(*value);
                }
                None => buf.put_i32(-1),
            }
        }
        buf.freeze()
    }

    #[test]
    fn column_lookup() {
        let template = Row::new(description(&[("id", 23, 0), ("name", 25, 0)]));
        let row = template.inner_clone(data_row(&[Some(b"42"), None]));

        let id = row.column(0usize).unwrap();
        assert_eq!(id.name(), "id");
        assert_eq!(id.oid(), 23);
        assert_eq!(id.as_slice(), Some(&b"42"[..]));

        let name = row.column("name").unwrap();
        assert!(name.is_null());
        assert!(name.data().is_none());

        assert!(row.column(2usize).is_err());
        assert!(row.column("missing").is_err());
    }

    #[test]
    fn format_code_is_carried() {
        let template = Row::new(description(&[("n", 23, 1)]));
        let value = 42i32.to_be_bytes();
        let row = template.inner_clone(data_row(&[Some(&value[..])]));
        let n = row.column(0usize).unwrap();
        assert_eq!(n.format(), PgFormat::Binary);
        assert_eq!(n.data().unwrap().format(), PgFormat::Binary);
    }
}
