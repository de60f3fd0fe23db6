//! Column decoding.
//!
//! [`Decode`] turns a [`Column`] back into a native value. Conversions are
//! directed by the target type and the column [`PgFormat`]: text payloads
//! are parsed, binary payloads are read in network byte order.
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error};

use bytes::Bytes;

use crate::{postgres::PgFormat, row::Column};

/// A type that can be constructed from a [`Column`].
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl Decode for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

impl Decode for () {
    fn decode(_: Column) -> Result<Self, DecodeError> {
        Ok(())
    }
}

fn text(column: Column) -> Result<Bytes, DecodeError> {
    let value = column.try_into_value()?;
    std::str::from_utf8(&value)?;
    Ok(value)
}

macro_rules! decode_number {
    ($($ty:ty),*) => {$(
        impl Decode for $ty {
            fn decode(column: Column) -> Result<Self, DecodeError> {
                match column.format() {
                    PgFormat::Text => {
                        let value = text(column)?;
                        // just validated
                        let text = unsafe { std::str::from_utf8_unchecked(&value) };
                        text.parse().map_err(|_| DecodeError::invalid(stringify!($ty)))
                    }
                    PgFormat::Binary => {
                        let value = column.try_into_value()?;
                        let be: [u8; size_of::<$ty>()] = value[..]
                            .try_into()
                            .map_err(|_| DecodeError::length(stringify!($ty)))?;
                        Ok(<$ty>::from_be_bytes(be))
                    }
                }
            }
        }
    )*};
}

decode_number!(i16, i32, i64, f32, f64);

impl Decode for bool {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.format() {
            PgFormat::Text => match &*column.try_into_value()? {
                b"t" | b"true" => Ok(true),
                b"f" | b"false" => Ok(false),
                _ => Err(DecodeError::invalid("bool")),
            },
            PgFormat::Binary => match &*column.try_into_value()? {
                [0] => Ok(false),
                [1] => Ok(true),
                _ => Err(DecodeError::length("bool")),
            },
        }
    }
}

impl Decode for String {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(String::from_utf8(column.try_into_value()?.into())?)
    }
}

impl Decode for Bytes {
    /// Bytea: raw in binary format, `\x` hex in text format.
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.format() {
            PgFormat::Binary => column.try_into_value(),
            PgFormat::Text => {
                let value = column.try_into_value()?;
                let hex = value
                    .strip_prefix(b"\\x")
                    .ok_or(DecodeError::invalid("bytea"))?;
                if hex.len() % 2 != 0 {
                    return Err(DecodeError::invalid("bytea"));
                }
                let mut out = Vec::with_capacity(hex.len() / 2);
                for pair in hex.chunks_exact(2) {
                    let hi = (pair[0] as char).to_digit(16);
                    let lo = (pair[1] as char).to_digit(16);
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                        _ => return Err(DecodeError::invalid("bytea")),
                    }
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

impl Decode for Vec<u8> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(Bytes::decode(column)?.into())
    }
}

impl<T: Decode> Decode for Vec<T> {
    /// Decode a PostgreSQL array literal, recursively.
    ///
    /// Binary array payloads are not supported.
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.format() != PgFormat::Text {
            return Err(DecodeError::Unsupported("binary array"));
        }
        let value = text(column)?;
        // just validated
        let literal = unsafe { std::str::from_utf8_unchecked(&value) };
        let mut out = Vec::new();
        for element in split_array_literal(literal)? {
            let value = element.map(|e| Bytes::from(e.into_bytes()));
            out.push(T::decode(Column::synthetic(PgFormat::Text, value))?);
        }
        Ok(out)
    }
}

/// Split a `{…}` array literal into its top level elements.
///
/// `None` is an unquoted `NULL`. Quoted elements are unescaped, sub-array
/// elements are returned verbatim braces included.
fn split_array_literal(literal: &str) -> Result<Vec<Option<String>>, DecodeError> {
    let invalid = || DecodeError::invalid("array");

    let inner = literal
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(invalid)?;

    let mut elements = Vec::new();
    let mut current = String::new();
    let mut any = false;
    let mut quoted = false;

    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            '"' => current.push(c),
            '{' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            '}' if !in_quotes => {
                depth = depth.checked_sub(1).ok_or_else(invalid)?;
                current.push(c);
            }
            ',' if !in_quotes && depth == 0 => {
                elements.push(finish_element(&mut current, &mut quoted));
                any = true;
            }
            _ => current.push(c),
        }
    }
    if in_quotes || depth != 0 || escaped {
        return Err(invalid());
    }
    if any || !current.is_empty() || quoted {
        elements.push(finish_element(&mut current, &mut quoted));
    }
    Ok(elements)
}

fn finish_element(current: &mut String, quoted: &mut bool) -> Option<String> {
    let element = std::mem::take(current);
    let was_quoted = std::mem::replace(quoted, false);
    if !was_quoted && element.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(element)
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding a column value.
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Value is malformed for the requested type.
    Invalid(&'static str),
    /// Binary value has the wrong width for the requested type.
    Length(&'static str),
    /// Conversion exists but not for this wire format.
    Unsupported(&'static str),
    /// Value is null.
    Null,
}

impl DecodeError {
    fn invalid(ty: &'static str) -> Self {
        Self::Invalid(ty)
    }

    fn length(ty: &'static str) -> Self {
        Self::Length(ty)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::Invalid(ty) => write!(f, "malformed value for {ty}"),
            Self::Length(ty) => write!(f, "wrong value width for {ty}"),
            Self::Unsupported(what) => write!(f, "{what} is not supported"),
            Self::Null => write!(f, "unexpected NULL value"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn column(text: &str) -> Column {
        Column::synthetic(PgFormat::Text, Some(Bytes::copy_from_slice(text.as_bytes())))
    }

    #[test]
    fn scalars_from_text() {
        assert_eq!(i32::decode(column("42")).unwrap(), 42);
        assert_eq!(i64::decode(column("-7")).unwrap(), -7);
        assert_eq!(f64::decode(column("1.5")).unwrap(), 1.5);
        assert!(bool::decode(column("t")).unwrap());
        assert!(!bool::decode(column("f")).unwrap());
        assert_eq!(String::decode(column("hi")).unwrap(), "hi");
        assert!(i32::decode(column("nope")).is_err());
    }

    #[test]
    fn scalars_from_binary() {
        let column = Column::synthetic(
            PgFormat::Binary,
            Some(Bytes::copy_from_slice(&42i32.to_be_bytes())),
        );
        assert_eq!(i32::decode(column.clone()).unwrap(), 42);
        assert!(i64::decode(column).is_err()); // width mismatch
    }

    #[test]
    fn null_handling() {
        let null = Column::synthetic(PgFormat::Text, None);
        assert_eq!(Option::<i32>::decode(null.clone()).unwrap(), None);
        assert!(i32::decode(null).is_err());
    }

    #[test]
    fn bytea_hex() {
        let decoded = Vec::<u8>::decode(column("\\x01ab")).unwrap();
        assert_eq!(decoded, vec![0x01, 0xab]);
    }

    #[test]
    fn array_literal() {
        assert_eq!(Vec::<i32>::decode(column("{1,2,3}")).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            Vec::<Option<String>>::decode(column("{\"a b\",NULL,\"c\\\"d\"}")).unwrap(),
            vec![Some("a b".into()), None, Some("c\"d".into())],
        );
        assert_eq!(
            Vec::<Vec<i32>>::decode(column("{{1},{2,3}}")).unwrap(),
            vec![vec![1], vec![2, 3]],
        );
        assert_eq!(Vec::<i32>::decode(column("{}")).unwrap(), Vec::<i32>::new());
        // a quoted "NULL" is the string, not the null
        assert_eq!(
            Vec::<Option<String>>::decode(column("{\"NULL\"}")).unwrap(),
            vec![Some("NULL".into())],
        );
        assert!(Vec::<i32>::decode(column("{1,2")).is_err());
    }
}
