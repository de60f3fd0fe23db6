//! Parameter encoding.
//!
//! [`Encode`] turns a native value into [`Data`] to be bound to a statement
//! parameter. The provided implementations produce text format payloads,
//! which the server converts according to the inferred parameter type;
//! binary payloads can always be bound directly as [`Data::binary`].
use crate::data::Data;

/// Value that can be encoded to be bound to a sql parameter.
///
/// Returning [`None`] binds a SQL `NULL`.
pub trait Encode {
    /// Encode the value.
    fn encode(&self) -> Option<Data>;

    /// Values that render as array literals are spliced unquoted into an
    /// enclosing literal, which is how multidimensional arrays nest.
    #[doc(hidden)]
    fn is_array_literal() -> bool
    where
        Self: Sized,
    {
        false
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self) -> Option<Data> {
        T::encode(self)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self) -> Option<Data> {
        self.as_ref().and_then(T::encode)
    }

    fn is_array_literal() -> bool
    where
        Self: Sized,
    {
        T::is_array_literal()
    }
}

impl Encode for Data {
    fn encode(&self) -> Option<Data> {
        Some(self.clone())
    }
}

impl Encode for str {
    fn encode(&self) -> Option<Data> {
        Some(Data::text(self))
    }
}

impl Encode for String {
    fn encode(&self) -> Option<Data> {
        Some(Data::text(self.as_str()))
    }
}

impl Encode for bool {
    fn encode(&self) -> Option<Data> {
        Some(Data::text(if *self { "t" } else { "f" }))
    }
}

macro_rules! encode_int {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(&self) -> Option<Data> {
                Some(Data::text(itoa::Buffer::new().format(*self)))
            }
        }
    )*};
}

// u8 is left out so that `Vec<u8>` stays bytea rather than an array literal
encode_int!(i8, i16, i32, i64, u16, u32, u64, usize);

macro_rules! encode_float {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(&self) -> Option<Data> {
                let value = *self;
                let text = if value.is_nan() {
                    String::from("NaN")
                } else if value.is_infinite() {
                    String::from(if value > 0.0 { "Infinity" } else { "-Infinity" })
                } else {
                    value.to_string()
                };
                Some(Data::text(text))
            }
        }
    )*};
}

encode_float!(f32, f64);

impl Encode for [u8] {
    /// Bytea in the hex input format.
    fn encode(&self) -> Option<Data> {
        Some(Data::text(to_hex(self)))
    }
}

impl Encode for Vec<u8> {
    fn encode(&self) -> Option<Data> {
        self.as_slice().encode()
    }
}

/// Render bytes in the bytea hex format, `\x` followed by hex digits.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push('\\');
    out.push('x');
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0xf) as usize] as char);
    }
    out
}

/// Render elements as a PostgreSQL array literal, recursively.
fn encode_slice<T: Encode>(elements: &[T]) -> Option<Data> {
    let mut out = String::from("{");
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match element.encode() {
            None => out.push_str("NULL"),
            Some(data) => match data.as_str() {
                // inner dimensions nest unquoted
                Some(text) if T::is_array_literal() => out.push_str(text),
                Some(text) => push_array_element(&mut out, text),
                // binary payloads cannot be spliced into a literal
                None => return None,
            },
        }
    }
    out.push('}');
    Some(Data::text(out))
}

impl<T: Encode> Encode for [T] {
    fn encode(&self) -> Option<Data> {
        encode_slice(self)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self) -> Option<Data> {
        encode_slice(self)
    }

    fn is_array_literal() -> bool
    where
        Self: Sized,
    {
        true
    }
}

/// Append one element of an array literal, quoting it when required.
fn push_array_element(out: &mut String, text: &str) {
    let plain = !text.is_empty()
        && !text.eq_ignore_ascii_case("null")
        && !text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if plain {
        out.push_str(text);
        return;
    }
    out.push('"');
    for c in text.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod test {
    use super::*;

    fn text(value: impl Encode) -> String {
        value.encode().unwrap().as_str().unwrap().to_string()
    }

    #[test]
    fn scalars() {
        assert_eq!(text(42i32), "42");
        assert_eq!(text(-7i64), "-7");
        assert_eq!(text(true), "t");
        assert_eq!(text("hi"), "hi");
        assert_eq!(text(1.5f64), "1.5");
        assert_eq!(text(f64::INFINITY), "Infinity");
        assert!(Option::<i32>::None.encode().is_none());
    }

    #[test]
    fn bytea_hex() {
        assert_eq!(text(&b"\x01\xab"[..]), "\\x01ab");
    }

    #[test]
    fn array_literal() {
        assert_eq!(text(vec![1i32, 2, 3]), "{1,2,3}");
        assert_eq!(
            text(vec![Some("a b"), None, Some("c\"d")]),
            "{\"a b\",NULL,\"c\\\"d\"}",
        );
        assert_eq!(text(vec![vec![1i32], vec![2]]), "{{1},{2}}");
        assert_eq!(text(vec![""]), "{\"\"}");
    }
}
