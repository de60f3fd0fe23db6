use bytes::Bytes;

/// An immutable UTF-8 string backed by [`Bytes`].
///
/// Server-sent strings (command tags, parameter statuses, notification
/// channels, error fields) are sliced straight out of the read buffer;
/// `ByteStr` keeps them reference counted, so cloning and subslicing never
/// copy and never re-validate.
#[derive(Clone, Default)]
pub struct ByteStr {
    bytes: Bytes,
}

impl ByteStr {
    /// Wrap `bytes` without copying, after checking they are UTF-8.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, std::str::Utf8Error> {
        match std::str::from_utf8(&bytes) {
            Ok(_) => Ok(Self { bytes }),
            Err(e) => Err(e),
        }
    }

    /// Copy a borrowed str into a fresh buffer.
    pub fn copy_from_str(string: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(string.as_bytes()) }
    }

    /// Wrap a static str in place, with no allocation.
    pub const fn from_static(string: &'static str) -> Self {
        Self { bytes: Bytes::from_static(string.as_bytes()) }
    }

    /// View the contents as `&str`.
    pub fn as_str(&self) -> &str {
        // every constructor admits UTF-8 only
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }

    /// Reference counted subslice.
    ///
    /// # Panics
    ///
    /// `subset` must point into this buffer, e.g. a slice taken off
    /// [`as_str`][ByteStr::as_str]. An unrelated str panics.
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self { bytes: self.bytes.slice_ref(subset.as_bytes()) }
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::borrow::Borrow<str> for ByteStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl From<&'static str> for ByteStr {
    fn from(string: &'static str) -> Self {
        Self::from_static(string)
    }
}

impl From<String> for ByteStr {
    fn from(string: String) -> Self {
        Self { bytes: Bytes::from(string.into_bytes()) }
    }
}

impl PartialEq for ByteStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ByteStr { }

impl PartialEq<str> for ByteStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for ByteStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl std::hash::Hash for ByteStr {
    /// Hashes like the `str` it borrows as, which is what keying a map by
    /// [`Borrow<str>`][std::borrow::Borrow] requires.
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subslicing_shares_the_buffer() {
        let source = ByteStr::from_static("host:5432");
        let host = source.slice_ref(&source.as_str()[..4]);
        assert_eq!(host, "host");
        assert_eq!(host.as_str().as_ptr(), source.as_str().as_ptr());
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(ByteStr::from_utf8(Bytes::from_static(b"\xff\xfe")).is_err());
        assert_eq!(ByteStr::from_utf8(Bytes::from_static(b"ok")).unwrap(), "ok");
    }
}
