//! Supporting utility types.
mod bytestr;
pub use bytestr::ByteStr;

/// A zero sized error type with a fixed message.
///
/// # Example
///
/// ```ignore
/// unit_error! {
///     /// The deadline passed.
///     pub TimedOut: "timed out"
/// }
/// ```
macro_rules! unit_error {
    ($(#[$doc:meta])* $vis:vis $name:ident: $msg:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        $vis struct $name;

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($msg)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "\"{self}\"")
            }
        }

        impl std::error::Error for $name { }
    };
}

/// Forward to [`log::debug`] when the `log` feature is on, vanish otherwise.
macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($args)*)
    };
}

/// Forward to [`log::warn`] when the `log` feature is on, vanish otherwise.
macro_rules! warning {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($args)*)
    };
}

pub(crate) use unit_error;
pub(crate) use debug;
pub(crate) use warning;
