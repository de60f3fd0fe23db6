use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Readiness conditions of a socket, as a bit mask.
///
/// ```
/// use prequel::net::Readiness;
///
/// let mask = Readiness::READABLE | Readiness::WRITABLE;
/// assert!(mask.is_readable());
/// assert!(mask.is_writable());
/// assert!(Readiness::NONE.is_empty());
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    /// No condition.
    pub const NONE: Readiness = Readiness(0);
    /// The socket has bytes to read.
    pub const READABLE: Readiness = Readiness(1);
    /// The socket accepts writes.
    pub const WRITABLE: Readiness = Readiness(1 << 1);

    /// Returns `true` when no condition is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when [`READABLE`][Readiness::READABLE] is set.
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns `true` when [`WRITABLE`][Readiness::WRITABLE] is set.
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns `true` when every condition of `other` is set in `self`.
    pub const fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Readiness {
    type Output = Readiness;

    fn bitand(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&format_args!("READABLE"));
        }
        if self.is_writable() {
            set.entry(&format_args!("WRITABLE"));
        }
        set.finish()
    }
}
