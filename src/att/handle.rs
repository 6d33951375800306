use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;
use std::ops::{Bound, RangeBounds};

use crate::util::name_of;

/// Attribute handle ([Vol 3] Part F, Section 3.2.2).
#[allow(clippy::unsafe_derive_deserialize)]
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Handle(NonZeroU16);

impl Handle {
    /// First valid handle.
    pub const MIN: Self = Self(
        // SAFETY: Non-zero
        unsafe { NonZeroU16::new_unchecked(0x0001) },
    );
    /// Last valid handle.
    pub const MAX: Self = Self(
        // SAFETY: Non-zero
        unsafe { NonZeroU16::new_unchecked(0xFFFF) },
    );

    /// Wraps a raw handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Option<Self> {
        match NonZeroU16::new(h) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the next handle or `None` if the maximum handle was reached.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_add(1))
    }

    /// Returns the raw handle value.
    #[inline(always)]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl Debug for Handle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(Handle), self.0.get())
    }
}

impl Display for Handle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Handle> for u16 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0.get()
    }
}

impl From<Handle> for usize {
    #[inline]
    fn from(h: Handle) -> Self {
        Self::from(h.0.get())
    }
}

/// Inclusive range of attribute handles. This is a `Copy` version of
/// `RangeInclusive<Handle>`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[must_use]
pub struct HandleRange {
    start: Handle,
    end: Handle,
}

impl HandleRange {
    /// Handle range that includes all possible handles.
    pub const ALL: Self = Self {
        start: Handle::MIN,
        end: Handle::MAX,
    };

    /// Creates a new handle range `start..=end`.
    #[inline]
    pub const fn new(start: Handle, end: Handle) -> Self {
        assert!(start.0.get() <= end.0.get());
        Self { start, end }
    }

    /// Validates a raw range from a request PDU
    /// ([Vol 3] Part F, Section 3.4.3.1). The error carries the handle that
    /// must be reported in the error response.
    #[inline]
    pub const fn validate(start: u16, end: u16) -> Result<Self, u16> {
        match (Handle::new(start), Handle::new(end)) {
            (Some(s), Some(e)) if start <= end => Ok(Self { start: s, end: e }),
            (None, _) => Err(0),
            (Some(_), None) => Err(0),
            _ => Err(start),
        }
    }

    /// Returns the starting handle.
    #[inline(always)]
    #[must_use]
    pub const fn start(self) -> Handle {
        self.start
    }

    /// Returns the ending handle.
    #[inline(always)]
    #[must_use]
    pub const fn end(self) -> Handle {
        self.end
    }

    /// Returns the smallest range that contains both `self` and `other`.
    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Returns whether `h` is within the range.
    #[inline(always)]
    #[must_use]
    pub fn contains(self, h: Handle) -> bool {
        self.start <= h && h <= self.end
    }

    /// Returns the remainder of the range after `h` or `None` if `h` is the
    /// last handle of the range.
    #[inline]
    #[must_use]
    pub fn after(self, h: Handle) -> Option<Self> {
        let next = h.next()?;
        (next <= self.end).then_some(Self {
            start: next.max(self.start),
            end: self.end,
        })
    }
}

impl RangeBounds<Handle> for HandleRange {
    #[inline]
    fn start_bound(&self) -> Bound<&Handle> {
        Bound::Included(&self.start)
    }

    #[inline]
    fn end_bound(&self) -> Bound<&Handle> {
        Bound::Included(&self.end)
    }
}

impl Default for HandleRange {
    /// Returns a handle range that includes all possible handles.
    #[inline(always)]
    fn default() -> Self {
        Self::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_size() {
        assert_eq!(std::mem::size_of::<Handle>(), 2);
        assert_eq!(std::mem::size_of::<Handle>(), std::mem::size_of::<Option<Handle>>());
        assert_eq!(std::mem::size_of::<HandleRange>(), 4);
    }

    #[test]
    fn validate() {
        assert_eq!(HandleRange::validate(0, 5), Err(0));
        assert_eq!(HandleRange::validate(5, 0), Err(0));
        assert_eq!(HandleRange::validate(0, 0), Err(0));
        assert_eq!(HandleRange::validate(6, 5), Err(6));
        let r = HandleRange::validate(5, 5).unwrap();
        assert_eq!((r.start().get(), r.end().get()), (5, 5));
        assert!(HandleRange::validate(1, 0xFFFF).is_ok());
    }

    #[test]
    fn union_after() {
        let h = |v| Handle::new(v).unwrap();
        let a = HandleRange::new(h(4), h(8));
        let b = HandleRange::new(h(2), h(5));
        assert_eq!(a.union(b), HandleRange::new(h(2), h(8)));
        assert_eq!(a.after(h(6)), Some(HandleRange::new(h(7), h(8))));
        assert_eq!(a.after(h(8)), None);
        assert_eq!(HandleRange::ALL.after(Handle::MAX), None);
    }
}
