use crate::{PAGE_MASK, PAGE_SIZE};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// A thin wrapper around a `usize` that denotes a **virtual** address in the
/// kernel address space. It does not validate canonicality at runtime; it only
/// carries the *kind* of address at the type level.
///
/// ### Invariants
/// - No invariant beyond "this is intended to be a virtual address".
/// - Arithmetic via `+`/`-` panics on overflow in debug builds like plain
///   integers; use [`checked_add`](Self::checked_add) where the operands come
///   from untrusted sizes.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_C900_0000_2000);
/// assert!(va.is_page_aligned());
/// assert_eq!((va + 0x10).page_base(), va);
/// assert_eq!((va + PAGE_SIZE) - va, PAGE_SIZE);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: usize) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `true` if the address is a multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Base of the page that contains this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// The address `n` pages further up.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: usize) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<usize> for VirtualAddress {
    #[inline]
    fn from(v: usize) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for usize {
    #[inline]
    fn from(a: VirtualAddress) -> Self {
        a.as_usize()
    }
}

impl Add<usize> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<usize> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<usize> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// Distance in bytes between two addresses (`self` must not be below `rhs`).
impl Sub<VirtualAddress> for VirtualAddress {
    type Output = usize;
    #[inline]
    fn sub(self, rhs: VirtualAddress) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_split() {
        let va = VirtualAddress::new(0x12345);
        assert_eq!(va.page_base().as_usize(), 0x12000);
        assert_eq!(va.page_offset(), 0x345);
        assert!(!va.is_page_aligned());
        assert!(va.page_base().is_page_aligned());
    }

    #[test]
    fn arithmetic() {
        let va = VirtualAddress::new(0x1000);
        assert_eq!(va + 0x10, VirtualAddress::new(0x1010));
        assert_eq!(va.add_pages(2), VirtualAddress::new(0x3000));
        assert_eq!(VirtualAddress::new(0x3000) - va, 0x2000);
        assert_eq!(VirtualAddress::new(usize::MAX).checked_add(1), None);
        assert!(VirtualAddress::new(0x4000).is_aligned(0x4000));
        assert!(!VirtualAddress::new(0x6000).is_aligned(0x4000));
    }

    #[test]
    fn formatting() {
        let va = VirtualAddress::new(0xdead_b000);
        assert_eq!(format!("{va}"), "0x00000000DEADB000");
        assert_eq!(format!("{va:x}"), "deadb000");
    }
}
