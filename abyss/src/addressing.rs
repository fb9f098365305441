//! Memory abstraction.
//!
//! The hypervisor does not assume any fixed relation between physical and
//! virtual addresses; translation between the two is a service of the page
//! allocator. This module only provides the strongly typed address values.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Round `addr` down to the start of its page.
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_MASK as u64)
}

/// Round `addr` up to the next page boundary.
#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_MASK as u64) & !(PAGE_MASK as u64)
}

/// Whether `addr` lies on a page boundary.
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK as u64 == 0
}

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0x0010_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into u64, the width of hardware table entries.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0 as u64
    }

    /// Offset of the address inside its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Create a new canonical virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Raw pointer to a `T` at this address.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Raw mutable pointer to a `T` at this address.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Get mutable reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// The address must be non-null, properly aligned for `T`, point to an
    /// initialized `T` and not be aliased for the returned lifetime.
    #[inline]
    pub unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        &mut *self.as_mut_ptr::<T>()
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x2000), 0x2000);
        assert!(is_page_aligned(0xfee0_0000));
        assert!(!is_page_aligned(0xfee0_0010));
    }

    #[test]
    fn address_checks() {
        assert!(Pa::new(0xfee0_0000).is_some());
        assert!(Pa::new(usize::MAX).is_none());
        assert!(Va::new(0xffff_8000_0000_1000).is_some());
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
        assert_eq!((Pa::ZERO + 0x1234).page_offset(), 0x234);
        assert_eq!(format!("{:?}", Pa::ZERO + 0x1000), "Pa(0x1000)");
    }
}
