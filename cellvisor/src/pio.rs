//! Port I/O permission bitmaps.
//!
//! One bit per port, a set bit makes the access trap. The 64 KiB port space
//! spans the two pages VMX calls I/O bitmap A and B.

use crate::mm::PageAllocator;
use abyss::addressing::{Pa, PAGE_SIZE};

const PIO_BITMAP_PAGES: usize = 2;
/// Size of a complete bitmap.
pub const PIO_BITMAP_SIZE: usize = PIO_BITMAP_PAGES * PAGE_SIZE;

/// I/O bitmap of a cell.
#[derive(Debug)]
pub struct PioBitmap {
    pa: Pa,
}

impl PioBitmap {
    /// Deny every port, then apply `config`.
    ///
    /// Bytes of `config` beyond the port space are ignored; ports not covered
    /// by it stay denied.
    pub fn new<M: PageAllocator + ?Sized>(mm: &M, config: &[u8]) -> Option<Self> {
        let pa = mm.alloc_pages(PIO_BITMAP_PAGES)?;
        let bitmap = Self { pa };
        let bytes = bitmap.bytes(mm);
        bytes.fill(0xff);
        let len = config.len().min(PIO_BITMAP_SIZE);
        bytes[..len].copy_from_slice(&config[..len]);
        Some(bitmap)
    }

    fn bytes<'a, M: PageAllocator + ?Sized>(&self, mm: &M) -> &'a mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                mm.phys_to_virt(self.pa).as_mut_ptr::<u8>(),
                PIO_BITMAP_SIZE,
            )
        }
    }

    /// Physical address of I/O bitmap A (ports 0 - 0x7fff).
    pub fn pa_a(&self) -> Pa {
        self.pa
    }

    /// Physical address of I/O bitmap B (ports 0x8000 - 0xffff).
    pub fn pa_b(&self) -> Pa {
        self.pa + PAGE_SIZE
    }

    /// Deny every port that `cell` may access.
    pub fn shrink<M: PageAllocator + ?Sized>(&mut self, mm: &M, cell: &[u8]) {
        for (b, c) in self.bytes(mm).iter_mut().zip(cell.iter()) {
            *b |= !*c;
        }
    }

    /// Give back the ports of a departing cell.
    ///
    /// A port is granted again only if both the departing cell's
    /// configuration and `original`, the owner's own configuration, grant it.
    pub fn restore<M: PageAllocator + ?Sized>(&mut self, mm: &M, cell: &[u8], original: &[u8]) {
        for ((b, c), o) in self.bytes(mm).iter_mut().zip(cell.iter()).zip(original.iter()) {
            *b &= *c | *o;
        }
    }

    /// Whether accesses to `port` trap.
    pub fn is_denied<M: PageAllocator + ?Sized>(&self, mm: &M, port: u16) -> bool {
        let port = port as usize;
        self.bytes(mm)[port / 8] & (1 << (port % 8)) != 0
    }

    pub fn release<M: PageAllocator + ?Sized>(self, mm: &M) {
        mm.free_pages(self.pa, PIO_BITMAP_PAGES);
    }
}
