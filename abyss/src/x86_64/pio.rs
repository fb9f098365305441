//! Port mapped io interface

use core::arch::asm;

/// A Port-mapped io.
#[derive(Clone, Copy)]
pub struct Pio(u16);

impl Pio {
    /// Create a new port mapped io interface.
    #[inline(always)]
    pub const fn new(port: u16) -> Self {
        Pio(port)
    }

    /// Read u8 from port.
    #[inline(always)]
    pub fn read_u8(self) -> u8 {
        let ret: u8;
        unsafe {
            asm!("in al, dx", lateout("al") ret, in("dx") self.0, options(nomem, nostack));
        }
        ret
    }

    /// Write u8 to port.
    #[inline(always)]
    pub fn write_u8(self, data: u8) {
        unsafe {
            asm!("out dx, al", in("al") data, in("dx") self.0, options(nomem, nostack));
        }
    }
}
