//! 16550 UART on the legacy COM1 port.
use crate::x86_64::pio::Pio;

const COM1: u16 = 0x3f8;
const BAUD: u32 = 115200;

const UART_THR: u16 = 0;
const UART_DLL: u16 = 0;
const UART_IER: u16 = 1;
const UART_FCR: u16 = 2;
const UART_LCR: u16 = 3;
const UART_MCR: u16 = 4;
const UART_LSR: u16 = 5;

const LCR_8N1: u8 = 0x03;
const LCR_DLAB: u8 = 0x80;
const LSR_THRE: u8 = 0x20;

/// Serial console.
pub struct Serial {
    base: u16,
}

impl Serial {
    /// Create a new serial device interface on COM1.
    pub const fn new() -> Self {
        Serial { base: COM1 }
    }

    fn reg(&self, offset: u16) -> Pio {
        Pio::new(self.base + offset)
    }

    /// Program 9600 8N1 with interrupts off.
    ///
    /// # Safety
    /// The caller must own the UART.
    pub unsafe fn init(&self) {
        self.reg(UART_FCR).write_u8(0);
        self.reg(UART_LCR).write_u8(LCR_DLAB);
        self.reg(UART_DLL).write_u8((BAUD / 9600) as u8);
        self.reg(UART_IER).write_u8(0);
        self.reg(UART_LCR).write_u8(LCR_8N1);
        self.reg(UART_MCR).write_u8(0);
    }

    fn put(&self, b: u8) {
        // Bounded wait for the transmitter.
        for _ in 0..12800 {
            if self.reg(UART_LSR).read_u8() & LSR_THRE != 0 {
                break;
            }
            core::hint::spin_loop();
        }
        self.reg(UART_THR).write_u8(b);
    }
}

impl core::fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.put(b'\r');
            }
            self.put(b);
        }
        Ok(())
    }
}
