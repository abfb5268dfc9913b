//! I/O port numbers.

/// First serial port (COM1), the diagnostic sink.
pub const SERIAL_PORT: u16 = 0x3F8;
