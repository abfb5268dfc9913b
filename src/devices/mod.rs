//! Hardware devices.
//!
//! Only the serial port lives here: it is the diagnostic sink the logger
//! and the panic path write to. Everything else the kernel talks to is
//! outside this crate.

pub mod serial;
