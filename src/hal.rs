//! Seams between the server core and the component platform.
//!
//! Everything the core needs from the outside world — UART register access,
//! interrupt acknowledgement, the heartbeat timer, and the input-client
//! registry — arrives through these traits, so the core itself stays free of
//! platform and architecture specifics.

use core::fmt;
use core::ptr::NonNull;
use core::time::Duration;

use crate::ring;

/// Byte-wide access to the UART register file.
///
/// Offsets are relative to the device base and span `0..=6`; both the divisor
/// latch and the data registers alias offset 0 depending on the DLAB bit, so
/// the implementation must not reorder or cache accesses.
pub trait PortIo {
    /// Reads the 8-bit register at `offset`
    fn read(&self, offset: u8) -> u8;

    /// Writes the 8-bit register at `offset`
    fn write(&self, offset: u8, value: u8);
}

/// Platform services beyond the register file.
pub trait Platform: PortIo {
    /// Acknowledges the UART interrupt at the controller
    fn ack_interrupt(&self);

    /// Arms the periodic heartbeat timer. Called once, during construction
    fn arm_heartbeat(&self, period: Duration);
}

/// The transmit side of the physical line.
///
/// [`crate::uart::Uart`] is the production implementation; tests substitute a
/// recording sink to observe exact wire contents.
pub trait Wire {
    /// Queues one byte for transmission, blocking until there is room
    fn send(&mut self, byte: u8);

    /// Marks a point at which buffered output must reach the line
    fn flush(&mut self);

    /// Sends a run of bytes
    fn send_all(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.send(byte);
        }
    }
}

/// Adapts a [`Wire`] to [`core::fmt::Write`] for operator console text.
pub struct WireFmt<'a, W: Wire>(pub &'a mut W);

impl<W: Wire> fmt::Write for WireFmt<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.send_all(s.as_bytes());
        Ok(())
    }
}

/// Registry of input clients, supplied by the component framework at startup.
///
/// Replaces startup probing of optional symbols: a platform with no keyboard
/// consumers passes a registry whose `count` is zero, and the server then
/// discards all received bytes.
pub trait InputRegistry {
    /// Number of registered input clients
    fn count(&self) -> usize;

    /// The badge of the client in registry slot `index` (`index < count`)
    fn enumerate_badge(&self, index: usize) -> usize;

    /// The largest badge any registered client carries
    fn largest_badge(&self) -> usize;

    /// The shared receive ring for `badge`.
    ///
    /// The region must stay valid and otherwise untouched (aside from the
    /// consumer advancing `head`) for the life of the server.
    fn ring_region(&self, badge: usize) -> NonNull<ring::Shared>;

    /// Signals `badge` that its ring has fresh data
    fn notify(&self, badge: usize);
}
