//! A multiplexing serial terminal server.
//!
//! One 16550-compatible UART is shared among up to [`MAX_CLIENTS`] cooperating
//! components. Each client owns two output streams (a processed stream whose
//! newlines are expanded to `\n\r`, and a raw stream) that are buffered
//! per-stream and interleaved onto the wire at line boundaries, colored per
//! stream so the reader can tell them apart. Keyboard input is routed to a
//! selected client, or broadcast to a chosen subset, under an in-band operator
//! console reached through the [`ESCAPE_CHAR`] character.
//!
//! The server is a single value: every piece of mutable state lives behind one
//! [`sync::SpinLock`] inside [`server::SerialServer`], fed by three event
//! sources (client send calls, UART receive interrupts, and the heartbeat
//! timer). The platform is reached only through the seams in [`hal`].

#![cfg_attr(not(test), no_std)]
#![warn(clippy::complexity)]
#![deny(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![warn(clippy::style)]
#![deny(clippy::suspicious)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::time::Duration;

pub mod hal;
pub mod input;
pub mod output;
pub mod palette;
pub mod ring;
pub mod server;
pub mod sync;
pub mod uart;

pub use server::{ConfigError, SerialServer};

/// The most clients the server will multiplex.
pub const MAX_CLIENTS: usize = 12;

/// One output stream per client for processed text, one for raw bytes.
pub const STREAM_COUNT: usize = 2 * MAX_CLIENTS;

/// Bytes buffered per output stream before the overflow policy engages.
pub const STREAM_CAPACITY: usize = 4096;

/// Line rate the UART is programmed to at startup.
pub const BAUD_RATE: u32 = 115_200;

/// Introduces an operator command on the keyboard side.
pub const ESCAPE_CHAR: u8 = b'@';

/// Period of the forced-progress flush timer.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);
