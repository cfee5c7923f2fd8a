//! Keyboard routing and the in-band operator console.
//!
//! Received bytes normally flow to the selected client's receive ring. An
//! [`ESCAPE_CHAR`] at the start of a line opens the operator console instead:
//! one following byte picks a client, toggles debug output, prints help, or
//! enters multi-client selection. Everything the console prints goes over the
//! same wire as client output, so every message clears the color latch.

use core::fmt::Write as _;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::hal::{InputRegistry, Wire, WireFmt};
use crate::output::OutputMux;
use crate::palette;
use crate::ring::{self, Push};
use crate::server::ConfigError;
use crate::{ESCAPE_CHAR, MAX_CLIENTS};

/// Diagnostic verbosity, cycled by the operator's `d` command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
pub enum DebugLevel {
    /// No diagnostics
    #[default]
    Off = 0,
    /// Report coalescing mismatches with hex dumps of both sides
    Coalescing = 1,
    /// Report line flushes that found no newline
    LineFlushes = 2,
}

impl DebugLevel {
    /// The next level, wrapping back to [`Self::Off`]
    #[must_use]
    pub fn cycled(self) -> Self {
        Self::from_u8((self as u8 + 1) % 3).unwrap_or(Self::Off)
    }
}

/// Where the router is within the escape protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Inside an ordinary line; everything is forwarded
    Mid,
    /// A new line is starting; an escape character would open the console
    LineStart,
    /// The escape character arrived; the next byte is a command
    EscapeSeen,
    /// Collecting digits for the multi-client selection
    MultiConfig,
}

/// The registered input clients and their receive rings.
///
/// Slots are indexed by badge; registration rejects badges the table cannot
/// hold rather than trusting the registry's arithmetic.
pub struct ClientTable<R: InputRegistry> {
    registry: R,
    slots: [Option<ring::Producer>; MAX_CLIENTS],
    count: usize,
    largest_badge: usize,
}

impl<R: InputRegistry> ClientTable<R> {
    /// Binds every registered client's ring.
    pub fn new(registry: R) -> Result<Self, ConfigError> {
        let count = registry.count();
        if count > MAX_CLIENTS {
            return Err(ConfigError::TooManyClients(count));
        }
        let mut slots = [const { None }; MAX_CLIENTS];
        for index in 0..count {
            let badge = registry.enumerate_badge(index);
            if badge >= count {
                return Err(ConfigError::BadgeOutOfRange(badge));
            }
            let slot = &mut slots[badge];
            if slot.is_some() {
                return Err(ConfigError::DuplicateBadge(badge));
            }
            // SAFETY: the registry guarantees the region outlives the server
            // and that nobody else produces into it.
            *slot = Some(unsafe { ring::Producer::new(registry.ring_region(badge)) });
        }
        let largest_badge = if count == 0 { 0 } else { registry.largest_badge() };
        Ok(Self {
            registry,
            slots,
            count,
            largest_badge,
        })
    }

    /// Whether no input clients are configured
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The largest badge any client carries; bounds the console's digits
    pub const fn largest_badge(&self) -> usize {
        self.largest_badge
    }

    /// The registry this table was built from
    pub const fn registry(&self) -> &R {
        &self.registry
    }

    /// Pushes a byte into `badge`'s ring, signalling the client if it needs
    /// a wake-up. A full ring drops the byte
    fn deliver(&mut self, badge: usize, byte: u8) {
        if let Some(producer) = self.slots.get_mut(badge).and_then(Option::as_mut) {
            if producer.push(byte) == (Push::Stored { wake: true }) {
                self.registry.notify(badge);
            }
        }
    }
}

/// The four-state operator console machine plus the routing configuration.
pub struct InputRouter {
    state: State,
    /// `Some(badge)` routes to one client; `None` broadcasts per `multi_mask`
    active_client: Option<usize>,
    /// Selected clients while broadcasting; bit per badge
    multi_mask: u16,
    debug: DebugLevel,
    /// Copied from the client table so digit parsing needs no registry access
    largest_badge: usize,
}

impl InputRouter {
    pub const fn new(largest_badge: usize) -> Self {
        Self {
            state: State::LineStart,
            active_client: Some(0),
            multi_mask: 0,
            debug: DebugLevel::Off,
            largest_badge,
        }
    }

    /// Whether broadcast mode is active (and output coalescing with it)
    pub const fn is_multi_input(&self) -> bool {
        self.active_client.is_none()
    }

    pub const fn debug(&self) -> DebugLevel {
        self.debug
    }

    /// Steps the machine with one received byte.
    ///
    /// Runs from the UART interrupt path, under the server lock. With no
    /// input clients configured the byte is discarded outright.
    pub fn handle_byte<R: InputRegistry, W: Wire>(
        &mut self,
        byte: u8,
        clients: &mut ClientTable<R>,
        mux: &mut OutputMux,
        wire: &mut W,
    ) {
        if clients.is_empty() {
            return;
        }
        match self.state {
            State::Mid => {
                if byte == b'\r' || byte == b'\n' {
                    self.state = State::LineStart;
                }
                self.forward(byte, clients);
            }
            State::LineStart => {
                if byte == ESCAPE_CHAR {
                    self.state = State::EscapeSeen;
                } else {
                    self.state = State::Mid;
                    self.forward(byte, clients);
                }
            }
            State::EscapeSeen => self.handle_command(byte, clients, mux, wire),
            State::MultiConfig => self.handle_selection(byte, mux, wire),
        }
    }

    /// One byte after the escape character.
    fn handle_command<R: InputRegistry, W: Wire>(
        &mut self,
        byte: u8,
        clients: &mut ClientTable<R>,
        mux: &mut OutputMux,
        wire: &mut W,
    ) {
        match byte {
            // A doubled escape is a literal one for the client.
            ESCAPE_CHAR => {
                self.state = State::Mid;
                self.forward(ESCAPE_CHAR, clients);
            }
            b'm' => {
                self.state = State::MultiConfig;
                self.multi_mask = 0;
                self.active_client = None;
                mux.reset_color_latch();
                wire.send_all(palette::RESET);
                wire.send_all(b"\r\nMulti-client input to clients: ");
                wire.flush();
            }
            b'd' => {
                self.debug = self.debug.cycled();
                wire.send_all(palette::RESET);
                let mut out = WireFmt(wire);
                _ = write!(out, "\r\nDebug: {}\r\n", self.debug as u8);
                mux.reset_color_latch();
                self.state = State::LineStart;
            }
            b'?' => {
                self.print_help(wire);
                mux.reset_color_latch();
                self.state = State::LineStart;
            }
            digit if self.is_client_digit(digit) => {
                let client = usize::from(digit - b'0');
                mux.reset_color_latch();
                wire.send_all(palette::RESET);
                let mut out = WireFmt(wire);
                _ = write!(out, "\r\nSwitching input to {client}\r\n");
                self.active_client = Some(client);
                self.state = State::LineStart;
            }
            // Not a command: the escape was meant literally, pass both on.
            other => {
                self.state = State::Mid;
                self.forward(ESCAPE_CHAR, clients);
                self.forward(other, clients);
            }
        }
    }

    /// Digit collection inside multi-client selection.
    fn handle_selection<W: Wire>(&mut self, byte: u8, mux: &mut OutputMux, wire: &mut W) {
        match byte {
            digit if self.is_client_digit(digit) => {
                wire.send_all(palette::RESET);
                if self.multi_mask != 0 {
                    wire.send(b',');
                }
                wire.send(digit);
                self.multi_mask |= 1 << (digit - b'0');
                mux.reset_color_latch();
                wire.flush();
            }
            b'm' | b'M' | b'\r' | b'\n' => {
                mux.reset_color_latch();
                wire.send_all(palette::RESET);
                wire.send_all(
                    b"\r\nSwitching input to multi-client. \
                      Output will be best-effort coalesced (colored white).\r\n",
                );
                self.state = State::LineStart;
            }
            _ => {}
        }
    }

    /// Sends a byte to the selected client, or to every selected client while
    /// broadcasting.
    fn forward<R: InputRegistry>(&self, byte: u8, clients: &mut ClientTable<R>) {
        match self.active_client {
            Some(badge) => clients.deliver(badge, byte),
            None => {
                for badge in 0..MAX_CLIENTS {
                    if self.multi_mask & (1 << badge) != 0 {
                        clients.deliver(badge, byte);
                    }
                }
            }
        }
    }

    fn is_client_digit(&self, byte: u8) -> bool {
        let limit = b'0' + u8::try_from(self.largest_badge).unwrap_or(0);
        (b'0'..=limit).contains(&byte)
    }

    fn print_help<W: Wire>(&self, wire: &mut W) {
        wire.send_all(palette::RESET);
        let mut out = WireFmt(wire);
        _ = write!(
            out,
            "\r\n --- Serial server help ---\
             \r\n Escape char: {}\
             \r\n 0 - {:<2} switches input to that client\
             \r\n ?      shows this help\
             \r\n m      simultaneous multi-client input\
             \r\n d      switch between debugging modes\
             \r\n          0: no debugging\
             \r\n          1: debug multi-input output coalescing\
             \r\n          2: debug line flushing\
             \r\n",
            ESCAPE_CHAR as char,
            self.largest_badge,
        );
    }
}
