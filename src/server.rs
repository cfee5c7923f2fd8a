//! The server value: all state of the terminal server behind one lock.
//!
//! Three kinds of events arrive concurrently — client `putchar` calls over
//! RPC, UART receive interrupts, and heartbeat timer ticks. Each one takes
//! the single [`SpinLock`] for its whole duration, so the multiplexer, router,
//! and driver below never observe each other mid-operation.

use derive_more::Display;

use crate::hal::{InputRegistry, Platform};
use crate::input::{ClientTable, InputRouter};
use crate::output::OutputMux;
use crate::sync::SpinLock;
use crate::uart::{Cause, Uart};
use crate::{HEARTBEAT_PERIOD, MAX_CLIENTS, STREAM_COUNT};

/// Rejected configurations, all detected during construction.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ConfigError {
    /// The divisor latch cannot represent this rate exactly
    #[display(fmt = "baud rate {} is zero or does not divide 115200", _0)]
    InvalidBaudRate(u32),
    /// The registry handed out a badge at or beyond its own count
    #[display(fmt = "input client badge {} is outside the registry's range", _0)]
    BadgeOutOfRange(usize),
    /// Two registry slots resolved to the same badge
    #[display(fmt = "input client badge {} registered twice", _0)]
    DuplicateBadge(usize),
    /// More input clients than the server multiplexes
    #[display(fmt = "registry reports {} clients, more than the table holds", _0)]
    TooManyClients(usize),
}

/// Everything the lock protects.
struct Inner<P: Platform, R: InputRegistry> {
    uart: Uart<P>,
    mux: OutputMux,
    router: InputRouter,
    clients: ClientTable<R>,
}

/// The multiplexing serial terminal server.
pub struct SerialServer<P: Platform, R: InputRegistry> {
    inner: SpinLock<Inner<P, R>>,
}

impl<P: Platform, R: InputRegistry> SerialServer<P, R> {
    /// Initializes the UART, binds every registered input client, and arms
    /// the heartbeat.
    ///
    /// Nothing runs concurrently until this returns, so the hardware bring-up
    /// happens outside the lock.
    pub fn new(platform: P, registry: R, baud: u32) -> Result<Self, ConfigError> {
        let mut uart = Uart::new(platform);
        uart.init(baud)?;
        let clients = ClientTable::new(registry)?;
        let router = InputRouter::new(clients.largest_badge());
        uart.ports().ack_interrupt();
        uart.ports().arm_heartbeat(HEARTBEAT_PERIOD);
        Ok(Self {
            inner: SpinLock::new(Inner {
                uart,
                mux: OutputMux::new(),
                router,
                clients,
            }),
        })
    }

    /// RPC entry: one byte of processed output from `sender`.
    ///
    /// A `\n` is followed by an implicit `\r` within the same lock hold, so
    /// no other stream's bytes can land between the pair.
    pub fn put_processed(&self, sender: usize, byte: u8) {
        assert!(sender < MAX_CLIENTS, "sender id out of range");
        let mut inner = self.inner.lock();
        inner.enqueue(sender, byte);
        if byte == b'\n' {
            inner.enqueue(sender, b'\r');
        }
    }

    /// RPC entry: one byte of raw output from `sender`, kept verbatim
    pub fn put_raw(&self, sender: usize, byte: u8) {
        assert!(sender < MAX_CLIENTS, "sender id out of range");
        self.inner.lock().enqueue(sender + MAX_CLIENTS, byte);
    }

    /// UART interrupt entry: drains every pending cause, then acknowledges
    /// the interrupt at the platform
    pub fn handle_interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.service_uart();
        inner.uart.ports().ack_interrupt();
    }

    /// Heartbeat timer entry: forces buffered output forward when the fast
    /// paths have gone quiet (see [`OutputMux::heartbeat`])
    pub fn heartbeat_tick(&self) {
        let mut inner = self.inner.lock();
        let Inner {
            uart, mux, router, ..
        } = &mut *inner;
        mux.heartbeat(router.debug(), uart);
    }
}

impl<P: Platform, R: InputRegistry> Inner<P, R> {
    fn enqueue(&mut self, stream: usize, byte: u8) {
        debug_assert!(stream < STREAM_COUNT);
        let Self {
            uart, mux, router, ..
        } = self;
        mux.put(stream, byte, router.is_multi_input(), router.debug(), uart);
    }

    fn service_uart(&mut self) {
        while let Some(cause) = self.uart.pending_cause() {
            match cause {
                Cause::ReceivedData | Cause::ReceiverTimeout => {
                    while let Some(byte) = self.uart.try_recv() {
                        let Self {
                            uart,
                            mux,
                            router,
                            clients,
                        } = self;
                        router.handle_byte(byte, clients, mux, uart);
                    }
                }
                other => self.uart.discard_status(other),
            }
        }
    }
}
