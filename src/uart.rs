//! Driver for the 16550-compatible UART the server owns.
//!
//! Register access goes through [`PortIo`], so the same driver runs over port
//! I/O, MMIO, or a test model. The driver keeps only transmit accounting and
//! the probed FIFO depth as state; everything else lives in the device.

use core::fmt;
use core::hint;

use bitfield_struct::bitfield;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::hal::{PortIo, Wire};
use crate::server::ConfigError;
use crate::BAUD_RATE;

/// Register offsets from the device base. The data and divisor-latch
/// registers alias offset 0/1 depending on the DLAB bit.
const DATA: u8 = 0;
const LATCH_LOW: u8 = 0;
const LATCH_HIGH: u8 = 1;
const IER: u8 = 1;
const IIR: u8 = 2;
const FCR: u8 = 2;
const LCR: u8 = 3;
const MCR: u8 = 4;
const LSR: u8 = 5;
const MSR: u8 = 6;

register_bitfields! {
    u8,
    /// The interrupt enable register
    InterruptEnable [
        /// Raise an interrupt when received data becomes available
        RECEIVED_DATA OFFSET(0) NUMBITS(1),
    ],
    /// The interrupt identification register
    InterruptIdent [
        /// Set when *no* interrupt is pending
        NO_PENDING OFFSET(0) NUMBITS(1) [],
        /// Why the interrupt was raised
        REASON OFFSET(1) NUMBITS(3) [],
        /// Both bits read as set when the FIFO is present and enabled
        FIFO_ENABLED OFFSET(6) NUMBITS(2) [
            Enabled = 0b11
        ],
    ],
    /// The FIFO control register (write-only)
    FifoControl [
        /// Enables both FIFOs
        ENABLE OFFSET(0) NUMBITS(1) [],
        /// Clears the receive FIFO
        CLEAR_RECEIVE OFFSET(1) NUMBITS(1) [],
        /// Clears the transmit FIFO
        CLEAR_TRANSMIT OFFSET(2) NUMBITS(1) [],
        /// Receive FIFO depth at which to interrupt
        TRIGGER OFFSET(6) NUMBITS(2) [
            OneByte = 0
        ],
    ],
    /// The line control register
    LineControl [
        /// Data bits per character, minus five
        WORD_LENGTH OFFSET(0) NUMBITS(2) [
            Eight = 3
        ],
        /// Set for two stop bits, clear for one
        EXTRA_STOP OFFSET(2) NUMBITS(1) [],
        /// Enables parity generation and checking
        PARITY OFFSET(3) NUMBITS(1) [],
        /// Divisor latch access: remaps offsets 0 and 1 to the divisor
        DLAB OFFSET(7) NUMBITS(1) [],
    ],
    /// The modem control register
    ModemControl [
        /// Data terminal ready
        DTR OFFSET(0) NUMBITS(1),
        /// Request to send
        RTS OFFSET(1) NUMBITS(1),
        /// Auxiliary output 1
        AUX1 OFFSET(2) NUMBITS(1),
        /// Auxiliary output 2; gates the interrupt line on PC-style wiring
        AUX2 OFFSET(3) NUMBITS(1),
    ],
    /// The line status register
    LineStatus [
        /// A received byte is waiting in the data register or FIFO
        DATA_READY OFFSET(0) NUMBITS(1),
        /// The transmit holding register is empty
        HOLDING_EMPTY OFFSET(5) NUMBITS(1),
        /// Both the holding and shift registers are empty
        TRANSMITTER_IDLE OFFSET(6) NUMBITS(1),
    ],
}

/// The 16-bit divisor latch, programmed one byte at a time.
#[bitfield(u16)]
struct Divisor {
    low: u8,
    high: u8,
}

/// Decoded value of the interrupt identification reason field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Cause {
    /// A modem status line changed; reading MSR clears it
    ModemStatus = 0,
    /// The transmit holding register drained
    TransmitterEmpty = 1,
    /// Received data crossed the FIFO trigger level
    ReceivedData = 2,
    /// A line status condition; reading LSR clears it
    LineStatus = 3,
    /// Data has been sitting in the receive FIFO below the trigger level
    ReceiverTimeout = 6,
}

/// A snapshot of the line status register.
type Status = LocalRegisterCopy<u8, LineStatus::Register>;

/// The driver. Generic over the register access seam.
pub struct Uart<P: PortIo> {
    ports: P,
    /// Hardware transmit FIFO depth probed at init: 16, or 1 without a FIFO
    fifo_depth: u8,
    /// Bytes written since the transmitter was last seen empty
    fifo_used: u8,
}

impl<P: PortIo> Uart<P> {
    /// Wraps the register file. The device is not touched until [`Self::init`]
    pub const fn new(ports: P) -> Self {
        Self {
            ports,
            fifo_depth: 1,
            fifo_used: 0,
        }
    }

    /// The platform handle behind this device
    pub const fn ports(&self) -> &P {
        &self.ports
    }

    /// Brings the device to a known state: 8N1 at `baud`, FIFOs probed and
    /// enabled, receive interrupts on, every stale cause drained.
    ///
    /// Returns [`ConfigError::InvalidBaudRate`] for a rate of zero or one the
    /// divisor latch cannot represent exactly.
    pub fn init(&mut self, baud: u32) -> Result<(), ConfigError> {
        // The DLAB state is unknown at entry; clear it so the register map is
        // the ordinary one before anything else.
        self.set_dlab(false);
        self.ports.write(IER, 0);
        self.disable_fifo();
        self.reset_line_control();
        self.reset_modem_control();
        self.drain_quiet();
        self.set_baud_rate(baud)?;
        self.fifo_used = 0;
        self.enable_fifo();
        self.ports
            .write(IER, InterruptEnable::RECEIVED_DATA::SET.value);
        self.drain_quiet();
        Ok(())
    }

    /// Sends one byte, spinning until the transmitter has room.
    ///
    /// The spin is bounded by the hardware draining at line rate: at most
    /// `fifo_depth` characters are in flight when the wait begins.
    pub fn putchar(&mut self, byte: u8) {
        if self.fifo_used == self.fifo_depth {
            while !self.transmitter_empty() {
                hint::spin_loop();
            }
            self.fifo_used = 0;
        }
        self.ports.write(DATA, byte);
        self.fifo_used += 1;
    }

    /// Reads the cause of the pending interrupt, or `None` when the device
    /// reports nothing outstanding
    pub fn pending_cause(&self) -> Option<Cause> {
        let ident: LocalRegisterCopy<u8, InterruptIdent::Register> =
            LocalRegisterCopy::new(self.ports.read(IIR));
        if ident.is_set(InterruptIdent::NO_PENDING) {
            return None;
        }
        let cause = Cause::from_u8(ident.read(InterruptIdent::REASON));
        debug_assert!(cause.is_some(), "reserved interrupt cause");
        cause
    }

    /// Takes one received byte, if the line status reports one waiting
    pub fn try_recv(&self) -> Option<u8> {
        self.line_status()
            .is_set(LineStatus::DATA_READY)
            .then(|| self.ports.read(DATA))
    }

    /// Clears a status-only cause by reading the register that latched it
    pub fn discard_status(&self, cause: Cause) {
        match cause {
            Cause::ModemStatus => {
                self.ports.read(MSR);
            }
            Cause::LineStatus => {
                self.ports.read(LSR);
            }
            // Nothing to write yet; the holding register drained on its own.
            Cause::TransmitterEmpty => {}
            Cause::ReceivedData | Cause::ReceiverTimeout => {
                debug_assert!(false, "receive causes are drained by the caller");
            }
        }
    }

    /// Reads and discards every pending cause, dropping any received bytes.
    /// Used around initialization, before routing is set up.
    fn drain_quiet(&self) {
        while let Some(cause) = self.pending_cause() {
            match cause {
                Cause::ReceivedData | Cause::ReceiverTimeout => {
                    while self.try_recv().is_some() {}
                }
                other => self.discard_status(other),
            }
        }
    }

    fn line_status(&self) -> Status {
        LocalRegisterCopy::new(self.ports.read(LSR))
    }

    fn transmitter_empty(&self) -> bool {
        let status = self.line_status();
        status.is_set(LineStatus::HOLDING_EMPTY) && status.is_set(LineStatus::TRANSMITTER_IDLE)
    }

    fn set_dlab(&self, enabled: bool) {
        let line: InMemoryRegister<u8, LineControl::Register> =
            InMemoryRegister::new(self.ports.read(LCR));
        if enabled {
            line.modify(LineControl::DLAB::SET);
        } else {
            line.modify(LineControl::DLAB::CLEAR);
        }
        self.ports.write(LCR, line.get());
    }

    fn set_baud_rate(&self, baud: u32) -> Result<(), ConfigError> {
        if baud == 0 || BAUD_RATE % baud != 0 {
            return Err(ConfigError::InvalidBaudRate(baud));
        }
        // The check above keeps the quotient within the 16-bit latch.
        #[allow(clippy::cast_possible_truncation)]
        let divisor = Divisor::from((BAUD_RATE / baud) as u16);
        self.set_dlab(true);
        self.ports.write(LATCH_HIGH, divisor.high());
        self.ports.write(LATCH_LOW, divisor.low());
        self.set_dlab(false);
        Ok(())
    }

    fn disable_fifo(&self) {
        // Clear both FIFOs first, then switch them off entirely.
        self.ports.write(
            FCR,
            (FifoControl::CLEAR_RECEIVE::SET + FifoControl::CLEAR_TRANSMIT::SET).value,
        );
        self.ports.write(FCR, 0);
    }

    /// Probes for a FIFO and enables it if present, recording its depth
    fn enable_fifo(&mut self) {
        let ident: LocalRegisterCopy<u8, InterruptIdent::Register> =
            LocalRegisterCopy::new(self.ports.read(IIR));
        if ident.matches_all(InterruptIdent::FIFO_ENABLED::Enabled) {
            self.fifo_depth = 16;
            self.ports.write(
                FCR,
                (FifoControl::ENABLE::SET + FifoControl::TRIGGER::OneByte).value,
            );
        } else {
            self.fifo_depth = 1;
        }
    }

    fn reset_line_control(&self) {
        let line: InMemoryRegister<u8, LineControl::Register> = InMemoryRegister::new(0);
        line.write(LineControl::WORD_LENGTH::Eight);
        self.ports.write(LCR, line.get());
    }

    fn reset_modem_control(&self) {
        self.ports.write(
            MCR,
            (ModemControl::DTR::SET
                + ModemControl::RTS::SET
                + ModemControl::AUX1::SET
                + ModemControl::AUX2::SET)
                .value,
        );
    }
}

impl<P: PortIo> Wire for Uart<P> {
    fn send(&mut self, byte: u8) {
        self.putchar(byte);
    }

    // Nothing is buffered past the hardware FIFO, which drains on its own.
    fn flush(&mut self) {}
}

impl<P: PortIo> fmt::Debug for Uart<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uart")
            .field("fifo_depth", &self.fifo_depth)
            .field("fifo_used", &self.fifo_used)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    /// Enough of a 16550 model to drive the init sequence, receive path, and
    /// transmit accounting.
    #[derive(Default)]
    struct TestPort {
        writes: RefCell<Vec<(u8, u8)>>,
        lcr: Cell<u8>,
        /// Scripted IIR reads; exhausted reads report nothing pending
        iir: RefCell<VecDeque<u8>>,
        rx: RefCell<VecDeque<u8>>,
        /// Times the LSR must be polled before the transmitter reads empty
        busy_polls: Cell<u32>,
        msr_reads: Cell<u32>,
        lsr_reads: Cell<u32>,
    }

    impl PortIo for TestPort {
        fn read(&self, offset: u8) -> u8 {
            match offset {
                DATA => self.rx.borrow_mut().pop_front().unwrap_or(0),
                IIR => self.iir.borrow_mut().pop_front().unwrap_or(0x01),
                LCR => self.lcr.get(),
                LSR => {
                    self.lsr_reads.set(self.lsr_reads.get() + 1);
                    let ready = u8::from(!self.rx.borrow().is_empty());
                    if self.busy_polls.get() > 0 {
                        self.busy_polls.set(self.busy_polls.get() - 1);
                        ready
                    } else {
                        ready | 0x60
                    }
                }
                MSR => {
                    self.msr_reads.set(self.msr_reads.get() + 1);
                    0
                }
                _ => 0,
            }
        }

        fn write(&self, offset: u8, value: u8) {
            if offset == LCR {
                self.lcr.set(value);
            }
            self.writes.borrow_mut().push((offset, value));
        }
    }

    fn dlab_set(lcr: u8) -> bool {
        lcr & 0x80 != 0
    }

    #[test]
    fn init_programs_divisor_under_dlab() {
        let mut uart = Uart::new(TestPort::default());
        uart.init(9600).unwrap();

        // Replay the writes tracking DLAB, and collect divisor-latch stores.
        let mut dlab = false;
        let mut latch = Vec::new();
        for &(offset, value) in uart.ports().writes.borrow().iter() {
            match offset {
                LCR => dlab = dlab_set(value),
                LATCH_LOW | LATCH_HIGH if dlab => latch.push((offset, value)),
                _ => {}
            }
        }
        // 115200 / 9600 = 12, high byte first.
        assert_eq!(latch, vec![(LATCH_HIGH, 0), (LATCH_LOW, 12)]);
        assert!(!dlab, "init must leave the ordinary register map active");
    }

    #[test]
    fn init_rejects_bad_rates() {
        assert_eq!(
            Uart::new(TestPort::default()).init(0),
            Err(ConfigError::InvalidBaudRate(0))
        );
        assert_eq!(
            Uart::new(TestPort::default()).init(7),
            Err(ConfigError::InvalidBaudRate(7))
        );
    }

    #[test]
    fn fifo_probe_reads_depth_from_ident() {
        let port = TestPort::default();
        // Both FIFO bits set, nothing pending: one value for the quiet drain
        // before the probe, one for the probe itself.
        port.iir.borrow_mut().extend([0xC1, 0xC1]);
        let mut uart = Uart::new(port);
        uart.init(BAUD_RATE).unwrap();
        assert_eq!(uart.fifo_depth, 16);
        // The FIFO must be re-enabled after the probe.
        assert!(uart
            .ports()
            .writes
            .borrow()
            .iter()
            .any(|&(offset, value)| offset == FCR && value == 0x01));
    }

    #[test]
    fn fifo_probe_falls_back_to_single_byte() {
        let mut uart = Uart::new(TestPort::default());
        uart.init(BAUD_RATE).unwrap();
        assert_eq!(uart.fifo_depth, 1);
    }

    #[test]
    fn putchar_waits_for_drain_at_depth() {
        let mut uart = Uart::new(TestPort::default());
        uart.init(BAUD_RATE).unwrap();
        uart.ports().writes.borrow_mut().clear();

        uart.putchar(b'a');
        assert_eq!(uart.fifo_used, 1);

        // At depth 1 the next byte must first observe the transmitter empty.
        uart.ports().busy_polls.set(3);
        let polls_before = uart.ports().lsr_reads.get();
        uart.putchar(b'b');
        assert!(uart.ports().lsr_reads.get() >= polls_before + 4);
        assert_eq!(uart.fifo_used, 1);

        let writes = uart.ports().writes.borrow();
        let sent: Vec<u8> = writes
            .iter()
            .filter(|&&(offset, _)| offset == DATA)
            .map(|&(_, value)| value)
            .collect();
        assert_eq!(sent, b"ab");
    }

    #[test]
    fn cause_decoding_matches_ident_field() {
        let port = TestPort::default();
        port.iir
            .borrow_mut()
            .extend([0x00, 0x02, 0x04, 0x06, 0x0C, 0x01]);
        let uart = Uart::new(port);
        assert_eq!(uart.pending_cause(), Some(Cause::ModemStatus));
        assert_eq!(uart.pending_cause(), Some(Cause::TransmitterEmpty));
        assert_eq!(uart.pending_cause(), Some(Cause::ReceivedData));
        assert_eq!(uart.pending_cause(), Some(Cause::LineStatus));
        assert_eq!(uart.pending_cause(), Some(Cause::ReceiverTimeout));
        assert_eq!(uart.pending_cause(), None);
    }

    #[test]
    fn status_causes_read_their_register() {
        let uart = Uart::new(TestPort::default());
        uart.discard_status(Cause::ModemStatus);
        assert_eq!(uart.ports().msr_reads.get(), 1);
        let before = uart.ports().lsr_reads.get();
        uart.discard_status(Cause::LineStatus);
        assert_eq!(uart.ports().lsr_reads.get(), before + 1);
    }

    #[test]
    fn recv_only_reports_ready_data() {
        let uart = Uart::new(TestPort::default());
        assert_eq!(uart.try_recv(), None);
        uart.ports().rx.borrow_mut().push_back(b'x');
        assert_eq!(uart.try_recv(), Some(b'x'));
        assert_eq!(uart.try_recv(), None);
    }
}
