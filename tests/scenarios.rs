//! End-to-end scenarios: the whole server over a modeled 16550 and real
//! shared rings, observing exact wire bytes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::time::Duration;

use serial_server::hal::{InputRegistry, Platform, PortIo};
use serial_server::palette;
use serial_server::ring::Shared;
use serial_server::{SerialServer, BAUD_RATE, HEARTBEAT_PERIOD, STREAM_CAPACITY};

const IIR_RECEIVED_DATA: u8 = 0x04;

/// Register-level model of the platform: enough 16550 to satisfy the init
/// sequence, the receive loop, and transmit accounting.
#[derive(Default)]
struct TestPlatform {
    /// Bytes written to the data register outside a divisor-latch window
    tx: RefCell<Vec<u8>>,
    lcr: Cell<u8>,
    /// Scripted interrupt-ident reads; exhausted reads report nothing pending
    iir: RefCell<VecDeque<u8>>,
    rx: RefCell<VecDeque<u8>>,
    acks: Cell<usize>,
    armed: Cell<Option<Duration>>,
}

impl TestPlatform {
    fn wire(&self) -> Vec<u8> {
        self.tx.borrow().clone()
    }

    fn dlab(&self) -> bool {
        self.lcr.get() & 0x80 != 0
    }
}

impl PortIo for &TestPlatform {
    fn read(&self, offset: u8) -> u8 {
        match offset {
            0 => self.rx.borrow_mut().pop_front().unwrap_or(0),
            2 => self.iir.borrow_mut().pop_front().unwrap_or(0x01),
            3 => self.lcr.get(),
            // Transmitter always drained; data-ready tracks the rx queue.
            5 => u8::from(!self.rx.borrow().is_empty()) | 0x60,
            _ => 0,
        }
    }

    fn write(&self, offset: u8, value: u8) {
        match offset {
            0 if !self.dlab() => self.tx.borrow_mut().push(value),
            3 => self.lcr.set(value),
            _ => {}
        }
    }
}

impl Platform for &TestPlatform {
    fn ack_interrupt(&self) {
        self.acks.set(self.acks.get() + 1);
    }

    fn arm_heartbeat(&self, period: Duration) {
        self.armed.set(Some(period));
    }
}

struct TestRegistry {
    rings: Vec<Box<Shared>>,
    notifications: RefCell<Vec<usize>>,
}

impl TestRegistry {
    fn with_clients(count: usize) -> Self {
        Self {
            rings: (0..count).map(|_| Box::new(Shared::new())).collect(),
            notifications: RefCell::new(Vec::new()),
        }
    }

    fn ring_contents(&self, badge: usize) -> Vec<u8> {
        let ring = self.rings[badge].as_ref();
        std::iter::from_fn(|| ring.pop()).collect()
    }
}

impl InputRegistry for &TestRegistry {
    fn count(&self) -> usize {
        self.rings.len()
    }

    fn enumerate_badge(&self, index: usize) -> usize {
        index
    }

    fn largest_badge(&self) -> usize {
        self.rings.len().saturating_sub(1)
    }

    fn ring_region(&self, badge: usize) -> NonNull<Shared> {
        NonNull::from(self.rings[badge].as_ref())
    }

    fn notify(&self, badge: usize) {
        self.notifications.borrow_mut().push(badge);
    }
}

fn boot<'world>(
    platform: &'world TestPlatform,
    registry: &'world TestRegistry,
) -> SerialServer<&'world TestPlatform, &'world TestRegistry> {
    SerialServer::new(platform, registry, BAUD_RATE).expect("valid configuration")
}

/// Delivers keyboard bytes through a receive interrupt.
fn press(
    platform: &TestPlatform,
    server: &SerialServer<&TestPlatform, &TestRegistry>,
    bytes: &[u8],
) {
    platform.rx.borrow_mut().extend(bytes.iter().copied());
    platform.iir.borrow_mut().push_back(IIR_RECEIVED_DATA);
    server.handle_interrupt();
}

fn colored(stream: usize, text: &[u8]) -> Vec<u8> {
    let mut expected = palette::RESET.to_vec();
    expected.extend_from_slice(palette::STREAM_COLORS[stream]);
    expected.extend_from_slice(text);
    expected
}

#[test]
fn construction_arms_heartbeat_and_acknowledges() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(1);
    let _server = boot(&platform, &registry);
    assert_eq!(platform.armed.get(), Some(HEARTBEAT_PERIOD));
    assert_eq!(platform.acks.get(), 1);
    assert!(platform.wire().is_empty(), "bring-up writes nothing");
}

#[test]
fn rejects_unrepresentable_baud() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(0);
    let result = SerialServer::new(&platform, &registry, 9601);
    assert!(result.is_err());
}

/// S1: a single processed line goes out under the client's color, with the
/// implicit carriage return completing the pair.
#[test]
fn single_client_line() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(1);
    let server = boot(&platform, &registry);

    for &byte in b"hi\n" {
        server.put_processed(0, byte);
    }
    assert_eq!(platform.wire(), colored(0, b"hi\n\r"));
}

/// S2: interleaving happens at line boundaries only, each client's bytes
/// contiguous under its own color.
#[test]
fn color_switches_on_line_boundary() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(2);
    let server = boot(&platform, &registry);

    for &byte in b"a\n" {
        server.put_processed(0, byte);
    }
    for &byte in b"b\n" {
        server.put_processed(1, byte);
    }

    let mut expected = colored(0, b"a\n\r");
    expected.extend_from_slice(&colored(1, b"b\n\r"));
    assert_eq!(platform.wire(), expected);
}

/// S3: a saturated stream forces everything out; nothing is lost and the
/// bystander keeps its own color.
#[test]
fn overflow_forces_full_flush() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(2);
    let server = boot(&platform, &registry);

    server.put_processed(1, b'b');
    let big = vec![b'x'; STREAM_CAPACITY];
    for &byte in &big {
        server.put_processed(0, byte);
    }

    let mut expected = colored(1, b"b");
    expected.extend_from_slice(&colored(0, &big));
    assert_eq!(platform.wire(), expected);
}

/// S4: the help command prints without delivering anything to clients.
#[test]
fn escape_help_screen() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(2);
    let server = boot(&platform, &registry);

    press(&platform, &server, b"@?");

    assert_eq!(registry.ring_contents(0), b"");
    assert_eq!(registry.ring_contents(1), b"");
    let text = String::from_utf8_lossy(&platform.wire()).into_owned();
    assert!(text.contains("Serial server help"), "{text}");
    assert!(text.contains("Escape char: @"), "{text}");
}

/// S5: multi-select routes a keystroke to each selected ring with one
/// notification apiece.
#[test]
fn multi_select_broadcast() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(3);
    let server = boot(&platform, &registry);

    press(&platform, &server, b"@m01m");
    press(&platform, &server, b"x");

    assert_eq!(registry.ring_contents(0), b"x");
    assert_eq!(registry.ring_contents(1), b"x");
    assert_eq!(registry.ring_contents(2), b"");
    assert_eq!(*registry.notifications.borrow(), vec![0, 1]);
}

/// S6: the heartbeat force-flushes a stream that never ends its line.
#[test]
fn heartbeat_flushes_stalled_output() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(1);
    let server = boot(&platform, &registry);

    for &byte in b"abc" {
        server.put_processed(0, byte);
    }
    assert!(platform.wire().is_empty(), "no newline, no fast path");

    server.heartbeat_tick();
    assert_eq!(platform.wire(), colored(0, b"abc"));
}

/// Identical broadcast output is printed once while multi-client input mode
/// is active, uncolored.
#[test]
fn broadcast_output_coalesces() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(2);
    let server = boot(&platform, &registry);

    press(&platform, &server, b"@m01m");
    let banner_len = platform.wire().len();

    for &byte in b"ok" {
        server.put_raw(0, byte);
        server.put_raw(1, byte);
    }
    let wire = platform.wire()[banner_len..].to_vec();
    assert_eq!(wire, b"ok");
}

/// A literal escape reaches the client and leaves the protocol mid-line.
#[test]
fn doubled_escape_is_literal() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(1);
    let server = boot(&platform, &registry);

    press(&platform, &server, b"@@tail\r");
    assert_eq!(registry.ring_contents(0), b"@tail\r");
}

/// Interrupt service acknowledges exactly once per invocation, after the
/// causes drain.
#[test]
fn interrupt_acknowledged_per_service() {
    let platform = TestPlatform::default();
    let registry = TestRegistry::with_clients(1);
    let server = boot(&platform, &registry);
    let after_boot = platform.acks.get();

    press(&platform, &server, b"k");
    assert_eq!(platform.acks.get(), after_boot + 1);
    assert_eq!(registry.ring_contents(0), b"k");
}
