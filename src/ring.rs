//! Single-producer/single-consumer byte rings shared with input clients.
//!
//! Each input client maps one [`Shared`] region. The server is the only
//! producer (it owns `tail`), the client the only consumer (it owns `head`).
//! A full ring drops bytes rather than blocking the interrupt path.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

/// Payload bytes per ring: one 4 KiB page minus the two indices.
pub const RING_BYTES: usize = 4096 - 2 * mem::size_of::<u32>();

const RING: u32 = RING_BYTES as u32;

/// The region layout both sides agree on.
#[repr(C)]
pub struct Shared {
    /// Next unread position; advanced only by the consumer
    head: AtomicU32,
    /// Next free position; advanced only by the producer
    tail: AtomicU32,
    buf: [UnsafeCell<u8>; RING_BYTES],
}

// The region is exactly one page.
const _: () = assert!(mem::size_of::<Shared>() == 4096);

impl Shared {
    /// An empty ring
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            buf: [const { UnsafeCell::new(0) }; RING_BYTES],
        }
    }

    /// Consumer side: takes the next unread byte, if any.
    ///
    /// The acquire load of `tail` pairs with the producer's release store, so
    /// a byte is visible by the time its index is.
    pub fn pop(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the slot is before `tail`, so the producer is done with it,
        // and this is the only consumer.
        let byte = unsafe { self.buf[head as usize].get().read() };
        self.head.store((head + 1) % RING, Ordering::Release);
        Some(byte)
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a pushed byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Push {
    /// The ring was full; the byte is gone
    Dropped,
    /// The byte was published
    Stored {
        /// Whether the consumer should be signalled. Wake-ups are suppressed
        /// while the consumer has not advanced past the previously signalled
        /// position, since it will see subsequent bytes on its own
        wake: bool,
    },
}

/// The server's write handle onto one client's ring.
pub struct Producer {
    shared: NonNull<Shared>,
    /// Consumer position observed at the last wake-up
    last_head: u32,
}

// SAFETY: the producer side is owned by exactly one thread at a time (the
// server serializes all pushes under its lock), and `Shared` is built from
// atomics plus slots only the producer writes.
unsafe impl Send for Producer {}

impl Producer {
    /// Wraps a shared region.
    ///
    /// # Safety
    /// * `shared` must point to a live, correctly initialized [`Shared`] that
    ///   outlives this producer
    /// * No other producer may write the same region
    pub const unsafe fn new(shared: NonNull<Shared>) -> Self {
        Self {
            shared,
            // Forces a wake-up on the first delivered byte.
            last_head: u32::MAX,
        }
    }

    /// Publishes one byte, or drops it if the ring is full
    pub fn push(&mut self, byte: u8) -> Push {
        // SAFETY: the constructor guarantees the region stays valid.
        let shared = unsafe { self.shared.as_ref() };
        let tail = shared.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % RING;
        let head = shared.head.load(Ordering::Relaxed);
        if next == head {
            return Push::Dropped;
        }
        // SAFETY: the slot is at `tail`, which the consumer never reads before
        // the release store below publishes it.
        unsafe {
            shared.buf[tail as usize].get().write(byte);
        }
        // Order the data write before the index becomes visible.
        shared.tail.store(next, Ordering::Release);

        let wake = head != self.last_head;
        if wake {
            self.last_head = head;
        }
        Push::Stored { wake }
    }
}
