//! The output multiplexer: many buffered streams, one colored wire.
//!
//! Every client owns two streams — processed text at `client`, raw bytes at
//! `client + MAX_CLIENTS` — each with a private buffer and a palette color.
//! Bytes are held until a line boundary so concurrent writers interleave at
//! whole lines, each run preceded by its stream's color whenever the wire's
//! latched color changes. Two policies break line discipline deliberately: a
//! saturated buffer forces everything out (§ overflow), and the heartbeat
//! forces progress for streams that never end their line.

use crate::hal::{Wire, WireFmt};
use crate::input::DebugLevel;
use crate::palette;
use crate::{STREAM_CAPACITY, STREAM_COUNT};

const fn bit(stream: usize) -> u32 {
    1 << stream
}

/// Whether two bytes form a `\r\n` or `\n\r` pair.
const fn newline_pair(first: u8, second: u8) -> bool {
    (first == b'\r' && second == b'\n') || (first == b'\n' && second == b'\r')
}

/// Result of a coalescing attempt over the broadcast streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Coalesce {
    /// Input is not in broadcast mode; nothing was attempted
    NotAttempted,
    /// Streams hold diverging bytes; they must flush separately
    Mismatch,
    /// Too little agreement yet; keep buffering in case later bytes match
    Buffering,
    /// A common prefix went out once and was removed everywhere
    Emitted,
}

impl Coalesce {
    /// Immediate flushing stays allowed only when coalescing is off the
    /// table. A `Buffering` verdict must keep bytes back: the other streams'
    /// copies of the same output may simply not have arrived yet.
    const fn allows_fast_path(self) -> bool {
        matches!(self, Self::NotAttempted | Self::Mismatch)
    }
}

/// Per-stream buffers plus the state describing what the wire last saw.
pub struct OutputMux {
    buffers: [[u8; STREAM_CAPACITY]; STREAM_COUNT],
    used: [usize; STREAM_COUNT],
    /// Bit `s` set ⇔ stream `s` holds unflushed bytes
    pending: u32,
    /// The stream whose color the terminal currently displays. `None` after
    /// anything uncolored (operator text, coalesced output) touched the wire
    latched: Option<usize>,
    /// Whether any full flush happened this heartbeat epoch
    done_output: bool,
    /// Whether any byte was enqueued this heartbeat epoch
    has_data: bool,
}

impl OutputMux {
    pub const fn new() -> Self {
        Self {
            buffers: [[0; STREAM_CAPACITY]; STREAM_COUNT],
            used: [0; STREAM_COUNT],
            pending: 0,
            latched: None,
            done_output: false,
            has_data: false,
        }
    }

    /// Enqueues one byte on `stream` and applies the flush policy.
    ///
    /// `multi_input` enables coalescing of identical broadcast output; it is
    /// true exactly while the input router is in multi-client mode.
    pub fn put<W: Wire>(
        &mut self,
        stream: usize,
        byte: u8,
        multi_input: bool,
        debug: DebugLevel,
        wire: &mut W,
    ) {
        debug_assert!(stream < STREAM_COUNT);
        let index = self.used[stream];
        debug_assert!(index < STREAM_CAPACITY);
        self.buffers[stream][index] = byte;
        self.used[stream] = index + 1;

        let coalesce = if multi_input {
            self.try_coalesce(debug, wire)
        } else {
            Coalesce::NotAttempted
        };

        if self.used[stream] == STREAM_CAPACITY {
            self.relieve_overflow(stream, debug, wire);
        } else if coalesce.allows_fast_path()
            && (self.ends_with_newline_pair(stream)
                || (self.latched == Some(stream) && self.pending == 0))
        {
            // End of line, or this stream already owns the color and is the
            // only writer: no interleaving risk either way.
            self.flush_stream(stream, wire);
        } else if coalesce != Coalesce::Emitted {
            self.pending |= bit(stream);
        }
        self.has_data = true;
    }

    /// Forgets the latched color. The next flush will re-emit a reset and the
    /// stream's color. Called whenever foreign bytes reach the wire
    pub fn reset_color_latch(&mut self) {
        self.latched = None;
    }

    /// The stream whose color is live on the wire, if any
    pub const fn color_latch(&self) -> Option<usize> {
        self.latched
    }

    /// Bit `s` set ⇔ stream `s` holds unflushed bytes
    pub const fn pending_bitmask(&self) -> u32 {
        self.pending
    }

    /// Unflushed bytes held for `stream`
    pub const fn buffered(&self, stream: usize) -> usize {
        self.used[stream]
    }

    /// One tick of the forced-progress timer.
    ///
    /// A recent full flush means the fast paths are doing their job; stand
    /// down for this epoch. Otherwise sweep out complete lines, and if not
    /// even one line is buffered anywhere, flush everything: a stream that
    /// never sends a newline must not stall forever.
    pub fn heartbeat<W: Wire>(&mut self, debug: DebugLevel, wire: &mut W) {
        if self.done_output {
            self.done_output = false;
            return;
        }
        if !self.has_data {
            return;
        }

        let mut flushed_line = false;
        let mut swept_clean = false;
        while !swept_clean {
            swept_clean = true;
            for stream in 0..STREAM_COUNT {
                if self.flush_stream_line(stream, debug, wire) {
                    flushed_line = true;
                    swept_clean = false;
                }
            }
        }
        if !flushed_line {
            for stream in 0..STREAM_COUNT {
                self.flush_stream(stream, wire);
            }
        }
        self.has_data = self.pending != 0;
    }

    /// Tries to print the common prefix of all non-empty streams exactly once.
    ///
    /// Best effort only: comparison is bytewise, so ANSI sequences or
    /// multibyte characters may be split when agreement starts or stops.
    fn try_coalesce<W: Wire>(&mut self, debug: DebugLevel, wire: &mut W) -> Coalesce {
        let mut members = [0_usize; STREAM_COUNT];
        let mut count = 0;
        let mut len = usize::MAX;
        for stream in 0..STREAM_COUNT {
            if self.used[stream] > 0 {
                members[count] = stream;
                count += 1;
                len = len.min(self.used[stream]);
            }
        }
        if count < 2 {
            return Coalesce::Buffering;
        }

        let first = members[0];
        for &stream in &members[1..count] {
            if self.buffers[stream][..len] != self.buffers[first][..len] {
                if debug == DebugLevel::Coalescing {
                    self.dump_mismatch(first, stream, len, wire);
                }
                return Coalesce::Mismatch;
            }
        }

        // Full agreement: the shared prefix goes out once, uncolored.
        if self.latched.is_some() {
            wire.send_all(palette::RESET);
        }
        self.latched = None;
        wire.send_all(&self.buffers[first][..len]);
        wire.flush();

        for &stream in &members[..count] {
            self.buffers[stream].copy_within(len..self.used[stream], 0);
            self.used[stream] -= len;
            if self.used[stream] == 0 {
                self.pending &= !bit(stream);
            }
        }
        if self.pending != 0 {
            self.has_data = true;
        }
        Coalesce::Emitted
    }

    /// Clears a saturated stream without stranding anyone else's bytes.
    ///
    /// Line discipline is already lost (someone's line will be cut), so:
    /// finish the active stream's line for color continuity, sweep complete
    /// lines everywhere, and if the offender is still full, push every buffer
    /// out wholesale, the offender last so its color ends up latched and its
    /// fast path resumes immediately.
    fn relieve_overflow<W: Wire>(&mut self, stream: usize, debug: DebugLevel, wire: &mut W) {
        if let Some(previous) = self.latched {
            self.flush_stream_line(previous, debug, wire);
        }
        let mut swept_clean = false;
        while !swept_clean {
            swept_clean = true;
            for other in 0..STREAM_COUNT {
                if self.flush_stream_line(other, debug, wire) {
                    swept_clean = false;
                }
            }
        }
        if self.used[stream] == STREAM_CAPACITY {
            for other in (0..STREAM_COUNT).filter(|&other| other != stream) {
                self.flush_stream(other, wire);
            }
            self.flush_stream(stream, wire);
        } else if self.latched != Some(stream) {
            // The offender will likely fill again soon; hand it the color now.
            wire.send_all(palette::RESET);
            wire.send_all(palette::STREAM_COLORS[stream]);
            self.latched = Some(stream);
        }
    }

    /// Flushes the entire buffer of `stream`
    fn flush_stream<W: Wire>(&mut self, stream: usize, wire: &mut W) {
        if self.used[stream] == 0 {
            return;
        }
        self.switch_color(stream, wire);
        wire.send_all(&self.buffers[stream][..self.used[stream]]);
        self.done_output = true;
        self.used[stream] = 0;
        self.pending &= !bit(stream);
        wire.flush();
    }

    /// Flushes `stream` up to and including its next complete line.
    ///
    /// Returns whether anything went out. A `\r\n` or `\n\r` pair is kept
    /// atomic; a lone `\r` or `\n` ends the line by itself.
    fn flush_stream_line<W: Wire>(
        &mut self,
        stream: usize,
        debug: DebugLevel,
        wire: &mut W,
    ) -> bool {
        let used = self.used[stream];
        if used == 0 {
            return false;
        }
        let held = &self.buffers[stream][..used];
        let Some(position) = held
            .iter()
            .position(|&byte| byte == b'\r')
            .or_else(|| held.iter().position(|&byte| byte == b'\n'))
        else {
            if debug == DebugLevel::LineFlushes {
                let mut out = WireFmt(wire);
                _ = core::fmt::Write::write_str(&mut out, "\r\nnewline not found!\r\n");
            }
            return false;
        };
        let mut len = position + 1;
        if len < used && newline_pair(held[position], held[len]) {
            len += 1;
        }

        self.switch_color(stream, wire);
        wire.send_all(&self.buffers[stream][..len]);
        self.buffers[stream].copy_within(len..used, 0);
        self.used[stream] = used - len;
        if self.used[stream] == 0 {
            self.pending &= !bit(stream);
        }
        true
    }

    /// Emits reset plus `stream`'s color, but only on an actual change:
    /// a color sequence never lands inside a stream's own contiguous run
    fn switch_color<W: Wire>(&mut self, stream: usize, wire: &mut W) {
        if self.latched != Some(stream) {
            wire.send_all(palette::RESET);
            wire.send_all(palette::STREAM_COLORS[stream]);
            self.latched = Some(stream);
        }
    }

    fn ends_with_newline_pair(&self, stream: usize) -> bool {
        let used = self.used[stream];
        used >= 2 && newline_pair(self.buffers[stream][used - 2], self.buffers[stream][used - 1])
    }

    fn dump_mismatch<W: Wire>(&self, first: usize, other: usize, len: usize, wire: &mut W) {
        use core::fmt::Write as _;
        let mut out = WireFmt(wire);
        _ = out.write_str("\r\nDiffering contents '");
        for &byte in &self.buffers[first][..len] {
            _ = write!(out, "{byte:02x}");
        }
        _ = out.write_str("' vs '");
        for &byte in &self.buffers[other][..len] {
            _ = write!(out, "{byte:02x}");
        }
        _ = out.write_str("'\r\n");
    }
}

impl Default for OutputMux {
    fn default() -> Self {
        Self::new()
    }
}
