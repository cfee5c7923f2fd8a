//! Fixed terminal colors, one per output stream.
//!
//! The first twelve entries mark the processed streams with distinct
//! foreground colors (bold past the sixth); the last twelve mark the raw
//! streams with the same colors over a white background. Entries are opaque
//! byte sequences emitted verbatim around stream switches.

use crate::STREAM_COUNT;

/// Returns every attribute to the terminal default.
pub const RESET: &[u8] = b"\x1b[0m";

/// Color sequences indexed by stream id.
pub const STREAM_COLORS: [&[u8]; STREAM_COUNT] = [
    // Processed streams.
    b"\x1b[31m",
    b"\x1b[32m",
    b"\x1b[34m",
    b"\x1b[35m",
    b"\x1b[33m",
    b"\x1b[36m",
    b"\x1b[1;31m",
    b"\x1b[1;32m",
    b"\x1b[1;34m",
    b"\x1b[1;35m",
    b"\x1b[1;33m",
    b"\x1b[1;36m",
    // Raw streams: the same ordering on a white background.
    b"\x1b[47;31m",
    b"\x1b[47;32m",
    b"\x1b[47;34m",
    b"\x1b[47;35m",
    b"\x1b[47;33m",
    b"\x1b[47;36m",
    b"\x1b[1;47;31m",
    b"\x1b[1;47;32m",
    b"\x1b[1;47;34m",
    b"\x1b[1;47;35m",
    b"\x1b[1;47;33m",
    b"\x1b[1;47;36m",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_CLIENTS;

    #[test]
    fn raw_entries_add_a_white_background() {
        for client in 0..MAX_CLIENTS {
            let processed = STREAM_COLORS[client];
            let raw = STREAM_COLORS[client + MAX_CLIENTS];
            assert_ne!(processed, raw);
            // Same foreground color code at the tail of the sequence.
            assert_eq!(
                &processed[processed.len() - 3..],
                &raw[raw.len() - 3..],
                "client {client}"
            );
        }
    }

    #[test]
    fn entries_are_distinct() {
        for (index, color) in STREAM_COLORS.iter().enumerate() {
            for other in &STREAM_COLORS[index + 1..] {
                assert_ne!(color, other);
            }
        }
    }
}
