//! Completion buffer untuk satu operasi receive.
//!
//! Buffer berkapasitas tetap, dialokasikan sekali per operasi, lalu dipakai
//! ulang di setiap round sampai operasi selesai.

use crate::encoding::Encoding;
use crate::error::ClientError;

/// Default receive buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 256;

/// What a receive chain does after one read round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The round was short; issue another read into the same buffer.
    Pending,
    /// The round filled the configured size and enough text accumulated.
    Complete(String),
    /// The round filled the configured size but the accumulated text is
    /// shorter than it. The chain stops without a notification.
    Dropped,
}

/// Single-use state of one receive operation.
///
/// Every round reads into `buffer[..size]` from offset zero and appends
/// the decoded text to the accumulator. A round shorter than `size`
/// re-issues; a full round stops the chain, which completes only when the
/// accumulated text is at least `size` characters long.
#[derive(Debug)]
pub struct CompletionBuffer {
    buffer: Box<[u8]>,
    size: usize,
    cursor: usize,
    accumulated: String,
    accumulated_chars: usize,
    bytes_read: usize,
    rounds: usize,
    encoding: Encoding,
}

impl CompletionBuffer {
    /// Allocate a buffer of `capacity` bytes configured for `size`-byte rounds.
    pub fn new(capacity: usize, size: usize, encoding: Encoding) -> Result<Self, ClientError> {
        if size == 0 {
            return Err(ClientError::EmptyReceive);
        }
        if size > capacity {
            return Err(ClientError::BufferTooSmall {
                requested: size,
                capacity,
            });
        }

        Ok(Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            size,
            cursor: 0,
            accumulated: String::with_capacity(size),
            accumulated_chars: 0,
            bytes_read: 0,
            rounds: 0,
            encoding,
        })
    }

    /// Slice the next round reads into.
    #[inline]
    pub fn window(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.size]
    }

    /// Record a finished round of `n` bytes (read into `window()`).
    pub fn complete_round(&mut self, n: usize) -> RoundOutcome {
        let n = n.min(self.size);
        self.cursor = n;
        self.rounds += 1;

        if n > 0 {
            let before = self.accumulated.len();
            self.encoding
                .decode_into(&self.buffer[..n], &mut self.accumulated);
            self.accumulated_chars += self.accumulated[before..].chars().count();
            self.bytes_read += n;
        }

        if n < self.size {
            return RoundOutcome::Pending;
        }

        if self.accumulated_chars >= self.size {
            RoundOutcome::Complete(std::mem::take(&mut self.accumulated))
        } else {
            RoundOutcome::Dropped
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Configured round size.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes written into the buffer by the last round.
    #[inline(always)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline(always)]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Total bytes read across all rounds.
    #[inline(always)]
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Text accumulated so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut CompletionBuffer, chunk: &[u8]) -> RoundOutcome {
        buf.window()[..chunk.len()].copy_from_slice(chunk);
        buf.complete_round(chunk.len())
    }

    #[test]
    fn test_exact_message_completes_in_one_round() {
        let mut buf = CompletionBuffer::new(DEFAULT_CAPACITY, 5, Encoding::Ascii).unwrap();
        assert_eq!(feed(&mut buf, b"hello"), RoundOutcome::Complete("hello".into()));
        assert_eq!(buf.rounds(), 1);
        assert_eq!(buf.cursor(), 5);
    }

    #[test]
    fn test_short_rounds_accumulate_until_full_round() {
        let mut buf = CompletionBuffer::new(16, 4, Encoding::Ascii).unwrap();
        assert_eq!(feed(&mut buf, b"ab"), RoundOutcome::Pending);
        assert_eq!(feed(&mut buf, b"c"), RoundOutcome::Pending);

        match feed(&mut buf, b"defg") {
            RoundOutcome::Complete(text) => {
                assert_eq!(text, "abcdefg");
                assert_eq!(text.len(), buf.bytes_read());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(buf.rounds(), 3);
    }

    #[test]
    fn test_short_final_round_never_completes() {
        let mut buf = CompletionBuffer::new(16, 8, Encoding::Ascii).unwrap();
        assert_eq!(feed(&mut buf, b"abc"), RoundOutcome::Pending);
        // EOF also counts as a short round
        assert_eq!(buf.complete_round(0), RoundOutcome::Pending);
        assert_eq!(buf.accumulated(), "abc");
    }

    #[test]
    fn test_full_round_below_size_in_chars_is_dropped() {
        // 4 bytes, 2 chars
        let mut buf = CompletionBuffer::new(16, 4, Encoding::Utf8).unwrap();
        assert_eq!(feed(&mut buf, "éé".as_bytes()), RoundOutcome::Dropped);
    }

    #[test]
    fn test_cursor_never_exceeds_capacity() {
        let mut buf = CompletionBuffer::new(8, 8, Encoding::Ascii).unwrap();
        assert_eq!(buf.window().len(), 8);
        buf.complete_round(64);
        assert!(buf.cursor() <= buf.capacity());
    }

    #[test]
    fn test_rejects_oversized_and_empty_targets() {
        assert!(matches!(
            CompletionBuffer::new(256, 512, Encoding::Ascii),
            Err(ClientError::BufferTooSmall {
                requested: 512,
                capacity: 256
            })
        ));
        assert!(matches!(
            CompletionBuffer::new(256, 0, Encoding::Ascii),
            Err(ClientError::EmptyReceive)
        ));
    }
}
