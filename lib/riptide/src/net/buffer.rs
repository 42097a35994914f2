/// Cursor position past which a consumed prefix becomes worth reclaiming.
const COMPACT_THRESHOLD: usize = 8192;

/// A byte container consumed through a cursor. Producers append at the
/// tail, the consumer advances the cursor; the consumed prefix is
/// reclaimed lazily so steady-state traffic does not shift bytes around.
pub struct OffsetBuffer {
    buf: Vec<u8>,
    offset: usize,
}

impl OffsetBuffer {
    #[inline]
    pub fn new() -> OffsetBuffer {
        OffsetBuffer {
            buf: Vec::new(),
            offset: 0,
        }
    }

    /// True while unconsumed bytes remain.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.offset < self.buf.len()
    }

    /// The unconsumed window.
    #[inline]
    pub fn current_data(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Number of unconsumed bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Moves the cursor forward over consumed bytes. The cursor never
    /// passes the end of the buffer.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        assert!(
            self.offset + n <= self.buf.len(),
            "buffer cursor overrun: offset {} + {} > size {}",
            self.offset,
            n,
            self.buf.len()
        );
        self.offset += n;
    }

    /// Resets to empty exactly when everything has been consumed.
    #[inline]
    pub fn clear_if_done(&mut self) -> bool {
        if self.offset != self.buf.len() {
            return false;
        }
        self.buf.clear();
        self.offset = 0;
        true
    }

    /// Erases the consumed prefix once it exceeds both the threshold and
    /// half the buffer. Never reorders the unconsumed tail.
    #[inline]
    pub fn compact_if_needed(&mut self) -> bool {
        if self.offset < COMPACT_THRESHOLD {
            return false;
        }
        if self.offset * 2 < self.buf.len() {
            return false;
        }
        self.buf.drain(..self.offset);
        self.offset = 0;
        true
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Outgoing bytes awaiting the TLS write path.
pub struct SendBuffer {
    inner: OffsetBuffer,
}

impl SendBuffer {
    #[inline]
    pub fn new() -> SendBuffer {
        SendBuffer {
            inner: OffsetBuffer::new(),
        }
    }

    /// Appends bytes and reports whether the buffer transitioned from
    /// empty-pending to has-pending, which is the caller's cue to request
    /// write readiness.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let was_pending = self.inner.has_pending();
        self.inner.extend(bytes);
        !was_pending && self.inner.has_pending()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.inner.has_pending()
    }

    #[inline]
    pub fn current_data(&self) -> &[u8] {
        self.inner.current_data()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.remaining()
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.inner.advance(n);
    }

    #[inline]
    pub fn clear_if_done(&mut self) -> bool {
        self.inner.clear_if_done()
    }

    #[inline]
    pub fn compact_if_needed(&mut self) -> bool {
        self.inner.compact_if_needed()
    }
}

/// Incoming plaintext from which complete protocol lines are extracted.
pub struct RecvBuffer {
    inner: OffsetBuffer,
}

impl RecvBuffer {
    #[inline]
    pub fn new() -> RecvBuffer {
        RecvBuffer {
            inner: OffsetBuffer::new(),
        }
    }

    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.extend(bytes);
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.inner.has_pending()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.remaining()
    }

    /// Extracts the next complete line, without its `\n` terminator, and
    /// advances the cursor past it. Returns `None` while no full line has
    /// arrived yet.
    pub fn next_line(&mut self) -> Option<String> {
        let data = self.inner.current_data();
        let pos = data.iter().position(|&b| b == b'\n')?;

        let line = String::from_utf8_lossy(&data[..pos]).into_owned();
        self.inner.advance(pos + 1);

        if !self.inner.clear_if_done() {
            self.inner.compact_if_needed();
        }

        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_reports_empty_to_pending_transition() {
        let mut send = SendBuffer::new();

        assert!(send.append(b"first"));
        assert!(!send.append(b"second"));

        send.advance(send.remaining());
        assert!(send.clear_if_done());

        // Back to empty, the transition fires again.
        assert!(send.append(b"third"));
    }

    #[test]
    fn test_append_empty_slice_is_not_a_transition() {
        let mut send = SendBuffer::new();
        assert!(!send.append(b""));
        assert!(!send.has_pending());
    }

    #[test]
    fn test_clear_if_done_only_after_full_drain() {
        let mut send = SendBuffer::new();
        send.append(b"abcdef");

        send.advance(3);
        assert!(!send.clear_if_done());
        assert_eq!(send.current_data(), b"def");

        send.advance(3);
        assert!(send.clear_if_done());
        assert_eq!(send.remaining(), 0);
        assert!(!send.has_pending());
    }

    #[test]
    fn test_compact_below_threshold_is_noop() {
        let mut buf = OffsetBuffer::new();
        buf.extend(&[7u8; 100]);
        buf.advance(99);

        assert!(!buf.compact_if_needed());
        assert_eq!(buf.offset(), 99);
    }

    #[test]
    fn test_compact_requires_majority_consumed() {
        let mut buf = OffsetBuffer::new();
        buf.extend(&[1u8; 8192]);
        buf.extend(&[2u8; 20000]);
        buf.advance(8192);

        // Cursor is past the threshold but under half the buffer.
        assert!(!buf.compact_if_needed());

        buf.advance(6000);
        assert!(buf.compact_if_needed());
        assert_eq!(buf.offset(), 0);
        assert_eq!(buf.remaining(), 28192 - 8192 - 6000);
    }

    #[test]
    fn test_compact_preserves_unconsumed_tail() {
        let mut buf = OffsetBuffer::new();
        let head: Vec<u8> = (0..COMPACT_THRESHOLD).map(|i| i as u8).collect();
        buf.extend(&head);
        buf.extend(b"tail bytes");
        buf.advance(COMPACT_THRESHOLD);

        let before = buf.current_data().to_vec();
        assert!(buf.compact_if_needed());
        assert_eq!(buf.current_data(), &before[..]);
    }

    #[test]
    #[should_panic(expected = "buffer cursor overrun")]
    fn test_advance_past_end_panics() {
        let mut buf = OffsetBuffer::new();
        buf.extend(b"abc");
        buf.advance(4);
    }

    #[test]
    fn test_next_line_waits_for_terminator() {
        let mut recv = RecvBuffer::new();
        recv.append(b"partial");

        assert_eq!(recv.next_line(), None);

        recv.append(b" line\nrest");
        assert_eq!(recv.next_line().unwrap(), "partial line");
        assert_eq!(recv.next_line(), None);
        assert!(recv.has_pending());
    }

    #[test]
    fn test_next_line_yields_empty_line() {
        let mut recv = RecvBuffer::new();
        recv.append(b"\nafter\n");

        assert_eq!(recv.next_line().unwrap(), "");
        assert_eq!(recv.next_line().unwrap(), "after");
        assert!(!recv.has_pending());
    }

    #[test]
    fn test_next_line_resets_after_full_drain() {
        let mut recv = RecvBuffer::new();
        recv.append(b"one\ntwo\n");

        assert_eq!(recv.next_line().unwrap(), "one");
        assert_eq!(recv.next_line().unwrap(), "two");
        assert_eq!(recv.inner.offset(), 0);
        assert_eq!(recv.inner.len(), 0);
    }
}
