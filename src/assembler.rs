//! Assembly of streamed input chunks into one pre-sized buffer.
//!
//! The host delivers the response body as a sequence of chunks over several
//! calls. [`AssemblyBuffer::feed`] copies as much as fits, releases every
//! chunk it fully consumed and reports whether more input is needed.

use std::collections::VecDeque;

/// One delivered input chunk.
#[derive(Debug, Clone, Default)]
pub struct InputChunk {
    data: Vec<u8>,
    pos: usize,
    /// Set on the chunk that ends the stream.
    last: bool,
}

impl InputChunk {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            last: false,
        }
    }

    /// A chunk that also marks the end of the stream.
    pub fn last(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            last: true,
        }
    }

    /// An empty end-of-stream marker.
    pub fn end_of_stream() -> Self {
        Self::last(Vec::new())
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Ordered queue of pending input chunks.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<InputChunk>,
    released: usize,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: InputChunk) {
        self.chunks.push_back(chunk);
    }

    /// Queue `chunk` ahead of everything already pending.
    pub fn push_front(&mut self, chunk: InputChunk) {
        self.chunks.push_front(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Unconsumed bytes across all queued chunks.
    pub fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.remaining().len()).sum()
    }

    /// Number of chunks released so far.
    pub fn released(&self) -> usize {
        self.released
    }

    /// True when the only thing left is an empty end-of-stream marker.
    pub fn at_end_of_stream(&self) -> bool {
        self.chunks
            .front()
            .is_some_and(|c| c.is_last() && c.remaining().is_empty())
    }

    fn front_mut(&mut self) -> Option<&mut InputChunk> {
        self.chunks.front_mut()
    }

    fn release_front(&mut self) {
        if self.chunks.pop_front().is_some() {
            self.released += 1;
        }
    }
}

impl FromIterator<InputChunk> for ChunkQueue {
    fn from_iter<I: IntoIterator<Item = InputChunk>>(iter: I) -> Self {
        Self {
            chunks: iter.into_iter().collect(),
            released: 0,
        }
    }
}

/// Result of one [`AssemblyBuffer::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Capacity not reached and the stream has not ended.
    NeedMore,
    /// Capacity reached exactly; the end-of-stream marker has not arrived yet.
    Filled,
    /// The payload is fully assembled.
    Complete,
    /// Capacity exhausted with unconsumed input left. Fatal.
    Overflow,
    /// The stream ended before a fixed-length prefix was filled. Fatal.
    Truncated,
}

impl FeedStatus {
    pub fn is_fatal(self) -> bool {
        matches!(self, FeedStatus::Overflow | FeedStatus::Truncated)
    }
}

/// How the end of the payload is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    /// Payload ends with the stream; more bytes than capacity is an overflow.
    Body,
    /// Payload has an exact length; the rest of the stream belongs to the
    /// next consumer.
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Filled,
    Complete,
    Overflow,
    Truncated,
}

/// Fixed-capacity destination buffer plus cursor.
#[derive(Debug)]
pub struct AssemblyBuffer {
    buf: Vec<u8>,
    capacity: usize,
    mode: AssemblyMode,
    state: State,
}

impl AssemblyBuffer {
    /// Buffer for an end-of-stream terminated payload.
    pub fn for_body(capacity: usize) -> Self {
        Self::new(capacity, AssemblyMode::Body)
    }

    /// Buffer for a payload of exactly `len` bytes at the head of the stream.
    pub fn for_prefix(len: usize) -> Self {
        Self::new(len, AssemblyMode::Prefix)
    }

    pub fn new(capacity: usize, mode: AssemblyMode) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            mode,
            state: State::Open,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn mode(&self) -> AssemblyMode {
        self.mode
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Take the assembled bytes. The allocation keeps its full capacity.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Copy as many queued bytes as fit.
    ///
    /// Can be called once per delivery. Fully consumed chunks are released
    /// from `source` immediately. Once `Overflow` or `Truncated` has been
    /// returned, the buffer stays in that state.
    pub fn feed(&mut self, source: &mut ChunkQueue) -> FeedStatus {
        let status = match self.state {
            State::Overflow => return FeedStatus::Overflow,
            State::Truncated => return FeedStatus::Truncated,
            State::Complete => return FeedStatus::Complete,
            State::Open | State::Filled => match self.mode {
                AssemblyMode::Body => self.feed_body(source),
                AssemblyMode::Prefix => self.feed_prefix(source),
            },
        };
        self.state = match status {
            FeedStatus::NeedMore => State::Open,
            FeedStatus::Filled => State::Filled,
            FeedStatus::Complete => State::Complete,
            FeedStatus::Overflow => State::Overflow,
            FeedStatus::Truncated => State::Truncated,
        };
        status
    }

    fn feed_body(&mut self, source: &mut ChunkQueue) -> FeedStatus {
        while let Some(chunk) = source.front_mut() {
            let rest = self.capacity - self.buf.len();
            if rest == 0 {
                // Full: only empty chunks may follow.
                if !chunk.remaining().is_empty() {
                    return FeedStatus::Overflow;
                }
                let last = chunk.is_last();
                source.release_front();
                if last {
                    return FeedStatus::Complete;
                }
                continue;
            }

            let take = rest.min(chunk.remaining().len());
            self.buf.extend_from_slice(&chunk.remaining()[..take]);
            chunk.consume(take);

            if chunk.remaining().is_empty() {
                let last = chunk.is_last();
                source.release_front();
                if last {
                    return FeedStatus::Complete;
                }
            }
        }

        if self.buf.len() == self.capacity {
            FeedStatus::Filled
        } else {
            FeedStatus::NeedMore
        }
    }

    fn feed_prefix(&mut self, source: &mut ChunkQueue) -> FeedStatus {
        loop {
            if self.buf.len() == self.capacity {
                return FeedStatus::Complete;
            }
            let Some(chunk) = source.front_mut() else {
                return FeedStatus::NeedMore;
            };

            let rest = self.capacity - self.buf.len();
            let take = rest.min(chunk.remaining().len());
            self.buf.extend_from_slice(&chunk.remaining()[..take]);
            chunk.consume(take);

            if chunk.remaining().is_empty() {
                if !chunk.is_last() {
                    source.release_front();
                } else if self.buf.len() < self.capacity {
                    return FeedStatus::Truncated;
                }
                // An exhausted last chunk stays queued as the end marker
                // for whoever reads the rest of the stream.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(chunks: Vec<InputChunk>) -> ChunkQueue {
        chunks.into_iter().collect()
    }

    #[test]
    fn test_exact_fill_with_end_marker_is_complete() {
        let mut buf = AssemblyBuffer::for_body(6);
        let mut q = queue(vec![InputChunk::new("abc"), InputChunk::last("def")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Complete);
        assert_eq!(buf.as_slice(), b"abcdef");
        assert!(q.is_empty());
        assert_eq!(q.released(), 2);
    }

    #[test]
    fn test_short_payload_without_end_needs_more() {
        let mut buf = AssemblyBuffer::for_body(10);
        let mut q = queue(vec![InputChunk::new("abc")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::NeedMore);
        assert_eq!(buf.len(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn test_short_payload_with_end_is_complete() {
        let mut buf = AssemblyBuffer::for_body(10);
        let mut q = queue(vec![InputChunk::last("abc")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Complete);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn test_overflow_without_end_marker() {
        let mut buf = AssemblyBuffer::for_body(4);
        let mut q = queue(vec![InputChunk::new("abcdef")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Overflow);
        assert_eq!(buf.len(), 4);
        // Sticky.
        let mut more = queue(vec![InputChunk::end_of_stream()]);
        assert_eq!(buf.feed(&mut more), FeedStatus::Overflow);
        assert_eq!(more.len(), 1);
    }

    #[test]
    fn test_overflow_when_last_chunk_does_not_fit() {
        let mut buf = AssemblyBuffer::for_body(4);
        let mut q = queue(vec![InputChunk::last("abcdef")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Overflow);
    }

    #[test]
    fn test_filled_then_end_marker_completes() {
        let mut buf = AssemblyBuffer::for_body(3);
        let mut q = queue(vec![InputChunk::new("abc")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Filled);
        let mut next = queue(vec![InputChunk::end_of_stream()]);
        assert_eq!(buf.feed(&mut next), FeedStatus::Complete);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn test_filled_then_more_bytes_overflows() {
        let mut buf = AssemblyBuffer::for_body(3);
        let mut q = queue(vec![InputChunk::new("abc")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Filled);
        let mut next = queue(vec![InputChunk::last("d")]);
        assert_eq!(buf.feed(&mut next), FeedStatus::Overflow);
    }

    #[test]
    fn test_filled_with_trailing_empty_end_marker() {
        let mut buf = AssemblyBuffer::for_body(3);
        let mut q = queue(vec![InputChunk::new("abc"), InputChunk::end_of_stream()]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Complete);
    }

    #[test]
    fn test_streaming_across_deliveries() {
        let mut buf = AssemblyBuffer::for_body(8);
        let mut q = queue(vec![InputChunk::new("ab")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::NeedMore);
        let mut q = queue(vec![InputChunk::new("cd"), InputChunk::new("ef")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::NeedMore);
        let mut q = queue(vec![InputChunk::last("gh")]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Complete);
        assert_eq!(buf.as_slice(), b"abcdefgh");
    }

    #[test]
    fn test_feed_statuses_for_all_small_sizes() {
        for capacity in 1..6usize {
            for total in 0..8usize {
                let payload = vec![b'x'; total];
                for with_end in [false, true] {
                    let mut buf = AssemblyBuffer::for_body(capacity);
                    let chunk = if with_end {
                        InputChunk::last(payload.clone())
                    } else {
                        InputChunk::new(payload.clone())
                    };
                    let mut q = queue(vec![chunk]);
                    let status = buf.feed(&mut q);
                    let expected = match (total.cmp(&capacity), with_end) {
                        (std::cmp::Ordering::Greater, _) => FeedStatus::Overflow,
                        (std::cmp::Ordering::Equal, true) => FeedStatus::Complete,
                        (std::cmp::Ordering::Equal, false) => FeedStatus::Filled,
                        (std::cmp::Ordering::Less, true) => FeedStatus::Complete,
                        (std::cmp::Ordering::Less, false) => FeedStatus::NeedMore,
                    };
                    assert_eq!(status, expected, "capacity={capacity} total={total} end={with_end}");
                    assert!(buf.len() <= capacity);
                }
            }
        }
    }

    #[test]
    fn test_prefix_leaves_rest_in_queue() {
        let mut prefix = AssemblyBuffer::for_prefix(4);
        let mut q = queue(vec![InputChunk::new("CTP"), InputChunk::new("P{\"a\""), InputChunk::last(":1}")]);
        assert_eq!(prefix.feed(&mut q), FeedStatus::Complete);
        assert_eq!(prefix.as_slice(), b"CTPP");
        assert_eq!(q.pending_bytes(), 7);

        let mut body = AssemblyBuffer::for_body(64);
        assert_eq!(body.feed(&mut q), FeedStatus::Complete);
        assert_eq!(body.as_slice(), b"{\"a\":1}");
    }

    #[test]
    fn test_prefix_keeps_end_marker() {
        let mut prefix = AssemblyBuffer::for_prefix(3);
        let mut q = queue(vec![InputChunk::last("abc")]);
        assert_eq!(prefix.feed(&mut q), FeedStatus::Complete);
        assert!(q.at_end_of_stream());
    }

    #[test]
    fn test_prefix_truncated() {
        let mut prefix = AssemblyBuffer::for_prefix(10);
        let mut q = queue(vec![InputChunk::new("abc")]);
        assert_eq!(prefix.feed(&mut q), FeedStatus::NeedMore);
        let mut q = queue(vec![InputChunk::last("de")]);
        assert_eq!(prefix.feed(&mut q), FeedStatus::Truncated);
        assert!(FeedStatus::Truncated.is_fatal());
    }

    #[test]
    fn test_zero_capacity_body() {
        let mut buf = AssemblyBuffer::for_body(0);
        let mut q = queue(vec![InputChunk::end_of_stream()]);
        assert_eq!(buf.feed(&mut q), FeedStatus::Complete);
    }
}
