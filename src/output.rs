//! Output chain: rendered bytes collected into fixed-capacity chunks.

use std::io;
use thiserror::Error;

/// Default chunk size, one memory page.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("output arena exhausted: {allocated} of {limit} bytes in use, {requested} more requested")]
    LimitExceeded {
        requested: usize,
        allocated: usize,
        limit: usize,
    },
}

/// Source of fresh output chunks for one request.
pub trait ChunkAllocator {
    /// Capacity of every chunk this allocator hands out.
    fn chunk_size(&self) -> usize;

    /// Allocate an empty buffer of `chunk_size()` capacity.
    fn allocate(&mut self) -> Result<Vec<u8>, AllocationError>;
}

/// Allocator of page-sized chunks with an optional total limit.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    page_size: usize,
    /// Total byte budget; `None` is unlimited.
    limit: Option<usize>,
    allocated: usize,
}

impl PageAllocator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            limit: None,
            allocated: 0,
        }
    }

    /// Cap the total bytes this allocator may hand out. Zero means unlimited.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl ChunkAllocator for PageAllocator {
    fn chunk_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&mut self) -> Result<Vec<u8>, AllocationError> {
        if let Some(limit) = self.limit {
            if self.allocated + self.page_size > limit {
                return Err(AllocationError::LimitExceeded {
                    requested: self.page_size,
                    allocated: self.allocated,
                    limit,
                });
            }
        }
        self.allocated += self.page_size;
        Ok(Vec::with_capacity(self.page_size))
    }
}

/// One fixed-capacity buffer of the output chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    data: Vec<u8>,
    capacity: usize,
}

impl OutputChunk {
    fn with_buffer(mut data: Vec<u8>, capacity: usize) -> Self {
        data.clear();
        Self { data, capacity }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn spare(&self) -> usize {
        self.capacity - self.data.len()
    }
}

/// Anything the VM can write rendered bytes into.
pub trait OutputCollector {
    fn collect(&mut self, bytes: &[u8]) -> Result<(), AllocationError>;
}

impl OutputCollector for Vec<u8> {
    fn collect(&mut self, bytes: &[u8]) -> Result<(), AllocationError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Appends bytes to a growing chain of chunks.
#[derive(Debug)]
pub struct OutputSink<A: ChunkAllocator = PageAllocator> {
    allocator: A,
    chunks: Vec<OutputChunk>,
    total: usize,
}

impl<A: ChunkAllocator> OutputSink<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            chunks: Vec::new(),
            total: 0,
        }
    }

    /// Start the chain in an existing allocation (typically the assembled
    /// request body). Its contents are discarded; its capacity becomes the
    /// first chunk's capacity.
    pub fn with_first_chunk(allocator: A, buffer: Vec<u8>) -> Self {
        let mut sink = Self::new(allocator);
        let capacity = buffer.capacity();
        if capacity > 0 {
            sink.chunks.push(OutputChunk::with_buffer(buffer, capacity));
        }
        sink
    }

    /// Append `bytes`, allocating new chunks as needed. Returns the running
    /// total of bytes written.
    pub fn write(&mut self, mut bytes: &[u8]) -> Result<usize, AllocationError> {
        while !bytes.is_empty() {
            if self.chunks.last().is_none_or(|c| c.spare() == 0) {
                let capacity = self.allocator.chunk_size();
                let buffer = self.allocator.allocate()?;
                self.chunks.push(OutputChunk::with_buffer(buffer, capacity));
            }
            let Some(tail) = self.chunks.last_mut() else {
                break;
            };
            let n = tail.spare().min(bytes.len());
            tail.data.extend_from_slice(&bytes[..n]);
            self.total += n;
            bytes = &bytes[n..];
        }
        Ok(self.total)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Close the chain. Chunks that never received a byte are dropped.
    pub fn finish(self) -> OutputChain {
        let chunks: Vec<OutputChunk> = self.chunks.into_iter().filter(|c| !c.is_empty()).collect();
        OutputChain {
            chunks,
            total: self.total,
        }
    }
}

impl<A: ChunkAllocator> OutputCollector for OutputSink<A> {
    fn collect(&mut self, bytes: &[u8]) -> Result<(), AllocationError> {
        self.write(bytes).map(|_| ())
    }
}

/// Finished, read-only output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChain {
    chunks: Vec<OutputChunk>,
    total: usize,
}

impl OutputChain {
    pub fn chunks(&self) -> &[OutputChunk] {
        &self.chunks
    }

    /// Sum of all chunk lengths.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(OutputChunk::as_bytes)
    }

    /// Concatenate the chain into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in self.iter() {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        for chunk in self.iter() {
            w.write_all(chunk)?;
        }
        w.flush()
    }
}
