//! Chunk queue
//!
//! An ordered sequence of in-memory byte buffers with a read cursor, fed by
//! the HTTP layer and drained by the upload pipelines. Every primitive
//! advances cursors chunk-atomically: whatever was actually consumed is
//! reflected even when an I/O error interrupts a drain.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::Write;

/// FIFO of byte buffers with a per-chunk read cursor
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Bytes>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer to the tail of the queue
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// Bytes available to consume
    pub fn available(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drop up to `num_bytes` from the head of the queue.
    ///
    /// Returns the number of bytes actually discarded.
    pub fn discard(&mut self, num_bytes: usize) -> usize {
        let mut remaining = num_bytes;
        while remaining > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let take = front.len().min(remaining);
            front.advance(take);
            remaining -= take;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        num_bytes - remaining
    }

    /// Copy up to `dst.len()` bytes from the head of the queue into `dst`,
    /// consuming them. Returns the number of bytes copied.
    pub fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let take = front.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&front[..take]);
            front.advance(take);
            copied += take;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        copied
    }

    /// Write up to `num_bytes` from the head of the queue into `out`,
    /// consuming them. Returns the number of bytes written; a short write on
    /// the underlying sink surfaces as an error with the cursor reflecting
    /// whatever was transferred.
    pub fn write_to<W: Write>(&mut self, out: &mut W, num_bytes: usize) -> std::io::Result<usize> {
        let mut written = 0;
        while written < num_bytes {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let take = front.len().min(num_bytes - written);
            let n = out.write(&front[..take])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "backing device refused bytes",
                ));
            }
            front.advance(n);
            written += n;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        Ok(written)
    }
}

/// Skip-then-buffer helper for fixed-position wire structures.
///
/// A structure living at `[start, start + buf.len())` of the inbound stream
/// is assembled across any number of queue visits: bytes before `start` are
/// discarded, bytes within the window are copied, and `curr_off` tracks the
/// absolute stream position throughout.
#[derive(Debug)]
pub struct Fill {
    start: u64,
    buf: Vec<u8>,
}

impl Fill {
    pub fn new(start: u64, len: usize) -> Self {
        Self {
            start,
            buf: vec![0u8; len],
        }
    }

    /// The assembled buffer; complete only once [`Fill::fill`] returned true.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Consume from the queue toward completing the buffer. Returns true
    /// when the structure is fully assembled.
    pub fn fill(&mut self, q: &mut ChunkQueue, curr_off: &mut u64) -> bool {
        if *curr_off < self.start {
            let gap = self.start - *curr_off;
            let skipped = q.discard(gap.min(usize::MAX as u64) as usize);
            *curr_off += skipped as u64;
            if *curr_off < self.start {
                return false;
            }
        }

        let pos = (*curr_off - self.start) as usize;
        if pos >= self.buf.len() {
            // The stream is already past this structure; callers validate
            // whatever was assembled.
            return true;
        }
        let copied = q.copy_into(&mut self.buf[pos..]);
        *curr_off += copied as u64;

        (*curr_off - self.start) as usize == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::NamedTempFile;

    fn queue_of(parts: &[&[u8]]) -> ChunkQueue {
        let mut q = ChunkQueue::new();
        for p in parts {
            q.push(Bytes::copy_from_slice(p));
        }
        q
    }

    #[test]
    fn test_available_spans_chunks() {
        let q = queue_of(&[b"hello", b"world!"]);
        assert_eq!(q.available(), 11);
        assert_eq!(ChunkQueue::new().available(), 0);
    }

    #[test]
    fn test_discard_across_chunks() {
        let mut q = queue_of(&[b"hello", b"world"]);
        assert_eq!(q.discard(7), 7);
        assert_eq!(q.available(), 3);

        let mut rest = [0u8; 3];
        assert_eq!(q.copy_into(&mut rest), 3);
        assert_eq!(&rest, b"rld");
    }

    #[test]
    fn test_discard_beyond_available() {
        let mut q = queue_of(&[b"abc"]);
        assert_eq!(q.discard(10), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn test_copy_into_partial() {
        let mut q = queue_of(&[b"ab", b"cdef"]);
        let mut dst = [0u8; 3];
        assert_eq!(q.copy_into(&mut dst), 3);
        assert_eq!(&dst, b"abc");
        assert_eq!(q.available(), 3);
    }

    #[test]
    fn test_write_to_file() {
        let mut q = queue_of(&[b"hello ", b"block ", b"device"]);
        let mut file = NamedTempFile::new().unwrap();
        let n = q.write_to(file.as_file_mut(), 12).unwrap();
        assert_eq!(n, 12);
        assert_eq!(q.available(), 6);

        file.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.as_file_mut().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello block ");
    }

    #[test]
    fn test_empty_push_is_dropped() {
        let mut q = ChunkQueue::new();
        q.push(Bytes::new());
        assert!(q.is_empty());
    }

    #[test]
    fn test_fill_contiguous() {
        let mut q = queue_of(&[b"head", b"erXX"]);
        let mut fill = Fill::new(0, 6);
        let mut off = 0u64;
        assert!(fill.fill(&mut q, &mut off));
        assert_eq!(fill.buf(), b"header");
        assert_eq!(off, 6);
        assert_eq!(q.available(), 2);
    }

    #[test]
    fn test_fill_skips_gap() {
        // Structure lives at offset 4; the first 4 bytes are padding
        let mut q = queue_of(&[b"SKIP", b"data"]);
        let mut fill = Fill::new(4, 4);
        let mut off = 0u64;
        assert!(fill.fill(&mut q, &mut off));
        assert_eq!(fill.buf(), b"data");
        assert_eq!(off, 8);
    }

    #[test]
    fn test_fill_across_visits() {
        let mut fill = Fill::new(2, 6);
        let mut off = 0u64;

        let mut q = queue_of(&[b"..ab"]);
        assert!(!fill.fill(&mut q, &mut off));
        assert_eq!(off, 4);

        let mut q = queue_of(&[b"cd"]);
        assert!(!fill.fill(&mut q, &mut off));

        let mut q = queue_of(&[b"ef..."]);
        assert!(fill.fill(&mut q, &mut off));
        assert_eq!(fill.buf(), b"abcdef");
        assert_eq!(off, 8);
        assert_eq!(q.available(), 3);
    }

    #[test]
    fn test_fill_structure_behind_cursor() {
        // A malformed stream can place a structure before the current
        // offset; the fill reports completion without touching the queue
        let mut fill = Fill::new(2, 4);
        let mut off = 100u64;
        let mut q = queue_of(&[b"data"]);
        assert!(fill.fill(&mut q, &mut off));
        assert_eq!(off, 100);
        assert_eq!(q.available(), 4);
    }

    #[test]
    fn test_fill_gap_larger_than_queue() {
        let mut fill = Fill::new(100, 4);
        let mut off = 0u64;
        let mut q = queue_of(&[b"tiny"]);
        assert!(!fill.fill(&mut q, &mut off));
        assert_eq!(off, 4);
        assert!(q.is_empty());
    }
}
