use slice_deque::SliceDeque;
use std::io;

/// Outcome of draining a non-blocking reader into the buffer.
#[derive(Debug, Eq, PartialEq)]
pub enum Ingress {
    /// Bytes taken in before the source would have blocked.
    Drained(usize),
    /// The source reached end of stream.
    Eof,
    /// The buffer filled up before the source ran dry.
    Full(usize),
}

/// A bounded, contiguous FIFO byte queue backing stream reassembly and
/// egress. Data is appended at the tail and consumed from the head; both
/// views are contiguous slices.
pub struct Buffer {
    data: SliceDeque<u8>,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = SliceDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Advance the head, discarding consumed data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Advance the tail over freshly written bytes.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.move_head(len);
    }

    /// Append `bytes` in one piece. Returns false, leaving the buffer
    /// untouched, when the free capacity is insufficient.
    #[inline]
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        let count = bytes.len();
        self.write_slice()[..count].copy_from_slice(bytes);
        self.move_tail(count);
        true
    }

    /// Drain `reader` until it would block, the stream ends, or the buffer
    /// is full.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<Ingress> {
        let mut total = 0;

        while self.free_capacity() > 0 {
            let free = self.free_capacity();
            let result = {
                let slice = self.write_slice();
                let limit = free.min(slice.len());
                reader.read(&mut slice[..limit])
            };

            match result {
                Ok(0) => return Ok(Ingress::Eof),
                Ok(count) => {
                    self.move_tail(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Ingress::Drained(total));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(Ingress::Full(total))
    }

    /// Write buffered data to `writer` until everything is flushed or the
    /// destination would block.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(self.data.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.move_head(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}
