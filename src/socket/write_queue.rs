use super::{WriteCb, WriteFlags};
use std::collections::VecDeque;

/// Most segments handed to one `sendmsg` call.
///
/// Well under IOV_MAX on every supported platform; a request with more
/// segments defers the excess to the next pass of the write loop.
pub(crate) const MAX_WRITE_IOVECS: usize = 64;

/// One pending write: a completion callback, the owned remaining segments,
/// and a cursor (segment index plus intra-segment offset) advanced on every
/// partial write.
///
/// Segments the cursor has moved past are released immediately, so a large
/// chain does not stay resident while its tail drains.
pub(crate) struct WriteRequest {
    callback: Option<WriteCb>,
    segments: Vec<Vec<u8>>,
    index: usize,
    offset: usize,
    bytes_written: usize,
    flags: WriteFlags,
}

impl WriteRequest {
    pub(crate) fn new(callback: Option<WriteCb>, segments: Vec<Vec<u8>>, flags: WriteFlags) -> Self {
        let segments: Vec<Vec<u8>> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        Self {
            callback,
            segments,
            index: 0,
            offset: 0,
            bytes_written: 0,
            flags,
        }
    }

    pub(crate) fn flags(&self) -> WriteFlags {
        self.flags
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.index >= self.segments.len()
    }

    /// Bytes of this request accepted by the kernel (or TLS engine) so far.
    pub(crate) fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Bytes not yet written.
    pub(crate) fn remaining(&self) -> usize {
        self.segments[self.index..]
            .iter()
            .map(Vec::len)
            .sum::<usize>()
            - self.offset
    }

    /// The unwritten remainder of the current segment.
    pub(crate) fn current_slice(&self) -> Option<&[u8]> {
        self.segments.get(self.index).map(|s| &s[self.offset..])
    }

    /// Whether the cursor sits in the final segment.
    pub(crate) fn in_final_segment(&self) -> bool {
        self.index + 1 == self.segments.len()
    }

    /// Fills `iovs` with the remaining segments, first one adjusted by the
    /// intra-segment offset. Returns the number of entries populated.
    pub(crate) fn fill_iovec(&self, iovs: &mut [libc::iovec; MAX_WRITE_IOVECS]) -> usize {
        let mut count = 0;
        for (n, segment) in self.segments[self.index..].iter().enumerate() {
            if count == MAX_WRITE_IOVECS {
                break;
            }
            let skip = if n == 0 { self.offset } else { 0 };
            let slice = &segment[skip..];
            iovs[count] = libc::iovec {
                iov_base: slice.as_ptr() as *mut libc::c_void,
                iov_len: slice.len(),
            };
            count += 1;
        }
        count
    }

    /// Advances the cursor by `n` bytes of write progress, releasing every
    /// segment the cursor passes.
    pub(crate) fn consume(&mut self, mut n: usize) {
        self.bytes_written += n;
        while n > 0 {
            let segment = &mut self.segments[self.index];
            let left = segment.len() - self.offset;
            if n >= left {
                n -= left;
                *segment = Vec::new();
                self.offset = 0;
                self.index += 1;
            } else {
                self.offset += n;
                n = 0;
            }
        }
        debug_assert!(self.index <= self.segments.len());
    }

    pub(crate) fn take_callback(&mut self) -> Option<WriteCb> {
        self.callback.take()
    }
}

/// The per-connection FIFO of pending writes.
///
/// Completion order is submission order; only the head request makes
/// progress.
#[derive(Default)]
pub(crate) struct WriteQueue {
    queue: VecDeque<WriteRequest>,
}

impl WriteQueue {
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn push_back(&mut self, request: WriteRequest) {
        self.queue.push_back(request);
    }

    pub(crate) fn push_front(&mut self, request: WriteRequest) {
        self.queue.push_front(request);
    }

    pub(crate) fn front(&self) -> Option<&WriteRequest> {
        self.queue.front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut WriteRequest> {
        self.queue.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<WriteRequest> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(segments: Vec<Vec<u8>>) -> WriteRequest {
        WriteRequest::new(None, segments, WriteFlags::NONE)
    }

    #[test]
    fn consume_advances_across_segment_boundaries() {
        let mut req = request(vec![vec![0u8; 4], vec![0u8; 6], vec![0u8; 2]]);
        assert_eq!(req.remaining(), 12);

        req.consume(3);
        assert_eq!(req.bytes_written(), 3);
        assert_eq!(req.remaining(), 9);
        assert!(!req.is_complete());

        // Crosses the first boundary and lands mid-second-segment.
        req.consume(5);
        assert_eq!(req.remaining(), 4);
        assert_eq!(req.current_slice().unwrap().len(), 4);

        req.consume(4);
        assert!(req.is_complete());
        assert_eq!(req.bytes_written(), 12);
        assert_eq!(req.remaining(), 0);
    }

    #[test]
    fn consumed_segments_are_released() {
        let mut req = request(vec![vec![7u8; 1024], vec![9u8; 8]]);
        req.consume(1024);
        // The first link is dropped as soon as the cursor passes it.
        assert!(req.segments[0].is_empty());
        assert_eq!(req.current_slice().unwrap(), &[9u8; 8]);
        assert!(req.in_final_segment());
    }

    #[test]
    fn fill_iovec_honors_offset_and_cap() {
        let mut req = request((0..100).map(|_| vec![0u8; 10]).collect());
        req.consume(5);
        let mut iovs = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_WRITE_IOVECS];
        let count = req.fill_iovec(&mut iovs);
        assert_eq!(count, MAX_WRITE_IOVECS);
        assert_eq!(iovs[0].iov_len, 5);
        assert_eq!(iovs[1].iov_len, 10);
    }

    #[test]
    fn empty_segments_are_filtered_at_construction() {
        let req = request(vec![Vec::new(), vec![1u8], Vec::new()]);
        assert_eq!(req.remaining(), 1);
        assert!(req.in_final_segment());

        let empty = request(Vec::new());
        assert!(empty.is_complete());
    }
}
